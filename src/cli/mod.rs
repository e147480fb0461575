mod doctor;
mod run;

use std::path::PathBuf;

use anyhow::Result;
use console::style;

use crate::core::terminal::{GuideSection, print_error};

fn print_help() {
    GuideSection::new("Simulation")
        .command(
            "run --config <toml> --montages a,b",
            "Simulate the named montages for one subject",
        )
        .command("  --catalog <json>", "Named montage catalog")
        .command("  --adhoc <json>", "Coordinate montages (all of them if --montages is omitted)")
        .command("  --net <csv>", "EEG net electrode positions, repeatable")
        .command("  --workers <n>", "Parallel montages (0 = half the cores)")
        .command("  --strict", "Abort if any montage is invalid")
        .print();

    GuideSection::new("Diagnostics")
        .command("doctor --config <toml>", "Check that the configured tools are installed")
        .command("help", "Show this guide")
        .print();

    println!(
        "\n {} {} <command> [options]\n",
        style("Usage:").bold(),
        style("tiflow").green()
    );
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunCommandArgs {
    pub config: Option<PathBuf>,
    pub montages: Vec<String>,
    pub catalog: Option<PathBuf>,
    pub adhoc: Option<PathBuf>,
    pub nets: Vec<PathBuf>,
    pub workers: Option<usize>,
    pub strict: bool,
}

pub fn parse_run_command_args(args: &[String], start: usize) -> RunCommandArgs {
    let mut parsed = RunCommandArgs::default();
    let mut i = start;
    while i < args.len() {
        let value = args.get(i + 1);
        match (args[i].as_str(), value) {
            ("--config" | "-c", Some(v)) => {
                parsed.config = Some(PathBuf::from(v));
                i += 2;
            }
            ("--montages" | "-m", Some(v)) => {
                parsed.montages.extend(
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from),
                );
                i += 2;
            }
            ("--catalog", Some(v)) => {
                parsed.catalog = Some(PathBuf::from(v));
                i += 2;
            }
            ("--adhoc", Some(v)) => {
                parsed.adhoc = Some(PathBuf::from(v));
                i += 2;
            }
            ("--net", Some(v)) => {
                parsed.nets.push(PathBuf::from(v));
                i += 2;
            }
            ("--workers" | "-w", Some(v)) => {
                parsed.workers = v.parse().ok();
                i += 2;
            }
            ("--strict", _) => {
                parsed.strict = true;
                i += 1;
            }
            _ => i += 1,
        }
    }
    parsed
}

/// Returns `Ok(false)` when the command ran but something failed, so the
/// binary can exit non-zero without printing a second error.
pub async fn run_main() -> Result<bool> {
    let args: Vec<String> = std::env::args().collect();
    let Some(cmd) = args.get(1) else {
        print_help();
        return Ok(true);
    };

    match cmd.as_str() {
        "run" => run::run_command(parse_run_command_args(&args, 2)).await,
        "doctor" => {
            let parsed = parse_run_command_args(&args, 2);
            doctor::run_doctor(parsed.config.as_deref()).await
        }
        "help" | "--help" | "-h" => {
            print_help();
            Ok(true)
        }
        other => {
            print_error(&format!("Unknown command '{}'", other));
            print_help();
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_run_command_args_reads_every_flag() {
        let args = argv(&[
            "tiflow",
            "run",
            "--config",
            "sim.toml",
            "--montages",
            "L_Insula, R_Hippocampus",
            "--catalog",
            "montage_list.json",
            "--net",
            "GSN.csv",
            "--workers",
            "3",
            "--strict",
        ]);
        let parsed = parse_run_command_args(&args, 2);
        assert_eq!(parsed.config, Some(PathBuf::from("sim.toml")));
        assert_eq!(parsed.montages, vec!["L_Insula", "R_Hippocampus"]);
        assert_eq!(parsed.catalog, Some(PathBuf::from("montage_list.json")));
        assert_eq!(parsed.nets, vec![PathBuf::from("GSN.csv")]);
        assert_eq!(parsed.workers, Some(3));
        assert!(parsed.strict);
        assert!(parsed.adhoc.is_none());
    }

    #[test]
    fn parse_run_command_args_tolerates_dangling_flags() {
        let args = argv(&["tiflow", "run", "--workers", "many", "--config"]);
        let parsed = parse_run_command_args(&args, 2);
        assert_eq!(parsed.workers, None);
        assert_eq!(parsed.config, None);
    }
}
