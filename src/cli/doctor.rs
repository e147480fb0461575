use std::path::Path;

use anyhow::Result;

use crate::core::config::{SimulationConfig, ToolConfig};
use crate::core::gateway::resolve_program;
use crate::core::terminal::{print_error, print_info, print_step, print_success, print_warn};

/// One external command to look for, and whether a run can do without it.
struct ToolCheck<'a> {
    role: &'a str,
    command: Option<&'a [String]>,
    required: bool,
}

fn checks(tools: &ToolConfig) -> Vec<ToolCheck<'_>> {
    vec![
        ToolCheck {
            role: "solver",
            command: Some(&tools.solver),
            required: true,
        },
        ToolCheck {
            role: "transform",
            command: Some(&tools.transform),
            required: true,
        },
        ToolCheck {
            role: "visualizer",
            command: tools.visualizer.as_deref(),
            required: false,
        },
    ]
}

/// Returns `true` when every required tool resolves.
pub async fn run_doctor(config_path: Option<&Path>) -> Result<bool> {
    print_step("Checking simulation dependencies...");
    println!();

    let config = match config_path {
        Some(path) => match SimulationConfig::load(path).await {
            Ok(config) => {
                print_success(&format!("Config {} is valid", path.display()));
                config
            }
            Err(e) => {
                print_error(&format!("Config {}: {}", path.display(), e));
                return Ok(false);
            }
        },
        None => {
            print_info("No --config given, checking default tool names");
            SimulationConfig::new("doctor", ".")
        }
    };

    let mut healthy = true;
    for check in checks(&config.tools) {
        let Some(program) = check.command.and_then(|c| c.first()) else {
            print_info(&format!("No {} configured, stage will be skipped", check.role));
            continue;
        };
        match resolve_program(program) {
            Some(path) => print_success(&format!("{} found: {}", check.role, path.display())),
            None if check.required => {
                print_error(&format!("{} '{}' not found on PATH", check.role, program));
                healthy = false;
            }
            None => print_warn(&format!("{} '{}' not found on PATH", check.role, program)),
        }
    }

    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    print_info(&format!(
        "{} logical cores, default worker budget {}",
        cores,
        (cores / 2).max(1)
    ));

    println!();
    if healthy {
        print_success("All required tools are available.");
    } else {
        print_warn("Some required tools are missing; runs will fail at the solve stage.");
    }
    Ok(healthy)
}
