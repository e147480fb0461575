use console::{Emoji, style};

use crate::core::pipeline::StageStatus;
use crate::core::report::CompletionReport;

pub static SUCCESS_ICON: Emoji<'_, '_> = Emoji("✅ ", "");
pub static INFO_ICON: Emoji<'_, '_> = Emoji("ℹ️  ", "");
pub static WARN_ICON: Emoji<'_, '_> = Emoji("⚠️  ", "");
pub static ERROR_ICON: Emoji<'_, '_> = Emoji("❌ ", "");
pub static GEAR: Emoji<'_, '_> = Emoji("⚙️  ", "");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "");

pub fn print_success(msg: &str) {
    println!("{} {}", SUCCESS_ICON, style(msg).green());
}

pub fn print_info(msg: &str) {
    println!("{} {}", INFO_ICON, style(msg).blue());
}

pub fn print_warn(msg: &str) {
    println!("{} {}", WARN_ICON, style(msg).yellow());
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", ERROR_ICON, style(msg).red().bold());
}

pub fn print_status(label: &str, msg: &str) {
    println!("  {} {}: {}", GEAR, style(label).bold().cyan(), msg);
}

pub fn print_step(step: &str) {
    println!("{} {}", SPARKLE, style(step).bold());
}

/// A titled block of `command  description` rows for `help`.
pub struct GuideSection {
    title: String,
    rows: Vec<(String, String)>,
}

impl GuideSection {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            rows: Vec::new(),
        }
    }

    pub fn command(mut self, usage: &str, description: &str) -> Self {
        self.rows.push((usage.to_string(), description.to_string()));
        self
    }

    pub fn print(self) {
        println!("\n {}", style(&self.title).bold().underlined());
        let width = self.rows.iter().map(|(u, _)| u.len()).max().unwrap_or(0);
        for (usage, description) in &self.rows {
            println!(
                "   {:<width$}  {}",
                style(usage).green(),
                style(description).dim(),
                width = width
            );
        }
    }
}

/// One line per montage, then the failure details and the summary.
pub fn print_report(report: &CompletionReport) {
    print_step(&format!("Session {}", report.session_id));
    for run in &report.runs {
        let done = run
            .stages
            .iter()
            .filter(|s| s.status == StageStatus::Succeeded)
            .count();
        let label = format!("{} [{}]", run.montage, run.mode);
        if run.is_success() {
            print_status(&label, &format!("{} {} stages", style("success").green(), done));
        } else {
            print_status(&label, &format!("{} after {} stages", style("failure").red(), done));
        }
        if let Some(path) = &run.log_path {
            println!("      log: {}", style(path.display()).dim());
        }
    }

    for failure in &report.failures {
        print_warn(&format!(
            "{} failed at {} ({}): {}",
            failure.montage, failure.stage, failure.kind, failure.detail
        ));
    }

    if report.all_succeeded() {
        print_success(&report.summary_line());
    } else {
        print_error(&report.summary_line());
    }
}
