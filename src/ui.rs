//! Terminal reporting for workflow runs.
//!
//! A single phase progress bar plus styled per-phase status lines, and a
//! final banner. All output goes through `indicatif` so status lines never
//! tear the bar.

use crate::state::PhaseStatus;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};

pub struct RunReporter {
    bar: ProgressBar,
    verbose: bool,
}

impl RunReporter {
    pub fn new(total_phases: u64, verbose: bool) -> Self {
        let bar = ProgressBar::new(total_phases);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .expect("progress bar template is a valid static string")
                .progress_chars("█▓▒░"),
        );
        bar.set_prefix("Phases");
        Self { bar, verbose }
    }

    /// Report a phase transition. Called after the transition is persisted.
    pub fn phase_status(&self, phase: &str, status: PhaseStatus) {
        match status {
            PhaseStatus::InProgress => {
                self.bar
                    .set_message(format!("{}", style(phase).yellow()));
            }
            PhaseStatus::Complete => {
                self.println(format!("  {} {}", style("✓").green().bold(), phase));
                self.bar.inc(1);
            }
            PhaseStatus::Skipped => {
                self.println(format!(
                    "  {} {} {}",
                    style("⊘").dim(),
                    phase,
                    style("(skipped)").dim()
                ));
                self.bar.inc(1);
            }
            PhaseStatus::Blocked => {
                self.println(format!("  {} {}", style("✗").red().bold(), phase));
            }
            PhaseStatus::NotStarted => {}
        }
    }

    pub fn log_step(&self, message: &str) {
        if self.verbose {
            self.println(format!("  {}", style(message).dim()));
        }
    }

    pub fn finish_success(&self, workflow: &str) {
        self.bar.finish_and_clear();
        println!(
            "{} workflow '{}' complete",
            style("✓").green().bold(),
            workflow
        );
    }

    pub fn finish_failure(&self, workflow: &str, error: &str) {
        self.bar.finish_and_clear();
        println!(
            "{} workflow '{}' stopped: {}",
            style("✗").red().bold(),
            workflow,
            error
        );
    }

    pub fn finish_interrupted(&self) {
        self.bar.finish_and_clear();
        println!(
            "{} interrupted — state saved, rerun to resume",
            style("⚠").yellow().bold()
        );
    }

    fn println(&self, message: String) {
        self.bar.println(message);
    }
}
