use crate::progress::PipelineEvent;
use crate::ui::icons::{BLOCKER, CHECK, CLOCK, CROSS, GATE, PAUSE, SPARKLE};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Terminal UI for a pipeline run: a single spinner tracking the current
/// stage, with event lines printed above it.
pub struct PipelineUI {
    spinner: ProgressBar,
    verbose: bool,
}

impl PipelineUI {
    pub fn new(verbose: bool) -> Self {
        let spinner = ProgressBar::new_spinner();
        let spinner_style = ProgressStyle::default_spinner()
            .template("{spinner} {msg}")
            .expect("progress bar template is a valid static string");
        spinner.set_style(spinner_style);
        spinner.enable_steady_tick(Duration::from_millis(100));
        Self { spinner, verbose }
    }

    /// Print a line above the spinner.
    fn println(&self, line: String) {
        self.spinner.println(line);
    }

    /// Render one pipeline event.
    pub fn handle(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::Progress { stage, message } => {
                self.spinner
                    .set_message(format!("{} {}", style(stage).cyan().bold(), message));
            }
            PipelineEvent::StageDone { stage, round, summary } => {
                let round_label = round
                    .map(|r| format!(" (round {})", r))
                    .unwrap_or_default();
                self.println(format!(
                    "{}{}{}: {}",
                    CHECK,
                    style(stage).bold(),
                    style(round_label).dim(),
                    summary
                ));
            }
            PipelineEvent::GatePass { round } => {
                self.println(format!(
                    "{}{} round {}",
                    GATE,
                    style("Quality gate passed").green().bold(),
                    round
                ));
            }
            PipelineEvent::GateFail { round, blocking } => {
                self.println(format!(
                    "{}{} round {} — another round follows",
                    GATE,
                    style("Quality gate failed").yellow().bold(),
                    round
                ));
                for issue in blocking {
                    self.println(format!("    {} {}", style("•").yellow(), issue));
                }
            }
            PipelineEvent::GateBlocked { round, reason } => {
                self.println(format!(
                    "{}{} round {}: {}",
                    BLOCKER,
                    style("Pipeline blocked").red().bold(),
                    round,
                    reason
                ));
            }
            PipelineEvent::Checkpointed { continuation_id } => {
                self.println(format!(
                    "{}{} (continuation {})",
                    CLOCK,
                    style("Time budget exceeded, state saved").yellow(),
                    continuation_id
                ));
            }
            PipelineEvent::AwaitUserContinue { continuation_id } => {
                self.println(format!(
                    "{}{} (continuation {})",
                    PAUSE,
                    style("Paused for your confirmation").cyan(),
                    continuation_id
                ));
            }
            PipelineEvent::Halted { reason, details } => {
                self.println(format!("{}{}", BLOCKER, style(reason).red().bold()));
                for detail in details {
                    self.println(format!("    {} {}", style("•").red(), detail));
                }
            }
            PipelineEvent::Error { message } => {
                self.println(format!("{}{}", CROSS, style(message).red()));
            }
            PipelineEvent::Complete { artifact } => {
                self.println(format!(
                    "{}{} after {} round(s) — overall {}, truthfulness {}",
                    SPARKLE,
                    style("Document optimized").green().bold(),
                    artifact.rounds_completed,
                    artifact.scorecard.overall,
                    artifact.scorecard.truthfulness
                ));
                if self.verbose {
                    for entry in &artifact.change_log {
                        self.println(format!("    {} {}", style("•").dim(), entry));
                    }
                }
            }
        }
    }

    pub fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}
