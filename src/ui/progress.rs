//! Terminal rendering of run progress.
//!
//! Supports three output modes:
//! - `full`: a header bar with per-phase spinners
//! - `minimal`: one line per notable event
//! - `json`: one JSON object per event, for machine consumption

use console::{Term, style};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;

use crate::orchestrator::RunEvent;
use crate::ui::icons::{CHECK, COST, CROSS, LOOP, REVIEW, RETRY, RUNNING, SPARKLE, STEP_BACK, WAVE};
use crate::worker::stream::truncate_str;

/// Output mode for the run UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UiMode {
    #[default]
    Full,
    Minimal,
    Json,
}

impl std::str::FromStr for UiMode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "json" => Self::Json,
            "minimal" => Self::Minimal,
            _ => Self::Full,
        })
    }
}

impl UiMode {
    pub fn parse(s: &str) -> Self {
        s.parse().unwrap_or_default()
    }
}

/// Renders [`RunEvent`]s as they arrive.
///
/// Events are consumed sequentially by a single task, so no locking is needed.
pub struct RunUI {
    mode: UiMode,
    multi: MultiProgress,
    header: ProgressBar,
    bars: HashMap<String, ProgressBar>,
    verbose: bool,
    term: Term,
}

fn bar_style(template: &str) -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▓░")
}

impl RunUI {
    pub fn new(total_phases: usize, mode: UiMode, verbose: bool) -> Self {
        let multi = MultiProgress::new();
        let header = if mode == UiMode::Full {
            let bar = multi.add(ProgressBar::new(total_phases as u64));
            bar.set_style(bar_style("{prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} {msg}"));
            bar.set_prefix("marshal");
            bar.set_message("starting");
            bar
        } else {
            ProgressBar::hidden()
        };
        Self {
            mode,
            multi,
            header,
            bars: HashMap::new(),
            verbose,
            term: Term::stdout(),
        }
    }

    pub fn handle_event(&mut self, event: &RunEvent) {
        match self.mode {
            UiMode::Json => {
                if let Ok(json) = serde_json::to_string(event) {
                    let _ = writeln!(&self.term, "{}", json);
                }
            }
            UiMode::Minimal => self.handle_minimal(event),
            UiMode::Full => self.handle_full(event),
        }
    }

    fn handle_minimal(&self, event: &RunEvent) {
        let line = match event {
            RunEvent::MilestoneStarted { milestone, .. } => format!("Milestone {}", milestone),
            RunEvent::PhaseSucceeded { phase, attempts, .. } => {
                format!("✓ {} ({} attempt(s))", phase, attempts)
            }
            RunEvent::PhaseRetrying {
                phase, diagnostic, ..
            } => format!("↻ {}: {}", phase, truncate_str(diagnostic, 100)),
            RunEvent::SteppedBack { from, to, .. } => format!("⏪ {} → {}", from, to),
            RunEvent::PhaseFatal {
                phase, diagnostic, ..
            } => format!("✗ {}: {}", phase, truncate_str(diagnostic, 100)),
            RunEvent::RunFinished {
                outcome,
                total_cost_usd,
                ..
            } => format!("Done: {} (${:.2})", outcome, total_cost_usd),
            _ => return,
        };
        let _ = writeln!(&self.term, "{}", line);
    }

    fn handle_full(&mut self, event: &RunEvent) {
        match event {
            RunEvent::MilestoneStarted {
                milestone,
                waves,
                completed,
            } => {
                self.multi.println("").ok();
                self.multi
                    .println(format!(
                        "{}Milestone {} ({} already done)",
                        WAVE,
                        style(milestone).yellow().bold(),
                        completed.len()
                    ))
                    .ok();
                for (i, wave) in waves.iter().enumerate() {
                    self.multi
                        .println(format!("   wave {}: {}", i + 1, style(wave.join(", ")).dim()))
                        .ok();
                }
                let total: usize = waves.iter().map(Vec::len).sum();
                self.header.set_length(total as u64);
                self.header.set_position(completed.len() as u64);
                self.header.set_message(milestone.clone());
            }
            RunEvent::PhaseStarted { phase, attempt, .. } => {
                let bar = self.bars.entry(phase.clone()).or_insert_with(|| {
                    let bar = self.multi.add(ProgressBar::new_spinner());
                    bar.set_style(
                        ProgressStyle::default_spinner()
                            .template("  {spinner} {prefix:.bold} {elapsed} {msg}")
                            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
                    );
                    bar.set_prefix(format!("[{}]", phase));
                    bar.enable_steady_tick(Duration::from_millis(120));
                    bar
                });
                bar.set_message(format!("{}attempt {}", RUNNING, attempt));
            }
            RunEvent::PhaseValidating { phase, .. } => {
                if let Some(bar) = self.bars.get(phase) {
                    bar.set_message(format!("{}checking evidence", REVIEW));
                }
            }
            RunEvent::PhaseSucceeded {
                phase,
                attempts,
                cost_usd,
                ..
            } => {
                if let Some(bar) = self.bars.remove(phase) {
                    bar.finish_and_clear();
                }
                self.multi
                    .println(format!(
                        "  {}{} {}",
                        CHECK,
                        style(phase).green(),
                        style(format!("({} attempt(s), ${:.2})", attempts, cost_usd)).dim()
                    ))
                    .ok();
                self.header.inc(1);
            }
            RunEvent::PhaseRetrying {
                phase,
                attempt,
                classification,
                diagnostic,
                ..
            } => {
                if let Some(bar) = self.bars.get(phase) {
                    bar.set_message(format!("{}retrying after attempt {}", RETRY, attempt));
                }
                if self.verbose {
                    self.multi
                        .println(format!(
                            "  {}{} {:?}: {}",
                            RETRY,
                            style(phase).yellow(),
                            classification,
                            truncate_str(diagnostic, 160)
                        ))
                        .ok();
                }
            }
            RunEvent::LoopDetected {
                phase,
                occurrences,
                action,
                ..
            } => {
                self.multi
                    .println(format!(
                        "  {}{} repeated the same failure {} times: {}",
                        LOOP,
                        style(phase).yellow(),
                        occurrences,
                        action
                    ))
                    .ok();
            }
            RunEvent::SteppedBack { from, to, reset, .. } => {
                for phase in reset {
                    if let Some(bar) = self.bars.remove(phase) {
                        bar.finish_and_clear();
                    }
                }
                self.multi
                    .println(format!(
                        "  {}{} → {} (re-opened: {})",
                        STEP_BACK,
                        style(from).yellow(),
                        style(to).cyan(),
                        reset.join(", ")
                    ))
                    .ok();
            }
            RunEvent::PhaseFatal {
                phase,
                attempts,
                diagnostic,
                ..
            } => {
                if let Some(bar) = self.bars.remove(phase) {
                    bar.finish_and_clear();
                }
                self.multi
                    .println(format!(
                        "  {}{} failed after {} attempt(s): {}",
                        CROSS,
                        style(phase).red().bold(),
                        attempts,
                        truncate_str(diagnostic, 200)
                    ))
                    .ok();
            }
            RunEvent::MilestoneCompleted { milestone, cost_usd } => {
                self.multi
                    .println(format!(
                        "{}Milestone {} complete {}",
                        SPARKLE,
                        style(milestone).green().bold(),
                        style(format!("(${:.2})", cost_usd)).dim()
                    ))
                    .ok();
            }
            RunEvent::RunFinished {
                outcome,
                total_cost_usd,
                ..
            } => {
                self.finish();
                let _ = writeln!(
                    &self.term,
                    "\n{}Run {} {}{:.2}",
                    if outcome == "completed" { CHECK } else { CROSS },
                    style(outcome).bold(),
                    COST,
                    total_cost_usd
                );
            }
        }
    }

    /// Clear every remaining bar.
    pub fn finish(&mut self) {
        for (_, bar) in self.bars.drain() {
            bar.finish_and_clear();
        }
        self.header.finish_and_clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ui_mode_parse() {
        assert_eq!(UiMode::parse("json"), UiMode::Json);
        assert_eq!(UiMode::parse("MINIMAL"), UiMode::Minimal);
        assert_eq!(UiMode::parse("anything"), UiMode::Full);
    }

    #[test]
    fn test_full_mode_tracks_phase_bars() {
        let mut ui = RunUI::new(2, UiMode::Full, false);
        ui.handle_event(&RunEvent::PhaseStarted {
            milestone: "m1".into(),
            phase: "lint".into(),
            attempt: 1,
        });
        assert!(ui.bars.contains_key("lint"));
        ui.handle_event(&RunEvent::PhaseSucceeded {
            milestone: "m1".into(),
            phase: "lint".into(),
            attempts: 1,
            cost_usd: 0.1,
        });
        assert!(ui.bars.is_empty());
        assert_eq!(ui.header.position(), 1);
    }
}
