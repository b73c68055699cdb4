//! Terminal rendering of training progress events.

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use radium_training::{ProgressEvent, ProgressSink};

const TEMPLATE: &str = "{prefix:.cyan} [{bar:40.cyan/blue}] {pos}/{len} {msg}";

/// Drives one progress bar per epoch and prints periodic task results above it.
pub struct BarProgressSink {
    bar: ProgressBar,
}

impl BarProgressSink {
    pub fn new() -> Self {
        let style = ProgressStyle::with_template(TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");
        let bar = ProgressBar::new(0);
        bar.set_style(style);
        Self { bar }
    }

    fn print(&self, line: &str) {
        self.bar.suspend(|| println!("{line}"));
    }
}

impl Default for BarProgressSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for BarProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Started { start_seq_index, total_sequences, num_params, seq_len } => {
                self.print(&format!(
                    "  {} params, seq_len {}, {} training sequences, starting at sequence {}",
                    readable_count(num_params).cyan(),
                    seq_len,
                    total_sequences,
                    start_seq_index.to_string().cyan()
                ));
            }
            ProgressEvent::EpochStarted { epoch, epochs, steps } => {
                self.bar.reset();
                self.bar.set_length(steps);
                self.bar.set_prefix(format!("epoch {epoch}/{epochs}"));
            }
            ProgressEvent::Step { loss, .. } => {
                self.bar.set_message(format!("loss {loss:.4}"));
                self.bar.inc(1);
            }
            ProgressEvent::Checkpointed { step, next_seq_index, index } => {
                self.print(&format!(
                    "  {} step {} checkpoint #{} (next sequence {})",
                    "✓".green(),
                    step,
                    index,
                    next_seq_index
                ));
            }
            ProgressEvent::Validated { step, loss } => {
                self.print(&format!("  step {} valid loss {}", step, format!("{loss:.4}").yellow()));
            }
            ProgressEvent::Sampled { prime, generated, .. } => {
                self.print(&format!("{}\n{}\n{}", prime.dimmed(), "*".repeat(40), generated));
            }
            ProgressEvent::Finished { .. } => self.bar.finish_and_clear(),
        }
    }
}

/// Decimal magnitude with one fractional digit: `950`, `33.0k`, `1.2M`.
fn readable_count(n: usize) -> String {
    const UNITS: [&str; 4] = ["k", "M", "B", "T"];
    if n < 1000 {
        return n.to_string();
    }
    let mut value = n as f64 / 1000.0;
    let mut unit = 0;
    while value >= 999.95 && unit + 1 < UNITS.len() {
        value /= 1000.0;
        unit += 1;
    }
    format!("{value:.1}{}", UNITS[unit])
}
