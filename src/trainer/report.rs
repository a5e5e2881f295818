//! Metric reporters selected by `log_with`.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use crate::error::Result;

use super::checkpoint::LogEntry;

/// File the `jsonl` reporter appends to.
pub const METRICS_FILE: &str = "metrics.jsonl";

/// Destination for logged metrics.
#[derive(Debug)]
pub enum Reporter {
    /// Discard metrics.
    None,
    /// Emit metrics as tracing events.
    Tracing,
    /// Append one JSON object per entry.
    Jsonl(File),
}

impl Reporter {
    /// Create the reporter named by `report_to`.
    ///
    /// Unknown names, including remote trackers, fall back to tracing.
    ///
    /// # Errors
    ///
    /// Returns an error if the metrics file cannot be opened.
    pub fn from_name(report_to: &str, output_dir: &Path) -> Result<Self> {
        match report_to.to_ascii_lowercase().as_str() {
            "none" | "" => Ok(Self::None),
            "tracing" => Ok(Self::Tracing),
            "jsonl" => {
                std::fs::create_dir_all(output_dir)?;
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(output_dir.join(METRICS_FILE))?;
                Ok(Self::Jsonl(file))
            }
            other => {
                tracing::warn!("Reporter '{}' is not available, logging metrics with tracing", other);
                Ok(Self::Tracing)
            }
        }
    }

    /// Report one log entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be written.
    pub fn report(&mut self, entry: &LogEntry) -> Result<()> {
        match self {
            Self::None => {}
            Self::Tracing => {
                tracing::info!(
                    step = entry.step,
                    epoch = entry.epoch,
                    loss = entry.loss,
                    learning_rate = entry.learning_rate,
                    eval_loss = entry.eval_loss,
                    "metrics"
                );
            }
            Self::Jsonl(file) => {
                writeln!(file, "{}", serde_json::to_string(entry)?)?;
            }
        }
        Ok(())
    }
}
