//! Trainer state and checkpoint directories.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SftError};

/// File the trainer state is written to.
pub const TRAINER_STATE_FILE: &str = "trainer_state.json";

const CHECKPOINT_PREFIX: &str = "checkpoint-";

/// One entry of the log history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Optimizer step the entry was recorded at.
    pub step: usize,
    /// Fractional epoch.
    pub epoch: f64,
    /// Mean training loss since the previous entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loss: Option<f64>,
    /// Learning rate of the last update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learning_rate: Option<f64>,
    /// Validation loss.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_loss: Option<f64>,
}

/// Progress of a run, saved with every checkpoint and the final weights.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    /// Optimizer steps taken.
    pub global_step: usize,
    /// Planned optimizer steps.
    pub max_steps: usize,
    /// Fractional epoch.
    pub epoch: f64,
    /// Best validation loss seen.
    pub best_metric: Option<f64>,
    /// Logged metrics in order.
    pub log_history: Vec<LogEntry>,
}

impl TrainerState {
    /// Record a log entry, tracking the best validation loss.
    pub fn push(&mut self, entry: LogEntry) {
        if let Some(eval_loss) = entry.eval_loss {
            if self.best_metric.map_or(true, |best| eval_loss < best) {
                self.best_metric = Some(eval_loss);
            }
        }
        self.log_history.push(entry);
    }

    /// Write `trainer_state.json` into `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        std::fs::write(
            dir.join(TRAINER_STATE_FILE),
            serde_json::to_string_pretty(self)?,
        )?;
        Ok(())
    }

    /// Read `trainer_state.json` from `dir`.
    ///
    /// # Errors
    ///
    /// Returns a `Checkpoint` error if the file does not exist.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(TRAINER_STATE_FILE);
        if !path.exists() {
            return Err(SftError::Checkpoint(format!(
                "no trainer state in {}",
                dir.display()
            )));
        }
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }
}

/// Directory of the checkpoint taken at `step`.
#[must_use]
pub fn checkpoint_dir(output_dir: &Path, step: usize) -> PathBuf {
    output_dir.join(format!("{CHECKPOINT_PREFIX}{step}"))
}

/// Checkpoint directories under `output_dir`, oldest first.
///
/// # Errors
///
/// Returns an error if `output_dir` cannot be listed.
pub fn list_checkpoints(output_dir: &Path) -> Result<Vec<(usize, PathBuf)>> {
    if !output_dir.exists() {
        return Ok(Vec::new());
    }

    let mut checkpoints = Vec::new();
    for entry in std::fs::read_dir(output_dir)? {
        let path = entry?.path();
        let step = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_prefix(CHECKPOINT_PREFIX))
            .and_then(|step| step.parse::<usize>().ok());
        if let (Some(step), true) = (step, path.is_dir()) {
            checkpoints.push((step, path));
        }
    }
    checkpoints.sort_by_key(|(step, _)| *step);
    Ok(checkpoints)
}

/// Delete the oldest checkpoints so at most `limit` remain. A limit of 0
/// keeps everything.
///
/// # Errors
///
/// Returns an error if a checkpoint cannot be removed.
pub fn rotate_checkpoints(output_dir: &Path, limit: usize) -> Result<Vec<PathBuf>> {
    if limit == 0 {
        return Ok(Vec::new());
    }

    let checkpoints = list_checkpoints(output_dir)?;
    let excess = checkpoints.len().saturating_sub(limit);
    let mut removed = Vec::with_capacity(excess);
    for (_, path) in checkpoints.into_iter().take(excess) {
        tracing::info!("Deleting older checkpoint {}", path.display());
        std::fs::remove_dir_all(&path)?;
        removed.push(path);
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        for step in [10, 2, 30, 20] {
            std::fs::create_dir_all(checkpoint_dir(dir.path(), step)).unwrap();
        }
        std::fs::create_dir_all(dir.path().join("checkpoint-final")).unwrap();

        let removed = rotate_checkpoints(dir.path(), 2).unwrap();
        assert_eq!(removed.len(), 2);

        let remaining: Vec<usize> = list_checkpoints(dir.path())
            .unwrap()
            .into_iter()
            .map(|(step, _)| step)
            .collect();
        assert_eq!(remaining, vec![20, 30]);
        assert!(dir.path().join("checkpoint-final").exists());
    }

    #[test]
    fn test_zero_limit_keeps_all() {
        let dir = tempfile::tempdir().unwrap();
        for step in 1..=3 {
            std::fs::create_dir_all(checkpoint_dir(dir.path(), step)).unwrap();
        }
        assert!(rotate_checkpoints(dir.path(), 0).unwrap().is_empty());
        assert_eq!(list_checkpoints(dir.path()).unwrap().len(), 3);
    }

    #[test]
    fn test_state_roundtrip_and_best_metric() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = TrainerState {
            max_steps: 4,
            ..Default::default()
        };
        for (step, eval_loss) in [(1, 2.5), (2, 1.5), (3, 1.8)] {
            state.push(LogEntry {
                step,
                epoch: 0.5,
                loss: None,
                learning_rate: None,
                eval_loss: Some(eval_loss),
            });
        }
        assert_eq!(state.best_metric, Some(1.5));

        state.save(dir.path()).unwrap();
        assert_eq!(TrainerState::load(dir.path()).unwrap(), state);
    }

    #[test]
    fn test_missing_state() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            TrainerState::load(dir.path()),
            Err(SftError::Checkpoint(_))
        ));
    }
}
