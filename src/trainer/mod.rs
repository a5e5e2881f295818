//! Trainer construction and the training-run capability.
//!
//! The pipeline never drives an optimizer itself. It builds a
//! [`TrainingRunner`] through a [`TrainerFactory`] and asks it to train and
//! save, so the orchestration can run against any implementation.

mod args;
mod checkpoint;
mod report;
mod sft;

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::adapters::LoraConfig;
use crate::dataset::SftDatasets;
use crate::error::Result;
use crate::model::CausalLm;
use crate::tokenizer::PreparedTokenizer;

pub use args::{EvaluationStrategy, SftParams, TrainingArguments, TRAINING_ARGS_FILE};
pub use checkpoint::{
    checkpoint_dir, list_checkpoints, rotate_checkpoints, LogEntry, TrainerState,
    TRAINER_STATE_FILE,
};
pub use report::{Reporter, METRICS_FILE};
pub use sft::{SftTrainer, SftTrainerFactory};

/// Summary of a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainOutput {
    /// Optimizer steps taken.
    pub global_step: usize,
    /// Mean training loss over all steps.
    pub training_loss: f64,
}

/// Everything a trainer is built from.
#[derive(Debug)]
pub struct TrainerInputs {
    /// Base model, already resized to the tokenizer.
    pub model: CausalLm,
    /// Tokenizer with padding configured.
    pub tokenizer: PreparedTokenizer,
    /// Train and validation records.
    pub datasets: SftDatasets,
    /// Optimization parameters.
    pub args: TrainingArguments,
    /// Adapter configuration; `None` trains every weight.
    pub peft: Option<LoraConfig>,
    /// Text-specific parameters.
    pub sft: SftParams,
}

/// A constructed trainer, ready to run.
pub trait TrainingRunner {
    /// Run the training loop to completion.
    ///
    /// # Errors
    ///
    /// Returns an error if any step fails.
    fn train(&mut self) -> Result<TrainOutput>;

    /// Write the trained weights and run metadata into `output_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be written.
    fn save_model(&self, output_dir: &Path) -> Result<()>;
}

/// Builds a [`TrainingRunner`] from the run inputs.
pub trait TrainerFactory {
    /// Construct the trainer.
    ///
    /// # Errors
    ///
    /// Returns an error if the inputs are inconsistent.
    fn build(&self, inputs: TrainerInputs) -> Result<Box<dyn TrainingRunner>>;
}
