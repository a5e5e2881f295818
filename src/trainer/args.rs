//! Training arguments and SFT-specific parameters derived from the config.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::SftConfig;
use crate::error::{Result, SftError};
use crate::scheduler::LrScheduler;

/// File the arguments are written to next to the weights.
pub const TRAINING_ARGS_FILE: &str = "training_args.json";

/// When evaluation runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvaluationStrategy {
    /// Never evaluate.
    No,
    /// Evaluate every `eval_steps` optimizer steps.
    #[default]
    Steps,
    /// Evaluate after each pass over the training set.
    Epoch,
}

/// Optimization and bookkeeping parameters of a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingArguments {
    /// Directory for checkpoints and final weights.
    pub output_dir: PathBuf,
    /// Examples per micro-batch.
    pub per_device_train_batch_size: usize,
    /// Micro-batches per optimizer step.
    pub gradient_accumulation_steps: usize,
    /// Trade compute for activation memory.
    pub gradient_checkpointing: bool,
    /// Peak learning rate.
    pub learning_rate: f64,
    /// Optimizer steps between log lines.
    pub logging_steps: usize,
    /// Also log after the first optimizer step.
    pub logging_first_step: bool,
    /// Passes over the training set; ignored when `max_steps` is positive.
    pub num_train_epochs: i64,
    /// Optimizer steps to run; `<= 0` defers to `num_train_epochs`.
    pub max_steps: i64,
    /// Metrics reporter name.
    pub report_to: String,
    /// Optimizer steps between checkpoints.
    pub save_steps: usize,
    /// Checkpoints kept on disk.
    pub save_total_limit: usize,
    /// Compute in bf16 where the device supports it.
    pub bf16: bool,
    /// Learning rate schedule.
    pub lr_scheduler_type: LrScheduler,
    /// Fraction of the run spent warming up.
    pub warmup_ratio: f64,
    /// When to evaluate.
    pub evaluation_strategy: EvaluationStrategy,
    /// Optimizer steps between evaluations.
    pub eval_steps: usize,
    /// Gradient norm clipping threshold.
    pub max_grad_norm: f64,
    /// Decoupled weight decay.
    pub weight_decay: f64,
    /// Random seed.
    pub seed: u64,
    /// Publish the output directory after training.
    pub push_to_hub: bool,
    /// Hub repository to publish to.
    pub hub_model_id: String,
}

impl TrainingArguments {
    /// Build the arguments for a run.
    #[must_use]
    pub fn from_config(config: &SftConfig) -> Self {
        Self {
            output_dir: PathBuf::from(&config.output_dir),
            per_device_train_batch_size: config.batch_size,
            gradient_accumulation_steps: config.gradient_accumulation_steps,
            gradient_checkpointing: true,
            learning_rate: config.learning_rate,
            logging_steps: config.logging_steps,
            logging_first_step: true,
            num_train_epochs: config.num_train_epochs,
            max_steps: config.max_steps,
            report_to: config.log_with.clone(),
            save_steps: config.save_steps,
            save_total_limit: config.save_total_limit,
            bf16: true,
            lr_scheduler_type: LrScheduler::Cosine,
            warmup_ratio: 0.1,
            evaluation_strategy: EvaluationStrategy::Steps,
            eval_steps: config.logging_steps,
            max_grad_norm: 1.0,
            weight_decay: 0.0,
            seed: 42,
            push_to_hub: config.push_to_hub,
            hub_model_id: config.hub_model_id.clone(),
        }
    }

    /// Check the sizes and intervals the training loop divides by.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error naming the first zero value.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("per_device_train_batch_size", self.per_device_train_batch_size),
            ("gradient_accumulation_steps", self.gradient_accumulation_steps),
            ("logging_steps", self.logging_steps),
            ("save_steps", self.save_steps),
        ] {
            if value == 0 {
                return Err(SftError::Config(format!("{name} must be > 0")));
            }
        }
        if self.evaluation_strategy == EvaluationStrategy::Steps && self.eval_steps == 0 {
            return Err(SftError::Config(
                "eval_steps must be > 0 with step evaluation".into(),
            ));
        }
        Ok(())
    }

    /// Optimizer steps in one pass over `num_micro_batches` micro-batches.
    #[must_use]
    pub fn steps_per_epoch(&self, num_micro_batches: usize) -> usize {
        num_micro_batches.div_ceil(self.gradient_accumulation_steps.max(1))
    }

    /// Total optimizer steps for the run.
    ///
    /// A positive `max_steps` wins; otherwise `num_train_epochs` full passes.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error if neither gives a positive step count.
    pub fn total_steps(&self, num_micro_batches: usize) -> Result<usize> {
        if let Ok(steps) = usize::try_from(self.max_steps) {
            if steps > 0 {
                return Ok(steps);
            }
        }
        let epochs = usize::try_from(self.num_train_epochs).unwrap_or(0);
        let total = epochs * self.steps_per_epoch(num_micro_batches);
        if total == 0 {
            return Err(SftError::Config(format!(
                "no training steps: max_steps={}, num_train_epochs={}, {} batches",
                self.max_steps, self.num_train_epochs, num_micro_batches
            )));
        }
        Ok(total)
    }

    /// Write `training_args.json` into `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        std::fs::write(
            dir.join(TRAINING_ARGS_FILE),
            serde_json::to_string_pretty(self)?,
        )?;
        Ok(())
    }
}

/// Parameters specific to supervised fine-tuning on raw text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SftParams {
    /// Token budget per example.
    pub max_seq_length: usize,
    /// Dataset column holding the text.
    pub dataset_text_field: String,
    /// Concatenate examples into fixed-length blocks.
    pub packing: bool,
    /// NEFTune embedding noise; `None` disables it.
    pub neftune_noise_alpha: Option<f64>,
}

impl SftParams {
    /// Build the parameters for a run.
    #[must_use]
    pub fn from_config(config: &SftConfig) -> Self {
        Self {
            max_seq_length: config.seq_length,
            dataset_text_field: config.dataset_text_field.clone(),
            packing: false,
            neftune_noise_alpha: Some(5.0),
        }
    }

    /// Check the parameters the trainer can honour.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error if packing is requested or the sequence
    /// length is too short to hold a target.
    pub fn validate(&self) -> Result<()> {
        if self.packing {
            return Err(SftError::Config("packing is not supported".into()));
        }
        if self.max_seq_length < 2 {
            return Err(SftError::Config(
                "max_seq_length must be at least 2".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_default_config() {
        let args = TrainingArguments::from_config(&SftConfig::default());
        assert_eq!(args.output_dir, PathBuf::from("output"));
        assert_eq!(args.per_device_train_batch_size, 4);
        assert!(args.gradient_checkpointing);
        assert!(args.logging_first_step);
        assert!(args.bf16);
        assert_eq!(args.eval_steps, args.logging_steps);
        assert_eq!(args.report_to, "wandb");
        assert_eq!(args.lr_scheduler_type, LrScheduler::Cosine);
        assert_eq!(args.evaluation_strategy, EvaluationStrategy::Steps);
        assert_eq!(args.seed, 42);
        assert_eq!(args.hub_model_id, "zephyr-7b-finetuned-autocomplete");
    }

    #[test]
    fn test_max_steps_wins() {
        let args = TrainingArguments::from_config(&SftConfig::default());
        assert_eq!(args.total_steps(3).unwrap(), 500);
    }

    #[test]
    fn test_epochs_when_no_max_steps() {
        let args = TrainingArguments::from_config(&SftConfig {
            max_steps: -1,
            num_train_epochs: 3,
            gradient_accumulation_steps: 2,
            ..Default::default()
        });
        // 5 micro-batches -> 3 optimizer steps per epoch.
        assert_eq!(args.steps_per_epoch(5), 3);
        assert_eq!(args.total_steps(5).unwrap(), 9);
    }

    #[test]
    fn test_no_steps_is_error() {
        let args = TrainingArguments::from_config(&SftConfig {
            max_steps: 0,
            num_train_epochs: 2,
            ..Default::default()
        });
        assert!(matches!(args.total_steps(0), Err(SftError::Config(_))));
    }

    #[test]
    fn test_zero_intervals_rejected() {
        let args = TrainingArguments::from_config(&SftConfig::default());
        assert!(args.validate().is_ok());

        let mutations: [fn(&mut TrainingArguments); 5] = [
            |a| a.per_device_train_batch_size = 0,
            |a| a.gradient_accumulation_steps = 0,
            |a| a.logging_steps = 0,
            |a| a.save_steps = 0,
            |a| a.eval_steps = 0,
        ];
        for mutate in mutations {
            let mut broken = args.clone();
            mutate(&mut broken);
            assert!(matches!(broken.validate(), Err(SftError::Config(_))));
        }
    }

    #[test]
    fn test_sft_params() {
        let params = SftParams::from_config(&SftConfig::default());
        assert_eq!(params.max_seq_length, 1024);
        assert_eq!(params.dataset_text_field, "text");
        assert!(!params.packing);
        assert_eq!(params.neftune_noise_alpha, Some(5.0));
        assert!(params.validate().is_ok());

        let packed = SftParams {
            packing: true,
            ..params
        };
        assert!(packed.validate().is_err());
    }

    #[test]
    fn test_save_writes_json() {
        let dir = tempfile::tempdir().unwrap();
        let args = TrainingArguments::from_config(&SftConfig::default());
        args.save(dir.path()).unwrap();

        let json: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join(TRAINING_ARGS_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(json["lr_scheduler_type"], "cosine");
        assert_eq!(json["max_grad_norm"], 1.0);
    }
}
