//! Configuration parsing and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SftError};

/// Flat configuration record for one fine-tuning run.
///
/// Every field has a default, so an empty YAML document (or no flags at all)
/// yields a complete record. Call [`SftConfig::validate`] before using it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SftConfig {
    /// Base model identifier (hub model ID or local directory).
    pub model_name: String,

    /// Name of the upstream dataset, recorded with the run artifacts.
    pub dataset_name: String,

    /// Column holding the training text.
    pub dataset_text_field: String,

    /// CSV file with the training records.
    pub train_file: PathBuf,

    /// CSV file with the validation records.
    pub validation_file: PathBuf,

    /// Metrics reporter (`none`, `tracing`, `jsonl`; anything else falls back to `tracing`).
    pub log_with: String,

    /// Peak learning rate.
    pub learning_rate: f64,

    /// Batch size per device.
    pub batch_size: usize,

    /// Maximum input sequence length in tokens.
    pub seq_length: usize,

    /// Gradient accumulation steps.
    pub gradient_accumulation_steps: usize,

    /// Load the base model with 8-bit weights.
    pub load_in_8bit: bool,

    /// Load the base model with 4-bit weights.
    pub load_in_4bit: bool,

    /// Train low-rank adapters instead of the full model.
    pub use_peft: bool,

    /// Allow architectures outside the natively supported families.
    pub trust_remote_code: bool,

    /// Output directory for checkpoints and final weights.
    pub output_dir: String,

    /// Rank of the `LoRA` decomposition.
    pub peft_lora_r: usize,

    /// `LoRA` scaling numerator.
    pub peft_lora_alpha: usize,

    /// Log every N optimizer steps.
    pub logging_steps: usize,

    /// Authenticate hub downloads with `HF_TOKEN`.
    pub use_auth_token: bool,

    /// Number of passes over the training data (ignored when `max_steps > 0`).
    pub num_train_epochs: i64,

    /// Total optimizer steps (takes precedence when positive).
    pub max_steps: i64,

    /// Save a checkpoint every N optimizer steps.
    pub save_steps: usize,

    /// Maximum number of checkpoints kept on disk.
    pub save_total_limit: usize,

    /// Publish the output directory to the model hub after saving.
    pub push_to_hub: bool,

    /// Repository name used when publishing.
    pub hub_model_id: String,
}

impl Default for SftConfig {
    fn default() -> Self {
        Self {
            model_name: "HuggingFaceH4/zephyr-7b-beta".into(),
            dataset_name: "stingning/ultrachat".into(),
            dataset_text_field: "text".into(),
            train_file: PathBuf::from("../rogers_data/rogers_train_df.csv"),
            validation_file: PathBuf::from("../rogers_data/rogers_val_df.csv"),
            log_with: "wandb".into(),
            learning_rate: 2.0e-5,
            batch_size: 4,
            seq_length: 1024,
            gradient_accumulation_steps: 1,
            load_in_8bit: false,
            load_in_4bit: true,
            use_peft: true,
            trust_remote_code: false,
            output_dir: "output".into(),
            peft_lora_r: 16,
            peft_lora_alpha: 64,
            logging_steps: 100,
            use_auth_token: false,
            num_train_epochs: -1,
            max_steps: 500,
            save_steps: 100,
            save_total_limit: 10,
            push_to_hub: true,
            hub_model_id: "zephyr-7b-finetuned-autocomplete".into(),
        }
    }
}

impl SftConfig {
    /// Load configuration from a YAML file. Missing keys keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.load_in_8bit && self.load_in_4bit {
            return Err(SftError::Config(
                "cannot load the model in 8 bits and 4 bits at the same time".into(),
            ));
        }

        if self.model_name.is_empty() {
            return Err(SftError::Config("model_name is required".into()));
        }

        if self.dataset_text_field.is_empty() {
            return Err(SftError::Config("dataset_text_field is required".into()));
        }

        for (name, value) in [
            ("batch_size", self.batch_size),
            ("seq_length", self.seq_length),
            ("gradient_accumulation_steps", self.gradient_accumulation_steps),
            ("logging_steps", self.logging_steps),
            ("save_steps", self.save_steps),
        ] {
            if value == 0 {
                return Err(SftError::Config(format!("{name} must be > 0")));
            }
        }

        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(SftError::Config("learning_rate must be > 0".into()));
        }

        if self.use_peft && self.peft_lora_r == 0 {
            return Err(SftError::Config("peft_lora_r must be > 0".into()));
        }

        if self.max_steps <= 0 && self.num_train_epochs <= 0 {
            return Err(SftError::Config(
                "either max_steps or num_train_epochs must be > 0".into(),
            ));
        }

        if self.push_to_hub && self.hub_model_id.is_empty() {
            return Err(SftError::Config(
                "hub_model_id is required when push_to_hub is set".into(),
            ));
        }

        Ok(())
    }

    /// Whether the base model is loaded with quantized weights.
    #[must_use]
    pub fn quantized(&self) -> bool {
        self.load_in_4bit || self.load_in_8bit
    }
}
