//! Command-line interface.
//!
//! ```bash
//! autocomplete-sft train --batch-size 8 --load-in-4bit false
//! autocomplete-sft train --config sft.yaml --max-steps 1000
//! autocomplete-sft validate --config sft.yaml
//! autocomplete-sft init-config sft.yaml
//! ```
//!
//! Every option of [`SftConfig`] is exposed as a kebab-case flag; the
//! snake_case spelling is accepted as an alias. Boolean options take an
//! explicit value.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::SftConfig;
use crate::error::Result;

/// Supervised LoRA/QLoRA fine-tuning for autocomplete models.
#[derive(Parser, Debug, Clone)]
#[command(name = "autocomplete-sft")]
#[command(version)]
#[command(about = "Supervised LoRA/QLoRA fine-tuning of causal language models", long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Enable debug logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the full fine-tuning pipeline.
    Train(RunArgs),

    /// Resolve and validate the configuration without loading anything.
    Validate(RunArgs),

    /// Write the default configuration as YAML.
    InitConfig {
        /// Destination file.
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },
}

/// Configuration source plus per-option overrides.
#[derive(Args, Debug, Clone, Default, PartialEq)]
pub struct RunArgs {
    /// YAML file providing the base configuration.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Base model identifier (hub ID or local directory).
    #[arg(long, alias = "model_name")]
    pub model_name: Option<String>,

    /// Upstream dataset name recorded with the run.
    #[arg(long, alias = "dataset_name")]
    pub dataset_name: Option<String>,

    /// Column holding the training text.
    #[arg(long, alias = "dataset_text_field")]
    pub dataset_text_field: Option<String>,

    /// Training CSV file.
    #[arg(long, alias = "train_file", value_name = "PATH")]
    pub train_file: Option<PathBuf>,

    /// Validation CSV file.
    #[arg(long, alias = "validation_file", value_name = "PATH")]
    pub validation_file: Option<PathBuf>,

    /// Metrics reporter.
    #[arg(long, alias = "log_with")]
    pub log_with: Option<String>,

    /// Peak learning rate.
    #[arg(long, alias = "learning_rate")]
    pub learning_rate: Option<f64>,

    /// Batch size per device.
    #[arg(long, alias = "batch_size")]
    pub batch_size: Option<usize>,

    /// Maximum input sequence length.
    #[arg(long, alias = "seq_length")]
    pub seq_length: Option<usize>,

    /// Gradient accumulation steps.
    #[arg(long, alias = "gradient_accumulation_steps")]
    pub gradient_accumulation_steps: Option<usize>,

    /// Load the model with 8-bit weights.
    #[arg(long = "load-in-8bit", alias = "load_in_8bit", value_name = "BOOL")]
    pub load_in_8bit: Option<bool>,

    /// Load the model with 4-bit weights.
    #[arg(long = "load-in-4bit", alias = "load_in_4bit", value_name = "BOOL")]
    pub load_in_4bit: Option<bool>,

    /// Train LoRA adapters.
    #[arg(long, alias = "use_peft", value_name = "BOOL")]
    pub use_peft: Option<bool>,

    /// Allow unsupported architectures.
    #[arg(long, alias = "trust_remote_code", value_name = "BOOL")]
    pub trust_remote_code: Option<bool>,

    /// Output directory.
    #[arg(long, alias = "output_dir")]
    pub output_dir: Option<String>,

    /// LoRA rank.
    #[arg(long, alias = "peft_lora_r")]
    pub peft_lora_r: Option<usize>,

    /// LoRA alpha.
    #[arg(long, alias = "peft_lora_alpha")]
    pub peft_lora_alpha: Option<usize>,

    /// Log every N steps.
    #[arg(long, alias = "logging_steps")]
    pub logging_steps: Option<usize>,

    /// Authenticate hub downloads with `HF_TOKEN`.
    #[arg(long, alias = "use_auth_token", value_name = "BOOL")]
    pub use_auth_token: Option<bool>,

    /// Number of training epochs.
    #[arg(long, alias = "num_train_epochs", allow_negative_numbers = true)]
    pub num_train_epochs: Option<i64>,

    /// Number of optimizer steps.
    #[arg(long, alias = "max_steps", allow_negative_numbers = true)]
    pub max_steps: Option<i64>,

    /// Save a checkpoint every N steps.
    #[arg(long, alias = "save_steps")]
    pub save_steps: Option<usize>,

    /// Maximum number of checkpoints kept.
    #[arg(long, alias = "save_total_limit")]
    pub save_total_limit: Option<usize>,

    /// Publish the output directory to the hub.
    #[arg(long, alias = "push_to_hub", value_name = "BOOL")]
    pub push_to_hub: Option<bool>,

    /// Hub repository name.
    #[arg(long, alias = "hub_model_id")]
    pub hub_model_id: Option<String>,
}

macro_rules! apply_overrides {
    ($args:expr, $config:expr, [$($field:ident),* $(,)?]) => {
        $(
            if let Some(value) = &$args.$field {
                $config.$field = value.clone();
            }
        )*
    };
}

impl RunArgs {
    /// Overwrite the fields of `config` that were given on the command line.
    pub fn apply_to(&self, config: &mut SftConfig) {
        apply_overrides!(
            self,
            config,
            [
                model_name,
                dataset_name,
                dataset_text_field,
                train_file,
                validation_file,
                log_with,
                learning_rate,
                batch_size,
                seq_length,
                gradient_accumulation_steps,
                load_in_8bit,
                load_in_4bit,
                use_peft,
                trust_remote_code,
                output_dir,
                peft_lora_r,
                peft_lora_alpha,
                logging_steps,
                use_auth_token,
                num_train_epochs,
                max_steps,
                save_steps,
                save_total_limit,
                push_to_hub,
                hub_model_id,
            ]
        );
    }

    /// Build the validated configuration: file (or defaults), then overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be loaded or the result is invalid.
    pub fn resolve(&self) -> Result<SftConfig> {
        let mut config = match &self.config {
            Some(path) => SftConfig::from_file(path)?,
            None => SftConfig::default(),
        };
        self.apply_to(&mut config);
        config.validate()?;
        Ok(config)
    }
}
