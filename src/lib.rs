//! # autocomplete-sft
//!
//! Supervised fine-tuning of causal language models for autocomplete, with
//! low-rank adapters and quantized base weights.
//!
//! A run loads a pretrained tokenizer and extends it with a padding token
//! and placeholder tokens for redacted entities, reads train/validation CSV
//! files, loads the base model (optionally 4-bit or 8-bit), resizes its
//! embeddings to the tokenizer, trains and saves the result.
//!
//! ## Features
//!
//! - **Flag or YAML configuration** - every option has a default
//! - **`LoRA` / `QLoRA`** - adapters on all attention and MLP projections
//! - **NEFTune** - embedding noise during training
//! - **Hub publishing** - optional upload of the output directory
//!
//! ## Quick Start
//!
//! ```bash
//! # Inspect the resolved configuration
//! autocomplete-sft validate --model-name ./zephyr-7b-beta
//!
//! # Fine-tune
//! autocomplete-sft train --config sft.yaml --push-to-hub false
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod adapters;
pub mod cli;
pub mod config;
pub mod dataset;
pub mod error;
pub mod hub;
pub mod model;
pub mod pipeline;
pub mod runtime;
pub mod scheduler;
pub mod tokenizer;
pub mod trainer;

pub use config::SftConfig;
pub use error::{Result, SftError};
pub use pipeline::PipelineOutput;
pub use trainer::{SftTrainer, TrainingRunner};
