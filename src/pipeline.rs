//! The fine-tuning run, from configuration to saved weights.

use std::path::PathBuf;

use crate::adapters::LoraConfig;
use crate::config::SftConfig;
use crate::dataset::SftDatasets;
use crate::error::Result;
use crate::hub::{HubPublisher, ModelSource};
use crate::model::{CausalLm, LoadPlan};
use crate::tokenizer::PreparedTokenizer;
use crate::trainer::{SftParams, TrainOutput, TrainerFactory, TrainerInputs, TrainingArguments};

/// Result of a completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutput {
    /// Summary returned by the trainer.
    pub train: TrainOutput,
    /// Directory the weights were saved to.
    pub output_dir: PathBuf,
    /// Hub repository the directory was published to.
    pub published_to: Option<String>,
}

/// Run a fine-tuning job.
///
/// Loads the tokenizer, datasets and model described by `config`, trains
/// with a runner from `factory`, saves into `output_dir` and, when
/// `push_to_hub` is set, publishes the directory with `publisher`.
///
/// # Errors
///
/// Returns the first error of any step. Nothing is retried.
pub fn run(
    config: &SftConfig,
    factory: &dyn TrainerFactory,
    publisher: &dyn HubPublisher,
) -> Result<PipelineOutput> {
    config.validate()?;
    tracing::info!(
        "Fine-tuning {} on {} (quantized: {}, adapters: {})",
        config.model_name,
        config.dataset_name,
        config.quantized(),
        config.use_peft
    );

    let source = ModelSource::new(&config.model_name, config.use_auth_token);
    let tokenizer = PreparedTokenizer::load(&source)?;

    let datasets = SftDatasets::load(
        &config.train_file,
        &config.validation_file,
        &config.dataset_text_field,
    )?;

    let plan = LoadPlan::from_config(config)?;
    let mut model = CausalLm::load(&config.model_name, &source, &plan, config.trust_remote_code)?;
    model.set_use_cache(false);
    model.resize_token_embeddings(tokenizer.vocab_size())?;

    let inputs = TrainerInputs {
        model,
        tokenizer,
        datasets,
        args: TrainingArguments::from_config(config),
        peft: LoraConfig::from_config(config),
        sft: SftParams::from_config(config),
    };
    let mut trainer = factory.build(inputs)?;

    let train = trainer.train()?;

    let output_dir = PathBuf::from(&config.output_dir);
    trainer.save_model(&output_dir)?;

    let published_to = if config.push_to_hub {
        publisher.publish(&config.hub_model_id, &output_dir)?;
        Some(config.hub_model_id.clone())
    } else {
        None
    };

    Ok(PipelineOutput {
        train,
        output_dir,
        published_to,
    })
}
