//! Supervised fine-tuning loop on candle.

use std::path::Path;

use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var, D};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use indicatif::{ProgressBar, ProgressStyle};

use super::args::{EvaluationStrategy, SftParams, TrainingArguments};
use super::checkpoint::{checkpoint_dir, rotate_checkpoints, LogEntry, TrainerState};
use super::report::Reporter;
use super::{TrainOutput, TrainerFactory, TrainerInputs, TrainingRunner};
use crate::adapters::LoraAdapters;
use crate::dataset::{SftDatasets, TextRecord};
use crate::error::{Result, SftError};
use crate::model::{CausalLm, ForwardOptions};
use crate::scheduler::LrSchedule;
use crate::tokenizer::PreparedTokenizer;

/// Builds [`SftTrainer`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct SftTrainerFactory;

impl TrainerFactory for SftTrainerFactory {
    fn build(&self, inputs: TrainerInputs) -> Result<Box<dyn TrainingRunner>> {
        Ok(Box::new(SftTrainer::new(inputs)?))
    }
}

/// Token ids of a padded batch with its loss mask.
struct Batch {
    input_ids: Tensor,
    mask: Tensor,
    targets: usize,
}

/// Trains a causal LM on raw text, with or without adapters.
pub struct SftTrainer {
    model: CausalLm,
    tokenizer: PreparedTokenizer,
    datasets: SftDatasets,
    args: TrainingArguments,
    sft: SftParams,
    adapters: Option<LoraAdapters>,
    trainable: Vec<Var>,
    state: TrainerState,
}

impl SftTrainer {
    /// Create a trainer and its trainable parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if a batch size or step interval is zero, the
    /// tokenizer and model vocabularies differ, the training split is empty,
    /// or a quantized model is trained without adapters.
    pub fn new(inputs: TrainerInputs) -> Result<Self> {
        let TrainerInputs {
            mut model,
            tokenizer,
            datasets,
            args,
            peft,
            sft,
        } = inputs;
        sft.validate()?;
        args.validate()?;
        let tokenizer = tokenizer.with_max_length(sft.max_seq_length)?;

        if model.vocab_size() != tokenizer.vocab_size() {
            return Err(SftError::Training(format!(
                "model has {} embeddings but tokenizer has {} tokens",
                model.vocab_size(),
                tokenizer.vocab_size()
            )));
        }
        if datasets.is_empty() {
            return Err(SftError::Dataset("training split is empty".into()));
        }

        let (adapters, trainable) = match peft {
            Some(config) => {
                let adapters = LoraAdapters::new(&config, model.matrix_shapes(), model.device())?;
                if adapters.is_empty() {
                    return Err(SftError::Training(format!(
                        "no weights match target modules {:?}",
                        config.target_modules
                    )));
                }
                let vars = adapters.varmap().all_vars();
                (Some(adapters), vars)
            }
            None => (None, model.enable_full_training()?),
        };

        let trainable_params: usize = trainable.iter().map(|var| var.elem_count()).sum();
        tracing::info!("Trainable parameters: {}", trainable_params);
        if args.gradient_checkpointing {
            tracing::debug!("Gradient checkpointing requested, activations are kept in memory");
        }

        Ok(Self {
            model,
            tokenizer,
            datasets,
            args,
            sft,
            adapters,
            trainable,
            state: TrainerState::default(),
        })
    }

    /// Progress of the run so far.
    #[must_use]
    pub fn state(&self) -> &TrainerState {
        &self.state
    }

    /// Adapters being trained, if any.
    #[must_use]
    pub fn adapters(&self) -> Option<&LoraAdapters> {
        self.adapters.as_ref()
    }

    /// Tokenize, truncate and right-pad a batch of records.
    fn collate(&self, records: &[TextRecord]) -> Result<Batch> {
        let encoded = records
            .iter()
            .map(|record| self.tokenizer.encode(&record.text))
            .collect::<Result<Vec<_>>>()?;

        let width = encoded.iter().map(Vec::len).max().unwrap_or(0).max(1);
        let targets = encoded.iter().map(|ids| ids.len().saturating_sub(1)).sum();
        let pad = self.tokenizer.pad_token_id();

        let mut ids = Vec::with_capacity(records.len() * width);
        let mut mask = Vec::with_capacity(records.len() * width);
        for row in &encoded {
            ids.extend_from_slice(row);
            ids.extend(std::iter::repeat(pad).take(width - row.len()));
            mask.extend(std::iter::repeat(1f32).take(row.len()));
            mask.extend(std::iter::repeat(0f32).take(width - row.len()));
        }

        let device = self.model.device();
        Ok(Batch {
            input_ids: Tensor::from_vec(ids, (records.len(), width), device)?,
            mask: Tensor::from_vec(mask, (records.len(), width), device)?,
            targets,
        })
    }

    /// Mean next-token loss of a batch.
    fn batch_loss(&self, records: &[TextRecord], training: bool) -> Result<Tensor> {
        let batch = self.collate(records)?;
        if batch.targets == 0 {
            return Ok(Tensor::zeros((), DType::F32, self.model.device())?);
        }

        let options = ForwardOptions {
            adapters: self.adapters.as_ref(),
            neftune_alpha: if training {
                self.sft.neftune_noise_alpha
            } else {
                None
            },
        };
        let logits = self.model.forward(&batch.input_ids, options)?;
        masked_lm_loss(&logits, &batch.input_ids, &batch.mask, batch.targets)
    }

    /// Mean loss over the validation split, or `None` if it is empty.
    fn evaluate(&self) -> Result<Option<f64>> {
        let batches: Vec<&[TextRecord]> = self
            .datasets
            .validation
            .chunks(self.args.per_device_train_batch_size)
            .collect();
        if batches.is_empty() {
            return Ok(None);
        }

        let mut total = 0.0;
        for batch in &batches {
            total += scalar(&self.batch_loss(batch, false)?)?;
        }
        Ok(Some(total / batches.len() as f64))
    }

    /// Forward and backward over the micro-batches of one optimizer step.
    fn accumulate(&self, micro_batches: &[&[TextRecord]]) -> Result<(GradStore, f64)> {
        let count = micro_batches.len() as f64;
        let mut accumulated: Option<GradStore> = None;
        let mut loss_sum = 0.0;

        for records in micro_batches {
            let loss = (self.batch_loss(records, true)? / count)?;
            loss_sum += scalar(&loss)?;
            let grads = loss.backward()?;

            accumulated = Some(match accumulated.take() {
                None => grads,
                Some(mut acc) => {
                    for var in &self.trainable {
                        if let Some(grad) = grads.get(var) {
                            let sum = match acc.get(var) {
                                Some(prev) => (prev + grad)?,
                                None => grad.clone(),
                            };
                            acc.insert(var, sum);
                        }
                    }
                    acc
                }
            });
        }

        let grads = accumulated
            .ok_or_else(|| SftError::Training("optimizer step without micro-batches".into()))?;
        Ok((grads, loss_sum))
    }

    /// Scale gradients so their global L2 norm is at most `max_norm`.
    /// Returns the norm before clipping.
    fn clip_grad_norm(&self, grads: &mut GradStore, max_norm: f64) -> Result<f64> {
        let mut sum_sq = 0.0;
        for var in &self.trainable {
            if let Some(grad) = grads.get(var) {
                sum_sq += scalar(&grad.sqr()?.sum_all()?)?;
            }
        }
        let norm = sum_sq.sqrt();

        if max_norm > 0.0 && norm > max_norm {
            let scale = max_norm / (norm + 1e-6);
            for var in &self.trainable {
                if let Some(grad) = grads.get(var) {
                    let clipped = (grad * scale)?;
                    grads.insert(var, clipped);
                }
            }
        }
        Ok(norm)
    }

    fn save_checkpoint(&self) -> Result<()> {
        let dir = checkpoint_dir(&self.args.output_dir, self.state.global_step);
        self.save_model(&dir)?;
        tracing::info!("Saved checkpoint to: {}", dir.display());
        rotate_checkpoints(&self.args.output_dir, self.args.save_total_limit)?;
        Ok(())
    }

}

impl TrainingRunner for SftTrainer {
    fn train(&mut self) -> Result<TrainOutput> {
        let args = self.args.clone();
        let micro_batches: Vec<&[TextRecord]> = self
            .datasets
            .train
            .chunks(args.per_device_train_batch_size)
            .collect();
        let steps: Vec<Vec<&[TextRecord]>> = micro_batches
            .chunks(args.gradient_accumulation_steps.max(1))
            .map(|group| group.to_vec())
            .collect();
        let steps_per_epoch = steps.len();
        let total_steps = args.total_steps(micro_batches.len())?;
        let schedule = LrSchedule::new(
            args.lr_scheduler_type,
            args.learning_rate,
            args.warmup_ratio,
            total_steps,
        );

        tracing::info!("Starting training");
        tracing::info!("  Base model: {}", self.model.name_or_path());
        tracing::info!("  Examples: {}", self.datasets.len());
        tracing::info!("  Steps: {} ({} per epoch)", total_steps, steps_per_epoch);
        tracing::info!(
            "  Batch size: {} x {} accumulation",
            args.per_device_train_batch_size,
            args.gradient_accumulation_steps
        );

        if let Err(e) = self.model.device().set_seed(args.seed) {
            tracing::debug!("Device RNG not seeded: {}", e);
        }
        std::fs::create_dir_all(&args.output_dir)?;
        let mut reporter = Reporter::from_name(&args.report_to, &args.output_dir)?;
        let mut optimizer = AdamW::new(
            self.trainable.clone(),
            ParamsAdamW {
                lr: schedule.lr_at(0),
                weight_decay: args.weight_decay,
                ..Default::default()
            },
        )?;

        self.state = TrainerState {
            max_steps: total_steps,
            ..Default::default()
        };

        let pb = ProgressBar::new(total_steps as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
                )?
                .progress_chars("#>-"),
        );

        let mut loss_total = 0.0;
        let mut loss_since_log = 0.0;
        let mut steps_since_log = 0usize;

        for (index, micro) in steps.iter().cycle().take(total_steps).enumerate() {
            let lr = schedule.lr_at(index);
            optimizer.set_learning_rate(lr);

            let (mut grads, loss) = self.accumulate(micro)?;
            if !loss.is_finite() {
                return Err(SftError::Training(format!(
                    "non-finite loss at step {}",
                    index + 1
                )));
            }
            let grad_norm = self.clip_grad_norm(&mut grads, args.max_grad_norm)?;
            optimizer.step(&grads)?;

            let step = index + 1;
            self.state.global_step = step;
            self.state.epoch = step as f64 / steps_per_epoch as f64;
            loss_total += loss;
            loss_since_log += loss;
            steps_since_log += 1;
            pb.set_message(format!("loss {loss:.4}"));
            pb.inc(1);
            tracing::debug!(step, loss, grad_norm, lr, "optimizer step");

            if (step == 1 && args.logging_first_step) || step % args.logging_steps == 0 {
                let entry = LogEntry {
                    step,
                    epoch: self.state.epoch,
                    loss: Some(loss_since_log / steps_since_log as f64),
                    learning_rate: Some(lr),
                    eval_loss: None,
                };
                reporter.report(&entry)?;
                self.state.push(entry);
                loss_since_log = 0.0;
                steps_since_log = 0;
            }

            let evaluate = match args.evaluation_strategy {
                EvaluationStrategy::No => false,
                EvaluationStrategy::Steps => args.eval_steps > 0 && step % args.eval_steps == 0,
                EvaluationStrategy::Epoch => step % steps_per_epoch == 0,
            };
            if evaluate {
                if let Some(eval_loss) = self.evaluate()? {
                    let entry = LogEntry {
                        step,
                        epoch: self.state.epoch,
                        loss: None,
                        learning_rate: None,
                        eval_loss: Some(eval_loss),
                    };
                    reporter.report(&entry)?;
                    self.state.push(entry);
                }
            }

            if step % args.save_steps == 0 {
                self.save_checkpoint()?;
            }
        }

        pb.finish_with_message("Training complete");

        let output = TrainOutput {
            global_step: self.state.global_step,
            training_loss: loss_total / total_steps as f64,
        };
        tracing::info!(
            "Training complete: {} steps, mean loss {:.4}",
            output.global_step,
            output.training_loss
        );
        Ok(output)
    }

    fn save_model(&self, output_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(output_dir)?;
        match &self.adapters {
            Some(adapters) => adapters.save(output_dir, self.model.name_or_path())?,
            None => self.model.save_pretrained(output_dir)?,
        }
        self.tokenizer.save(output_dir)?;
        self.args.save(output_dir)?;
        self.state.save(output_dir)?;
        tracing::info!("Saved model to: {}", output_dir.display());
        Ok(())
    }
}

/// Cross entropy of each position predicting the next token, averaged over
/// the `targets` positions whose next token is not padding.
fn masked_lm_loss(logits: &Tensor, input_ids: &Tensor, mask: &Tensor, targets: usize) -> Result<Tensor> {
    let (batch, seq_len, vocab) = logits.dims3()?;
    let positions = batch * (seq_len - 1);

    let logits = logits
        .narrow(1, 0, seq_len - 1)?
        .to_dtype(DType::F32)?
        .reshape((positions, vocab))?;
    let labels = input_ids
        .narrow(1, 1, seq_len - 1)?
        .reshape((positions, 1))?
        .contiguous()?;
    let weights = mask.narrow(1, 1, seq_len - 1)?.reshape(positions)?;

    let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
    let picked = log_probs.gather(&labels, 1)?.squeeze(1)?;
    let total = (picked * weights)?.sum_all()?;
    Ok((total.neg()? / targets as f64)?)
}

fn scalar(tensor: &Tensor) -> Result<f64> {
    Ok(f64::from(tensor.to_dtype(DType::F32)?.to_scalar::<f32>()?))
}
