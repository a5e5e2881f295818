//! Causal language model loading, quantization and embedding resizing.
//!
//! Models use the Llama weight layout (`model.embed_tokens`, `model.layers.N`,
//! `model.norm`, `lm_head`), which covers the Llama, Mistral and Qwen2
//! families. Weights are kept in a flat name-to-parameter map so the trainer
//! can freeze, quantize or train them individually.

mod decoder;
mod quant;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use candle_core::quantized::QTensor;
use candle_core::{DType, Device, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SftError};
use crate::hub::ModelSource;

pub use decoder::ForwardOptions;
pub use quant::{DevicePlacement, LoadPlan, QuantBits, QuantizationDescriptor};

/// Name of the token embedding weight.
pub const EMBED_TOKENS: &str = "model.embed_tokens.weight";

/// Name of the output projection weight.
pub const LM_HEAD: &str = "lm_head.weight";

/// File name of full-model weights.
pub const MODEL_WEIGHTS_FILE: &str = "model.safetensors";

/// Model types with a natively supported layout.
pub const SUPPORTED_MODEL_TYPES: [&str; 3] = ["llama", "mistral", "qwen2"];

/// Architecture hyperparameters read from `config.json`.
///
/// Unknown keys are preserved so the saved `config.json` matches the input
/// apart from the fields this crate changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArch {
    /// Architecture family.
    #[serde(default = "default_model_type")]
    pub model_type: String,
    /// Number of token embeddings.
    pub vocab_size: usize,
    /// Width of the residual stream.
    pub hidden_size: usize,
    /// Width of the feed-forward block.
    pub intermediate_size: usize,
    /// Number of decoder blocks.
    pub num_hidden_layers: usize,
    /// Number of query heads.
    pub num_attention_heads: usize,
    /// Number of key/value heads (grouped-query attention).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_key_value_heads: Option<usize>,
    /// RMS norm epsilon.
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    /// Rotary embedding base.
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    /// Whether `lm_head` shares the embedding matrix.
    #[serde(default)]
    pub tie_word_embeddings: bool,
    /// Whether key/value caching is enabled.
    #[serde(default = "default_use_cache")]
    pub use_cache: bool,
    /// Remaining keys of `config.json`.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_model_type() -> String {
    "llama".into()
}
fn default_rms_norm_eps() -> f64 {
    1e-6
}
fn default_rope_theta() -> f64 {
    10_000.0
}
fn default_use_cache() -> bool {
    true
}

impl ModelArch {
    /// Key/value head count, defaulting to the query head count.
    #[must_use]
    pub fn kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    /// Width of one attention head.
    #[must_use]
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    fn check(&self, trust_remote_code: bool) -> Result<()> {
        if !SUPPORTED_MODEL_TYPES.contains(&self.model_type.as_str()) {
            if !trust_remote_code {
                return Err(SftError::Model(format!(
                    "unsupported model_type '{}' (set trust_remote_code to try the Llama layout)",
                    self.model_type
                )));
            }
            tracing::warn!(
                "model_type '{}' is not natively supported, assuming the Llama layout",
                self.model_type
            );
        }

        if self.num_attention_heads == 0
            || self.kv_heads() == 0
            || self.hidden_size % self.num_attention_heads != 0
            || self.num_attention_heads % self.kv_heads() != 0
            || self.head_dim() % 2 != 0
        {
            return Err(SftError::Model(format!(
                "inconsistent attention shape: hidden={} heads={} kv_heads={}",
                self.hidden_size,
                self.num_attention_heads,
                self.kv_heads()
            )));
        }
        Ok(())
    }
}

/// A single named weight.
#[derive(Debug, Clone)]
pub enum Parameter {
    /// Dense weight excluded from optimization.
    Frozen(Tensor),
    /// Dense weight updated by the optimizer.
    Trainable(Var),
    /// Blockwise-quantized weight, dequantized on use.
    Quantized(Arc<QTensor>),
}

impl Parameter {
    /// Dense view of the weight in `dtype`.
    ///
    /// # Errors
    ///
    /// Returns an error if dequantization or conversion fails.
    pub fn tensor(&self, device: &Device, dtype: DType) -> Result<Tensor> {
        Ok(match self {
            Self::Frozen(tensor) => tensor.clone(),
            Self::Trainable(var) => var.as_tensor().clone(),
            Self::Quantized(qtensor) => qtensor.dequantize(device)?.to_dtype(dtype)?,
        })
    }

    /// Weight dimensions.
    #[must_use]
    pub fn dims(&self) -> Vec<usize> {
        match self {
            Self::Frozen(tensor) => tensor.dims().to_vec(),
            Self::Trainable(var) => var.dims().to_vec(),
            Self::Quantized(qtensor) => qtensor.shape().dims().to_vec(),
        }
    }

    /// Check if the weight is stored quantized.
    #[must_use]
    pub fn is_quantized(&self) -> bool {
        matches!(self, Self::Quantized(_))
    }
}

/// A causal language model held as named parameters.
pub struct CausalLm {
    name_or_path: String,
    arch: ModelArch,
    params: BTreeMap<String, Parameter>,
    device: Device,
    dtype: DType,
    quantization: Option<QuantizationDescriptor>,
}

impl std::fmt::Debug for CausalLm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CausalLm")
            .field("name_or_path", &self.name_or_path)
            .field("model_type", &self.arch.model_type)
            .field("params", &self.params.len())
            .field("dtype", &self.dtype)
            .field("quantization", &self.quantization)
            .finish_non_exhaustive()
    }
}

impl CausalLm {
    /// Load `config.json` and safetensors weights according to `plan`.
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be resolved or parsed, or if the
    /// architecture is not supported.
    pub fn load(
        name_or_path: &str,
        source: &ModelSource,
        plan: &LoadPlan,
        trust_remote_code: bool,
    ) -> Result<Self> {
        let config_path = source.config_file()?;
        let arch: ModelArch = serde_json::from_str(&std::fs::read_to_string(&config_path)?)?;
        arch.check(trust_remote_code)?;

        let device = plan.placement.device()?;
        let dtype = plan.dtype_for(&device);
        tracing::info!(
            "Loading {} ({}, {} layers) on {:?} as {:?}",
            name_or_path,
            arch.model_type,
            arch.num_hidden_layers,
            device,
            dtype
        );

        let mut tensors = HashMap::new();
        for file in source.weight_files()? {
            tracing::debug!("Reading {}", file.display());
            tensors.extend(candle_core::safetensors::load(&file, &device)?);
        }

        Self::from_tensors(name_or_path, arch, tensors, &device, dtype, plan.quantization)
    }

    /// Build a model from already-loaded tensors.
    ///
    /// Projection weights are quantized when `quantization` is set and their
    /// shape allows it; everything else is converted to `dtype`.
    ///
    /// # Errors
    ///
    /// Returns an error if the embedding is missing or a conversion fails.
    pub fn from_tensors(
        name_or_path: &str,
        arch: ModelArch,
        tensors: HashMap<String, Tensor>,
        device: &Device,
        dtype: DType,
        quantization: Option<QuantizationDescriptor>,
    ) -> Result<Self> {
        let mut params = BTreeMap::new();
        let mut quantized = 0usize;

        for (name, tensor) in tensors {
            let tensor = tensor.to_device(device)?;
            let param = match quantization {
                Some(descriptor) if is_projection(&name) && descriptor.supports(&tensor) => {
                    quantized += 1;
                    Parameter::Quantized(Arc::new(descriptor.quantize(&tensor)?))
                }
                _ => Parameter::Frozen(tensor.to_dtype(dtype)?),
            };
            params.insert(name, param);
        }

        if !params.contains_key(EMBED_TOKENS) {
            return Err(SftError::Model(format!("missing {EMBED_TOKENS}")));
        }
        if quantization.is_some() {
            tracing::info!("Quantized {} projection weights", quantized);
        }

        Ok(Self {
            name_or_path: name_or_path.to_string(),
            arch,
            params,
            device: device.clone(),
            dtype,
            quantization,
        })
    }

    /// Identifier the model was loaded from.
    #[must_use]
    pub fn name_or_path(&self) -> &str {
        &self.name_or_path
    }

    /// Architecture hyperparameters.
    #[must_use]
    pub fn arch(&self) -> &ModelArch {
        &self.arch
    }

    /// Device holding the weights.
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Dtype of dense weights and activations.
    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Quantization applied at load time.
    #[must_use]
    pub fn quantization(&self) -> Option<QuantizationDescriptor> {
        self.quantization
    }

    /// Look up a parameter.
    #[must_use]
    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.params.get(name)
    }

    /// Dense view of a named weight.
    ///
    /// # Errors
    ///
    /// Returns a `Model` error if the weight does not exist.
    pub fn weight(&self, name: &str) -> Result<Tensor> {
        self.params
            .get(name)
            .ok_or_else(|| SftError::Model(format!("missing weight {name}")))?
            .tensor(&self.device, self.dtype)
    }

    /// Output projection, falling back to the embedding when tied.
    pub(crate) fn lm_head_weight(&self) -> Result<Tensor> {
        if self.arch.tie_word_embeddings || !self.params.contains_key(LM_HEAD) {
            self.weight(EMBED_TOKENS)
        } else {
            self.weight(LM_HEAD)
        }
    }

    /// Rows of the token embedding.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.params
            .get(EMBED_TOKENS)
            .and_then(|param| param.dims().first().copied())
            .unwrap_or(0)
    }

    /// Whether key/value caching is enabled.
    #[must_use]
    pub fn use_cache(&self) -> bool {
        self.arch.use_cache
    }

    /// Enable or disable key/value caching.
    pub fn set_use_cache(&mut self, use_cache: bool) {
        self.arch.use_cache = use_cache;
    }

    /// Resize the token embedding (and an untied `lm_head`) to `new_size` rows.
    ///
    /// Added rows are initialized to the mean of the existing rows; shrinking
    /// drops the trailing rows.
    ///
    /// # Errors
    ///
    /// Returns an error if `new_size` is zero or a weight is not a matrix.
    pub fn resize_token_embeddings(&mut self, new_size: usize) -> Result<()> {
        if new_size == 0 {
            return Err(SftError::Model("cannot resize embeddings to 0 rows".into()));
        }
        let old_size = self.vocab_size();
        if old_size == new_size {
            return Ok(());
        }

        for name in [EMBED_TOKENS, LM_HEAD] {
            let Some(param) = self.params.get(name) else {
                continue;
            };
            let resized = resize_rows(&param.tensor(&self.device, self.dtype)?, new_size)?;
            let param = match param {
                Parameter::Trainable(_) => Parameter::Trainable(Var::from_tensor(&resized)?),
                _ => Parameter::Frozen(resized),
            };
            self.params.insert(name.to_string(), param);
        }

        self.arch.vocab_size = new_size;
        tracing::info!("Resized token embeddings: {} -> {}", old_size, new_size);
        Ok(())
    }

    /// `(out_features, in_features)` of every two-dimensional weight.
    #[must_use]
    pub fn matrix_shapes(&self) -> Vec<(&str, (usize, usize))> {
        self.params
            .iter()
            .filter_map(|(name, param)| match param.dims().as_slice() {
                [rows, cols] => Some((name.as_str(), (*rows, *cols))),
                _ => None,
            })
            .collect()
    }

    /// Make every dense weight trainable and return the variables.
    ///
    /// # Errors
    ///
    /// Returns a `Training` error for a quantized model, whose weights cannot
    /// be updated directly.
    pub fn enable_full_training(&mut self) -> Result<Vec<Var>> {
        let quantized_error =
            || SftError::Training("cannot fine-tune a quantized model without adapters".into());
        if self.params.values().any(Parameter::is_quantized) {
            return Err(quantized_error());
        }

        let mut vars = Vec::with_capacity(self.params.len());
        for param in self.params.values_mut() {
            let var = match param {
                Parameter::Trainable(var) => var.clone(),
                Parameter::Frozen(tensor) => Var::from_tensor(tensor)?,
                Parameter::Quantized(_) => return Err(quantized_error()),
            };
            *param = Parameter::Trainable(var.clone());
            vars.push(var);
        }
        Ok(vars)
    }

    /// Write `model.safetensors` and `config.json` into `dir`.
    ///
    /// Quantized weights are written dequantized.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be written.
    pub fn save_pretrained(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;

        let mut tensors = HashMap::with_capacity(self.params.len());
        for (name, param) in &self.params {
            tensors.insert(name.clone(), param.tensor(&self.device, self.dtype)?);
        }
        candle_core::safetensors::save(&tensors, dir.join(MODEL_WEIGHTS_FILE))?;

        std::fs::write(
            dir.join("config.json"),
            serde_json::to_string_pretty(&self.arch)?,
        )?;
        Ok(())
    }
}

fn is_projection(name: &str) -> bool {
    name.starts_with("model.layers.") && name.ends_with("_proj.weight")
}

fn resize_rows(weight: &Tensor, new_rows: usize) -> Result<Tensor> {
    let (rows, cols) = weight.dims2()?;
    if new_rows <= rows {
        return Ok(weight.narrow(0, 0, new_rows)?.contiguous()?);
    }

    let mean = weight
        .to_dtype(DType::F32)?
        .mean_keepdim(0)?
        .to_dtype(weight.dtype())?;
    let added = mean.broadcast_as((new_rows - rows, cols))?.contiguous()?;
    Ok(Tensor::cat(&[weight, &added], 0)?)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Architecture of a tiny two-layer model used across tests.
    pub(crate) fn tiny_arch(vocab_size: usize) -> ModelArch {
        serde_json::from_value(serde_json::json!({
            "model_type": "llama",
            "vocab_size": vocab_size,
            "hidden_size": 32,
            "intermediate_size": 64,
            "num_hidden_layers": 2,
            "num_attention_heads": 4,
            "num_key_value_heads": 2,
            "rms_norm_eps": 1e-5,
            "architectures": ["LlamaForCausalLM"]
        }))
        .unwrap()
    }

    /// Random weights in the Llama layout for `arch`.
    pub(crate) fn tiny_tensors(arch: &ModelArch) -> HashMap<String, Tensor> {
        let device = Device::Cpu;
        let hidden = arch.hidden_size;
        let kv = arch.kv_heads() * arch.head_dim();
        let randn = |shape: (usize, usize)| Tensor::randn(0f32, 0.02, shape, &device).unwrap();
        let ones = |n: usize| Tensor::ones(n, DType::F32, &device).unwrap();

        let mut tensors = HashMap::new();
        tensors.insert(EMBED_TOKENS.to_string(), randn((arch.vocab_size, hidden)));
        tensors.insert(LM_HEAD.to_string(), randn((arch.vocab_size, hidden)));
        tensors.insert("model.norm.weight".to_string(), ones(hidden));
        for i in 0..arch.num_hidden_layers {
            let p = format!("model.layers.{i}");
            tensors.insert(format!("{p}.input_layernorm.weight"), ones(hidden));
            tensors.insert(format!("{p}.post_attention_layernorm.weight"), ones(hidden));
            tensors.insert(format!("{p}.self_attn.q_proj.weight"), randn((hidden, hidden)));
            tensors.insert(format!("{p}.self_attn.k_proj.weight"), randn((kv, hidden)));
            tensors.insert(format!("{p}.self_attn.v_proj.weight"), randn((kv, hidden)));
            tensors.insert(format!("{p}.self_attn.o_proj.weight"), randn((hidden, hidden)));
            tensors.insert(
                format!("{p}.mlp.gate_proj.weight"),
                randn((arch.intermediate_size, hidden)),
            );
            tensors.insert(
                format!("{p}.mlp.up_proj.weight"),
                randn((arch.intermediate_size, hidden)),
            );
            tensors.insert(
                format!("{p}.mlp.down_proj.weight"),
                randn((hidden, arch.intermediate_size)),
            );
        }
        tensors
    }

    pub(crate) fn tiny_model(vocab_size: usize) -> CausalLm {
        let arch = tiny_arch(vocab_size);
        let tensors = tiny_tensors(&arch);
        CausalLm::from_tensors("tiny", arch, tensors, &Device::Cpu, DType::F32, None).unwrap()
    }

    #[test]
    fn test_resize_grows_to_tokenizer_vocab() {
        let mut model = tiny_model(20);
        model.resize_token_embeddings(27).unwrap();

        assert_eq!(model.vocab_size(), 27);
        assert_eq!(model.arch().vocab_size, 27);
        assert_eq!(model.weight(EMBED_TOKENS).unwrap().dims(), &[27, 32]);
        assert_eq!(model.weight(LM_HEAD).unwrap().dims(), &[27, 32]);
    }

    #[test]
    fn test_resize_new_rows_are_mean() {
        let mut model = tiny_model(10);
        let mean = model
            .weight(EMBED_TOKENS)
            .unwrap()
            .mean_keepdim(0)
            .unwrap();
        model.resize_token_embeddings(12).unwrap();

        let added = model.weight(EMBED_TOKENS).unwrap().narrow(0, 11, 1).unwrap();
        let diff: f32 = (added - mean)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-6);
    }

    #[test]
    fn test_resize_shrinks() {
        let mut model = tiny_model(20);
        model.resize_token_embeddings(15).unwrap();
        assert_eq!(model.vocab_size(), 15);
        assert!(model.resize_token_embeddings(0).is_err());
    }

    #[test]
    fn test_quantized_load_keeps_embeddings_dense() {
        let arch = tiny_arch(16);
        let tensors = tiny_tensors(&arch);
        let descriptor = QuantizationDescriptor {
            bits: QuantBits::Eight,
        };
        let model =
            CausalLm::from_tensors("tiny", arch, tensors, &Device::Cpu, DType::F32, Some(descriptor))
                .unwrap();

        assert!(model
            .parameter("model.layers.0.self_attn.q_proj.weight")
            .unwrap()
            .is_quantized());
        assert!(!model.parameter(EMBED_TOKENS).unwrap().is_quantized());
        assert!(!model
            .parameter("model.layers.0.input_layernorm.weight")
            .unwrap()
            .is_quantized());
        // down_proj has 64 input features, a whole number of blocks.
        assert!(model
            .parameter("model.layers.1.mlp.down_proj.weight")
            .unwrap()
            .is_quantized());
    }

    #[test]
    fn test_full_training_rejected_when_quantized() {
        let arch = tiny_arch(16);
        let tensors = tiny_tensors(&arch);
        let descriptor = QuantizationDescriptor {
            bits: QuantBits::Four,
        };
        let mut model =
            CausalLm::from_tensors("tiny", arch, tensors, &Device::Cpu, DType::F32, Some(descriptor))
                .unwrap();
        assert!(matches!(
            model.enable_full_training(),
            Err(SftError::Training(_))
        ));
    }

    #[test]
    fn test_use_cache_toggle() {
        let mut model = tiny_model(8);
        assert!(model.use_cache());
        model.set_use_cache(false);
        assert!(!model.use_cache());
    }

    #[test]
    fn test_unsupported_model_type() {
        let mut arch = tiny_arch(8);
        arch.model_type = "gpt2".into();
        assert!(arch.check(false).is_err());
        assert!(arch.check(true).is_ok());
    }

    #[test]
    fn test_zero_heads_is_model_error() {
        let mut arch = tiny_arch(8);
        arch.num_key_value_heads = Some(0);
        assert!(matches!(arch.check(false), Err(SftError::Model(_))));

        let mut arch = tiny_arch(8);
        arch.num_attention_heads = 0;
        assert!(matches!(arch.check(false), Err(SftError::Model(_))));
    }

    #[test]
    fn test_load_rejects_zero_kv_heads() {
        let dir = tempfile::tempdir().unwrap();
        tiny_model(8).save_pretrained(dir.path()).unwrap();
        let config_path = dir.path().join("config.json");
        let mut config: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&config_path).unwrap()).unwrap();
        config["num_key_value_heads"] = serde_json::json!(0);
        std::fs::write(&config_path, config.to_string()).unwrap();

        let source = ModelSource::Local(dir.path().to_path_buf());
        let plan = LoadPlan::from_config(&crate::config::SftConfig {
            load_in_4bit: false,
            ..Default::default()
        })
        .unwrap();
        assert!(matches!(
            CausalLm::load("tiny", &source, &plan, false),
            Err(SftError::Model(_))
        ));
    }

    #[test]
    fn test_load_and_save_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut model = tiny_model(12);
        model.set_use_cache(false);
        model.save_pretrained(dir.path()).unwrap();

        let source = ModelSource::Local(dir.path().to_path_buf());
        let plan = LoadPlan::from_config(&crate::config::SftConfig {
            load_in_4bit: false,
            ..Default::default()
        })
        .unwrap();
        let loaded = CausalLm::load("tiny", &source, &plan, false).unwrap();

        assert_eq!(loaded.vocab_size(), 12);
        assert!(!loaded.use_cache());
        assert_eq!(
            loaded.arch().extra.get("architectures"),
            Some(&serde_json::json!(["LlamaForCausalLM"]))
        );
    }
}
