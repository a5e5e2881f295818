//! Low-rank adapter (`LoRA`) configuration and trainable adapter weights.
//!
//! Adapters are created for every projection whose module name matches one
//! of the configured targets. Each adapter holds `A` (`r x in`) initialized
//! with Kaiming-uniform and `B` (`out x r`) initialized to zero, so an
//! untrained adapter leaves the base model unchanged.

use std::collections::BTreeMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::{Init, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};

use crate::config::SftConfig;
use crate::error::Result;

/// Projection layers adapted in every decoder block.
pub const TARGET_MODULES: [&str; 7] = [
    "q_proj",
    "k_proj",
    "v_proj",
    "o_proj",
    "gate_proj",
    "up_proj",
    "down_proj",
];

/// File name of the saved adapter weights.
pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";

/// File name of the saved adapter configuration.
pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";

/// Bias handling for adapted layers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bias {
    /// Biases are not trained.
    #[default]
    None,
    /// All biases are trained.
    All,
    /// Only biases of adapted layers are trained.
    LoraOnly,
}

/// Task the adapters are trained for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskType {
    /// Next-token prediction.
    #[default]
    #[serde(rename = "CAUSAL_LM")]
    CausalLm,
}

/// Adapter configuration handed to the trainer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraConfig {
    /// Rank of the decomposition.
    pub r: usize,
    /// Scaling numerator; updates are scaled by `lora_alpha / r`.
    pub lora_alpha: usize,
    /// Dropout on the adapter input.
    pub lora_dropout: f64,
    /// Module names to adapt.
    pub target_modules: Vec<String>,
    /// Bias policy.
    pub bias: Bias,
    /// Task type.
    pub task_type: TaskType,
}

impl LoraConfig {
    /// Adapter configuration for a run, or `None` when adapters are disabled.
    #[must_use]
    pub fn from_config(config: &SftConfig) -> Option<Self> {
        config.use_peft.then(|| Self {
            r: config.peft_lora_r,
            lora_alpha: config.peft_lora_alpha,
            lora_dropout: 0.0,
            target_modules: TARGET_MODULES.iter().map(ToString::to_string).collect(),
            bias: Bias::None,
            task_type: TaskType::CausalLm,
        })
    }

    /// Scaling applied to the low-rank update.
    #[must_use]
    pub fn scaling(&self) -> f64 {
        self.lora_alpha as f64 / self.r as f64
    }

    /// Whether a parameter named `<prefix>.<module>.weight` is a target.
    #[must_use]
    pub fn targets(&self, weight_name: &str) -> bool {
        weight_name
            .strip_suffix(".weight")
            .and_then(|module| module.rsplit('.').next())
            .is_some_and(|module| self.target_modules.iter().any(|target| target == module))
    }
}

/// One adapted projection.
#[derive(Debug, Clone)]
pub struct LoraLinear {
    a: Tensor,
    b: Tensor,
    scaling: f64,
}

impl LoraLinear {
    /// Low-rank update `scaling * x A^T B^T` for input `x` (`... x in`).
    ///
    /// # Errors
    ///
    /// Returns an error on shape mismatch.
    pub fn delta(&self, x: &Tensor) -> Result<Tensor> {
        let a = self.a.to_dtype(x.dtype())?;
        let b = self.b.to_dtype(x.dtype())?;
        let hidden = x.broadcast_matmul(&a.t()?)?;
        let update = hidden.broadcast_matmul(&b.t()?)?;
        Ok((update * self.scaling)?)
    }
}

/// Trainable adapters for a model, keyed by the adapted weight name.
pub struct LoraAdapters {
    config: LoraConfig,
    varmap: VarMap,
    layers: BTreeMap<String, LoraLinear>,
}

impl LoraAdapters {
    /// Create adapters for every targeted weight in `shapes`
    /// (weight name to `(out_features, in_features)`).
    ///
    /// # Errors
    ///
    /// Returns an error if the adapter tensors cannot be allocated.
    pub fn new<'a, I>(config: &LoraConfig, shapes: I, device: &Device) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, (usize, usize))>,
    {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let mut layers = BTreeMap::new();

        for (name, (out_features, in_features)) in shapes {
            if !config.targets(name) {
                continue;
            }
            let module = name.trim_end_matches(".weight");
            let module_vb = vb.pp(format!("base_model.model.{module}"));
            let a = module_vb.get_with_hints(
                (config.r, in_features),
                "lora_A.weight",
                candle_nn::init::DEFAULT_KAIMING_UNIFORM,
            )?;
            let b = module_vb.get_with_hints((out_features, config.r), "lora_B.weight", Init::Const(0.0))?;
            tracing::debug!("Adapter on {} ({}x{})", module, out_features, in_features);
            layers.insert(
                name.to_string(),
                LoraLinear {
                    a,
                    b,
                    scaling: config.scaling(),
                },
            );
        }

        tracing::info!(
            "Created {} LoRA adapters with r={}, alpha={}",
            layers.len(),
            config.r,
            config.lora_alpha
        );

        Ok(Self {
            config: config.clone(),
            varmap,
            layers,
        })
    }

    /// Adapter for a weight, if that weight is adapted.
    #[must_use]
    pub fn get(&self, weight_name: &str) -> Option<&LoraLinear> {
        self.layers.get(weight_name)
    }

    /// Number of adapted projections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Check if no projection was adapted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Trainable variables, for the optimizer.
    #[must_use]
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Get the number of trainable parameters.
    #[must_use]
    pub fn trainable_param_count(&self) -> usize {
        self.varmap.all_vars().iter().map(|v| v.elem_count()).sum()
    }

    /// Write `adapter_model.safetensors` and `adapter_config.json` into `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if either file cannot be written.
    pub fn save(&self, dir: &Path, base_model: &str) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        self.varmap.save(dir.join(ADAPTER_WEIGHTS_FILE))?;

        let adapter_config = serde_json::json!({
            "peft_type": "LORA",
            "base_model_name_or_path": base_model,
            "r": self.config.r,
            "lora_alpha": self.config.lora_alpha,
            "lora_dropout": self.config.lora_dropout,
            "target_modules": self.config.target_modules,
            "bias": self.config.bias,
            "task_type": self.config.task_type,
        });
        std::fs::write(
            dir.join(ADAPTER_CONFIG_FILE),
            serde_json::to_string_pretty(&adapter_config)?,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lora_config() -> LoraConfig {
        LoraConfig::from_config(&SftConfig::default()).unwrap()
    }

    #[test]
    fn test_from_config() {
        let config = lora_config();
        assert_eq!(config.r, 16);
        assert_eq!(config.lora_alpha, 64);
        assert_eq!(config.target_modules.len(), 7);
        assert_eq!(config.bias, Bias::None);
        assert_eq!(config.task_type, TaskType::CausalLm);
        assert!((config.scaling() - 4.0).abs() < f64::EPSILON);

        let disabled = SftConfig {
            use_peft: false,
            ..Default::default()
        };
        assert!(LoraConfig::from_config(&disabled).is_none());
    }

    #[test]
    fn test_targets_match_module_name() {
        let config = lora_config();
        assert!(config.targets("model.layers.0.self_attn.q_proj.weight"));
        assert!(config.targets("model.layers.3.mlp.down_proj.weight"));
        assert!(!config.targets("model.embed_tokens.weight"));
        assert!(!config.targets("model.layers.0.input_layernorm.weight"));
        assert!(!config.targets("model.layers.0.self_attn.q_proj.bias"));
    }

    #[test]
    fn test_serialized_names() {
        let json = serde_json::to_value(lora_config()).unwrap();
        assert_eq!(json["bias"], "none");
        assert_eq!(json["task_type"], "CAUSAL_LM");
    }

    #[test]
    fn test_untrained_adapter_is_identity() {
        let config = LoraConfig {
            r: 2,
            ..lora_config()
        };
        let shapes = [("model.layers.0.self_attn.q_proj.weight", (4, 3))];
        let adapters = LoraAdapters::new(&config, shapes, &Device::Cpu).unwrap();
        assert_eq!(adapters.len(), 1);
        assert_eq!(adapters.trainable_param_count(), 2 * 3 + 4 * 2);

        let x = Tensor::ones((1, 5, 3), DType::F32, &Device::Cpu).unwrap();
        let delta = adapters
            .get("model.layers.0.self_attn.q_proj.weight")
            .unwrap()
            .delta(&x)
            .unwrap();
        assert_eq!(delta.dims(), &[1, 5, 4]);
        let total: f32 = delta.abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(total, 0.0);
    }

    #[test]
    fn test_save_writes_peft_layout() {
        let dir = tempfile::tempdir().unwrap();
        let shapes = [
            ("model.layers.0.self_attn.v_proj.weight", (8, 8)),
            ("model.layers.0.input_layernorm.weight", (8, 1)),
        ];
        let adapters = LoraAdapters::new(&lora_config(), shapes, &Device::Cpu).unwrap();
        adapters.save(dir.path(), "tiny").unwrap();

        let tensors =
            candle_core::safetensors::load(dir.path().join(ADAPTER_WEIGHTS_FILE), &Device::Cpu)
                .unwrap();
        assert!(tensors.contains_key("base_model.model.model.layers.0.self_attn.v_proj.lora_A.weight"));
        assert!(tensors.contains_key("base_model.model.model.layers.0.self_attn.v_proj.lora_B.weight"));
        assert_eq!(tensors.len(), 2);

        let config: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join(ADAPTER_CONFIG_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(config["peft_type"], "LORA");
        assert_eq!(config["r"], 16);
    }
}
