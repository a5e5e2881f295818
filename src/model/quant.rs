//! Load-time quantization and device placement.

use candle_core::quantized::{GgmlDType, QTensor};
use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::config::SftConfig;
use crate::error::{Result, SftError};
use crate::runtime;

/// Weight precision used for quantized loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantBits {
    /// 4-bit blockwise weights.
    Four,
    /// 8-bit blockwise weights.
    Eight,
}

/// How projection weights are stored after loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantizationDescriptor {
    /// Weight precision.
    pub bits: QuantBits,
}

impl QuantizationDescriptor {
    /// Storage format backing this precision.
    #[must_use]
    pub fn ggml_dtype(&self) -> GgmlDType {
        match self.bits {
            QuantBits::Four => GgmlDType::Q4_0,
            QuantBits::Eight => GgmlDType::Q8_0,
        }
    }

    /// Whether a weight of this shape can be stored quantized.
    ///
    /// Blocks run along the input dimension, which must be a multiple of the
    /// block size.
    #[must_use]
    pub fn supports(&self, weight: &Tensor) -> bool {
        weight.rank() == 2
            && weight
                .dims()
                .last()
                .is_some_and(|cols| cols % self.ggml_dtype().block_size() == 0)
    }

    /// Quantize a dense weight.
    ///
    /// # Errors
    ///
    /// Returns an error if the weight cannot be converted.
    pub fn quantize(&self, weight: &Tensor) -> Result<QTensor> {
        let weight = weight.to_dtype(DType::F32)?;
        Ok(QTensor::quantize(&weight, self.ggml_dtype())?)
    }
}

/// Where the model is placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePlacement {
    /// First accelerator if one is available, else CPU.
    Auto,
    /// Accelerator matching this process's local rank.
    LocalProcess(usize),
}

impl DevicePlacement {
    /// Create the device.
    ///
    /// # Errors
    ///
    /// Returns an error if the accelerator cannot be initialized.
    pub fn device(&self) -> Result<Device> {
        let ordinal = match self {
            Self::Auto => 0,
            Self::LocalProcess(index) => *index,
        };
        Ok(Device::cuda_if_available(ordinal)?)
    }
}

/// Everything the model loader needs besides the model identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadPlan {
    /// Quantization, if any.
    pub quantization: Option<QuantizationDescriptor>,
    /// Device placement.
    pub placement: DevicePlacement,
    /// Compute dtype; `None` keeps full precision.
    pub compute_dtype: Option<DType>,
}

impl LoadPlan {
    /// Derive the plan from the quantization flags.
    ///
    /// A quantized model is pinned to the local process's accelerator and
    /// computes in bf16.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error if both flags are set.
    pub fn from_config(config: &SftConfig) -> Result<Self> {
        let bits = match (config.load_in_8bit, config.load_in_4bit) {
            (true, true) => {
                return Err(SftError::Config(
                    "cannot load the model in 8 bits and 4 bits at the same time".into(),
                ))
            }
            (true, false) => Some(QuantBits::Eight),
            (false, true) => Some(QuantBits::Four),
            (false, false) => None,
        };

        Ok(match bits {
            Some(bits) => Self {
                quantization: Some(QuantizationDescriptor { bits }),
                placement: DevicePlacement::LocalProcess(runtime::local_process_index()),
                compute_dtype: Some(DType::BF16),
            },
            None => Self {
                quantization: None,
                placement: DevicePlacement::Auto,
                compute_dtype: None,
            },
        })
    }

    /// Dtype dense weights are held in on `device`.
    ///
    /// Reduced precision is only used on accelerators.
    #[must_use]
    pub fn dtype_for(&self, device: &Device) -> DType {
        match self.compute_dtype {
            Some(dtype) if !device.is_cpu() => dtype,
            Some(dtype) => {
                tracing::debug!("Compute dtype {:?} requested on CPU, using f32", dtype);
                DType::F32
            }
            None => DType::F32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(eight: bool, four: bool) -> Result<LoadPlan> {
        LoadPlan::from_config(&SftConfig {
            load_in_8bit: eight,
            load_in_4bit: four,
            ..Default::default()
        })
    }

    #[test]
    fn test_plan_for_every_flag_combination() {
        assert!(matches!(plan(true, true), Err(SftError::Config(_))));

        let four = plan(false, true).unwrap();
        assert_eq!(
            four.quantization,
            Some(QuantizationDescriptor {
                bits: QuantBits::Four
            })
        );
        assert_eq!(four.compute_dtype, Some(DType::BF16));
        assert!(matches!(four.placement, DevicePlacement::LocalProcess(_)));

        let eight = plan(true, false).unwrap();
        assert_eq!(eight.quantization.unwrap().ggml_dtype(), GgmlDType::Q8_0);

        let none = plan(false, false).unwrap();
        assert_eq!(none.quantization, None);
        assert_eq!(none.placement, DevicePlacement::Auto);
        assert_eq!(none.compute_dtype, None);
    }

    #[test]
    fn test_cpu_dtype_is_f32() {
        let four = plan(false, true).unwrap();
        assert_eq!(four.dtype_for(&Device::Cpu), DType::F32);
    }

    #[test]
    fn test_quantize_aligned_weight() {
        let descriptor = QuantizationDescriptor {
            bits: QuantBits::Eight,
        };
        let weight = Tensor::randn(0f32, 1.0, (4, 64), &Device::Cpu).unwrap();
        assert!(descriptor.supports(&weight));

        let quantized = descriptor.quantize(&weight).unwrap();
        let restored = quantized.dequantize(&Device::Cpu).unwrap();
        assert_eq!(restored.dims(), &[4, 64]);

        let error: f32 = (restored - &weight)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(error < 0.1, "max abs error {error}");
    }

    #[test]
    fn test_unaligned_weight_not_supported() {
        let descriptor = QuantizationDescriptor {
            bits: QuantBits::Four,
        };
        let weight = Tensor::zeros((4, 20), DType::F32, &Device::Cpu).unwrap();
        assert!(!descriptor.supports(&weight));
    }
}
