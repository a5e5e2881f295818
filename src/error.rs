//! Error types for autocomplete-sft.

use thiserror::Error;

/// Result type alias for autocomplete-sft operations.
pub type Result<T> = std::result::Result<T, SftError>;

/// Errors that can occur while preparing or running a fine-tuning job.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SftError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Model loading error.
    #[error("model error: {0}")]
    Model(String),

    /// Dataset error.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// Training error.
    #[error("training error: {0}")]
    Training(String),

    /// Checkpoint error.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Hub publishing error.
    #[error("hub error: {0}")]
    Hub(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON artifact error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV parsing error.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Hub download error.
    #[error("hub download error: {0}")]
    HubApi(#[from] hf_hub::api::sync::ApiError),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Tokenizer error.
    #[error("tokenizer error: {0}")]
    Tokenizer(#[from] tokenizers::Error),

    /// Progress bar template error.
    #[error("template error: {0}")]
    Template(#[from] indicatif::style::TemplateError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_config_error_creation() {
        let error = SftError::Config("both quantization modes requested".to_string());
        assert_eq!(
            error.to_string(),
            "configuration error: both quantization modes requested"
        );
    }

    #[test]
    fn test_dataset_error_creation() {
        let error = SftError::Dataset("train file not found".to_string());
        assert_eq!(error.to_string(), "dataset error: train file not found");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let error: SftError = io_error.into();
        assert!(error.to_string().contains("IO error"));
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_config_parse_error_conversion() {
        let yaml_error = serde_yaml::from_str::<serde_yaml::Value>("invalid: yaml: :::").unwrap_err();
        let error: SftError = yaml_error.into();
        assert!(error.to_string().contains("invalid config file"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_error = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let error: SftError = json_error.into();
        assert!(matches!(error, SftError::Json(_)));
    }

    #[test]
    fn test_candle_error_conversion() {
        use candle_core::{DType, Device, Tensor};

        let lhs = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let rhs = Tensor::zeros((3, 4), DType::F32, &Device::Cpu).unwrap();
        let candle_error = lhs.broadcast_add(&rhs).unwrap_err();
        let error: SftError = candle_error.into();
        assert!(error.to_string().contains("candle error"));
    }

    #[test]
    fn test_tokenizer_error_conversion() {
        let result = tokenizers::Tokenizer::from_file("/nonexistent/path/to/tokenizer.json");
        if let Err(tokenizer_error) = result {
            let error: SftError = tokenizer_error.into();
            assert!(error.to_string().contains("tokenizer error"));
        }
    }

    #[test]
    fn test_error_source_chain() {
        use std::error::Error;

        let error: SftError = io::Error::new(io::ErrorKind::NotFound, "x.csv").into();
        assert!(error.source().is_some());
    }

    #[test]
    fn test_error_display_per_variant() {
        let errors = [
            SftError::Model("model".to_string()),
            SftError::Training("training".to_string()),
            SftError::Checkpoint("checkpoint".to_string()),
            SftError::Hub("hub".to_string()),
        ];

        assert!(errors[0].to_string().starts_with("model error"));
        assert!(errors[1].to_string().starts_with("training error"));
        assert!(errors[2].to_string().starts_with("checkpoint error"));
        assert!(errors[3].to_string().starts_with("hub error"));
    }
}
