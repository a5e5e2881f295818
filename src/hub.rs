//! Model hub access: resolving model files and publishing results.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Command;

use hf_hub::api::sync::{Api, ApiBuilder, ApiRepo};

use crate::error::{Result, SftError};

const CONFIG_FILE: &str = "config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";
const SINGLE_WEIGHTS_FILE: &str = "model.safetensors";
const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";

/// Where model files come from: a local directory or a hub repository.
#[derive(Debug, Clone)]
pub enum ModelSource {
    /// Directory containing `config.json`, `tokenizer.json` and safetensors files.
    Local(PathBuf),
    /// Hub repository, downloaded into the local hub cache on demand.
    Hub {
        /// Repository identifier.
        model_id: String,
        /// Whether to authenticate with `HF_TOKEN`.
        use_auth_token: bool,
    },
}

impl ModelSource {
    /// Interpret a model identifier. Existing directories win over hub IDs.
    #[must_use]
    pub fn new(model_name: &str, use_auth_token: bool) -> Self {
        let path = Path::new(model_name);
        if path.is_dir() {
            Self::Local(path.to_path_buf())
        } else {
            Self::Hub {
                model_id: model_name.to_string(),
                use_auth_token,
            }
        }
    }

    /// Resolve the tokenizer file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing locally or cannot be downloaded.
    pub fn tokenizer_file(&self) -> Result<PathBuf> {
        self.file(TOKENIZER_FILE)
    }

    /// Resolve the model `config.json`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing locally or cannot be downloaded.
    pub fn config_file(&self) -> Result<PathBuf> {
        self.file(CONFIG_FILE)
    }

    /// Resolve every safetensors shard of the model.
    ///
    /// A sharded checkpoint is described by `model.safetensors.index.json`;
    /// otherwise a single `model.safetensors` is expected.
    ///
    /// # Errors
    ///
    /// Returns an error if neither layout can be found, the index is
    /// malformed, or the hub cannot be reached.
    pub fn weight_files(&self) -> Result<Vec<PathBuf>> {
        if self.has_file(WEIGHTS_INDEX_FILE)? {
            let index_path = self.file(WEIGHTS_INDEX_FILE)?;
            let shards = shard_names(&index_path)?;
            shards.iter().map(|name| self.file(name)).collect()
        } else {
            Ok(vec![self.file(SINGLE_WEIGHTS_FILE)?])
        }
    }

    fn has_file(&self, name: &str) -> Result<bool> {
        match self {
            Self::Local(dir) => Ok(dir.join(name).is_file()),
            Self::Hub {
                model_id,
                use_auth_token,
            } => {
                let info = hub_repo(model_id, *use_auth_token)?.info()?;
                Ok(info.siblings.iter().any(|sibling| sibling.rfilename == name))
            }
        }
    }

    fn file(&self, name: &str) -> Result<PathBuf> {
        match self {
            Self::Local(dir) => {
                let path = dir.join(name);
                if path.is_file() {
                    Ok(path)
                } else {
                    Err(SftError::Model(format!(
                        "{} not found in {}",
                        name,
                        dir.display()
                    )))
                }
            }
            Self::Hub {
                model_id,
                use_auth_token,
            } => {
                let repo = hub_repo(model_id, *use_auth_token)?;
                Ok(repo.get(name)?)
            }
        }
    }
}

fn hub_repo(model_id: &str, use_auth_token: bool) -> Result<ApiRepo> {
    let api = if use_auth_token {
        let token = std::env::var("HF_TOKEN").map_err(|_| {
            SftError::Config("use_auth_token is set but HF_TOKEN is not".into())
        })?;
        ApiBuilder::new().with_token(Some(token)).build()?
    } else {
        Api::new()?
    };
    Ok(api.model(model_id.to_string()))
}

fn shard_names(index_path: &Path) -> Result<BTreeSet<String>> {
    let content = std::fs::read_to_string(index_path)?;
    let index: serde_json::Value = serde_json::from_str(&content)?;
    let weight_map = index
        .get("weight_map")
        .and_then(serde_json::Value::as_object)
        .ok_or_else(|| {
            SftError::Model(format!("no weight_map in {}", index_path.display()))
        })?;

    Ok(weight_map
        .values()
        .filter_map(serde_json::Value::as_str)
        .map(ToString::to_string)
        .collect())
}

/// Publishes a saved output directory to a hub repository.
pub trait HubPublisher {
    /// Upload the contents of `dir` to `repo_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the upload fails.
    fn publish(&self, repo_id: &str, dir: &Path) -> Result<()>;
}

/// Uploads through the `huggingface-cli` executable.
#[derive(Debug, Clone)]
pub struct CliPublisher {
    program: String,
}

impl Default for CliPublisher {
    fn default() -> Self {
        Self {
            program: "huggingface-cli".into(),
        }
    }
}

impl CliPublisher {
    /// Use a different executable with the same `upload` interface.
    #[must_use]
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl HubPublisher for CliPublisher {
    fn publish(&self, repo_id: &str, dir: &Path) -> Result<()> {
        tracing::info!("Publishing {} to {}", dir.display(), repo_id);
        let status = Command::new(&self.program)
            .arg("upload")
            .arg(repo_id)
            .arg(dir)
            .status()
            .map_err(|e| SftError::Hub(format!("failed to run {}: {e}", self.program)))?;

        if status.success() {
            Ok(())
        } else {
            Err(SftError::Hub(format!(
                "{} upload exited with {status}",
                self.program
            )))
        }
    }
}
