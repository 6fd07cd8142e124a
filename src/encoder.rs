//! Text encoders backing the dual-head model.
//!
//! Pure-Rust candle runtime with Metal/CUDA acceleration when available.
//! [`BertTextEncoder`] wraps a pretrained BERT-family checkpoint whose weights
//! live in a [`VarMap`] so they can be unfrozen for full fine-tuning.
//! [`TokenEmbeddingEncoder`] is a single trainable lookup table, useful for
//! smoke runs and tests that should not download anything.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use candle_nn::{Embedding, LayerNorm, Module, VarBuilder, VarMap};
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{AffectError, Result};

/// Paths to encoder files, downloaded from HuggingFace Hub or found locally.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config_path: PathBuf,
    pub tokenizer_path: PathBuf,
    pub weights_path: PathBuf,
}

/// Download model files from HuggingFace Hub.
///
/// Uses `hf_hub::api::sync::Api` which caches at `~/.cache/huggingface/hub/`.
pub fn download_model(repo_id: &str) -> Result<ModelFiles> {
    let hub_err = |what: &str, e: hf_hub::api::sync::ApiError| {
        AffectError::Configuration(format!("Failed to download {} from {}: {}", what, repo_id, e))
    };
    let api = hf_hub::api::sync::Api::new().map_err(|e| hub_err("api", e))?;
    let repo = api.model(repo_id.to_string());

    Ok(ModelFiles {
        config_path: repo.get("config.json").map_err(|e| hub_err("config.json", e))?,
        tokenizer_path: repo
            .get("tokenizer.json")
            .map_err(|e| hub_err("tokenizer.json", e))?,
        weights_path: repo
            .get("model.safetensors")
            .map_err(|e| hub_err("model.safetensors", e))?,
    })
}

/// Use a local directory when `name` points at one, otherwise fetch from the Hub.
pub fn resolve_model_files(name: &str) -> Result<ModelFiles> {
    let dir = Path::new(name);
    if dir.is_dir() {
        let files = ModelFiles {
            config_path: dir.join("config.json"),
            tokenizer_path: dir.join("tokenizer.json"),
            weights_path: dir.join("model.safetensors"),
        };
        for path in [&files.config_path, &files.tokenizer_path, &files.weights_path] {
            if !path.exists() {
                return Err(AffectError::Configuration(format!(
                    "Encoder directory is missing {}",
                    path.display()
                )));
            }
        }
        return Ok(files);
    }
    download_model(name)
}

/// Metal on macOS or CUDA with the `cuda` feature, when the device can run a
/// layer norm; CPU otherwise.
pub fn select_device() -> Device {
    for (name, candidate) in accelerators() {
        match candidate {
            Ok(device) if runs_layer_norm(&device) => {
                info!("Compute device: {}", name);
                return device;
            }
            Ok(_) => warn!("{} is present but cannot run layer norm", name),
            Err(e) => debug!("{} unavailable: {}", name, e),
        }
    }
    info!("Compute device: CPU");
    Device::Cpu
}

fn accelerators() -> Vec<(&'static str, candle_core::Result<Device>)> {
    #[allow(unused_mut)]
    let mut found = Vec::new();
    #[cfg(target_os = "macos")]
    found.push(("Metal", Device::new_metal(0)));
    #[cfg(feature = "cuda")]
    found.push(("CUDA", Device::new_cuda(0)));
    found
}

/// BERT normalizes every layer; a device without layer norm is useless here.
fn runs_layer_norm(device: &Device) -> bool {
    let hidden = 4;
    let ln = match (
        Tensor::ones(hidden, DType::F32, device),
        Tensor::zeros(hidden, DType::F32, device),
    ) {
        (Ok(weight), Ok(bias)) => LayerNorm::new(weight, bias, 1e-12),
        _ => return false,
    };
    Tensor::arange(0f32, (2 * hidden) as f32, device)
        .and_then(|x| x.reshape((2, hidden)))
        .and_then(|x| ln.forward(&x))
        .is_ok()
}

/// Pretrained text encoder: token ids in, per-token hidden states out.
///
/// Every encoder owns its parameters in a [`VarMap`]; the model decides
/// whether that group is trainable.
pub trait TextEncoder: Send + Sync {
    /// `[N, S]` ids and mask -> `[N, S, H]` hidden states.
    fn encode(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor>;

    fn hidden_size(&self) -> usize;

    fn varmap(&self) -> &VarMap;

    /// Enough to rebuild the same architecture before loading a snapshot.
    fn architecture(&self) -> EncoderArchitecture;
}

/// Serializable description of an encoder's shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EncoderArchitecture {
    Bert { config: serde_json::Value },
    TokenEmbedding { vocab_size: usize, hidden_size: usize },
}

impl EncoderArchitecture {
    /// Build a freshly initialised encoder of this shape.
    pub fn build(&self, device: &Device) -> Result<Box<dyn TextEncoder>> {
        match self {
            EncoderArchitecture::Bert { config } => {
                Ok(Box::new(BertTextEncoder::build(config.clone(), device)?))
            }
            EncoderArchitecture::TokenEmbedding {
                vocab_size,
                hidden_size,
            } => Ok(Box::new(TokenEmbeddingEncoder::new(
                *vocab_size,
                *hidden_size,
                device,
            )?)),
        }
    }
}

/// BERT encoder with trainable weights.
pub struct BertTextEncoder {
    model: BertModel,
    varmap: VarMap,
    raw_config: serde_json::Value,
    hidden_size: usize,
}

impl BertTextEncoder {
    /// Build the architecture with fresh weights.
    pub fn build(raw_config: serde_json::Value, device: &Device) -> Result<Self> {
        let config: BertConfig = serde_json::from_value(raw_config.clone()).map_err(|e| {
            AffectError::Configuration(format!("Failed to parse BERT config: {}", e))
        })?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = BertModel::load(vb, &config)?;
        Ok(Self {
            model,
            varmap,
            raw_config,
            hidden_size: config.hidden_size,
        })
    }

    /// Build and fill with pretrained weights.
    ///
    /// Accepts checkpoints stored with or without a `bert.` prefix.
    pub fn from_pretrained(files: &ModelFiles, device: &Device) -> Result<Self> {
        let config_str = std::fs::read_to_string(&files.config_path).map_err(|e| {
            AffectError::Configuration(format!(
                "Failed to read encoder config {}: {}",
                files.config_path.display(),
                e
            ))
        })?;
        let raw_config: serde_json::Value = serde_json::from_str(&config_str)?;
        let encoder = Self::build(raw_config, device)?;

        let weights = candle_core::safetensors::load(&files.weights_path, device)?;
        let prefixed = weights.keys().any(|k| k.starts_with("bert."));
        let lookup = |name: &str| -> Option<&Tensor> {
            if prefixed {
                weights.get(&format!("bert.{}", name))
            } else {
                weights.get(name)
            }
        };

        let data = encoder.varmap.data().lock().map_err(|_| {
            AffectError::Numerical("encoder parameter store lock poisoned".into())
        })?;
        for (name, var) in data.iter() {
            let tensor = lookup(name).ok_or_else(|| {
                AffectError::artifact(
                    &files.weights_path,
                    format!("checkpoint has no tensor for '{}'", name),
                )
            })?;
            var.set(&tensor.to_dtype(DType::F32)?)?;
        }
        debug!("Loaded {} encoder tensors", data.len());
        drop(data);

        info!(
            "Loaded BERT encoder from {} (hidden size {})",
            files.weights_path.display(),
            encoder.hidden_size
        );
        Ok(encoder)
    }
}

impl TextEncoder for BertTextEncoder {
    fn encode(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        let token_type_ids = input_ids.zeros_like()?;
        Ok(self
            .model
            .forward(input_ids, &token_type_ids, Some(attention_mask))?)
    }

    fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    fn architecture(&self) -> EncoderArchitecture {
        EncoderArchitecture::Bert {
            config: self.raw_config.clone(),
        }
    }
}

/// Trainable token-embedding table. Hidden state of a token is its embedding row.
pub struct TokenEmbeddingEncoder {
    embeddings: Embedding,
    varmap: VarMap,
    vocab_size: usize,
    hidden_size: usize,
}

impl TokenEmbeddingEncoder {
    pub fn new(vocab_size: usize, hidden_size: usize, device: &Device) -> Result<Self> {
        if vocab_size == 0 || hidden_size == 0 {
            return Err(AffectError::Configuration(
                "token embedding encoder needs vocab_size > 0 and hidden_size > 0".into(),
            ));
        }
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let embeddings = candle_nn::embedding(vocab_size, hidden_size, vb.pp("embeddings"))?;
        Ok(Self {
            embeddings,
            varmap,
            vocab_size,
            hidden_size,
        })
    }
}

impl TextEncoder for TokenEmbeddingEncoder {
    fn encode(&self, input_ids: &Tensor, _attention_mask: &Tensor) -> Result<Tensor> {
        Ok(self.embeddings.forward(input_ids)?)
    }

    fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    fn architecture(&self) -> EncoderArchitecture {
        EncoderArchitecture::TokenEmbedding {
            vocab_size: self.vocab_size,
            hidden_size: self.hidden_size,
        }
    }
}

/// Snapshot every variable in `varmap` under `prefix`.
pub(crate) fn collect_tensors(
    varmap: &VarMap,
    prefix: &str,
    out: &mut HashMap<String, Tensor>,
) -> Result<()> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| AffectError::Numerical("parameter store lock poisoned".into()))?;
    for (name, var) in data.iter() {
        out.insert(format!("{prefix}{name}"), var.as_tensor().copy()?);
    }
    Ok(())
}

/// Overwrite every variable in `varmap` from `tensors[prefix + name]`.
pub(crate) fn restore_tensors(
    varmap: &VarMap,
    prefix: &str,
    tensors: &HashMap<String, Tensor>,
    source: &Path,
) -> Result<()> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| AffectError::Numerical("parameter store lock poisoned".into()))?;
    for (name, var) in data.iter() {
        let key = format!("{prefix}{name}");
        let tensor = tensors.get(&key).ok_or_else(|| {
            AffectError::artifact(source, format!("snapshot has no tensor for '{}'", key))
        })?;
        if tensor.dims() != var.as_tensor().dims() {
            return Err(AffectError::artifact(
                source,
                format!(
                    "shape mismatch for '{}': snapshot {:?}, model {:?}",
                    key,
                    tensor.dims(),
                    var.as_tensor().dims()
                ),
            ));
        }
        var.set(tensor)?;
    }
    Ok(())
}
