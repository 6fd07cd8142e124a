//! Dual-head emotion/intensity model.
//!
//! ```text
//! ids, mask ─> TextEncoder ─> pool ─┬─> emotion_projection ─> GELU ─> emotion_head ─> [N, L]
//!                                   └─> intensity_projection ─> GELU ─> intensity_head ─> [N, 1]
//! ```
//!
//! Parameters are split into two groups: the encoder's own [`VarMap`] and the
//! heads' [`VarMap`]. Only the heads are trainable while the encoder is frozen.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Linear, Module, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::calibration::artifacts::write_json_atomic;
use crate::encoder::{collect_tensors, restore_tensors, EncoderArchitecture, TextEncoder};
use crate::error::{AffectError, Result};

pub const WEIGHTS_FILE: &str = "model.safetensors";
pub const MODEL_CONFIG_FILE: &str = "model_config.json";

const ENCODER_PREFIX: &str = "encoder.";
const HEADS_PREFIX: &str = "heads.";

/// How per-token hidden states collapse into one vector per example.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pooling {
    /// Attention-mask-weighted mean over tokens.
    #[default]
    Mean,
    /// Hidden state of the first token.
    FirstToken,
}

/// Parameter groups with independent trainability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamGroup {
    Encoder,
    Heads,
}

/// Initial head biases: label log-odds for emotion, median target for intensity.
#[derive(Debug, Clone)]
pub struct HeadPriors {
    pub emotion_bias: Vec<f32>,
    pub intensity_bias: f32,
}

/// Outputs of one forward pass.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// `[N, L]` raw emotion logits.
    pub emotion_logits: Tensor,
    /// `[N, 1]` raw intensity prediction.
    pub intensity_logit: Tensor,
    /// `[N, H]` post-activation emotion features (metric-learning space).
    pub emotion_features: Tensor,
    /// `[N, H]` post-activation intensity features.
    pub intensity_features: Tensor,
}

/// Persisted shape of a model snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    pub encoder: EncoderArchitecture,
    pub num_labels: usize,
    pub pooling: Pooling,
}

/// In-memory copy of every parameter, keyed like the snapshot file.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    tensors: HashMap<String, Tensor>,
}

pub struct DualHeadModel {
    encoder: Box<dyn TextEncoder>,
    head_vars: VarMap,
    emotion_projection: Linear,
    emotion_head: Linear,
    intensity_projection: Linear,
    intensity_head: Linear,
    pooling: Pooling,
    num_labels: usize,
    encoder_trainable: bool,
    heads_trainable: bool,
    device: Device,
}

impl DualHeadModel {
    /// Build heads on top of `encoder`.
    ///
    /// Fails with a configuration error when `num_labels` is zero or the priors
    /// do not match the label count.
    pub fn new(
        encoder: Box<dyn TextEncoder>,
        num_labels: usize,
        pooling: Pooling,
        priors: Option<&HeadPriors>,
        device: &Device,
    ) -> Result<Self> {
        if num_labels == 0 {
            return Err(AffectError::Configuration(
                "label count must be > 0".to_string(),
            ));
        }
        let hidden = encoder.hidden_size();
        let head_vars = VarMap::new();
        let vb = VarBuilder::from_varmap(&head_vars, DType::F32, device);

        let emotion_projection = candle_nn::linear(hidden, hidden, vb.pp("emotion_projection"))?;
        let emotion_head = candle_nn::linear(hidden, num_labels, vb.pp("emotion_head"))?;
        let intensity_projection =
            candle_nn::linear(hidden, hidden, vb.pp("intensity_projection"))?;
        let intensity_head = candle_nn::linear(hidden, 1, vb.pp("intensity_head"))?;

        let model = Self {
            encoder,
            head_vars,
            emotion_projection,
            emotion_head,
            intensity_projection,
            intensity_head,
            pooling,
            num_labels,
            encoder_trainable: true,
            heads_trainable: true,
            device: device.clone(),
        };
        if let Some(priors) = priors {
            model.init_biases(priors)?;
        }
        Ok(model)
    }

    fn head_var(&self, name: &str) -> Result<Var> {
        let data = self
            .head_vars
            .data()
            .lock()
            .map_err(|_| AffectError::Numerical("parameter store lock poisoned".into()))?;
        data.get(name)
            .cloned()
            .ok_or_else(|| AffectError::Configuration(format!("no head parameter '{}'", name)))
    }

    fn init_biases(&self, priors: &HeadPriors) -> Result<()> {
        if priors.emotion_bias.len() != self.num_labels {
            return Err(AffectError::Configuration(format!(
                "emotion prior has {} entries for {} labels",
                priors.emotion_bias.len(),
                self.num_labels
            )));
        }
        self.head_var("emotion_head.bias")?.set(&Tensor::from_vec(
            priors.emotion_bias.clone(),
            self.num_labels,
            &self.device,
        )?)?;
        self.head_var("intensity_head.bias")?
            .set(&Tensor::from_vec(vec![priors.intensity_bias], 1, &self.device)?)?;
        Ok(())
    }

    fn pool(&self, hidden: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        match self.pooling {
            Pooling::Mean => {
                let mask = attention_mask.to_dtype(DType::F32)?.unsqueeze(2)?;
                let counts = mask.sum(1)?;
                let min_count = counts.flatten_all()?.min(0)?.to_scalar::<f32>()?;
                if min_count <= 0.0 {
                    return Err(AffectError::Data(
                        "attention mask has a fully masked row".into(),
                    ));
                }
                let summed = hidden.broadcast_mul(&mask)?.sum(1)?;
                Ok(summed.broadcast_div(&counts)?)
            }
            Pooling::FirstToken => Ok(hidden.narrow(1, 0, 1)?.squeeze(1)?),
        }
    }

    /// Run the encoder and both heads.
    ///
    /// An empty batch yields empty outputs with the right trailing dimensions.
    pub fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<ModelOutput> {
        let n = input_ids.dim(0)?;
        let hidden = self.encoder.hidden_size();
        if n == 0 {
            return Ok(ModelOutput {
                emotion_logits: Tensor::zeros((0, self.num_labels), DType::F32, &self.device)?,
                intensity_logit: Tensor::zeros((0, 1), DType::F32, &self.device)?,
                emotion_features: Tensor::zeros((0, hidden), DType::F32, &self.device)?,
                intensity_features: Tensor::zeros((0, hidden), DType::F32, &self.device)?,
            });
        }

        let mut states = self.encoder.encode(input_ids, attention_mask)?;
        if !self.encoder_trainable {
            states = states.detach();
        }
        let pooled = self.pool(&states, attention_mask)?;

        let emotion_features = self.emotion_projection.forward(&pooled)?.gelu_erf()?;
        let intensity_features = self.intensity_projection.forward(&pooled)?.gelu_erf()?;

        Ok(ModelOutput {
            emotion_logits: self.emotion_head.forward(&emotion_features)?,
            intensity_logit: self.intensity_head.forward(&intensity_features)?,
            emotion_features,
            intensity_features,
        })
    }

    /// Mark a parameter group trainable or frozen.
    pub fn set_trainable(&mut self, group: ParamGroup, trainable: bool) {
        match group {
            ParamGroup::Encoder => self.encoder_trainable = trainable,
            ParamGroup::Heads => self.heads_trainable = trainable,
        }
    }

    pub fn is_trainable(&self, group: ParamGroup) -> bool {
        match group {
            ParamGroup::Encoder => self.encoder_trainable,
            ParamGroup::Heads => self.heads_trainable,
        }
    }

    /// Variables the optimizer may update under the current freeze state.
    pub fn trainable_vars(&self) -> Vec<Var> {
        let mut vars = Vec::new();
        if self.heads_trainable {
            vars.extend(self.head_vars.all_vars());
        }
        if self.encoder_trainable {
            vars.extend(self.encoder.varmap().all_vars());
        }
        vars
    }

    /// Every variable of one group, trainable or not.
    pub fn group_vars(&self, group: ParamGroup) -> Vec<Var> {
        match group {
            ParamGroup::Encoder => self.encoder.varmap().all_vars(),
            ParamGroup::Heads => self.head_vars.all_vars(),
        }
    }

    pub fn num_parameters(&self, group: ParamGroup) -> usize {
        self.group_vars(group)
            .iter()
            .map(|v| v.as_tensor().elem_count())
            .sum()
    }

    pub fn num_labels(&self) -> usize {
        self.num_labels
    }

    pub fn hidden_size(&self) -> usize {
        self.encoder.hidden_size()
    }

    pub fn pooling(&self) -> Pooling {
        self.pooling
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Drop the heads and hand back the encoder with its current weights.
    pub fn into_encoder(self) -> Box<dyn TextEncoder> {
        self.encoder
    }

    pub fn spec(&self) -> ModelSpec {
        ModelSpec {
            encoder: self.encoder.architecture(),
            num_labels: self.num_labels,
            pooling: self.pooling,
        }
    }

    /// Copy all current parameters.
    pub fn checkpoint(&self) -> Result<Checkpoint> {
        let mut tensors = HashMap::new();
        collect_tensors(self.encoder.varmap(), ENCODER_PREFIX, &mut tensors)?;
        collect_tensors(&self.head_vars, HEADS_PREFIX, &mut tensors)?;
        Ok(Checkpoint { tensors })
    }

    /// Overwrite all parameters from a checkpoint.
    pub fn restore(&self, checkpoint: &Checkpoint) -> Result<()> {
        let source = Path::new("<in-memory checkpoint>");
        restore_tensors(self.encoder.varmap(), ENCODER_PREFIX, &checkpoint.tensors, source)?;
        restore_tensors(&self.head_vars, HEADS_PREFIX, &checkpoint.tensors, source)
    }

    /// Write weights and shape description into `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let checkpoint = self.checkpoint()?;
        candle_core::safetensors::save(&checkpoint.tensors, dir.join(WEIGHTS_FILE))?;
        write_json_atomic(&dir.join(MODEL_CONFIG_FILE), &self.spec())?;
        info!("Saved model weights to {}", dir.display());
        Ok(())
    }

    /// Rebuild a model from `dir` written by [`DualHeadModel::save`].
    pub fn load(dir: &Path, device: &Device) -> Result<Self> {
        let spec_path = dir.join(MODEL_CONFIG_FILE);
        let spec_str = std::fs::read_to_string(&spec_path)
            .map_err(|e| AffectError::artifact(&spec_path, format!("failed to read: {}", e)))?;
        let spec: ModelSpec = serde_json::from_str(&spec_str)
            .map_err(|e| AffectError::artifact(&spec_path, format!("invalid model spec: {}", e)))?;

        let encoder = spec.encoder.build(device)?;
        let model = Self::new(encoder, spec.num_labels, spec.pooling, None, device)?;

        let weights_path = dir.join(WEIGHTS_FILE);
        if !weights_path.exists() {
            return Err(AffectError::artifact(&weights_path, "weights file missing"));
        }
        let tensors = candle_core::safetensors::load(&weights_path, device)?;
        restore_tensors(model.encoder.varmap(), ENCODER_PREFIX, &tensors, &weights_path)?;
        restore_tensors(&model.head_vars, HEADS_PREFIX, &tensors, &weights_path)?;
        Ok(model)
    }
}
