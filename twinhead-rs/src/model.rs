//! Dual-head classifier over a pretrained encoder, and model loading.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use serde::{Deserialize, Serialize};

use crate::dataset::Batch;
use crate::encoder::{BertEncoder, Dense, EncoderConfig, SequenceEncoder};
use crate::error::{Result, TwinheadError};

/// Weights file written by [`DualHeadClassifier::save_pretrained`].
pub const WEIGHTS_NAME: &str = "model.safetensors";
/// Legacy PyTorch weights file accepted on load.
pub const PTH_WEIGHTS_NAME: &str = "pytorch_model.bin";
/// Encoder configuration file.
pub const CONFIG_NAME: &str = "config.json";
/// Tokenizer file.
pub const TOKENIZER_NAME: &str = "tokenizer.json";

/// Family of a pretrained encoder. Decides input conventions and which label
/// order workarounds apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncoderFamily {
    /// BERT.
    Bert,
    /// ALBERT.
    Albert,
    /// DistilBERT.
    DistilBert,
    /// RoBERTa.
    Roberta,
    /// XLM-RoBERTa.
    XlmRoberta,
    /// XLNet.
    Xlnet,
}

impl EncoderFamily {
    /// Parse a `model_type` string.
    ///
    /// ```rust
    /// use twinhead_rs::model::EncoderFamily;
    ///
    /// assert_eq!(EncoderFamily::from_model_type("BERT").unwrap(), EncoderFamily::Bert);
    /// assert_eq!(
    ///     EncoderFamily::from_model_type("xlm-roberta").unwrap(),
    ///     EncoderFamily::XlmRoberta
    /// );
    /// assert!(EncoderFamily::from_model_type("gpt2").is_err());
    /// ```
    pub fn from_model_type(model_type: &str) -> Result<Self> {
        match model_type.to_ascii_lowercase().as_str() {
            "bert" => Ok(Self::Bert),
            "albert" => Ok(Self::Albert),
            "distilbert" => Ok(Self::DistilBert),
            "roberta" => Ok(Self::Roberta),
            "xlmroberta" | "xlm-roberta" => Ok(Self::XlmRoberta),
            "xlnet" => Ok(Self::Xlnet),
            other => Err(TwinheadError::UnknownModelType(format!(
                "{other} (expected one of bert, albert, distilbert, roberta, xlmroberta, xlnet)"
            ))),
        }
    }

    /// Canonical name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bert => "bert",
            Self::Albert => "albert",
            Self::DistilBert => "distilbert",
            Self::Roberta => "roberta",
            Self::XlmRoberta => "xlmroberta",
            Self::Xlnet => "xlnet",
        }
    }

    /// Input conventions of this family.
    #[must_use]
    pub fn input_policy(self) -> InputPolicy {
        match self {
            Self::Bert | Self::Albert => InputPolicy::default(),
            Self::Xlnet => InputPolicy {
                uses_segment_ids: true,
                pad_on_left: true,
                pad_segment_id: 4,
            },
            Self::DistilBert | Self::Roberta | Self::XlmRoberta => InputPolicy {
                uses_segment_ids: false,
                ..InputPolicy::default()
            },
        }
    }

    /// Whether an encoder implementation exists for this family.
    #[must_use]
    pub fn has_encoder(self) -> bool {
        matches!(self, Self::Bert)
    }
}

impl fmt::Display for EncoderFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-family input conventions, resolved once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputPolicy {
    /// Segment ids are passed to the encoder; otherwise zeros are used.
    pub uses_segment_ids: bool,
    /// Padding goes before the tokens.
    pub pad_on_left: bool,
    /// Segment id of padding positions.
    pub pad_segment_id: u32,
}

impl Default for InputPolicy {
    fn default() -> Self {
        Self {
            uses_segment_ids: true,
            pad_on_left: false,
            pad_segment_id: 0,
        }
    }
}

/// Inputs of one classifier call. Optional fields have fixed defaults:
/// missing segment ids are zeros, missing labels contribute no loss.
#[derive(Debug, Clone, Copy)]
pub struct ForwardRequest<'a> {
    /// Token ids `[batch, seq]`.
    pub input_ids: &'a Tensor,
    /// Attention mask `[batch, seq]`.
    pub attention_mask: &'a Tensor,
    /// Segment ids `[batch, seq]`.
    pub token_type_ids: Option<&'a Tensor>,
    /// Head A labels `[batch]`.
    pub labels_a: Option<&'a Tensor>,
    /// Head B labels `[batch]`.
    pub labels_b: Option<&'a Tensor>,
}

impl<'a> ForwardRequest<'a> {
    /// Request for a collated batch, with both labels.
    #[must_use]
    pub fn from_batch(batch: &'a Batch, policy: InputPolicy) -> Self {
        Self {
            input_ids: &batch.input_ids,
            attention_mask: &batch.attention_mask,
            token_type_ids: policy.uses_segment_ids.then_some(&batch.token_type_ids),
            labels_a: Some(&batch.labels_a),
            labels_b: Some(&batch.labels_b),
        }
    }

    /// Drop both labels (pure inference).
    #[must_use]
    pub fn without_labels(self) -> Self {
        Self {
            labels_a: None,
            labels_b: None,
            ..self
        }
    }
}

/// Result of one classifier call.
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    /// Sum of the head losses (a zero scalar without labels).
    pub loss: Tensor,
    /// Head A logits `[batch, num_labels_a]`.
    pub logits_a: Tensor,
    /// Head B logits `[batch, num_labels_b]`.
    pub logits_b: Tensor,
    /// Last encoder layer `[batch, seq, hidden]`.
    pub hidden_states: Tensor,
}

/// `config.json` of a fine-tuned classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Encoder settings.
    #[serde(flatten)]
    pub encoder: EncoderConfig,
    /// Head A output size.
    pub num_labels_a: usize,
    /// Head B output size.
    pub num_labels_b: usize,
    /// Task the heads were trained on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finetuning_task: Option<String>,
}

/// Encoder with a BERT pooler and two independent linear heads.
///
/// All parameters live in one [`VarMap`] in f32; mixed precision only changes
/// the dtype the encoder computes in.
pub struct DualHeadClassifier {
    encoder: BertEncoder,
    pooler: Dense,
    classifier_a: Dense,
    classifier_b: Dense,
    config: ClassifierConfig,
    family: EncoderFamily,
    varmap: VarMap,
    device: Device,
}

impl fmt::Debug for DualHeadClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DualHeadClassifier")
            .field("family", &self.family)
            .field("num_labels_a", &self.config.num_labels_a)
            .field("num_labels_b", &self.config.num_labels_b)
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

impl DualHeadClassifier {
    /// Build a randomly initialized classifier.
    pub fn new(config: ClassifierConfig, family: EncoderFamily, device: &Device) -> Result<Self> {
        if !family.has_encoder() {
            return Err(TwinheadError::Model(format!(
                "no encoder implementation for model type {family}"
            )));
        }
        if config.num_labels_a == 0 || config.num_labels_b == 0 {
            return Err(TwinheadError::Model(
                "both heads need at least one output".into(),
            ));
        }
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let hidden = config.encoder.hidden_size;
        let std = config.encoder.initializer_range;

        let encoder = BertEncoder::new(&config.encoder, vb.pp("bert"))?;
        let pooler = Dense::new(hidden, hidden, std, vb.pp("bert").pp("pooler").pp("dense"))?;
        let classifier_a = Dense::new(hidden, config.num_labels_a, std, vb.pp("classifier_a"))?;
        let classifier_b = Dense::new(hidden, config.num_labels_b, std, vb.pp("classifier_b"))?;

        Ok(Self {
            encoder,
            pooler,
            classifier_a,
            classifier_b,
            config,
            family,
            varmap,
            device: device.clone(),
        })
    }

    /// Load a pretrained encoder (or a fine-tuned checkpoint) from `model_dir`
    /// and size the heads for the task.
    ///
    /// `config.json` is read from `config_dir`. Parameters present in the
    /// weights file overwrite the initialization; the rest (fresh heads) keep
    /// it.
    pub fn from_pretrained(
        model_dir: &Path,
        config_dir: &Path,
        num_labels_a: usize,
        num_labels_b: usize,
        family: EncoderFamily,
        device: &Device,
    ) -> Result<Self> {
        let config_path = config_dir.join(CONFIG_NAME);
        let content = std::fs::read_to_string(&config_path).map_err(|e| {
            TwinheadError::Model(format!("failed to read {}: {e}", config_path.display()))
        })?;
        let encoder: EncoderConfig = serde_json::from_str(&content).map_err(|e| {
            TwinheadError::Model(format!("failed to parse {}: {e}", config_path.display()))
        })?;
        let config = ClassifierConfig {
            encoder,
            num_labels_a,
            num_labels_b,
            finetuning_task: None,
        };
        let model = Self::new(config, family, device)?;
        model.load_weights(model_dir)?;
        Ok(model)
    }

    fn load_weights(&self, model_dir: &Path) -> Result<()> {
        let st_path = model_dir.join(WEIGHTS_NAME);
        let pth_path = model_dir.join(PTH_WEIGHTS_NAME);
        let tensors: HashMap<String, Tensor> = if st_path.exists() {
            candle_core::safetensors::load(&st_path, &Device::Cpu)?
        } else if pth_path.exists() {
            candle_core::pickle::read_all(&pth_path)?.into_iter().collect()
        } else {
            return Err(TwinheadError::Model(format!(
                "no model weights found in {}. Expected {WEIGHTS_NAME} or {PTH_WEIGHTS_NAME}",
                model_dir.display()
            )));
        };

        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| TwinheadError::Model("parameter map lock poisoned".into()))?;
        let mut used = HashSet::new();
        let mut missing = Vec::new();
        for (name, var) in data.iter() {
            let found = candidate_names(name)
                .into_iter()
                .find_map(|candidate| tensors.get_key_value(&candidate));
            let Some((key, tensor)) = found else {
                missing.push(name.clone());
                continue;
            };
            if tensor.dims() != var.dims() {
                return Err(TwinheadError::Model(format!(
                    "shape mismatch for {name}: checkpoint {:?}, model {:?}",
                    tensor.dims(),
                    var.dims()
                )));
            }
            var.set(&tensor.to_dtype(DType::F32)?.to_device(&self.device)?)?;
            used.insert(key.clone());
        }

        missing.sort();
        tracing::info!(
            "loaded {} tensors from {}",
            used.len(),
            model_dir.display()
        );
        if !missing.is_empty() {
            tracing::info!("newly initialized parameters: {missing:?}");
        }
        let unused = tensors.len() - used.len();
        if unused > 0 {
            tracing::debug!("{unused} checkpoint tensors not used by the classifier");
        }
        Ok(())
    }

    /// Write `model.safetensors` and `config.json` into `dir`.
    pub fn save_pretrained(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        self.varmap.save(dir.join(WEIGHTS_NAME))?;
        let config = serde_json::to_string_pretty(&self.config)?;
        std::fs::write(dir.join(CONFIG_NAME), config)?;
        Ok(())
    }

    /// Record the task the heads are trained on in `config.json`.
    pub fn set_finetuning_task(&mut self, task: &str) {
        self.config.finetuning_task = Some(task.to_string());
    }

    /// Compute dtype of the encoder (f32 or half for mixed precision).
    pub fn set_compute_dtype(&mut self, dtype: DType) {
        self.encoder.set_compute_dtype(dtype);
    }

    /// Run the encoder once and both heads.
    pub fn forward(&self, request: &ForwardRequest<'_>, train: bool) -> Result<ForwardOutput> {
        let zeros;
        let token_type_ids = match request.token_type_ids {
            Some(ids) => ids,
            None => {
                zeros = request.input_ids.zeros_like()?;
                &zeros
            }
        };
        let hidden_states =
            self.encoder
                .forward(request.input_ids, token_type_ids, request.attention_mask, train)?;

        let first = hidden_states.narrow(1, 0, 1)?.squeeze(1)?;
        let pooled = self.pooler.forward(&first)?.tanh()?.to_dtype(DType::F32)?;
        let pooled = if train && self.config.encoder.hidden_dropout_prob > 0.0 {
            #[allow(clippy::cast_possible_truncation)]
            let p = self.config.encoder.hidden_dropout_prob as f32;
            candle_nn::ops::dropout(&pooled, p)?
        } else {
            pooled
        };

        let logits_a = self.classifier_a.forward(&pooled)?;
        let logits_b = self.classifier_b.forward(&pooled)?;

        let loss_a = head_loss(&logits_a, request.labels_a, self.config.num_labels_a)?;
        let loss_b = head_loss(&logits_b, request.labels_b, self.config.num_labels_b)?;
        let loss = match (loss_a, loss_b) {
            (Some(a), Some(b)) => (a + b)?,
            (Some(loss), None) | (None, Some(loss)) => loss,
            (None, None) => Tensor::new(0f32, &self.device)?,
        };

        Ok(ForwardOutput {
            loss,
            logits_a,
            logits_b,
            hidden_states,
        })
    }

    /// All trainable parameters, sorted by name.
    pub fn named_parameters(&self) -> Result<Vec<(String, Var)>> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| TwinheadError::Model("parameter map lock poisoned".into()))?;
        let mut params: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(params)
    }

    /// Number of trainable scalars.
    pub fn num_parameters(&self) -> Result<usize> {
        Ok(self
            .named_parameters()?
            .iter()
            .map(|(_, var)| var.elem_count())
            .sum())
    }

    /// Backing parameter map.
    #[must_use]
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Model configuration.
    #[must_use]
    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Encoder family.
    #[must_use]
    pub fn family(&self) -> EncoderFamily {
        self.family
    }

    /// Input conventions of the encoder family.
    #[must_use]
    pub fn input_policy(&self) -> InputPolicy {
        self.family.input_policy()
    }

    /// Device the parameters live on.
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }
}

/// Loss of one head: MSE for a single output, cross-entropy otherwise.
fn head_loss(logits: &Tensor, labels: Option<&Tensor>, num_labels: usize) -> Result<Option<Tensor>> {
    let Some(labels) = labels else {
        return Ok(None);
    };
    let loss = if num_labels == 1 {
        candle_nn::loss::mse(&logits.squeeze(1)?, &labels.to_dtype(DType::F32)?)?
    } else {
        candle_nn::loss::cross_entropy(logits, &labels.to_dtype(DType::U32)?)?
    };
    Ok(Some(loss))
}

/// Names a parameter may carry in a checkpoint: as is, without the `bert.`
/// prefix, and with legacy `gamma`/`beta` layer norm names.
fn candidate_names(name: &str) -> Vec<String> {
    let mut bases = vec![name.to_string()];
    if let Some(stripped) = name.strip_prefix("bert.") {
        bases.push(stripped.to_string());
    }
    let mut out = bases.clone();
    for base in bases {
        if base.contains("LayerNorm.") {
            if let Some(prefix) = base.strip_suffix(".weight") {
                out.push(format!("{prefix}.gamma"));
            } else if let Some(prefix) = base.strip_suffix(".bias") {
                out.push(format!("{prefix}.beta"));
            }
        }
    }
    out
}

/// Resolve a model directory: a local path, or a snapshot in the
/// `HuggingFace` hub cache.
pub fn resolve_model_path(model_id: &str) -> Result<PathBuf> {
    let path = PathBuf::from(model_id);
    if path.exists() {
        return Ok(path);
    }

    let cache_dir = std::env::var("HF_HOME")
        .or_else(|_| std::env::var("HOME").map(|h| format!("{h}/.cache/huggingface")))
        .unwrap_or_else(|_| "/tmp/huggingface".to_string());
    let repo = PathBuf::from(format!(
        "{cache_dir}/hub/models--{}",
        model_id.replace('/', "--")
    ));
    let snapshots = repo.join("snapshots");
    if snapshots.is_dir() {
        let mut entries = std::fs::read_dir(&snapshots)?
            .filter_map(std::result::Result::ok)
            .map(|entry| entry.path())
            .filter(|p| p.is_dir())
            .collect::<Vec<_>>();
        entries.sort();
        if let Some(snapshot) = entries.pop() {
            return Ok(snapshot);
        }
    }
    Err(TwinheadError::Model(format!(
        "model not found at '{model_id}' or in HF cache at '{}'. Use `huggingface-cli download {model_id}` to download.",
        repo.display()
    )))
}

/// Load `tokenizer.json` from a model directory.
pub fn load_tokenizer(dir: &Path) -> Result<tokenizers::Tokenizer> {
    let tokenizer_file = dir.join(TOKENIZER_NAME);
    if !tokenizer_file.exists() {
        return Err(TwinheadError::Tokenizer(
            format!("{TOKENIZER_NAME} not found in {}", dir.display()).into(),
        ));
    }
    tokenizers::Tokenizer::from_file(&tokenizer_file)
        .map_err(|e| TwinheadError::Tokenizer(format!("failed to load tokenizer: {e}").into()))
}
