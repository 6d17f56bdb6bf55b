//! BERT encoder built from autograd-friendly candle primitives.
//!
//! Parameter names follow the HuggingFace layout (`embeddings.*`,
//! `encoder.layer.N.*`) so pretrained `model.safetensors` and
//! `pytorch_model.bin` files load without renaming.

use candle_core::{DType, Device, Tensor, D};
use candle_nn::{Init, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TwinheadError};
use crate::normalization::LayerNorm;

/// Encoder that turns token ids into contextual hidden states.
pub trait SequenceEncoder {
    /// Hidden states `[batch, seq, hidden]` for the given inputs.
    fn forward(
        &self,
        input_ids: &Tensor,
        token_type_ids: &Tensor,
        attention_mask: &Tensor,
        train: bool,
    ) -> Result<Tensor>;

    /// Width of the hidden states.
    fn hidden_size(&self) -> usize;
}

/// Hidden activation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HiddenAct {
    /// Exact (erf) GELU.
    #[default]
    Gelu,
    /// Tanh-approximated GELU.
    #[serde(rename = "gelu_new")]
    GeluNew,
    /// ReLU.
    Relu,
}

impl HiddenAct {
    fn apply(self, xs: &Tensor) -> Result<Tensor> {
        Ok(match self {
            HiddenAct::Gelu => xs.gelu_erf()?,
            HiddenAct::GeluNew => xs.gelu()?,
            HiddenAct::Relu => xs.relu()?,
        })
    }
}

/// `config.json` of a BERT-family encoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Vocabulary size.
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,
    /// Hidden width.
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    /// Transformer layers.
    #[serde(default = "default_layers")]
    pub num_hidden_layers: usize,
    /// Attention heads per layer.
    #[serde(default = "default_heads")]
    pub num_attention_heads: usize,
    /// Feed-forward width.
    #[serde(default = "default_intermediate_size")]
    pub intermediate_size: usize,
    /// Feed-forward activation.
    #[serde(default)]
    pub hidden_act: HiddenAct,
    /// Dropout on hidden states and the pooled output.
    #[serde(default = "default_dropout")]
    pub hidden_dropout_prob: f64,
    /// Dropout on attention probabilities.
    #[serde(default = "default_dropout")]
    pub attention_probs_dropout_prob: f64,
    /// Number of learned positions.
    #[serde(default = "default_max_positions")]
    pub max_position_embeddings: usize,
    /// Number of segment types.
    #[serde(default = "default_type_vocab_size")]
    pub type_vocab_size: usize,
    /// Std of the normal initializer.
    #[serde(default = "default_initializer_range")]
    pub initializer_range: f64,
    /// Layer norm epsilon.
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    /// Padding token id.
    #[serde(default)]
    pub pad_token_id: usize,
    /// Model type tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_type: Option<String>,
}

fn default_vocab_size() -> usize {
    30522
}
fn default_hidden_size() -> usize {
    768
}
fn default_layers() -> usize {
    12
}
fn default_heads() -> usize {
    12
}
fn default_intermediate_size() -> usize {
    3072
}
fn default_dropout() -> f64 {
    0.1
}
fn default_max_positions() -> usize {
    512
}
fn default_type_vocab_size() -> usize {
    2
}
fn default_initializer_range() -> f64 {
    0.02
}
fn default_layer_norm_eps() -> f64 {
    1e-12
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            vocab_size: default_vocab_size(),
            hidden_size: default_hidden_size(),
            num_hidden_layers: default_layers(),
            num_attention_heads: default_heads(),
            intermediate_size: default_intermediate_size(),
            hidden_act: HiddenAct::default(),
            hidden_dropout_prob: default_dropout(),
            attention_probs_dropout_prob: default_dropout(),
            max_position_embeddings: default_max_positions(),
            type_vocab_size: default_type_vocab_size(),
            initializer_range: default_initializer_range(),
            layer_norm_eps: default_layer_norm_eps(),
            pad_token_id: 0,
            model_type: Some("bert".into()),
        }
    }
}

impl EncoderConfig {
    /// Check internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            return Err(TwinheadError::Model(format!(
                "hidden_size {} is not a multiple of num_attention_heads {}",
                self.hidden_size, self.num_attention_heads
            )));
        }
        for (name, p) in [
            ("hidden_dropout_prob", self.hidden_dropout_prob),
            ("attention_probs_dropout_prob", self.attention_probs_dropout_prob),
        ] {
            if !(0.0..1.0).contains(&p) {
                return Err(TwinheadError::Model(format!("{name} {p} outside [0, 1)")));
            }
        }
        Ok(())
    }
}

/// Affine projection whose weights are cast to the activation dtype on use.
#[derive(Debug, Clone)]
pub struct Dense {
    weight: Tensor,
    bias: Tensor,
}

impl Dense {
    /// `weight [out, in]` drawn from `N(0, init_std)`, zero bias.
    pub fn new(in_dim: usize, out_dim: usize, init_std: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(
            (out_dim, in_dim),
            "weight",
            Init::Randn {
                mean: 0.0,
                stdev: init_std,
            },
        )?;
        let bias = vb.get_with_hints(out_dim, "bias", Init::Const(0.0))?;
        Ok(Self { weight, bias })
    }

    /// `xs · weightᵀ + bias` over the last dimension.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let weight = self.weight.to_dtype(xs.dtype())?;
        let bias = self.bias.to_dtype(xs.dtype())?;
        Ok(xs.broadcast_matmul(&weight.t()?)?.broadcast_add(&bias)?)
    }
}

fn dropout(xs: &Tensor, p: f64, train: bool) -> Result<Tensor> {
    if train && p > 0.0 {
        #[allow(clippy::cast_possible_truncation)]
        let p = p as f32;
        Ok(candle_nn::ops::dropout(xs, p)?)
    } else {
        Ok(xs.clone())
    }
}

fn embedding_table(rows: usize, dim: usize, init_std: f64, vb: VarBuilder) -> Result<Tensor> {
    Ok(vb.get_with_hints(
        (rows, dim),
        "weight",
        Init::Randn {
            mean: 0.0,
            stdev: init_std,
        },
    )?)
}

struct Embeddings {
    word: Tensor,
    position: Tensor,
    token_type: Tensor,
    norm: LayerNorm,
    dropout: f64,
}

impl Embeddings {
    fn new(config: &EncoderConfig, vb: VarBuilder) -> Result<Self> {
        let std = config.initializer_range;
        Ok(Self {
            word: embedding_table(config.vocab_size, config.hidden_size, std, vb.pp("word_embeddings"))?,
            position: embedding_table(
                config.max_position_embeddings,
                config.hidden_size,
                std,
                vb.pp("position_embeddings"),
            )?,
            token_type: embedding_table(
                config.type_vocab_size,
                config.hidden_size,
                std,
                vb.pp("token_type_embeddings"),
            )?,
            norm: LayerNorm::new(config.hidden_size, config.layer_norm_eps, vb.pp("LayerNorm"))?,
            dropout: config.hidden_dropout_prob,
        })
    }

    fn lookup(table: &Tensor, ids: &Tensor) -> Result<Tensor> {
        let (batch, seq) = ids.dims2()?;
        let hidden = table.dim(1)?;
        let rows = table.index_select(&ids.flatten_all()?, 0)?;
        Ok(rows.reshape((batch, seq, hidden))?)
    }

    fn forward(&self, input_ids: &Tensor, token_type_ids: &Tensor, train: bool) -> Result<Tensor> {
        let (_, seq) = input_ids.dims2()?;
        let max_positions = self.position.dim(0)?;
        if seq > max_positions {
            return Err(TwinheadError::Model(format!(
                "sequence length {seq} exceeds max_position_embeddings {max_positions}"
            )));
        }
        let words = Self::lookup(&self.word, input_ids)?;
        let types = Self::lookup(&self.token_type, token_type_ids)?;
        let positions = self.position.narrow(0, 0, seq)?.unsqueeze(0)?;
        let xs = (words + types)?.broadcast_add(&positions)?;
        let xs = self.norm.forward(&xs)?;
        dropout(&xs, self.dropout, train)
    }
}

struct SelfAttention {
    query: Dense,
    key: Dense,
    value: Dense,
    output: Dense,
    norm: LayerNorm,
    num_heads: usize,
    head_dim: usize,
    attention_dropout: f64,
    hidden_dropout: f64,
}

impl SelfAttention {
    fn new(config: &EncoderConfig, vb: VarBuilder) -> Result<Self> {
        let h = config.hidden_size;
        let std = config.initializer_range;
        let self_vb = vb.pp("self");
        let out_vb = vb.pp("output");
        Ok(Self {
            query: Dense::new(h, h, std, self_vb.pp("query"))?,
            key: Dense::new(h, h, std, self_vb.pp("key"))?,
            value: Dense::new(h, h, std, self_vb.pp("value"))?,
            output: Dense::new(h, h, std, out_vb.pp("dense"))?,
            norm: LayerNorm::new(h, config.layer_norm_eps, out_vb.pp("LayerNorm"))?,
            num_heads: config.num_attention_heads,
            head_dim: h / config.num_attention_heads,
            attention_dropout: config.attention_probs_dropout_prob,
            hidden_dropout: config.hidden_dropout_prob,
        })
    }

    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (batch, seq, _) = xs.dims3()?;
        Ok(xs
            .reshape((batch, seq, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    fn forward(&self, xs: &Tensor, mask_bias: &Tensor, train: bool) -> Result<Tensor> {
        let (batch, seq, hidden) = xs.dims3()?;
        let q = self.split_heads(&self.query.forward(xs)?)?;
        let k = self.split_heads(&self.key.forward(xs)?)?;
        let v = self.split_heads(&self.value.forward(xs)?)?;

        #[allow(clippy::cast_precision_loss)]
        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?.contiguous()?)? * scale)?;
        let scores = scores.broadcast_add(mask_bias)?;
        let probs = candle_nn::ops::softmax(&scores.to_dtype(DType::F32)?, D::Minus1)?
            .to_dtype(xs.dtype())?;
        let probs = dropout(&probs, self.attention_dropout, train)?;

        let context = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq, hidden))?;
        let out = dropout(&self.output.forward(&context)?, self.hidden_dropout, train)?;
        self.norm.forward(&(out + xs)?)
    }
}

struct Layer {
    attention: SelfAttention,
    intermediate: Dense,
    output: Dense,
    norm: LayerNorm,
    act: HiddenAct,
    dropout: f64,
}

impl Layer {
    fn new(config: &EncoderConfig, vb: VarBuilder) -> Result<Self> {
        let std = config.initializer_range;
        Ok(Self {
            attention: SelfAttention::new(config, vb.pp("attention"))?,
            intermediate: Dense::new(
                config.hidden_size,
                config.intermediate_size,
                std,
                vb.pp("intermediate").pp("dense"),
            )?,
            output: Dense::new(
                config.intermediate_size,
                config.hidden_size,
                std,
                vb.pp("output").pp("dense"),
            )?,
            norm: LayerNorm::new(
                config.hidden_size,
                config.layer_norm_eps,
                vb.pp("output").pp("LayerNorm"),
            )?,
            act: config.hidden_act,
            dropout: config.hidden_dropout_prob,
        })
    }

    fn forward(&self, xs: &Tensor, mask_bias: &Tensor, train: bool) -> Result<Tensor> {
        let attended = self.attention.forward(xs, mask_bias, train)?;
        let inner = self.act.apply(&self.intermediate.forward(&attended)?)?;
        let out = dropout(&self.output.forward(&inner)?, self.dropout, train)?;
        self.norm.forward(&(out + attended)?)
    }
}

/// BERT encoder stack (embeddings and transformer layers, no pooler).
pub struct BertEncoder {
    embeddings: Embeddings,
    layers: Vec<Layer>,
    hidden_size: usize,
    compute_dtype: DType,
}

impl BertEncoder {
    /// Build the encoder under `vb` (usually `vb.pp("bert")`).
    pub fn new(config: &EncoderConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let embeddings = Embeddings::new(config, vb.pp("embeddings"))?;
        let layers = (0..config.num_hidden_layers)
            .map(|i| Layer::new(config, vb.pp(format!("encoder.layer.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            embeddings,
            layers,
            hidden_size: config.hidden_size,
            compute_dtype: DType::F32,
        })
    }

    /// Dtype activations are computed in. Parameters stay f32.
    pub fn set_compute_dtype(&mut self, dtype: DType) {
        self.compute_dtype = dtype;
    }

    /// Current activation dtype.
    #[must_use]
    pub fn compute_dtype(&self) -> DType {
        self.compute_dtype
    }

    /// Additive attention bias `[batch, 1, 1, seq]`: 0 on tokens, -10000 on padding.
    fn mask_bias(attention_mask: &Tensor, dtype: DType) -> Result<Tensor> {
        let (batch, seq) = attention_mask.dims2()?;
        let bias = attention_mask
            .to_dtype(DType::F32)?
            .affine(10000.0, -10000.0)?
            .reshape((batch, 1, 1, seq))?;
        Ok(bias.to_dtype(dtype)?)
    }

    /// Device the parameters live on.
    #[must_use]
    pub fn device(&self) -> &Device {
        self.embeddings.word.device()
    }
}

impl SequenceEncoder for BertEncoder {
    fn forward(
        &self,
        input_ids: &Tensor,
        token_type_ids: &Tensor,
        attention_mask: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let mut xs = self
            .embeddings
            .forward(input_ids, token_type_ids, train)?
            .to_dtype(self.compute_dtype)?;
        let mask_bias = Self::mask_bias(attention_mask, self.compute_dtype)?;
        for layer in &self.layers {
            xs = layer.forward(&xs, &mask_bias, train)?;
        }
        Ok(xs)
    }

    fn hidden_size(&self) -> usize {
        self.hidden_size
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use candle_nn::VarMap;

    pub(crate) fn tiny_config() -> EncoderConfig {
        EncoderConfig {
            vocab_size: 16,
            hidden_size: 8,
            num_hidden_layers: 2,
            num_attention_heads: 2,
            intermediate_size: 16,
            hidden_dropout_prob: 0.0,
            attention_probs_dropout_prob: 0.0,
            max_position_embeddings: 32,
            ..Default::default()
        }
    }

    #[test]
    fn test_config_parses_hf_json() {
        let json = r#"{
            "architectures": ["BertForMaskedLM"],
            "hidden_act": "gelu",
            "hidden_size": 128,
            "num_attention_heads": 2,
            "num_hidden_layers": 2,
            "intermediate_size": 512,
            "vocab_size": 30522,
            "model_type": "bert"
        }"#;
        let config: EncoderConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.hidden_size, 128);
        assert_eq!(config.max_position_embeddings, 512);
        assert_eq!(config.hidden_act, HiddenAct::Gelu);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_rejects_bad_head_split() {
        let config = EncoderConfig {
            hidden_size: 10,
            num_attention_heads: 3,
            ..tiny_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parameter_names_follow_hf_layout() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        BertEncoder::new(&tiny_config(), vb.pp("bert")).unwrap();
        let data = varmap.data().lock().unwrap();
        for name in [
            "bert.embeddings.word_embeddings.weight",
            "bert.embeddings.LayerNorm.weight",
            "bert.encoder.layer.0.attention.self.query.weight",
            "bert.encoder.layer.1.attention.output.LayerNorm.bias",
            "bert.encoder.layer.1.intermediate.dense.weight",
            "bert.encoder.layer.0.output.dense.bias",
        ] {
            assert!(data.contains_key(name), "missing {name}");
        }
    }

    #[test]
    fn test_forward_shape_and_padding_invariance() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let encoder = BertEncoder::new(&tiny_config(), vb).unwrap();
        let ids = Tensor::new(&[[2u32, 5, 6, 3, 0, 0]], &Device::Cpu).unwrap();
        let types = ids.zeros_like().unwrap();
        let mask = Tensor::new(&[[1u32, 1, 1, 1, 0, 0]], &Device::Cpu).unwrap();
        let hidden = encoder.forward(&ids, &types, &mask, false).unwrap();
        assert_eq!(hidden.dims(), &[1, 6, 8]);

        // Padding must not change the representation of real tokens.
        let short_ids = Tensor::new(&[[2u32, 5, 6, 3]], &Device::Cpu).unwrap();
        let short_mask = Tensor::new(&[[1u32, 1, 1, 1]], &Device::Cpu).unwrap();
        let short = encoder
            .forward(&short_ids, &short_ids.zeros_like().unwrap(), &short_mask, false)
            .unwrap();
        let cls_long = hidden.narrow(1, 0, 1).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let cls_short = short.narrow(1, 0, 1).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for (a, b) in cls_long.iter().zip(&cls_short) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn test_gradients_reach_embeddings() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let encoder = BertEncoder::new(&tiny_config(), vb).unwrap();
        let ids = Tensor::new(&[[2u32, 7, 3]], &Device::Cpu).unwrap();
        let mask = ids.ones_like().unwrap();
        let hidden = encoder.forward(&ids, &ids.zeros_like().unwrap(), &mask, true).unwrap();
        let grads = hidden.sqr().unwrap().sum_all().unwrap().backward().unwrap();
        let data = varmap.data().lock().unwrap();
        let word = data.get("embeddings.word_embeddings.weight").unwrap();
        assert!(grads.get(word.as_tensor()).is_some());
    }

    #[test]
    fn test_sequence_longer_than_positions_is_error() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = EncoderConfig {
            max_position_embeddings: 2,
            ..tiny_config()
        };
        let encoder = BertEncoder::new(&config, vb).unwrap();
        let ids = Tensor::new(&[[2u32, 7, 3]], &Device::Cpu).unwrap();
        let mask = ids.ones_like().unwrap();
        assert!(encoder.forward(&ids, &ids.zeros_like().unwrap(), &mask, false).is_err());
    }
}
