//! Conversion of raw examples into fixed-length model features.

use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;

use crate::error::{Result, TwinheadError};
use crate::model::InputPolicy;
use crate::task::{Example, LabelSet, OutputMode};

/// Encoded label of one head.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum LabelValue {
    /// Class index.
    Class(usize),
    /// Regression target.
    Value(f32),
}

impl LabelValue {
    /// Label as a class index (regression targets are truncated).
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn as_class(self) -> u32 {
        match self {
            LabelValue::Class(idx) => idx as u32,
            LabelValue::Value(v) => v.max(0.0) as u32,
        }
    }

    /// Label as a float target.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_value(self) -> f32 {
        match self {
            LabelValue::Class(idx) => idx as f32,
            LabelValue::Value(v) => v,
        }
    }
}

/// Model input for one example. Every sequence has length `max_seq_length`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    /// Token ids.
    pub input_ids: Vec<u32>,
    /// 1 on real tokens, 0 on padding.
    pub attention_mask: Vec<u32>,
    /// Segment ids.
    pub token_type_ids: Vec<u32>,
    /// Head A label.
    pub label_a: LabelValue,
    /// Head B label.
    pub label_b: LabelValue,
}

#[derive(Debug, Clone, Copy)]
struct SpecialTokens {
    cls: u32,
    sep: u32,
    pad: u32,
}

impl SpecialTokens {
    fn lookup(tokenizer: &Tokenizer) -> Result<Self> {
        let find = |names: &[&str]| names.iter().find_map(|name| tokenizer.token_to_id(name));
        let cls = find(&["[CLS]", "<s>", "<cls>"])
            .ok_or_else(|| TwinheadError::Dataset("tokenizer has no CLS token".into()))?;
        let sep = find(&["[SEP]", "</s>", "<sep>"])
            .ok_or_else(|| TwinheadError::Dataset("tokenizer has no SEP token".into()))?;
        let pad = find(&["[PAD]", "<pad>"]).unwrap_or(0);
        Ok(Self { cls, sep, pad })
    }
}

/// Tokenizes, truncates and pads examples into [`Feature`]s.
///
/// Layout is `[CLS] a [SEP]` or `[CLS] a [SEP] b [SEP]`, with segment id 0 on
/// the first part and 1 on the second.
#[derive(Debug, Clone)]
pub struct FeatureConverter {
    tokenizer: Tokenizer,
    max_seq_length: usize,
    policy: InputPolicy,
    output_mode: OutputMode,
    special: SpecialTokens,
}

impl FeatureConverter {
    /// Create a converter. Truncation and padding configured inside the
    /// tokenizer file are disabled; the converter applies its own.
    pub fn new(
        tokenizer: &Tokenizer,
        max_seq_length: usize,
        policy: InputPolicy,
        output_mode: OutputMode,
    ) -> Result<Self> {
        if max_seq_length < 3 {
            return Err(TwinheadError::Config(format!(
                "max_seq_length {max_seq_length} leaves no room for tokens"
            )));
        }
        let mut tokenizer = tokenizer.clone();
        tokenizer.with_truncation(None)?;
        tokenizer.with_padding(None);
        let special = SpecialTokens::lookup(&tokenizer)?;
        Ok(Self {
            tokenizer,
            max_seq_length,
            policy,
            output_mode,
            special,
        })
    }

    /// Convert every example, in order.
    pub fn convert(&self, examples: &[Example], labels: &LabelSet) -> Result<Vec<Feature>> {
        let mut features = Vec::with_capacity(examples.len());
        for (index, example) in examples.iter().enumerate() {
            let feature = self.convert_one(example, labels)?;
            if index < 5 {
                tracing::debug!(
                    guid = %example.guid,
                    input_ids = ?feature.input_ids,
                    attention_mask = ?feature.attention_mask,
                    token_type_ids = ?feature.token_type_ids,
                    label_a = ?feature.label_a,
                    label_b = ?feature.label_b,
                    "converted example"
                );
            }
            features.push(feature);
        }
        Ok(features)
    }

    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(self.tokenizer.encode(text, false)?.get_ids().to_vec())
    }

    fn convert_one(&self, example: &Example, labels: &LabelSet) -> Result<Feature> {
        let mut tokens_a = self.encode(&example.text_a)?;
        let mut tokens_b = match &example.text_b {
            Some(text) => Some(self.encode(text)?),
            None => None,
        };
        match tokens_b.as_mut() {
            Some(tokens_b) => truncate_pair(&mut tokens_a, tokens_b, self.max_seq_length - 3),
            None => tokens_a.truncate(self.max_seq_length - 2),
        }

        let mut input_ids = Vec::with_capacity(self.max_seq_length);
        let mut token_type_ids = Vec::with_capacity(self.max_seq_length);
        input_ids.push(self.special.cls);
        input_ids.extend_from_slice(&tokens_a);
        input_ids.push(self.special.sep);
        token_type_ids.resize(input_ids.len(), 0);
        if let Some(tokens_b) = tokens_b {
            input_ids.extend_from_slice(&tokens_b);
            input_ids.push(self.special.sep);
            token_type_ids.resize(input_ids.len(), 1);
        }
        let mut attention_mask = vec![1u32; input_ids.len()];

        let padding = self.max_seq_length - input_ids.len();
        if self.policy.pad_on_left {
            input_ids.splice(0..0, std::iter::repeat(self.special.pad).take(padding));
            attention_mask.splice(0..0, std::iter::repeat(0).take(padding));
            token_type_ids.splice(0..0, std::iter::repeat(self.policy.pad_segment_id).take(padding));
        } else {
            input_ids.resize(self.max_seq_length, self.special.pad);
            attention_mask.resize(self.max_seq_length, 0);
            token_type_ids.resize(self.max_seq_length, self.policy.pad_segment_id);
        }

        Ok(Feature {
            input_ids,
            attention_mask,
            token_type_ids,
            label_a: label_value(example.label_a.as_deref(), &labels.a, self.output_mode)?,
            label_b: label_value(example.label_b.as_deref(), &labels.b, self.output_mode)?,
        })
    }
}

/// Encode a label. Missing labels (unlabeled test rows) become the first
/// class or `0.0`.
fn label_value(label: Option<&str>, list: &[String], mode: OutputMode) -> Result<LabelValue> {
    match (mode, label) {
        (OutputMode::Classification, None) => Ok(LabelValue::Class(0)),
        (OutputMode::Classification, Some(label)) => list
            .iter()
            .position(|l| l == label.trim())
            .map(LabelValue::Class)
            .ok_or_else(|| {
                TwinheadError::Dataset(format!("label {label:?} not in {list:?}"))
            }),
        (OutputMode::Regression, None) => Ok(LabelValue::Value(0.0)),
        (OutputMode::Regression, Some(label)) => label
            .trim()
            .parse::<f32>()
            .map(LabelValue::Value)
            .map_err(|e| TwinheadError::Dataset(format!("regression label {label:?}: {e}"))),
    }
}

/// Drop tokens from the longer sequence until the pair fits `max_len`.
fn truncate_pair(a: &mut Vec<u32>, b: &mut Vec<u32>, max_len: usize) {
    while a.len() + b.len() > max_len {
        if a.len() > b.len() {
            a.pop();
        } else {
            b.pop();
        }
    }
}
