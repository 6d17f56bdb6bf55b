//! Shared fixtures for the integration tests: a word-level tokenizer, a
//! tiny BERT checkpoint on disk and TRAC-style CSV data.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use candle_core::Device;
use tokenizers::Tokenizer;
use twinhead_rs::encoder::EncoderConfig;
use twinhead_rs::model::{ClassifierConfig, EncoderFamily, TOKENIZER_NAME};
use twinhead_rs::{DualHeadClassifier, RunConfig};

const WORDS: [&str; 16] = [
    "[PAD]", "[UNK]", "[CLS]", "[SEP]", "you", "are", "great", "go", "away", "now", "hello",
    "there", "bye", "friend", "bad", "good",
];

pub const TRAIN_ROWS: &str = "ID,Text,Sub-task A,Sub-task B\n\
    1,you are great,NAG,NGEN\n\
    2,go away now,OAG,GEN\n\
    3,hello there friend,CAG,NGEN\n\
    4,bad bad friend,OAG,GEN\n";

pub const DEV_ROWS: &str = "ID,Text,Sub-task A,Sub-task B\n\
    5,you are good,NAG,NGEN\n\
    6,go away bad friend,OAG,GEN\n\
    7,bye now,CAG,NGEN\n";

pub const TEST_ROWS: &str = "ID,Text\n8,hello friend\n9,go away\n";

/// Word-level tokenizer over [`WORDS`].
pub fn tokenizer() -> Tokenizer {
    let vocab = WORDS
        .iter()
        .enumerate()
        .map(|(i, w)| format!("\"{w}\": {i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let added = WORDS[..4]
        .iter()
        .enumerate()
        .map(|(i, w)| {
            format!(
                r#"{{"id": {i}, "content": "{w}", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true}}"#
            )
        })
        .collect::<Vec<_>>()
        .join(", ");
    let json = format!(
        r#"{{
  "version": "1.0",
  "truncation": null,
  "padding": null,
  "added_tokens": [{added}],
  "normalizer": {{"type": "Lowercase"}},
  "pre_tokenizer": {{"type": "Whitespace"}},
  "post_processor": null,
  "decoder": null,
  "model": {{"type": "WordLevel", "vocab": {{{vocab}}}, "unk_token": "[UNK]"}}
}}"#
    );
    json.parse().expect("tokenizer json")
}

/// Encoder small enough to train in milliseconds, without dropout.
pub fn encoder_config() -> EncoderConfig {
    EncoderConfig {
        vocab_size: WORDS.len(),
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

/// Randomly initialized classifier on CPU.
pub fn classifier(num_labels_a: usize, num_labels_b: usize) -> DualHeadClassifier {
    let config = ClassifierConfig {
        encoder: encoder_config(),
        num_labels_a,
        num_labels_b,
        finetuning_task: None,
    };
    DualHeadClassifier::new(config, EncoderFamily::Bert, &Device::Cpu).expect("classifier")
}

/// Write a pretrained model directory (weights, config and tokenizer).
pub fn write_model_dir(dir: &Path, num_labels_a: usize, num_labels_b: usize) -> PathBuf {
    let model = classifier(num_labels_a, num_labels_b);
    model.save_pretrained(dir).expect("save model");
    tokenizer()
        .save(dir.join(TOKENIZER_NAME), false)
        .expect("save tokenizer");
    dir.to_path_buf()
}

/// Write `train.csv`, `dev.csv` and `test.csv` into `dir`.
pub fn write_trac_data(dir: &Path) {
    std::fs::create_dir_all(dir).expect("data dir");
    std::fs::write(dir.join("train.csv"), TRAIN_ROWS).expect("train.csv");
    std::fs::write(dir.join("dev.csv"), DEV_ROWS).expect("dev.csv");
    std::fs::write(dir.join("test.csv"), TEST_ROWS).expect("test.csv");
}

/// CPU run over the fixtures under `root`: one optimizer step per epoch of
/// four examples (batch 2, accumulation 2).
pub fn run_config(root: &Path) -> RunConfig {
    let data_dir = root.join("data");
    write_trac_data(&data_dir);
    let model_dir = write_model_dir(&root.join("tiny-bert"), 3, 2);

    let mut config = RunConfig::trac_bert_preset();
    config.data_dir = data_dir.to_string_lossy().into_owned();
    config.output_dir = root.join("out").to_string_lossy().into_owned();
    config.folders = Vec::new();
    config.model.model_name_or_path = model_dir.to_string_lossy().into_owned();
    config.data.max_seq_length = 16;
    config.training.per_device_train_batch_size = 2;
    config.training.gradient_accumulation_steps = 2;
    config.training.num_train_epochs = 1.0;
    config.training.learning_rate = 1e-3;
    config.training.logging_steps = 1;
    config.evaluation.per_device_eval_batch_size = 2;
    config.no_cuda = true;
    config.do_train = true;
    config.do_eval = true;
    config
}
