use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::io::Write;
use tempfile::NamedTempFile;
use tokenizers::Tokenizer;
use twinhead_rs::features::FeatureConverter;
use twinhead_rs::metrics::{compute_metrics, HeadValues};
use twinhead_rs::model::EncoderFamily;
use twinhead_rs::task::{Example, OutputMode, TaskProcessor, TracProcessor};
use twinhead_rs::RunConfig;

const SMALL_YAML: &str = r#"
task_name: trac
data_dir: ./data/trac2
output_dir: ./outputs/trac-bert
folders: [eng]
model:
  model_type: bert
  model_name_or_path: ./models/bert-base-uncased
data:
  max_seq_length: 128
training:
  per_device_train_batch_size: 8
  gradient_accumulation_steps: 1
  learning_rate: 5.0e-5
  weight_decay: 0.01
  max_grad_norm: 1.0
  num_train_epochs: 3
  warmup_steps: 100
  logging_steps: 50
  save_steps: 50
evaluation:
  per_device_eval_batch_size: 8
  evaluate_during_training: true
do_train: true
do_eval: true
seed: 42
"#;

const WORDS: [&str; 12] = [
    "[PAD]", "[UNK]", "[CLS]", "[SEP]", "you", "are", "great", "go", "away", "now", "hello", "there",
];

fn tokenizer() -> Tokenizer {
    let vocab = WORDS
        .iter()
        .enumerate()
        .map(|(i, w)| format!("\"{w}\": {i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let json = format!(
        r#"{{"version": "1.0", "truncation": null, "padding": null, "added_tokens": [],
  "normalizer": {{"type": "Lowercase"}}, "pre_tokenizer": {{"type": "Whitespace"}},
  "post_processor": null, "decoder": null,
  "model": {{"type": "WordLevel", "vocab": {{{vocab}}}, "unk_token": "[UNK]"}}}}"#
    );
    json.parse().unwrap()
}

fn examples(n: usize) -> Vec<Example> {
    let texts = ["you are great", "go away now", "hello there you are great go away now"];
    (0..n)
        .map(|i| Example {
            guid: format!("train-{i}"),
            text_a: vec![texts[i % texts.len()]; 1 + i % 4].join(" "),
            text_b: None,
            label_a: Some(["NAG", "CAG", "OAG"][i % 3].to_string()),
            label_b: Some(["NGEN", "GEN"][i % 2].to_string()),
        })
        .collect()
}

fn bench_config_from_yaml(c: &mut Criterion) {
    c.bench_function("config_from_yaml", |b| {
        b.iter(|| {
            let config: RunConfig = black_box(serde_yaml::from_str(SMALL_YAML).unwrap());
            black_box(config);
        });
    });
}

fn bench_config_validate(c: &mut Criterion) {
    c.bench_function("config_validate", |b| {
        let config = RunConfig::trac_mbert_preset();
        b.iter(|| black_box(config.validate()).unwrap());
    });
}

fn bench_config_file_io(c: &mut Criterion) {
    c.bench_function("config_file_io", |b| {
        let config = RunConfig::trac_bert_preset();

        b.iter(|| {
            let mut temp_file = NamedTempFile::new().unwrap();
            let yaml = serde_yaml::to_string(&config).unwrap();
            temp_file.write_all(yaml.as_bytes()).unwrap();
            temp_file.flush().unwrap();

            let loaded = black_box(RunConfig::from_file(temp_file.path()).unwrap());
            black_box(loaded);
        });
    });
}

fn bench_feature_conversion(c: &mut Criterion) {
    let mut group = c.benchmark_group("feature_conversion");
    let labels = TracProcessor.get_labels();

    for max_seq_length in [32, 128] {
        let converter = FeatureConverter::new(
            &tokenizer(),
            max_seq_length,
            EncoderFamily::Bert.input_policy(),
            OutputMode::Classification,
        )
        .unwrap();
        let examples = examples(512);
        group.bench_function(format!("max_seq_{max_seq_length}"), |b| {
            b.iter(|| black_box(converter.convert(&examples, &labels).unwrap()));
        });
    }

    group.finish();
}

fn bench_metrics(c: &mut Criterion) {
    let preds = HeadValues::Classes((0..10_000).map(|i| i % 3).collect());
    let refs = HeadValues::Classes((0..10_000).map(|i| (i / 2) % 3).collect());
    c.bench_function("classification_metrics", |b| {
        b.iter(|| black_box(compute_metrics("trac", &preds, &refs).unwrap()));
    });
}

criterion_group!(
    benches,
    bench_config_from_yaml,
    bench_config_validate,
    bench_config_file_io,
    bench_feature_conversion,
    bench_metrics,
);
criterion_main!(benches);
