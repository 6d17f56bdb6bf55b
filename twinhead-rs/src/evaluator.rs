//! Evaluation loop: per-slice inference, metrics and prediction dumps.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use candle_core::{DType, Device, Tensor, D};
use tokenizers::Tokenizer;

use crate::cache::FeatureCache;
use crate::config::RunConfig;
use crate::dataset::{Batch, DataLoader, FeatureDataset, Sampler};
use crate::distributed::DistributedContext;
use crate::error::{recover, Result};
use crate::metrics::{compute_metrics, HeadValues, MetricsFn};
use crate::model::{DualHeadClassifier, ForwardRequest};
use crate::task::{EvalSlice, OutputMode, Split, TaskSpec};

/// Metrics report written per evaluation prefix.
pub const EVAL_RESULTS_NAME: &str = "eval_results.txt";
/// Head A predictions, one per line.
pub const PREDICTIONS_A_NAME: &str = "a_test_predictions.txt";
/// Head B predictions, one per line.
pub const PREDICTIONS_B_NAME: &str = "b_test_predictions.txt";

/// Reduce logits to per-row predictions: arg-max for classification, the
/// single output for regression.
pub fn reduce_logits(logits: &Tensor, mode: OutputMode) -> Result<HeadValues> {
    Ok(match mode {
        OutputMode::Classification => HeadValues::Classes(
            logits
                .argmax(D::Minus1)?
                .to_vec1::<u32>()?
                .into_iter()
                .map(|c| c as usize)
                .collect(),
        ),
        OutputMode::Regression => HeadValues::Values(
            logits
                .flatten_all()?
                .to_dtype(DType::F32)?
                .to_vec1::<f32>()?,
        ),
    })
}

fn labels_to_values(labels: &Tensor, mode: OutputMode) -> Result<HeadValues> {
    Ok(match mode {
        OutputMode::Classification => HeadValues::Classes(
            labels
                .to_dtype(DType::U32)?
                .to_vec1::<u32>()?
                .into_iter()
                .map(|c| c as usize)
                .collect(),
        ),
        OutputMode::Regression => HeadValues::Values(labels.to_dtype(DType::F32)?.to_vec1::<f32>()?),
    })
}

/// Outputs of one head gathered over a slice.
#[derive(Debug)]
struct HeadOutputs {
    predictions: HeadValues,
    references: HeadValues,
}

impl HeadOutputs {
    fn new(mode: OutputMode) -> Self {
        let empty = || match mode {
            OutputMode::Classification => HeadValues::Classes(Vec::new()),
            OutputMode::Regression => HeadValues::Values(Vec::new()),
        };
        Self {
            predictions: empty(),
            references: empty(),
        }
    }

    fn extend(&mut self, predictions: HeadValues, references: HeadValues) {
        append(&mut self.predictions, predictions);
        append(&mut self.references, references);
    }
}

fn append(into: &mut HeadValues, from: HeadValues) {
    match (into, from) {
        (HeadValues::Classes(a), HeadValues::Classes(b)) => a.extend(b),
        (HeadValues::Values(a), HeadValues::Values(b)) => a.extend(b),
        _ => {}
    }
}

struct BatchOutputs {
    loss: f64,
    predictions_a: HeadValues,
    predictions_b: HeadValues,
    references_a: HeadValues,
    references_b: HeadValues,
}

/// Evaluates a model on every evaluation slice of a task.
pub struct Evaluator<'a> {
    config: &'a RunConfig,
    task: &'a TaskSpec,
    tokenizer: &'a Tokenizer,
    ctx: &'a DistributedContext,
    device: Device,
    metrics: MetricsFn,
}

impl<'a> Evaluator<'a> {
    /// Evaluator using [`compute_metrics`].
    #[must_use]
    pub fn new(
        config: &'a RunConfig,
        task: &'a TaskSpec,
        tokenizer: &'a Tokenizer,
        ctx: &'a DistributedContext,
        device: &Device,
    ) -> Self {
        Self {
            config,
            task,
            tokenizer,
            ctx,
            device: device.clone(),
            metrics: compute_metrics,
        }
    }

    /// Replace the metrics function.
    #[must_use]
    pub fn with_metrics(mut self, metrics: MetricsFn) -> Self {
        self.metrics = metrics;
        self
    }

    /// Evaluate `model` on every slice. Uses the `dev` split with metrics when
    /// `do_eval` is set, otherwise the `test` split with predictions only.
    ///
    /// Per-batch failures and failures while writing reports are logged and
    /// skipped; the returned map holds whatever metrics were computed.
    pub fn evaluate(&self, model: &DualHeadClassifier, prefix: &str) -> Result<BTreeMap<String, f64>> {
        let mut results = BTreeMap::new();
        for slice in self.task.eval_slices() {
            self.evaluate_slice(model, slice, prefix, &mut results)?;
        }
        Ok(results)
    }

    fn evaluate_slice(
        &self,
        model: &DualHeadClassifier,
        slice: &EvalSlice,
        prefix: &str,
        results: &mut BTreeMap<String, f64>,
    ) -> Result<()> {
        let with_truth = self.config.do_eval;
        let split = if with_truth { Split::Dev } else { Split::Test };
        let eval_output_dir = slice.output_dir(&self.config.output_dir);
        std::fs::create_dir_all(&eval_output_dir)?;

        let features = FeatureCache::new(self.config, self.tokenizer, model.family(), self.ctx)
            .load(self.task, &slice.task_name, split)?;
        let mode = self.task.output_mode();
        let dataset = FeatureDataset::new(features, mode)?;
        let loader = DataLoader::new(
            &dataset,
            self.config.eval_batch_size(),
            Sampler::Sequential,
            &self.device,
        )?;

        tracing::info!("***** Running evaluation {prefix} *****");
        tracing::info!("  Num examples = {}", dataset.len());
        tracing::info!("  Batch size = {}", self.config.eval_batch_size());

        let mut head_a = HeadOutputs::new(mode);
        let mut head_b = HeadOutputs::new(mode);
        let mut eval_loss = 0.0;
        let mut nb_eval_steps = 0usize;
        for (i, batch) in loader.epoch(0).enumerate() {
            let outputs = batch.and_then(|batch| Self::eval_batch(model, &batch, mode));
            let Some(outputs) = recover(&format!("evaluation batch {i}"), outputs) else {
                continue;
            };
            eval_loss += outputs.loss;
            nb_eval_steps += 1;
            head_a.extend(outputs.predictions_a, outputs.references_a);
            head_b.extend(outputs.predictions_b, outputs.references_b);
        }
        #[allow(clippy::cast_precision_loss)]
        let eval_loss = if nb_eval_steps > 0 {
            eval_loss / nb_eval_steps as f64
        } else {
            0.0
        };
        tracing::info!("  eval_loss = {eval_loss}");

        if with_truth {
            let report = self.write_metrics(
                &slice.task_name,
                &head_a,
                &head_b,
                &eval_output_dir.join(prefix),
                results,
            );
            recover("writing evaluation results", report);
        }
        let dumps = write_predictions(&eval_output_dir, &head_a.predictions, &head_b.predictions);
        recover("writing predictions", dumps);
        Ok(())
    }

    fn eval_batch(model: &DualHeadClassifier, batch: &Batch, mode: OutputMode) -> Result<BatchOutputs> {
        let request = ForwardRequest::from_batch(batch, model.input_policy());
        let output = model.forward(&request, false)?;
        Ok(BatchOutputs {
            loss: f64::from(output.loss.to_dtype(DType::F32)?.to_scalar::<f32>()?),
            predictions_a: reduce_logits(&output.logits_a, mode)?,
            predictions_b: reduce_logits(&output.logits_b, mode)?,
            references_a: labels_to_values(&batch.labels_a, mode)?,
            references_b: labels_to_values(&batch.labels_b, mode)?,
        })
    }

    /// Compute per-head metrics into `results` and write the report. Entries
    /// computed before a failure stay in `results`.
    fn write_metrics(
        &self,
        task_name: &str,
        head_a: &HeadOutputs,
        head_b: &HeadOutputs,
        report_dir: &Path,
        results: &mut BTreeMap<String, f64>,
    ) -> Result<()> {
        let result_a = suffixed((self.metrics)(task_name, &head_a.predictions, &head_a.references)?, "_a");
        results.extend(result_a.iter().map(|(k, v)| (k.clone(), *v)));
        let result_b = suffixed((self.metrics)(task_name, &head_b.predictions, &head_b.references)?, "_b");
        results.extend(result_b.iter().map(|(k, v)| (k.clone(), *v)));

        std::fs::create_dir_all(report_dir)?;
        let mut report = String::new();
        for (key, value) in result_a.iter().chain(result_b.iter()) {
            tracing::info!("  {key} = {value}");
            let _ = writeln!(report, "{key} = {value}");
        }
        std::fs::write(report_dir.join(EVAL_RESULTS_NAME), report)?;
        Ok(())
    }
}

fn suffixed(metrics: BTreeMap<String, f64>, suffix: &str) -> BTreeMap<String, f64> {
    metrics
        .into_iter()
        .map(|(k, v)| (format!("{k}{suffix}"), v))
        .collect()
}

fn write_predictions(dir: &Path, a: &HeadValues, b: &HeadValues) -> Result<()> {
    std::fs::write(dir.join(PREDICTIONS_A_NAME), a.lines().join("\n"))?;
    std::fs::write(dir.join(PREDICTIONS_B_NAME), b.lines().join("\n"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TwinheadError;
    use crate::features::tests::tiny_tokenizer;
    use crate::model::tests::tiny_classifier;
    use crate::task::lookup_task;
    use tempfile::TempDir;

    const ROWS: &str = "ID,Text,Sub-task A,Sub-task B\n\
        1,you are great,NAG,NGEN\n\
        2,go away now,OAG,GEN\n\
        3,hello there friend,CAG,NGEN\n";

    fn setup(do_eval: bool) -> (TempDir, RunConfig) {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("data");
        std::fs::create_dir_all(&data).unwrap();
        std::fs::write(data.join("dev.csv"), ROWS).unwrap();
        std::fs::write(
            data.join("test.csv"),
            "ID,Text\n7,bye friend\n8,good good\n",
        )
        .unwrap();
        let mut config = RunConfig::trac_bert_preset();
        config.data_dir = data.to_string_lossy().into_owned();
        config.output_dir = dir.path().join("out").to_string_lossy().into_owned();
        config.folders = Vec::new();
        config.model.model_name_or_path = "tiny-bert".into();
        config.data.max_seq_length = 8;
        config.evaluation.per_device_eval_batch_size = 2;
        config.do_eval = do_eval;
        config.do_predict = !do_eval;
        (dir, config)
    }

    #[test]
    fn test_reduce_logits() {
        let logits = Tensor::new(&[[0.1f32, 2.0, -1.0], [3.0, 0.0, 0.5]], &Device::Cpu).unwrap();
        assert_eq!(
            reduce_logits(&logits, OutputMode::Classification).unwrap(),
            HeadValues::Classes(vec![1, 0])
        );
        let logits = Tensor::new(&[[0.25f32], [-1.5]], &Device::Cpu).unwrap();
        assert_eq!(
            reduce_logits(&logits, OutputMode::Regression).unwrap(),
            HeadValues::Values(vec![0.25, -1.5])
        );
    }

    #[test]
    fn test_evaluate_writes_report_and_predictions() {
        let (dir, config) = setup(true);
        let task = lookup_task("trac").unwrap();
        let tokenizer = tiny_tokenizer();
        let ctx = DistributedContext::single_process();
        let model = tiny_classifier(3, 2);

        let results = Evaluator::new(&config, &task, &tokenizer, &ctx, &Device::Cpu)
            .evaluate(&model, "checkpoint-1")
            .unwrap();
        for key in ["acc_a", "f1_a", "acc_and_f1_a", "acc_b", "f1_b", "acc_and_f1_b"] {
            assert!(results.contains_key(key), "missing {key}");
        }

        let out = dir.path().join("out");
        let report = std::fs::read_to_string(out.join("checkpoint-1").join(EVAL_RESULTS_NAME)).unwrap();
        let keys: Vec<_> = report.lines().map(|l| l.split(" = ").next().unwrap()).collect();
        assert_eq!(
            keys,
            vec!["acc_a", "acc_and_f1_a", "f1_a", "acc_b", "acc_and_f1_b", "f1_b"]
        );
        let preds = std::fs::read_to_string(out.join(PREDICTIONS_A_NAME)).unwrap();
        assert_eq!(preds.lines().count(), 3);
        assert!(preds.lines().all(|l| l.parse::<usize>().unwrap() < 3));
    }

    #[test]
    fn test_predict_only_skips_metrics() {
        let (dir, config) = setup(false);
        let task = lookup_task("trac").unwrap();
        let tokenizer = tiny_tokenizer();
        let ctx = DistributedContext::single_process();
        let model = tiny_classifier(3, 2);

        let results = Evaluator::new(&config, &task, &tokenizer, &ctx, &Device::Cpu)
            .evaluate(&model, "")
            .unwrap();
        assert!(results.is_empty());
        let out = dir.path().join("out");
        assert!(!out.join(EVAL_RESULTS_NAME).exists());
        let preds = std::fs::read_to_string(out.join(PREDICTIONS_B_NAME)).unwrap();
        assert_eq!(preds.lines().count(), 2);
    }

    #[test]
    fn test_failing_metrics_still_write_predictions() {
        fn broken(_: &str, _: &HeadValues, _: &HeadValues) -> Result<BTreeMap<String, f64>> {
            Err(TwinheadError::Evaluation("metric failed".into()))
        }
        let (dir, config) = setup(true);
        let task = lookup_task("trac").unwrap();
        let tokenizer = tiny_tokenizer();
        let ctx = DistributedContext::single_process();
        let model = tiny_classifier(3, 2);

        let results = Evaluator::new(&config, &task, &tokenizer, &ctx, &Device::Cpu)
            .with_metrics(broken)
            .evaluate(&model, "")
            .unwrap();
        assert!(results.is_empty());
        assert!(dir.path().join("out").join(PREDICTIONS_A_NAME).exists());
    }

    #[test]
    fn test_missing_split_is_an_error() {
        let (dir, config) = setup(true);
        std::fs::remove_file(dir.path().join("data").join("dev.csv")).unwrap();
        let task = lookup_task("trac").unwrap();
        let tokenizer = tiny_tokenizer();
        let ctx = DistributedContext::single_process();
        let model = tiny_classifier(3, 2);
        let result = Evaluator::new(&config, &task, &tokenizer, &ctx, &Device::Cpu).evaluate(&model, "");
        assert!(result.is_err());
    }
}
