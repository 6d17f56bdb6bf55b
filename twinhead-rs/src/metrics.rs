//! Evaluation metrics and the structured training log.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use serde::Serialize;

use crate::error::{Result, TwinheadError};

/// Reduced model outputs (or references) for one head.
#[derive(Debug, Clone, PartialEq)]
pub enum HeadValues {
    /// Class index per row.
    Classes(Vec<usize>),
    /// Scalar per row.
    Values(Vec<f32>),
}

impl HeadValues {
    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Classes(v) => v.len(),
            Self::Values(v) => v.len(),
        }
    }

    /// Whether there are no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One printable line per row.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        match self {
            Self::Classes(v) => v.iter().map(ToString::to_string).collect(),
            Self::Values(v) => v.iter().map(ToString::to_string).collect(),
        }
    }
}

/// Signature of a metrics function: task name, predictions, references.
pub type MetricsFn = fn(&str, &HeadValues, &HeadValues) -> Result<BTreeMap<String, f64>>;

/// Default metrics.
///
/// Classification yields `acc`, `f1` (macro over the classes seen in either
/// list) and `acc_and_f1`; regression yields `pearson`, `spearmanr` and
/// `corr`.
///
/// ```rust
/// use twinhead_rs::metrics::{compute_metrics, HeadValues};
///
/// let preds = HeadValues::Classes(vec![0, 1, 1, 0]);
/// let labels = HeadValues::Classes(vec![0, 1, 0, 0]);
/// let metrics = compute_metrics("trac", &preds, &labels).unwrap();
/// assert_eq!(metrics["acc"], 0.75);
/// ```
#[allow(clippy::cast_precision_loss)]
pub fn compute_metrics(
    task: &str,
    predictions: &HeadValues,
    references: &HeadValues,
) -> Result<BTreeMap<String, f64>> {
    if predictions.len() != references.len() {
        return Err(TwinheadError::Evaluation(format!(
            "{task}: {} predictions for {} references",
            predictions.len(),
            references.len()
        )));
    }
    let mut out = BTreeMap::new();
    match (predictions, references) {
        (HeadValues::Classes(preds), HeadValues::Classes(labels)) => {
            let acc = accuracy(preds, labels);
            let f1 = macro_f1(preds, labels);
            out.insert("acc".to_string(), acc);
            out.insert("f1".to_string(), f1);
            out.insert("acc_and_f1".to_string(), (acc + f1) / 2.0);
        }
        (HeadValues::Values(preds), HeadValues::Values(labels)) => {
            let x: Vec<f64> = preds.iter().map(|&v| f64::from(v)).collect();
            let y: Vec<f64> = labels.iter().map(|&v| f64::from(v)).collect();
            let pearson = pearson(&x, &y);
            let spearman = self::pearson(&ranks(&x), &ranks(&y));
            out.insert("pearson".to_string(), pearson);
            out.insert("spearmanr".to_string(), spearman);
            out.insert("corr".to_string(), (pearson + spearman) / 2.0);
        }
        _ => {
            return Err(TwinheadError::Evaluation(format!(
                "{task}: predictions and references have different output modes"
            )))
        }
    }
    Ok(out)
}

#[allow(clippy::cast_precision_loss)]
fn accuracy(preds: &[usize], labels: &[usize]) -> f64 {
    if preds.is_empty() {
        return 0.0;
    }
    let correct = preds.iter().zip(labels).filter(|(p, l)| p == l).count();
    correct as f64 / preds.len() as f64
}

#[allow(clippy::cast_precision_loss)]
fn macro_f1(preds: &[usize], labels: &[usize]) -> f64 {
    let classes: std::collections::BTreeSet<usize> =
        preds.iter().chain(labels.iter()).copied().collect();
    if classes.is_empty() {
        return 0.0;
    }
    let mut total = 0.0;
    for &class in &classes {
        let mut tp = 0usize;
        let mut fp = 0usize;
        let mut fn_ = 0usize;
        for (&p, &l) in preds.iter().zip(labels) {
            match (p == class, l == class) {
                (true, true) => tp += 1,
                (true, false) => fp += 1,
                (false, true) => fn_ += 1,
                (false, false) => {}
            }
        }
        let denom = 2 * tp + fp + fn_;
        if denom > 0 {
            total += (2 * tp) as f64 / denom as f64;
        }
    }
    total / classes.len() as f64
}

#[allow(clippy::cast_precision_loss)]
fn pearson(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len() as f64;
    if x.is_empty() {
        return 0.0;
    }
    let mx = x.iter().sum::<f64>() / n;
    let my = y.iter().sum::<f64>() / n;
    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for (a, b) in x.iter().zip(y) {
        sxy += (a - mx) * (b - my);
        sxx += (a - mx).powi(2);
        syy += (b - my).powi(2);
    }
    if sxx == 0.0 || syy == 0.0 {
        return 0.0;
    }
    sxy / (sxx.sqrt() * syy.sqrt())
}

/// Average ranks (ties share the mean of their positions), 1-based.
#[allow(clippy::cast_precision_loss)]
fn ranks(values: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
    let mut out = vec![0.0; values.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && values[order[j + 1]] == values[order[i]] {
            j += 1;
        }
        let rank = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            out[idx] = rank;
        }
        i = j + 1;
    }
    out
}

/// One structured training log record.
#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    /// Evaluation metrics, keys prefixed `eval_`.
    #[serde(flatten)]
    pub eval: BTreeMap<String, f64>,
    /// Learning rate after the step.
    pub learning_rate: f64,
    /// Mean training loss over the logging interval.
    pub loss: f64,
    /// Global optimizer step.
    pub step: usize,
}

/// Destination of structured training records.
pub trait MetricSink {
    /// Record one entry.
    fn record(&mut self, record: &LogRecord) -> Result<()>;
}

impl<S: MetricSink + ?Sized> MetricSink for &mut S {
    fn record(&mut self, record: &LogRecord) -> Result<()> {
        (**self).record(record)
    }
}

/// Writes each record as one JSON line to stdout and, optionally, a file.
#[derive(Debug)]
pub struct JsonLinesSink {
    file: Option<File>,
    stdout: bool,
}

impl JsonLinesSink {
    /// Sink appending to `path` and echoing to stdout.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Some(file),
            stdout: true,
        })
    }

    /// Sink that only appends to `path`.
    pub fn file_only(path: &Path) -> Result<Self> {
        let mut sink = Self::new(path)?;
        sink.stdout = false;
        Ok(sink)
    }
}

impl MetricSink for JsonLinesSink {
    fn record(&mut self, record: &LogRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        if self.stdout {
            println!("{line}");
        }
        if let Some(file) = self.file.as_mut() {
            writeln!(file, "{line}")?;
        }
        Ok(())
    }
}

/// Sink that keeps records in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    /// Records in arrival order.
    pub records: Vec<LogRecord>,
}

impl MetricSink for MemorySink {
    fn record(&mut self, record: &LogRecord) -> Result<()> {
        self.records.push(record.clone());
        Ok(())
    }
}
