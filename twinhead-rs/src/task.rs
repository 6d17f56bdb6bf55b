//! Task processors, raw examples and label vocabularies.
//!
//! A task declares its label sets for both heads, how to read raw
//! [`Example`]s for a split, its output mode and the evaluation slices it is
//! scored on.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TwinheadError};
use crate::model::EncoderFamily;

/// Dataset split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    /// Training data.
    Train,
    /// Labeled development data.
    Dev,
    /// Test data, possibly unlabeled.
    Test,
}

impl Split {
    /// Name used in file names.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Dev => "dev",
            Split::Test => "test",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the heads of a task classify or regress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Labels are class names; predictions are arg-max indices.
    Classification,
    /// Labels are numbers; predictions are the squeezed logits.
    Regression,
}

/// Raw input of one example.
#[derive(Debug, Clone, PartialEq)]
pub struct Example {
    /// Unique id.
    pub guid: String,
    /// First text.
    pub text_a: String,
    /// Optional second text.
    pub text_b: Option<String>,
    /// Head A label, if known.
    pub label_a: Option<String>,
    /// Head B label, if known.
    pub label_b: Option<String>,
}

/// Label vocabularies of both heads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSet {
    /// Head A labels in index order.
    pub a: Vec<String>,
    /// Head B labels in index order.
    pub b: Vec<String>,
}

impl LabelSet {
    /// Build from string slices.
    #[must_use]
    pub fn new(a: &[&str], b: &[&str]) -> Self {
        Self {
            a: a.iter().map(|s| (*s).to_string()).collect(),
            b: b.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    /// Output cardinality of head A.
    #[must_use]
    pub fn num_labels_a(&self, mode: OutputMode) -> usize {
        match mode {
            OutputMode::Classification => self.a.len(),
            OutputMode::Regression => 1,
        }
    }

    /// Output cardinality of head B.
    #[must_use]
    pub fn num_labels_b(&self, mode: OutputMode) -> usize {
        match mode {
            OutputMode::Classification => self.b.len(),
            OutputMode::Regression => 1,
        }
    }
}

/// Label order fix-ups for pretrained checkpoints whose classifier was
/// trained with a different label order than the task processor declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelOrderWorkaround {
    /// RoBERTa MNLI checkpoints store `entailment` and `neutral` swapped
    /// relative to the MNLI processor: label indices 1 and 2 are exchanged.
    RobertaMnli,
}

impl LabelOrderWorkaround {
    /// The workaround registered for `(task, family)`, if any.
    #[must_use]
    pub fn for_task(task_name: &str, family: EncoderFamily) -> Option<Self> {
        let mnli = matches!(task_name, "mnli" | "mnli-mm");
        let roberta = matches!(family, EncoderFamily::Roberta | EncoderFamily::XlmRoberta);
        (mnli && roberta).then_some(LabelOrderWorkaround::RobertaMnli)
    }

    /// Apply to both heads' label lists.
    pub fn apply(self, labels: &mut LabelSet) {
        match self {
            LabelOrderWorkaround::RobertaMnli => {
                for list in [&mut labels.a, &mut labels.b] {
                    if list.len() > 2 {
                        list.swap(1, 2);
                    }
                }
            }
        }
    }
}

/// Reader of raw examples for one task.
pub trait TaskProcessor: Send + Sync {
    /// Label vocabularies of both heads.
    fn get_labels(&self) -> LabelSet;

    /// All examples of `split`, read from `data_dir` and its `folders`.
    fn get_examples(&self, data_dir: &Path, split: Split, folders: &[String]) -> Result<Vec<Example>>;
}

/// One evaluation slice: the task variant scored and the suffix appended to
/// the output directory for its reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalSlice {
    /// Task name used for the cache key and for `compute_metrics`.
    pub task_name: String,
    /// Appended to `output_dir` (empty for the main slice).
    pub output_suffix: String,
}

impl EvalSlice {
    /// Output directory of this slice.
    #[must_use]
    pub fn output_dir(&self, output_dir: &str) -> PathBuf {
        PathBuf::from(format!("{output_dir}{}", self.output_suffix))
    }
}

/// A registered task.
pub struct TaskSpec {
    name: String,
    output_mode: OutputMode,
    eval_slices: Vec<EvalSlice>,
    processor: Box<dyn TaskProcessor>,
}

impl fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSpec")
            .field("name", &self.name)
            .field("output_mode", &self.output_mode)
            .field("eval_slices", &self.eval_slices)
            .finish_non_exhaustive()
    }
}

impl TaskSpec {
    /// A task evaluated on a single slice under its own name.
    pub fn new(name: impl Into<String>, output_mode: OutputMode, processor: Box<dyn TaskProcessor>) -> Self {
        let name = name.into();
        Self {
            eval_slices: vec![EvalSlice {
                task_name: name.clone(),
                output_suffix: String::new(),
            }],
            name,
            output_mode,
            processor,
        }
    }

    /// Replace the evaluation slices.
    #[must_use]
    pub fn with_eval_slices(mut self, slices: Vec<EvalSlice>) -> Self {
        self.eval_slices = slices;
        self
    }

    /// Task name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Output mode of both heads.
    #[must_use]
    pub fn output_mode(&self) -> OutputMode {
        self.output_mode
    }

    /// Slices scored by the evaluation loop.
    #[must_use]
    pub fn eval_slices(&self) -> &[EvalSlice] {
        &self.eval_slices
    }

    /// The task's processor.
    #[must_use]
    pub fn processor(&self) -> &dyn TaskProcessor {
        self.processor.as_ref()
    }

    /// Label vocabularies from the processor.
    #[must_use]
    pub fn labels(&self) -> LabelSet {
        self.processor.get_labels()
    }
}

/// Names of the built-in tasks.
pub const TASK_NAMES: &[&str] = &["trac"];

/// Resolve a built-in task by name.
pub fn lookup_task(name: &str) -> Result<TaskSpec> {
    match name {
        "trac" => Ok(TaskSpec::new(
            "trac",
            OutputMode::Classification,
            Box::new(TracProcessor),
        )),
        other => Err(TwinheadError::UnknownTask(format!(
            "{other} (known tasks: {})",
            TASK_NAMES.join(", ")
        ))),
    }
}

/// TRAC-2 shared task: aggression (head A) and gendered aggression (head B).
///
/// Reads `<data_dir>/<folder>/trac2_<folder>_<split>.csv` for every folder,
/// or `<data_dir>/<split>.csv` when no folders are configured. Files carry the
/// header `ID,Text,Sub-task A,Sub-task B`; label columns may be absent or
/// empty on the test split.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracProcessor;

#[derive(Debug, Deserialize)]
struct TracRow {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Text")]
    text: String,
    #[serde(rename = "Sub-task A", default)]
    sub_task_a: Option<String>,
    #[serde(rename = "Sub-task B", default)]
    sub_task_b: Option<String>,
}

impl TracProcessor {
    fn read_file(path: &Path, split: Split, tag: &str) -> Result<Vec<Example>> {
        if !path.exists() {
            return Err(TwinheadError::Dataset(format!(
                "{} not found",
                path.display()
            )));
        }
        let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
        let mut examples = Vec::new();
        for row in reader.deserialize::<TracRow>() {
            let row = row?;
            examples.push(Example {
                guid: format!("{split}-{tag}-{}", row.id),
                text_a: row.text,
                text_b: None,
                label_a: row.sub_task_a.filter(|s| !s.trim().is_empty()),
                label_b: row.sub_task_b.filter(|s| !s.trim().is_empty()),
            });
        }
        tracing::debug!("read {} examples from {}", examples.len(), path.display());
        Ok(examples)
    }
}

impl TaskProcessor for TracProcessor {
    fn get_labels(&self) -> LabelSet {
        LabelSet::new(&["NAG", "CAG", "OAG"], &["NGEN", "GEN"])
    }

    fn get_examples(&self, data_dir: &Path, split: Split, folders: &[String]) -> Result<Vec<Example>> {
        if folders.is_empty() {
            let path = data_dir.join(format!("{split}.csv"));
            return Self::read_file(&path, split, "all");
        }
        let mut examples = Vec::new();
        for folder in folders {
            let path = data_dir
                .join(folder)
                .join(format!("trac2_{folder}_{split}.csv"));
            examples.extend(Self::read_file(&path, split, folder)?);
        }
        Ok(examples)
    }
}
