//! Run configuration parsing and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TwinheadError};
use crate::model::EncoderFamily;

/// Immutable configuration for one fine-tuning run.
///
/// # Example
///
/// ```rust
/// use twinhead_rs::RunConfig;
///
/// # fn main() -> twinhead_rs::Result<()> {
/// let config = RunConfig::from_preset("trac-bert")?;
/// config.validate()?;
/// assert_eq!(config.task_name, "trac");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Name of the task to train, resolved through the task registry.
    pub task_name: String,

    /// Directory holding the task data and the feature caches.
    pub data_dir: String,

    /// Directory receiving checkpoints, the final model and reports.
    pub output_dir: String,

    /// Data sub-folders to read (e.g. one per language).
    #[serde(default)]
    pub folders: Vec<String>,

    /// Pretrained encoder settings.
    pub model: ModelConfig,

    /// Feature conversion settings.
    #[serde(default)]
    pub data: DataConfig,

    /// Training hyperparameters.
    #[serde(default)]
    pub training: TrainingConfig,

    /// Evaluation settings.
    #[serde(default)]
    pub evaluation: EvaluationConfig,

    /// Multi-process settings.
    #[serde(default)]
    pub distributed: DistributedConfig,

    /// Run training.
    #[serde(default)]
    pub do_train: bool,

    /// Evaluate on the dev split.
    #[serde(default)]
    pub do_eval: bool,

    /// Predict on the test split.
    #[serde(default)]
    pub do_predict: bool,

    /// Allow training into a non-empty output directory.
    #[serde(default)]
    pub overwrite_output_dir: bool,

    /// Random seed.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Stay on CPU even when CUDA is available.
    #[serde(default)]
    pub no_cuda: bool,

    /// Data-parallel replicas within this process.
    #[serde(default = "default_n_devices")]
    pub n_devices: usize,
}

fn default_seed() -> u64 {
    42
}
fn default_n_devices() -> usize {
    1
}

/// Pretrained encoder settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Encoder family (`bert`, `roberta`, `xlnet`, ...).
    #[serde(default = "default_model_type")]
    pub model_type: String,

    /// Directory of the pretrained encoder or of a checkpoint to resume from.
    pub model_name_or_path: String,

    /// Directory holding `config.json`, when different from the model path.
    #[serde(default)]
    pub config_name: Option<String>,

    /// Directory holding `tokenizer.json`, when different from the model path.
    #[serde(default)]
    pub tokenizer_name: Option<String>,
}

fn default_model_type() -> String {
    "bert".into()
}

/// Feature conversion settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Length every feature is padded or truncated to.
    #[serde(default = "default_max_seq_length")]
    pub max_seq_length: usize,

    /// Rebuild feature caches even when a matching one exists.
    #[serde(default)]
    pub overwrite_cache: bool,
}

fn default_max_seq_length() -> usize {
    128
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            max_seq_length: default_max_seq_length(),
            overwrite_cache: false,
        }
    }
}

/// Mixed precision optimization level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptLevel {
    /// Full f32.
    O0,
    /// Half-precision compute with dynamic loss scaling.
    #[default]
    O1,
    /// Treated as `O1`: layer norms already run in f32.
    O2,
    /// Pure half precision, no loss scaling.
    O3,
}

/// Training hyperparameters.
///
/// # Example
///
/// ```rust
/// use twinhead_rs::TrainingConfig;
///
/// let training = TrainingConfig {
///     per_device_train_batch_size: 16,
///     gradient_accumulation_steps: 2,
///     learning_rate: 3e-5,
///     ..Default::default()
/// };
///
/// assert_eq!(training.num_train_epochs, 3.0);
/// assert_eq!(training.max_steps, None);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Batch size per replica.
    #[serde(default = "default_batch_size")]
    pub per_device_train_batch_size: usize,

    /// Batches accumulated per optimizer step.
    #[serde(default = "default_grad_accum")]
    pub gradient_accumulation_steps: usize,

    /// Peak learning rate.
    #[serde(default = "default_lr")]
    pub learning_rate: f64,

    /// Decoupled weight decay for the decay group.
    #[serde(default)]
    pub weight_decay: f64,

    /// AdamW epsilon.
    #[serde(default = "default_adam_epsilon")]
    pub adam_epsilon: f64,

    /// AdamW first moment decay.
    #[serde(default = "default_beta1")]
    pub adam_beta1: f64,

    /// AdamW second moment decay.
    #[serde(default = "default_beta2")]
    pub adam_beta2: f64,

    /// Maximum global gradient norm.
    #[serde(default = "default_grad_norm")]
    pub max_grad_norm: f64,

    /// Number of epochs. Fractional values are truncated for iteration.
    #[serde(default = "default_epochs")]
    pub num_train_epochs: f64,

    /// Total optimizer steps; overrides `num_train_epochs` when set.
    #[serde(default)]
    pub max_steps: Option<usize>,

    /// Linear warmup steps.
    #[serde(default)]
    pub warmup_steps: usize,

    /// Log every N optimizer steps (0 disables).
    #[serde(default = "default_log_steps")]
    pub logging_steps: usize,

    /// Checkpoint every N optimizer steps (0 disables).
    #[serde(default = "default_save_steps")]
    pub save_steps: usize,

    /// Train with half-precision compute and loss scaling.
    #[serde(default)]
    pub fp16: bool,

    /// Mixed precision level.
    #[serde(default)]
    pub fp16_opt_level: OptLevel,

    /// Initial dynamic loss scale.
    #[serde(default = "default_loss_scale")]
    pub initial_loss_scale: f64,

    /// Clean steps before the loss scale doubles.
    #[serde(default = "default_growth_interval")]
    pub loss_scale_growth_interval: usize,
}

fn default_batch_size() -> usize {
    8
}
fn default_grad_accum() -> usize {
    1
}
fn default_lr() -> f64 {
    5e-5
}
fn default_adam_epsilon() -> f64 {
    1e-8
}
fn default_beta1() -> f64 {
    0.9
}
fn default_beta2() -> f64 {
    0.999
}
fn default_grad_norm() -> f64 {
    1.0
}
fn default_epochs() -> f64 {
    3.0
}
fn default_log_steps() -> usize {
    500
}
fn default_save_steps() -> usize {
    500
}
fn default_loss_scale() -> f64 {
    65536.0
}
fn default_growth_interval() -> usize {
    2000
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            per_device_train_batch_size: default_batch_size(),
            gradient_accumulation_steps: default_grad_accum(),
            learning_rate: default_lr(),
            weight_decay: 0.0,
            adam_epsilon: default_adam_epsilon(),
            adam_beta1: default_beta1(),
            adam_beta2: default_beta2(),
            max_grad_norm: default_grad_norm(),
            num_train_epochs: default_epochs(),
            max_steps: None,
            warmup_steps: 0,
            logging_steps: default_log_steps(),
            save_steps: default_save_steps(),
            fp16: false,
            fp16_opt_level: OptLevel::default(),
            initial_loss_scale: default_loss_scale(),
            loss_scale_growth_interval: default_growth_interval(),
        }
    }
}

/// Evaluation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    /// Batch size per replica during evaluation.
    #[serde(default = "default_batch_size")]
    pub per_device_eval_batch_size: usize,

    /// Evaluate at every logging step (single process only).
    #[serde(default)]
    pub evaluate_during_training: bool,

    /// Evaluate every checkpoint under the output directory.
    #[serde(default)]
    pub eval_all_checkpoints: bool,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            per_device_eval_batch_size: default_batch_size(),
            evaluate_during_training: false,
            eval_all_checkpoints: false,
        }
    }
}

/// Multi-process settings. Unset fields fall back to `LOCAL_RANK` and
/// `WORLD_SIZE` from the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedConfig {
    /// Rank of this process on the node.
    #[serde(default)]
    pub local_rank: Option<usize>,

    /// Number of cooperating processes.
    #[serde(default)]
    pub world_size: Option<usize>,

    /// Shared directory for barrier markers. Defaults to `<data_dir>/.twinhead-sync`.
    #[serde(default)]
    pub sync_dir: Option<String>,

    /// How long a worker waits at a barrier.
    #[serde(default = "default_barrier_timeout")]
    pub barrier_timeout_secs: u64,

    /// Poll interval while waiting at a barrier.
    #[serde(default = "default_poll_interval")]
    pub barrier_poll_ms: u64,
}

fn default_barrier_timeout() -> u64 {
    7200
}
fn default_poll_interval() -> u64 {
    200
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            local_rank: None,
            world_size: None,
            sync_dir: None,
            barrier_timeout_secs: default_barrier_timeout(),
            barrier_poll_ms: default_poll_interval(),
        }
    }
}

impl RunConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create a configuration from a preset.
    ///
    /// Available presets:
    /// - `"trac-bert"` - English TRAC with `bert-base-uncased`
    /// - `"trac-mbert"` - all three TRAC languages with multilingual BERT
    pub fn from_preset(preset: &str) -> Result<Self> {
        match preset {
            "trac-bert" => Ok(Self::trac_bert_preset()),
            "trac-mbert" => Ok(Self::trac_mbert_preset()),
            _ => Err(TwinheadError::Config(format!("Unknown preset: {preset}"))),
        }
    }

    /// English TRAC-2 aggression and misogyny identification with BERT base.
    #[must_use]
    pub fn trac_bert_preset() -> Self {
        Self {
            task_name: "trac".into(),
            data_dir: "./data/trac2".into(),
            output_dir: "./outputs/trac-bert".into(),
            folders: vec!["eng".into()],
            model: ModelConfig {
                model_type: "bert".into(),
                model_name_or_path: "./models/bert-base-uncased".into(),
                config_name: None,
                tokenizer_name: None,
            },
            data: DataConfig::default(),
            training: TrainingConfig::default(),
            evaluation: EvaluationConfig::default(),
            distributed: DistributedConfig::default(),
            do_train: true,
            do_eval: true,
            do_predict: false,
            overwrite_output_dir: false,
            seed: default_seed(),
            no_cuda: false,
            n_devices: 1,
        }
    }

    /// Multilingual TRAC-2 (English, Hindi, Bengali) with multilingual BERT.
    #[must_use]
    pub fn trac_mbert_preset() -> Self {
        Self {
            data_dir: "./data/trac2".into(),
            output_dir: "./outputs/trac-mbert".into(),
            folders: vec!["eng".into(), "hin".into(), "iben".into()],
            model: ModelConfig {
                model_type: "bert".into(),
                model_name_or_path: "./models/bert-base-multilingual-cased".into(),
                config_name: None,
                tokenizer_name: None,
            },
            training: TrainingConfig {
                learning_rate: 3e-5,
                num_train_epochs: 4.0,
                ..Default::default()
            },
            ..Self::trac_bert_preset()
        }
    }

    /// Validate the configuration.
    ///
    /// ```rust
    /// use twinhead_rs::RunConfig;
    ///
    /// let mut config = RunConfig::from_preset("trac-bert").unwrap();
    /// config.training.gradient_accumulation_steps = 0;
    /// assert!(config.validate().is_err());
    /// ```
    pub fn validate(&self) -> Result<()> {
        if self.task_name.is_empty() {
            return Err(TwinheadError::Config("task_name is required".into()));
        }
        if self.data_dir.is_empty() {
            return Err(TwinheadError::Config("data_dir is required".into()));
        }
        if self.output_dir.is_empty() {
            return Err(TwinheadError::Config("output_dir is required".into()));
        }
        if self.model.model_name_or_path.is_empty() {
            return Err(TwinheadError::Config(
                "model.model_name_or_path is required".into(),
            ));
        }
        EncoderFamily::from_model_type(&self.model.model_type)?;

        if self.data.max_seq_length < 3 {
            return Err(TwinheadError::Config(
                "data.max_seq_length must be >= 3".into(),
            ));
        }

        let training = &self.training;
        if training.per_device_train_batch_size == 0 {
            return Err(TwinheadError::Config(
                "training.per_device_train_batch_size must be > 0".into(),
            ));
        }
        if self.evaluation.per_device_eval_batch_size == 0 {
            return Err(TwinheadError::Config(
                "evaluation.per_device_eval_batch_size must be > 0".into(),
            ));
        }
        if training.gradient_accumulation_steps == 0 {
            return Err(TwinheadError::Config(
                "training.gradient_accumulation_steps must be > 0".into(),
            ));
        }
        if training.learning_rate <= 0.0 {
            return Err(TwinheadError::Config(
                "training.learning_rate must be > 0".into(),
            ));
        }
        if training.weight_decay < 0.0 {
            return Err(TwinheadError::Config(
                "training.weight_decay must be >= 0".into(),
            ));
        }
        if !(0.0..1.0).contains(&training.adam_beta1) || !(0.0..1.0).contains(&training.adam_beta2)
        {
            return Err(TwinheadError::Config(
                "training.adam_beta1 and adam_beta2 must lie in [0, 1)".into(),
            ));
        }
        if training.max_grad_norm <= 0.0 {
            return Err(TwinheadError::Config(
                "training.max_grad_norm must be > 0".into(),
            ));
        }
        if training.max_steps == Some(0) {
            return Err(TwinheadError::Config(
                "training.max_steps must be > 0 when set".into(),
            ));
        }
        if training.max_steps.is_none() && training.num_train_epochs < 1.0 {
            return Err(TwinheadError::Config(
                "training.num_train_epochs must be >= 1 unless max_steps is set".into(),
            ));
        }
        if training.fp16 && training.initial_loss_scale <= 0.0 {
            return Err(TwinheadError::Config(
                "training.initial_loss_scale must be > 0".into(),
            ));
        }
        if self.n_devices == 0 {
            return Err(TwinheadError::Config("n_devices must be > 0".into()));
        }
        if let (Some(rank), Some(world)) =
            (self.distributed.local_rank, self.distributed.world_size)
        {
            if rank >= world {
                return Err(TwinheadError::Config(format!(
                    "distributed.local_rank {rank} must be < world_size {world}"
                )));
            }
        }

        Ok(())
    }

    /// Batch size of one training step across all in-process replicas.
    #[must_use]
    pub fn train_batch_size(&self) -> usize {
        self.training.per_device_train_batch_size * self.n_devices.max(1)
    }

    /// Batch size of one evaluation step across all in-process replicas.
    #[must_use]
    pub fn eval_batch_size(&self) -> usize {
        self.evaluation.per_device_eval_batch_size * self.n_devices.max(1)
    }

    /// Identifier of the encoder used in feature cache names: the last
    /// non-empty path component of `model_name_or_path`.
    ///
    /// ```rust
    /// use twinhead_rs::RunConfig;
    ///
    /// let mut config = RunConfig::from_preset("trac-bert").unwrap();
    /// config.model.model_name_or_path = "models/bert-base-uncased/".into();
    /// assert_eq!(config.encoder_id(), "bert-base-uncased");
    /// ```
    #[must_use]
    pub fn encoder_id(&self) -> String {
        self.model
            .model_name_or_path
            .split('/')
            .filter(|part| !part.is_empty())
            .last()
            .unwrap_or_default()
            .to_string()
    }

    /// Directory `config.json` is read from.
    #[must_use]
    pub fn config_dir(&self) -> PathBuf {
        PathBuf::from(
            self.model
                .config_name
                .as_deref()
                .unwrap_or(&self.model.model_name_or_path),
        )
    }

    /// Directory `tokenizer.json` is read from.
    #[must_use]
    pub fn tokenizer_dir(&self) -> PathBuf {
        PathBuf::from(
            self.model
                .tokenizer_name
                .as_deref()
                .unwrap_or(&self.model.model_name_or_path),
        )
    }

    /// Directory used for barrier markers.
    #[must_use]
    pub fn sync_dir(&self) -> PathBuf {
        self.distributed.sync_dir.as_ref().map_or_else(
            || Path::new(&self.data_dir).join(".twinhead-sync"),
            PathBuf::from,
        )
    }
}
