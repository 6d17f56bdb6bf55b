//! Run driver: validates the configuration, loads the pretrained encoder and
//! tokenizer, then trains, saves and evaluates as requested.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use candle_core::Device;
use tokenizers::Tokenizer;

use crate::cache::FeatureCache;
use crate::checkpoint::{find_checkpoints, save_model_artifacts, CHECKPOINT_PREFIX};
use crate::config::RunConfig;
use crate::dataset::FeatureDataset;
use crate::distributed::{DistributedContext, SyncPoint};
use crate::error::{recover, Result, TwinheadError};
use crate::evaluator::Evaluator;
use crate::model::{load_tokenizer, resolve_model_path, DualHeadClassifier, EncoderFamily};
use crate::task::{lookup_task, Split, TaskSpec};
use crate::trainer::Trainer;

/// What a run produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOutcome {
    /// `(global_step, average loss)` when training ran on this process.
    pub training: Option<(usize, f64)>,
    /// Evaluation metrics, suffixed `_<step>` when several checkpoints were
    /// evaluated.
    pub results: BTreeMap<String, f64>,
}

/// Drives one fine-tuning run.
///
/// # Example
///
/// ```no_run
/// use twinhead_rs::{RunConfig, Runner};
///
/// # fn main() -> twinhead_rs::Result<()> {
/// let config = RunConfig::from_file("trac.yaml")?;
/// let outcome = Runner::new(config)?.run()?;
/// for (key, value) in &outcome.results {
///     println!("{key} = {value}");
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Runner {
    config: RunConfig,
    task: TaskSpec,
    family: EncoderFamily,
}

impl Runner {
    /// Runner for a built-in task.
    ///
    /// # Errors
    ///
    /// Fails with a fatal error on an invalid configuration, an unknown task
    /// or an unknown model type.
    pub fn new(config: RunConfig) -> Result<Self> {
        config.validate()?;
        let task = lookup_task(&config.task_name)?;
        Self::with_task(config, task)
    }

    /// Runner for a caller-provided task.
    pub fn with_task(config: RunConfig, task: TaskSpec) -> Result<Self> {
        config.validate()?;
        let family = EncoderFamily::from_model_type(&config.model.model_type)?;
        Ok(Self {
            config,
            task,
            family,
        })
    }

    /// Run configuration.
    #[must_use]
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Execute the run.
    pub fn run(&self) -> Result<RunOutcome> {
        let config = &self.config;
        self.check_output_dir()?;

        let ctx = DistributedContext::from_config(config)?;
        let device = select_device(config, &ctx);
        if let Err(err) = device.set_seed(config.seed) {
            tracing::debug!("device RNG not seeded: {err}");
        }
        tracing::warn!(
            "Process rank: {:?}, device: {:?}, n_devices: {}, distributed training: {}, 16-bits training: {}",
            ctx.local_rank(),
            device,
            config.n_devices,
            ctx.is_distributed(),
            config.training.fp16
        );

        let (mut model, tokenizer) =
            ctx.synchronized(SyncPoint::PretrainedModel, || self.load_pretrained(&device))?;
        tracing::info!("Training/evaluation parameters {config:?}");

        let mut outcome = RunOutcome::default();
        let output_dir = PathBuf::from(&config.output_dir);
        let mut reloaded = None;

        if config.do_train {
            let features = FeatureCache::new(config, &tokenizer, self.family, &ctx).load(
                &self.task,
                self.task.name(),
                Split::Train,
            )?;
            let dataset = FeatureDataset::new(features, self.task.output_mode())?;
            let evaluator = Evaluator::new(config, &self.task, &tokenizer, &ctx, &device);
            let mut evaluate = |m: &DualHeadClassifier| evaluator.evaluate(m, "");
            let (global_step, tr_loss) = Trainer::new(config, &ctx, &device).train(
                &mut model,
                &tokenizer,
                &dataset,
                Some(&mut evaluate),
            )?;
            tracing::info!(" global_step = {global_step}, average loss = {tr_loss}");
            outcome.training = Some((global_step, tr_loss));

            if ctx.is_primary() {
                tracing::info!("Saving model checkpoint to {}", output_dir.display());
                save_model_artifacts(&output_dir, &model, &tokenizer, config)?;
                reloaded = Some(self.load_classifier(&output_dir, &output_dir, &device)?);
            }
        }

        if (config.do_eval || config.do_predict) && ctx.is_primary() {
            let tokenizer = if config.do_train {
                load_tokenizer(&output_dir)?
            } else {
                tokenizer
            };
            outcome.results =
                self.evaluate_checkpoints(&output_dir, &tokenizer, &ctx, &device, reloaded)?;
        }

        Ok(outcome)
    }

    fn check_output_dir(&self) -> Result<()> {
        let config = &self.config;
        let output_dir = Path::new(&config.output_dir);
        if config.do_train && !config.overwrite_output_dir && output_dir.is_dir() {
            let non_empty = std::fs::read_dir(output_dir)?.next().is_some();
            if non_empty {
                return Err(TwinheadError::OutputDirExists(output_dir.to_path_buf()));
            }
        }
        Ok(())
    }

    fn load_pretrained(&self, device: &Device) -> Result<(DualHeadClassifier, Tokenizer)> {
        let model_dir = resolve_model_path(&self.config.model.model_name_or_path)?;
        let config_dir = match &self.config.model.config_name {
            Some(name) => resolve_model_path(name)?,
            None => model_dir.clone(),
        };
        let tokenizer_dir = match &self.config.model.tokenizer_name {
            Some(name) => resolve_model_path(name)?,
            None => model_dir.clone(),
        };
        let model = self.load_classifier(&model_dir, &config_dir, device)?;
        let tokenizer = load_tokenizer(&tokenizer_dir)?;
        Ok((model, tokenizer))
    }

    fn load_classifier(&self, model_dir: &Path, config_dir: &Path, device: &Device) -> Result<DualHeadClassifier> {
        let labels = self.task.labels();
        let mode = self.task.output_mode();
        let mut model = DualHeadClassifier::from_pretrained(
            model_dir,
            config_dir,
            labels.num_labels_a(mode),
            labels.num_labels_b(mode),
            self.family,
            device,
        )?;
        model.set_finetuning_task(self.task.name());
        Ok(model)
    }

    /// Evaluate `output_dir`, or every checkpoint under it. `reloaded` is the
    /// model just saved to `output_dir`, if any.
    fn evaluate_checkpoints(
        &self,
        output_dir: &Path,
        tokenizer: &Tokenizer,
        ctx: &DistributedContext,
        device: &Device,
        mut reloaded: Option<DualHeadClassifier>,
    ) -> Result<BTreeMap<String, f64>> {
        let checkpoints = if self.config.evaluation.eval_all_checkpoints {
            find_checkpoints(output_dir)?
        } else {
            vec![output_dir.to_path_buf()]
        };
        tracing::info!("Evaluate the following checkpoints: {checkpoints:?}");

        let evaluator = Evaluator::new(&self.config, &self.task, tokenizer, ctx, device);
        let mut results = BTreeMap::new();
        for checkpoint in &checkpoints {
            let path = checkpoint.to_string_lossy();
            let global_step = if checkpoints.len() > 1 {
                path.rsplit('-').next().unwrap_or_default().to_string()
            } else {
                String::new()
            };
            let prefix = if path.contains(CHECKPOINT_PREFIX) {
                checkpoint
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default()
            } else {
                String::new()
            };

            let model = match reloaded.take() {
                Some(model) if checkpoint.as_path() == output_dir => Ok(model),
                other => {
                    reloaded = other;
                    self.load_classifier(checkpoint, checkpoint, device)
                }
            };
            let evaluated = model.and_then(|model| evaluator.evaluate(&model, &prefix));
            let Some(result) = recover(&format!("evaluating {path}"), evaluated) else {
                continue;
            };
            for (key, value) in result {
                let key = if global_step.is_empty() {
                    key
                } else {
                    format!("{key}_{global_step}")
                };
                results.insert(key, value);
            }
        }
        Ok(results)
    }
}

/// CPU when `no_cuda` is set, otherwise the CUDA device of this rank when
/// one is available.
fn select_device(config: &RunConfig, ctx: &DistributedContext) -> Device {
    if config.no_cuda {
        tracing::info!("Device: CPU (no_cuda)");
        return Device::Cpu;
    }
    let ordinal = ctx.local_rank().unwrap_or(0);
    match Device::cuda_if_available(ordinal) {
        Ok(device @ Device::Cuda(_)) => {
            tracing::info!("Device: CUDA (device {ordinal})");
            device
        }
        Ok(device) => {
            tracing::warn!("CUDA not available; running on CPU.");
            device
        }
        Err(err) => {
            tracing::warn!("CUDA init failed ({err}); falling back to CPU.");
            Device::Cpu
        }
    }
}
