//! Training loop: gradient accumulation, clipping, scheduling, periodic
//! logging and checkpointing, resumable from a checkpoint directory.

use std::collections::BTreeMap;
use std::path::Path;

use candle_core::{Device, Tensor};
use indicatif::{ProgressBar, ProgressStyle};
use tokenizers::Tokenizer;

use crate::checkpoint::{
    checkpoint_dir, global_step_from_path, has_training_state, save_checkpoint, CheckpointParts,
};
use crate::config::RunConfig;
use crate::dataset::{Batch, DataLoader, FeatureDataset, Sampler};
use crate::distributed::DistributedContext;
use crate::error::{recover, Result, TwinheadError};
use crate::metrics::{JsonLinesSink, LogRecord, MetricSink};
use crate::model::{DualHeadClassifier, ForwardRequest, InputPolicy};
use crate::optimizer::{param_groups, AdamW, GradientAccumulator, OptimizerConfig};
use crate::precision::{LossScaler, PrecisionPlan};
use crate::scheduler::LinearWarmupSchedule;

/// File the structured training log is appended to, under `output_dir`.
pub const TRAIN_LOG_NAME: &str = "train_log.jsonl";

/// Evaluation run at logging steps during training.
pub type EvalHook<'h> = dyn FnMut(&DualHeadClassifier) -> Result<BTreeMap<String, f64>> + 'h;

/// Progress counters of one training run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingState {
    /// Optimizer steps taken (including those restored from a checkpoint).
    pub global_step: usize,
    /// Full epochs already covered by `global_step`.
    pub epochs_trained: usize,
    /// Batches to skip at the start of the first resumed epoch.
    pub steps_trained_in_current_epoch: usize,
    /// Sum of (accumulation-scaled) batch losses.
    pub tr_loss: f64,
    /// `tr_loss` at the last logging step.
    pub logging_loss: f64,
}

impl TrainingState {
    /// State after `global_step` optimizer steps of `steps_per_epoch` each.
    ///
    /// ```rust
    /// use twinhead_rs::trainer::TrainingState;
    ///
    /// let state = TrainingState::resume(7, 3);
    /// assert_eq!(state.epochs_trained, 2);
    /// assert_eq!(state.steps_trained_in_current_epoch, 1);
    /// ```
    #[must_use]
    pub fn resume(global_step: usize, steps_per_epoch: usize) -> Self {
        if steps_per_epoch == 0 {
            return Self {
                global_step,
                ..Self::default()
            };
        }
        Self {
            global_step,
            epochs_trained: global_step / steps_per_epoch,
            steps_trained_in_current_epoch: global_step % steps_per_epoch,
            ..Self::default()
        }
    }

    /// Mean loss per optimizer step, or 0 before the first step.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn average_loss(&self) -> f64 {
        if self.global_step == 0 {
            0.0
        } else {
            self.tr_loss / self.global_step as f64
        }
    }
}

/// Step budget of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepPlan {
    /// Optimizer steps per epoch.
    pub steps_per_epoch: usize,
    /// Total optimizer steps the schedule decays over.
    pub t_total: usize,
    /// Epochs to iterate.
    pub num_epochs: usize,
}

impl StepPlan {
    /// Derive the budget from the loader size and the run configuration.
    ///
    /// ```rust
    /// use twinhead_rs::trainer::StepPlan;
    ///
    /// let plan = StepPlan::new(10, 2, 3.0, None).unwrap();
    /// assert_eq!((plan.steps_per_epoch, plan.t_total, plan.num_epochs), (5, 15, 3));
    ///
    /// let plan = StepPlan::new(10, 2, 3.0, Some(12)).unwrap();
    /// assert_eq!((plan.t_total, plan.num_epochs), (12, 3));
    /// ```
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    pub fn new(
        batches_per_epoch: usize,
        gradient_accumulation_steps: usize,
        num_train_epochs: f64,
        max_steps: Option<usize>,
    ) -> Result<Self> {
        let steps_per_epoch = batches_per_epoch / gradient_accumulation_steps.max(1);
        if steps_per_epoch == 0 {
            return Err(TwinheadError::Training(format!(
                "{batches_per_epoch} batches per epoch cannot fill one optimizer step \
                 with gradient_accumulation_steps = {gradient_accumulation_steps}"
            )));
        }
        let plan = match max_steps {
            Some(max_steps) => Self {
                steps_per_epoch,
                t_total: max_steps,
                num_epochs: max_steps / steps_per_epoch + 1,
            },
            None => {
                // The schedule spans the fractional epoch budget; the loop
                // only runs whole epochs.
                let epochs = num_train_epochs.max(0.0);
                Self {
                    steps_per_epoch,
                    t_total: (steps_per_epoch as f64 * epochs) as usize,
                    num_epochs: epochs as usize,
                }
            }
        };
        Ok(plan)
    }
}

/// Runs the training loop for one model.
pub struct Trainer<'a> {
    config: &'a RunConfig,
    ctx: &'a DistributedContext,
    device: Device,
    sink: Option<Box<dyn MetricSink + 'a>>,
}

impl<'a> Trainer<'a> {
    /// Create a trainer. On the primary the structured log goes to
    /// `<output_dir>/train_log.jsonl` and stdout unless another sink is set.
    #[must_use]
    pub fn new(config: &'a RunConfig, ctx: &'a DistributedContext, device: &Device) -> Self {
        Self {
            config,
            ctx,
            device: device.clone(),
            sink: None,
        }
    }

    /// Replace the structured log destination.
    #[must_use]
    pub fn with_sink(mut self, sink: Box<dyn MetricSink + 'a>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Train `model` on `dataset`. Returns the global step reached and the
    /// mean loss per optimizer step.
    ///
    /// When `model_name_or_path` names a checkpoint directory, the step
    /// counter is restored from its name and, if present, the optimizer and
    /// scheduler state from its files.
    pub fn train(
        &mut self,
        model: &mut DualHeadClassifier,
        tokenizer: &Tokenizer,
        dataset: &FeatureDataset,
        mut evaluate: Option<&mut EvalHook<'_>>,
    ) -> Result<(usize, f64)> {
        let config = self.config;
        let training = &config.training;

        if self.ctx.is_primary() && self.sink.is_none() {
            let path = Path::new(&config.output_dir).join(TRAIN_LOG_NAME);
            self.sink = Some(Box::new(JsonLinesSink::new(&path)?));
        }

        let sampler = if self.ctx.is_distributed() {
            Sampler::Distributed {
                seed: config.seed,
                rank: self.ctx.local_rank().unwrap_or(0),
                world_size: self.ctx.world_size(),
            }
        } else {
            Sampler::Random { seed: config.seed }
        };
        let loader = DataLoader::new(dataset, config.train_batch_size(), sampler, &self.device)?;
        let accum = training.gradient_accumulation_steps.max(1);
        let plan = StepPlan::new(
            loader.len(),
            accum,
            training.num_train_epochs,
            training.max_steps,
        )?;

        let precision = PrecisionPlan::resolve(training, &self.device)?;
        model.set_compute_dtype(precision.compute_dtype);
        let mut scaler = LossScaler::for_plan(precision, training);

        let params = model.named_parameters()?;
        let mut optimizer = AdamW::new(
            param_groups(params.clone(), training.weight_decay),
            OptimizerConfig::from(training),
        )?;
        let mut scheduler =
            LinearWarmupSchedule::new(training.learning_rate, training.warmup_steps, plan.t_total);
        optimizer.set_learning_rate(scheduler.get_lr());

        let resume_dir = Path::new(&config.model.model_name_or_path);
        if has_training_state(resume_dir) {
            optimizer.load(resume_dir, &self.device)?;
            scheduler = LinearWarmupSchedule::load(resume_dir)?;
            tracing::info!("restored optimizer and scheduler state from {}", resume_dir.display());
        }
        let mut state = TrainingState::resume(
            global_step_from_path(&config.model.model_name_or_path),
            plan.steps_per_epoch,
        );

        tracing::info!("***** Running training *****");
        tracing::info!("  Num examples = {}", dataset.len());
        tracing::info!("  Num Epochs = {}", plan.num_epochs);
        tracing::info!(
            "  Instantaneous batch size per device = {}",
            training.per_device_train_batch_size
        );
        tracing::info!(
            "  Total train batch size (w. parallel, distributed & accumulation) = {}",
            config.train_batch_size() * accum * self.ctx.world_size()
        );
        tracing::info!("  Gradient Accumulation steps = {accum}");
        tracing::info!("  Total optimization steps = {}", plan.t_total);
        tracing::info!("  Trainable parameters = {}", model.num_parameters()?);
        if state.global_step > 0 {
            tracing::info!("  Continuing training from checkpoint, will skip to saved global_step");
            tracing::info!("  Continuing training from epoch {}", state.epochs_trained);
            tracing::info!("  Continuing training from global step {}", state.global_step);
            tracing::info!(
                "  Will skip the first {} steps in the first epoch",
                state.steps_trained_in_current_epoch
            );
        }

        let mut accumulator = GradientAccumulator::new(params);
        let policy = model.input_policy();
        let replicas = config.n_devices.max(1);
        let mut skip = state.steps_trained_in_current_epoch;

        'epochs: for epoch in state.epochs_trained..plan.num_epochs {
            let pb = self.progress_bar(loader.len(), epoch, plan.num_epochs)?;
            for (step, batch) in loader.epoch(epoch).enumerate() {
                pb.inc(1);
                if skip > 0 {
                    skip -= 1;
                    continue;
                }
                let batch = batch?;

                let loss = batch_loss(model, &batch, policy, replicas)?;
                #[allow(clippy::cast_precision_loss)]
                let loss = (loss / accum as f64)?;
                let grads = scaler.scale_loss(&loss)?.backward()?;
                accumulator.accumulate(&grads)?;
                let loss_value = f64::from(loss.to_scalar::<f32>()?);
                state.tr_loss += loss_value;
                pb.set_message(format!("loss {loss_value:.4}"));

                if (step + 1) % accum != 0 {
                    continue;
                }
                apply_update(&mut accumulator, &mut optimizer, &mut scaler, training.max_grad_norm)?;
                scheduler.step(&mut optimizer);
                accumulator.zero();
                state.global_step += 1;

                if self.ctx.is_primary()
                    && training.logging_steps > 0
                    && state.global_step % training.logging_steps == 0
                {
                    self.log_step(&mut state, scheduler.get_lr(), model, evaluate.as_deref_mut())?;
                }

                if self.ctx.is_primary()
                    && training.save_steps > 0
                    && state.global_step % training.save_steps == 0
                {
                    let target = checkpoint_dir(Path::new(&config.output_dir), state.global_step);
                    save_checkpoint(
                        &target,
                        &CheckpointParts {
                            model,
                            tokenizer,
                            config,
                            optimizer: &optimizer,
                            scheduler: &scheduler,
                        },
                    )?;
                }

                if training.max_steps.is_some_and(|max| state.global_step > max) {
                    pb.finish_and_clear();
                    break 'epochs;
                }
            }
            pb.finish_and_clear();
        }

        tracing::info!(
            " global_step = {}, average loss = {}",
            state.global_step,
            state.average_loss()
        );
        Ok((state.global_step, state.average_loss()))
    }

    fn log_step(
        &mut self,
        state: &mut TrainingState,
        learning_rate: f64,
        model: &DualHeadClassifier,
        evaluate: Option<&mut EvalHook<'_>>,
    ) -> Result<()> {
        let training = &self.config.training;
        let mut eval = BTreeMap::new();
        if self.config.evaluation.evaluate_during_training {
            if self.ctx.is_distributed() {
                tracing::debug!("skipping evaluation during distributed training");
            } else if let Some(hook) = evaluate {
                if let Some(results) = recover("evaluation during training", hook(model)) {
                    for (key, value) in results {
                        eval.insert(format!("eval_{key}"), value);
                    }
                }
            }
        }

        #[allow(clippy::cast_precision_loss)]
        let loss = (state.tr_loss - state.logging_loss) / training.logging_steps as f64;
        state.logging_loss = state.tr_loss;
        let record = LogRecord {
            eval,
            learning_rate,
            loss,
            step: state.global_step,
        };
        if let Some(sink) = self.sink.as_mut() {
            sink.record(&record)?;
        }
        Ok(())
    }

    fn progress_bar(&self, len: usize, epoch: usize, num_epochs: usize) -> Result<ProgressBar> {
        if !self.ctx.is_primary() {
            return Ok(ProgressBar::hidden());
        }
        let pb = ProgressBar::new(len as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>7}/{len:7} {prefix} {msg}")?
                .progress_chars("#>-"),
        );
        pb.set_prefix(format!("epoch {}/{num_epochs}", epoch + 1));
        Ok(pb)
    }
}

/// Training loss of one batch, averaged over in-process replica shards.
fn batch_loss(
    model: &DualHeadClassifier,
    batch: &Batch,
    policy: InputPolicy,
    replicas: usize,
) -> Result<Tensor> {
    if replicas <= 1 {
        return Ok(model
            .forward(&ForwardRequest::from_batch(batch, policy), true)?
            .loss);
    }
    let mut losses = Vec::with_capacity(replicas);
    for shard in batch.shards(replicas)? {
        let output = model.forward(&ForwardRequest::from_batch(&shard, policy), true)?;
        losses.push(output.loss);
    }
    Ok(Tensor::stack(&losses, 0)?.mean_all()?)
}

/// Unscale, check, clip and apply the accumulated gradients. Steps with
/// non-finite gradients are skipped.
fn apply_update(
    accumulator: &mut GradientAccumulator,
    optimizer: &mut AdamW,
    scaler: &mut LossScaler,
    max_grad_norm: f64,
) -> Result<()> {
    let finite = accumulator.all_finite()?;
    // The gradients carry the scale in effect before this update.
    let applied_scale = scaler.scale();
    if !scaler.update(!finite) {
        return Ok(());
    }
    if !finite {
        tracing::warn!("non-finite gradients, skipping optimizer step");
        return Ok(());
    }
    if scaler.is_enabled() {
        accumulator.scale(1.0 / applied_scale)?;
    }
    let norm = accumulator.clip_grad_norm(max_grad_norm)?;
    tracing::trace!("gradient norm {norm:.4}");
    optimizer.step(accumulator.grads())
}
