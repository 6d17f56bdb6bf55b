//! AdamW with parameter groups, gradient accumulation and clipping.
//!
//! `candle_nn::AdamW` applies one weight decay to every variable and keeps
//! its moments private, so it can neither exempt biases and layer norms from
//! decay nor be checkpointed. This optimizer keeps the moments per parameter
//! name so they can be written next to the model weights and restored.

use std::collections::HashMap;
use std::path::Path;

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::config::TrainingConfig;
use crate::error::{Result, TwinheadError};

/// Moment tensors file inside a checkpoint.
pub const OPTIMIZER_STATE_NAME: &str = "optimizer.safetensors";
/// Step counter and hyperparameters file inside a checkpoint.
pub const OPTIMIZER_META_NAME: &str = "optimizer.json";

/// Parameter name fragments exempt from weight decay.
const NO_DECAY: &[&str] = &[
    "bias",
    "LayerNorm.weight",
    "LayerNorm.gamma",
    "LayerNorm.beta",
    "layer_norm.weight",
];

/// Optimizer configuration.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Learning rate
    pub learning_rate: f64,
    /// Beta1 for Adam
    pub beta1: f64,
    /// Beta2 for Adam
    pub beta2: f64,
    /// Weight decay of the decayed group
    pub weight_decay: f64,
    /// Epsilon for numerical stability
    pub eps: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 5e-5,
            beta1: 0.9,
            beta2: 0.999,
            weight_decay: 0.0,
            eps: 1e-8,
        }
    }
}

impl From<&TrainingConfig> for OptimizerConfig {
    fn from(config: &TrainingConfig) -> Self {
        Self {
            learning_rate: config.learning_rate,
            beta1: config.adam_beta1,
            beta2: config.adam_beta2,
            weight_decay: config.weight_decay,
            eps: config.adam_epsilon,
        }
    }
}

/// Whether `name` is exempt from weight decay.
///
/// ```rust
/// use twinhead_rs::optimizer::is_no_decay;
///
/// assert!(is_no_decay("encoder.layer.0.output.LayerNorm.weight"));
/// assert!(is_no_decay("classifier_a.bias"));
/// assert!(!is_no_decay("classifier_a.weight"));
/// ```
#[must_use]
pub fn is_no_decay(name: &str) -> bool {
    NO_DECAY.iter().any(|fragment| name.contains(fragment))
}

/// Parameters sharing one weight decay.
#[derive(Debug, Clone)]
pub struct ParamGroup {
    /// Decoupled weight decay applied to every member.
    pub weight_decay: f64,
    /// Named trainable variables.
    pub params: Vec<(String, Var)>,
}

/// Split `params` into a decayed group and a no-decay group.
#[must_use]
pub fn param_groups(params: Vec<(String, Var)>, weight_decay: f64) -> Vec<ParamGroup> {
    let (no_decay, decay): (Vec<_>, Vec<_>) =
        params.into_iter().partition(|(name, _)| is_no_decay(name));
    vec![
        ParamGroup {
            weight_decay,
            params: decay,
        },
        ParamGroup {
            weight_decay: 0.0,
            params: no_decay,
        },
    ]
}

#[derive(Debug, Clone)]
struct Moments {
    exp_avg: Tensor,
    exp_avg_sq: Tensor,
}

#[derive(Debug, Serialize, Deserialize)]
struct GroupMeta {
    weight_decay: f64,
    params: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OptimizerMeta {
    step: usize,
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    groups: Vec<GroupMeta>,
}

/// AdamW with decoupled weight decay and bias correction.
#[derive(Debug)]
pub struct AdamW {
    groups: Vec<ParamGroup>,
    config: OptimizerConfig,
    state: HashMap<String, Moments>,
    step: usize,
}

impl AdamW {
    /// Create the optimizer with zeroed moments.
    pub fn new(groups: Vec<ParamGroup>, config: OptimizerConfig) -> Result<Self> {
        let mut state = HashMap::new();
        for (name, var) in groups.iter().flat_map(|g| g.params.iter()) {
            let zeros = var.as_tensor().zeros_like()?;
            state.insert(
                name.clone(),
                Moments {
                    exp_avg: zeros.clone(),
                    exp_avg_sq: zeros,
                },
            );
        }
        Ok(Self {
            groups,
            config,
            state,
            step: 0,
        })
    }

    /// Apply one update from `grads`, keyed by parameter name. Parameters
    /// without a gradient are left untouched.
    pub fn step(&mut self, grads: &HashMap<String, Tensor>) -> Result<()> {
        self.step += 1;
        let OptimizerConfig {
            learning_rate: lr,
            beta1,
            beta2,
            eps,
            ..
        } = self.config;
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        let t = self.step as i32;
        let bias1 = 1.0 - beta1.powi(t);
        let bias2 = 1.0 - beta2.powi(t);

        for group in &self.groups {
            let decay = 1.0 - lr * group.weight_decay;
            for (name, var) in &group.params {
                let Some(grad) = grads.get(name) else {
                    continue;
                };
                let moments = self.state.get_mut(name).ok_or_else(|| {
                    TwinheadError::Training(format!("no optimizer state for {name}"))
                })?;
                let grad = grad.to_dtype(var.dtype())?;
                moments.exp_avg = (moments.exp_avg.affine(beta1, 0.0)? + grad.affine(1.0 - beta1, 0.0)?)?;
                moments.exp_avg_sq =
                    (moments.exp_avg_sq.affine(beta2, 0.0)? + grad.sqr()?.affine(1.0 - beta2, 0.0)?)?;
                let m_hat = moments.exp_avg.affine(1.0 / bias1, 0.0)?;
                let v_hat = moments.exp_avg_sq.affine(1.0 / bias2, 0.0)?;
                let update = (m_hat / v_hat.sqrt()?.affine(1.0, eps)?)?;
                let next = (var.as_tensor().affine(decay, 0.0)? - update.affine(lr, 0.0)?)?;
                var.set(&next)?;
            }
        }
        Ok(())
    }

    /// Current learning rate.
    #[must_use]
    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    /// Set learning rate (used by schedulers).
    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }

    /// Number of updates applied so far.
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.step
    }

    /// Parameter groups.
    #[must_use]
    pub fn groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    /// Write moments and counters into `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let mut tensors = HashMap::new();
        for (name, moments) in &self.state {
            tensors.insert(format!("{name}.exp_avg"), moments.exp_avg.clone());
            tensors.insert(format!("{name}.exp_avg_sq"), moments.exp_avg_sq.clone());
        }
        candle_core::safetensors::save(&tensors, dir.join(OPTIMIZER_STATE_NAME))?;

        let meta = OptimizerMeta {
            step: self.step,
            learning_rate: self.config.learning_rate,
            beta1: self.config.beta1,
            beta2: self.config.beta2,
            eps: self.config.eps,
            groups: self
                .groups
                .iter()
                .map(|g| GroupMeta {
                    weight_decay: g.weight_decay,
                    params: g.params.iter().map(|(name, _)| name.clone()).collect(),
                })
                .collect(),
        };
        std::fs::write(dir.join(OPTIMIZER_META_NAME), serde_json::to_string_pretty(&meta)?)?;
        Ok(())
    }

    /// Restore moments and counters written by [`AdamW::save`].
    pub fn load(&mut self, dir: &Path, device: &Device) -> Result<()> {
        let meta: OptimizerMeta =
            serde_json::from_str(&std::fs::read_to_string(dir.join(OPTIMIZER_META_NAME))?)?;
        let mut tensors = candle_core::safetensors::load(dir.join(OPTIMIZER_STATE_NAME), device)?;

        for (name, moments) in &mut self.state {
            let mut take = |suffix: &str, like: &Tensor| -> Result<Tensor> {
                let key = format!("{name}.{suffix}");
                let tensor = tensors.remove(&key).ok_or_else(|| {
                    TwinheadError::Checkpoint(format!("optimizer state is missing {key}"))
                })?;
                if tensor.shape() != like.shape() {
                    return Err(TwinheadError::Checkpoint(format!(
                        "optimizer state {key} has shape {:?}, expected {:?}",
                        tensor.dims(),
                        like.dims()
                    )));
                }
                Ok(tensor.to_dtype(DType::F32)?.to_dtype(like.dtype())?)
            };
            let exp_avg = take("exp_avg", &moments.exp_avg)?;
            let exp_avg_sq = take("exp_avg_sq", &moments.exp_avg_sq)?;
            *moments = Moments { exp_avg, exp_avg_sq };
        }
        if !tensors.is_empty() {
            tracing::warn!("ignoring {} unknown optimizer state tensors", tensors.len());
        }

        self.step = meta.step;
        self.config.learning_rate = meta.learning_rate;
        Ok(())
    }
}

/// Sums gradients over micro-batches until the next optimizer step.
#[derive(Debug)]
pub struct GradientAccumulator {
    params: Vec<(String, Var)>,
    grads: HashMap<String, Tensor>,
}

impl GradientAccumulator {
    /// Track gradients of `params`.
    #[must_use]
    pub fn new(params: Vec<(String, Var)>) -> Self {
        Self {
            params,
            grads: HashMap::new(),
        }
    }

    /// Add the gradients of one backward pass.
    pub fn accumulate(&mut self, store: &GradStore) -> Result<()> {
        for (name, var) in &self.params {
            let Some(grad) = store.get(var.as_tensor()) else {
                continue;
            };
            let grad = grad.to_dtype(DType::F32)?;
            let summed = match self.grads.remove(name) {
                Some(prev) => (prev + grad)?,
                None => grad,
            };
            self.grads.insert(name.clone(), summed);
        }
        Ok(())
    }

    /// Accumulated gradients keyed by parameter name.
    #[must_use]
    pub fn grads(&self) -> &HashMap<String, Tensor> {
        &self.grads
    }

    /// Whether no gradient has been accumulated since the last reset.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }

    /// Multiply every accumulated gradient by `factor`.
    pub fn scale(&mut self, factor: f64) -> Result<()> {
        for grad in self.grads.values_mut() {
            *grad = grad.affine(factor, 0.0)?;
        }
        Ok(())
    }

    /// L2 norm over all accumulated gradients.
    pub fn global_norm(&self) -> Result<f64> {
        let mut total = 0f64;
        for grad in self.grads.values() {
            total += f64::from(grad.sqr()?.sum_all()?.to_scalar::<f32>()?);
        }
        Ok(total.sqrt())
    }

    /// Whether every gradient element is finite.
    pub fn all_finite(&self) -> Result<bool> {
        Ok(self.global_norm()?.is_finite())
    }

    /// Rescale gradients so their global norm is at most `max_norm`.
    /// Returns the norm before clipping.
    pub fn clip_grad_norm(&mut self, max_norm: f64) -> Result<f64> {
        let norm = self.global_norm()?;
        if max_norm > 0.0 && norm.is_finite() {
            let coef = max_norm / (norm + 1e-6);
            if coef < 1.0 {
                self.scale(coef)?;
            }
        }
        Ok(norm)
    }

    /// Drop all accumulated gradients.
    pub fn zero(&mut self) {
        self.grads.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn scalar_var(value: f32) -> Var {
        Var::new(&[value], &Device::Cpu).unwrap()
    }

    fn value(var: &Var) -> f32 {
        var.as_tensor().to_vec1::<f32>().unwrap()[0]
    }

    fn grads(entries: &[(&str, f32)]) -> HashMap<String, Tensor> {
        entries
            .iter()
            .map(|(name, g)| ((*name).to_string(), Tensor::new(&[*g], &Device::Cpu).unwrap()))
            .collect()
    }

    #[test]
    fn test_optimizer_config_from_training() {
        let training = TrainingConfig {
            learning_rate: 2e-5,
            weight_decay: 0.01,
            ..TrainingConfig::default()
        };
        let config = OptimizerConfig::from(&training);
        assert_eq!(config.learning_rate, 2e-5);
        assert_eq!(config.beta1, 0.9);
        assert_eq!(config.beta2, 0.999);
        assert_eq!(config.weight_decay, 0.01);
    }

    #[test]
    fn test_param_groups_exempt_bias_and_layer_norm() {
        let params = vec![
            ("classifier_a.weight".to_string(), scalar_var(1.0)),
            ("classifier_a.bias".to_string(), scalar_var(1.0)),
            ("embeddings.LayerNorm.weight".to_string(), scalar_var(1.0)),
        ];
        let groups = param_groups(params, 0.01);
        assert_eq!(groups[0].weight_decay, 0.01);
        assert_eq!(groups[0].params.len(), 1);
        assert_eq!(groups[0].params[0].0, "classifier_a.weight");
        assert_eq!(groups[1].weight_decay, 0.0);
        assert_eq!(groups[1].params.len(), 2);
    }

    #[test]
    fn test_first_step_moves_by_learning_rate() {
        let w = scalar_var(1.0);
        let b = scalar_var(1.0);
        let groups = param_groups(vec![("w".into(), w.clone()), ("b.bias".into(), b.clone())], 0.5);
        let mut opt = AdamW::new(
            groups,
            OptimizerConfig {
                learning_rate: 0.1,
                weight_decay: 0.5,
                ..OptimizerConfig::default()
            },
        )
        .unwrap();
        opt.step(&grads(&[("w", 0.5), ("b.bias", -2.0)])).unwrap();
        // Bias-corrected Adam moves each scalar by lr * sign(grad).
        assert!((value(&w) - (0.95 - 0.1)).abs() < 1e-5);
        assert!((value(&b) - 1.1).abs() < 1e-5);
        assert_eq!(opt.step_count(), 1);
    }

    #[test]
    fn test_missing_gradient_leaves_param() {
        let w = scalar_var(3.0);
        let groups = param_groups(vec![("w".into(), w.clone())], 0.1);
        let mut opt = AdamW::new(groups, OptimizerConfig::default()).unwrap();
        opt.step(&HashMap::new()).unwrap();
        assert_eq!(value(&w), 3.0);
    }

    #[test]
    fn test_save_and_load_resume_identically() {
        let config = OptimizerConfig {
            learning_rate: 0.01,
            ..OptimizerConfig::default()
        };
        let g1 = grads(&[("w", 0.3)]);
        let g2 = grads(&[("w", -0.7)]);

        let straight = scalar_var(1.0);
        let mut opt = AdamW::new(param_groups(vec![("w".into(), straight.clone())], 0.0), config.clone()).unwrap();
        opt.step(&g1).unwrap();
        opt.step(&g2).unwrap();

        let dir = TempDir::new().unwrap();
        let resumed = scalar_var(1.0);
        let mut first = AdamW::new(param_groups(vec![("w".into(), resumed.clone())], 0.0), config.clone()).unwrap();
        first.step(&g1).unwrap();
        first.save(dir.path()).unwrap();

        let mut second = AdamW::new(param_groups(vec![("w".into(), resumed.clone())], 0.0), config).unwrap();
        second.load(dir.path(), &Device::Cpu).unwrap();
        assert_eq!(second.step_count(), 1);
        second.step(&g2).unwrap();

        assert!((value(&straight) - value(&resumed)).abs() < 1e-7);
    }

    #[test]
    fn test_load_rejects_missing_state() {
        let dir = TempDir::new().unwrap();
        let opt = AdamW::new(param_groups(vec![("w".into(), scalar_var(1.0))], 0.0), OptimizerConfig::default()).unwrap();
        opt.save(dir.path()).unwrap();

        let mut other = AdamW::new(
            param_groups(vec![("other".into(), scalar_var(1.0))], 0.0),
            OptimizerConfig::default(),
        )
        .unwrap();
        let err = other.load(dir.path(), &Device::Cpu).unwrap_err();
        assert!(matches!(err, TwinheadError::Checkpoint(_)));
    }

    #[test]
    fn test_accumulator_sums_backward_passes() {
        let w = scalar_var(2.0);
        let mut acc = GradientAccumulator::new(vec![("w".into(), w.clone())]);
        for _ in 0..2 {
            // d(3w)/dw = 3
            let loss = w.as_tensor().affine(3.0, 0.0).unwrap().sum_all().unwrap();
            acc.accumulate(&loss.backward().unwrap()).unwrap();
        }
        let g = acc.grads()["w"].to_vec1::<f32>().unwrap()[0];
        assert_eq!(g, 6.0);
        acc.zero();
        assert!(acc.is_empty());
    }

    #[test]
    fn test_clip_grad_norm() {
        let w = scalar_var(0.0);
        let mut acc = GradientAccumulator::new(vec![("w".into(), w)]);
        acc.grads.insert("a".into(), Tensor::new(&[3f32], &Device::Cpu).unwrap());
        acc.grads.insert("b".into(), Tensor::new(&[4f32], &Device::Cpu).unwrap());

        let norm = acc.clip_grad_norm(1.0).unwrap();
        assert!((norm - 5.0).abs() < 1e-6);
        assert!((acc.global_norm().unwrap() - 1.0).abs() < 1e-4);

        // Below the threshold nothing changes.
        let norm = acc.clip_grad_norm(10.0).unwrap();
        assert!(norm < 1.0 + 1e-4);
        assert!((acc.global_norm().unwrap() - norm).abs() < 1e-9);
    }

    #[test]
    fn test_non_finite_gradients_detected() {
        let mut acc = GradientAccumulator::new(Vec::new());
        acc.grads.insert("a".into(), Tensor::new(&[f32::INFINITY], &Device::Cpu).unwrap());
        assert!(!acc.all_finite().unwrap());
    }
}
