//! Mixed precision: compute dtype selection and dynamic loss scaling.
//!
//! Master weights and optimizer moments always stay f32. With `fp16` on, the
//! encoder runs its matmuls in f16 and the loss is multiplied by a dynamic
//! scale before backward so small gradients survive the half-precision pass.

use candle_core::{DType, Device, Tensor};

use crate::config::{OptLevel, TrainingConfig};
use crate::error::{Result, TwinheadError};

/// How a run uses reduced precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionPlan {
    /// Activation dtype inside the encoder.
    pub compute_dtype: DType,
    /// Whether the loss is dynamically scaled.
    pub loss_scaling: bool,
}

impl PrecisionPlan {
    /// Plain f32 training.
    pub const FULL: Self = Self {
        compute_dtype: DType::F32,
        loss_scaling: false,
    };

    /// Resolve the plan for `training` on `device`.
    ///
    /// Half precision needs an accelerator; asking for it on the CPU fails
    /// with [`TwinheadError::MixedPrecisionUnavailable`].
    pub fn resolve(training: &TrainingConfig, device: &Device) -> Result<Self> {
        if !training.fp16 {
            return Ok(Self::FULL);
        }
        if device.is_cpu() {
            return Err(TwinheadError::MixedPrecisionUnavailable(
                "fp16 needs a CUDA or Metal device (build with --features cuda or metal)".into(),
            ));
        }
        let plan = match training.fp16_opt_level {
            OptLevel::O0 => Self::FULL,
            OptLevel::O1 | OptLevel::O2 => Self {
                compute_dtype: DType::F16,
                loss_scaling: true,
            },
            OptLevel::O3 => Self {
                compute_dtype: DType::F16,
                loss_scaling: false,
            },
        };
        tracing::info!(
            "mixed precision {:?}: compute {:?}, loss scaling {}",
            training.fp16_opt_level,
            plan.compute_dtype,
            plan.loss_scaling
        );
        Ok(plan)
    }
}

/// Dynamic loss scale: halves on overflow, doubles after a run of clean steps.
#[derive(Debug, Clone)]
pub struct LossScaler {
    scale: f64,
    growth_interval: usize,
    clean_steps: usize,
    enabled: bool,
}

impl LossScaler {
    /// Scaler starting at `initial` that grows every `growth_interval` clean steps.
    #[must_use]
    pub fn new(initial: f64, growth_interval: usize) -> Self {
        Self {
            scale: initial,
            growth_interval: growth_interval.max(1),
            clean_steps: 0,
            enabled: true,
        }
    }

    /// Scaler that never scales and never skips.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            scale: 1.0,
            growth_interval: 1,
            clean_steps: 0,
            enabled: false,
        }
    }

    /// Scaler for `plan`.
    #[must_use]
    pub fn for_plan(plan: PrecisionPlan, training: &TrainingConfig) -> Self {
        if plan.loss_scaling {
            Self::new(training.initial_loss_scale, training.loss_scale_growth_interval)
        } else {
            Self::disabled()
        }
    }

    /// Current scale.
    #[must_use]
    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Whether scaling is active.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Multiply `loss` by the current scale.
    pub fn scale_loss(&self, loss: &Tensor) -> Result<Tensor> {
        if !self.enabled {
            return Ok(loss.clone());
        }
        Ok(loss.affine(self.scale, 0.0)?)
    }

    /// Record the outcome of a step. Returns `false` when the step overflowed
    /// and the optimizer update must be skipped.
    pub fn update(&mut self, overflow: bool) -> bool {
        if !self.enabled {
            return true;
        }
        if overflow {
            self.scale = (self.scale / 2.0).max(1.0);
            self.clean_steps = 0;
            tracing::warn!("gradient overflow, skipping step; loss scale reduced to {}", self.scale);
            return false;
        }
        self.clean_steps += 1;
        if self.clean_steps >= self.growth_interval {
            self.scale *= 2.0;
            self.clean_steps = 0;
            tracing::debug!("loss scale increased to {}", self.scale);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fp32_plan_without_fp16() {
        let plan = PrecisionPlan::resolve(&TrainingConfig::default(), &Device::Cpu).unwrap();
        assert_eq!(plan, PrecisionPlan::FULL);
    }

    #[test]
    fn test_fp16_on_cpu_is_rejected() {
        let training = TrainingConfig {
            fp16: true,
            ..TrainingConfig::default()
        };
        let err = PrecisionPlan::resolve(&training, &Device::Cpu).unwrap_err();
        assert!(matches!(err, TwinheadError::MixedPrecisionUnavailable(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_scaler_halves_on_overflow_and_grows() {
        let mut scaler = LossScaler::new(8.0, 2);
        assert!(!scaler.update(true));
        assert_eq!(scaler.scale(), 4.0);
        assert!(scaler.update(false));
        assert_eq!(scaler.scale(), 4.0);
        assert!(scaler.update(false));
        assert_eq!(scaler.scale(), 8.0);
    }

    #[test]
    fn test_scaler_floor() {
        let mut scaler = LossScaler::new(1.0, 10);
        scaler.update(true);
        assert_eq!(scaler.scale(), 1.0);
    }

    #[test]
    fn test_disabled_scaler_is_identity() {
        let mut scaler = LossScaler::disabled();
        let loss = Tensor::new(3f32, &Device::Cpu).unwrap();
        let scaled = scaler.scale_loss(&loss).unwrap();
        assert_eq!(scaled.to_scalar::<f32>().unwrap(), 3.0);
        assert!(scaler.update(true));
    }

    #[test]
    fn test_scale_loss() {
        let scaler = LossScaler::new(4.0, 10);
        let loss = Tensor::new(0.5f32, &Device::Cpu).unwrap();
        assert_eq!(scaler.scale_loss(&loss).unwrap().to_scalar::<f32>().unwrap(), 2.0);
    }
}
