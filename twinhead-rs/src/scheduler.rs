//! Learning rate schedule: linear warmup then linear decay to zero.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::optimizer::AdamW;

/// Scheduler state file inside a checkpoint.
pub const SCHEDULER_NAME: &str = "scheduler.json";

/// Linear warmup from 0 to the base rate over `warmup_steps`, then linear
/// decay reaching 0 at `total_steps`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearWarmupSchedule {
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    current_step: usize,
}

impl LinearWarmupSchedule {
    /// Create a scheduler at step 0.
    #[must_use]
    pub fn new(base_lr: f64, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            base_lr,
            warmup_steps,
            total_steps,
            current_step: 0,
        }
    }

    /// Multiplier on the base rate at `step`.
    ///
    /// ```rust
    /// use twinhead_rs::scheduler::LinearWarmupSchedule;
    ///
    /// let schedule = LinearWarmupSchedule::new(1e-3, 10, 110);
    /// assert_eq!(schedule.lr_lambda(0), 0.0);
    /// assert_eq!(schedule.lr_lambda(10), 1.0);
    /// assert_eq!(schedule.lr_lambda(60), 0.5);
    /// assert_eq!(schedule.lr_lambda(500), 0.0);
    /// ```
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn lr_lambda(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return step as f64 / self.warmup_steps.max(1) as f64;
        }
        let remaining = self.total_steps.saturating_sub(step) as f64;
        let span = self.total_steps.saturating_sub(self.warmup_steps).max(1) as f64;
        (remaining / span).max(0.0)
    }

    /// Learning rate for the current step.
    #[must_use]
    pub fn get_lr(&self) -> f64 {
        self.base_lr * self.lr_lambda(self.current_step)
    }

    /// Number of steps taken.
    #[must_use]
    pub fn current_step(&self) -> usize {
        self.current_step
    }

    /// Advance one step and push the new rate into `optimizer`.
    pub fn step(&mut self, optimizer: &mut AdamW) {
        self.current_step += 1;
        optimizer.set_learning_rate(self.get_lr());
    }

    /// Write the schedule position into `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::write(dir.join(SCHEDULER_NAME), serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Read a schedule written by [`LinearWarmupSchedule::save`].
    pub fn load(dir: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(dir.join(SCHEDULER_NAME))?;
        Ok(serde_json::from_str(&content)?)
    }
}
