//! # twinhead-rs
//!
//! Fine-tuning of pretrained transformer encoders for dual-label text
//! classification: one shared encoder, two independent classification heads.
//!
//! ## Features
//!
//! - **YAML Configuration** - One file describes the whole run
//! - **Feature Cache** - Tokenized features are cached per split, encoder and length
//! - **Two Heads** - Losses of both heads are summed into one objective
//! - **Mixed Precision** - f16 compute with dynamic loss scaling on CUDA
//! - **Checkpoints** - Periodic, resumable checkpoints with optimizer state
//! - **Multi-Process** - File-barrier coordination between ranks
//!
//! ## Quick Start (CLI)
//!
//! ```bash
//! # Write a starting configuration
//! twinhead init trac.yaml --preset trac-bert
//!
//! # Validate it
//! twinhead validate trac.yaml
//!
//! # Train, then evaluate the saved model
//! twinhead run trac.yaml --do-train --do-eval
//! ```
//!
//! ## Quick Start (Library)
//!
//! ```no_run
//! use twinhead_rs::{RunConfig, Runner};
//!
//! # fn main() -> twinhead_rs::Result<()> {
//! let config = RunConfig::from_file("trac.yaml")?;
//! let outcome = Runner::new(config)?.run()?;
//! if let Some((step, loss)) = outcome.training {
//!     println!("trained {step} steps, loss {loss:.4}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Customizing a Preset
//!
//! ```rust
//! use twinhead_rs::{RunConfig, TrainingConfig};
//!
//! let mut config = RunConfig::from_preset("trac-bert").unwrap();
//! config.training = TrainingConfig {
//!     learning_rate: 3e-5,
//!     num_train_epochs: 2.0,
//!     ..Default::default()
//! };
//! config.do_predict = true;
//! assert!(config.validate().is_ok());
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod distributed;
pub mod encoder;
pub mod error;
pub mod evaluator;
pub mod features;
pub mod metrics;
pub mod model;
pub mod normalization;
pub mod optimizer;
pub mod precision;
pub mod runner;
pub mod scheduler;
pub mod task;
pub mod trainer;

pub use config::{RunConfig, TrainingConfig};
pub use distributed::DistributedContext;
pub use error::{Result, TwinheadError};
pub use model::DualHeadClassifier;
pub use runner::{RunOutcome, Runner};
pub use task::{lookup_task, TaskSpec};
pub use trainer::Trainer;
