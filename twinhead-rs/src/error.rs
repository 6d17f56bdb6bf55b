//! Error types for twinhead-rs.
//!
//! Every unit of work returns [`Result`]. Call sites decide whether a failure
//! aborts the run (`?`) or is logged and skipped ([`recover`]).
//!
//! # Example - Pattern Matching
//!
//! ```rust
//! use twinhead_rs::{RunConfig, TwinheadError};
//!
//! # fn main() {
//! match RunConfig::from_preset("invalid-preset") {
//!     Ok(_) => println!("Loaded config"),
//!     Err(TwinheadError::Config(msg)) => {
//!         eprintln!("Configuration error: {}", msg);
//!     }
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! # }
//! ```

use std::backtrace::Backtrace;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for twinhead-rs operations.
pub type Result<T> = std::result::Result<T, TwinheadError>;

/// Errors that can occur in twinhead-rs.
///
/// # Example
///
/// ```rust
/// use twinhead_rs::{Result, TwinheadError};
///
/// fn validate_path(path: &str) -> Result<()> {
///     if path.is_empty() {
///         return Err(TwinheadError::Config("Path cannot be empty".to_string()));
///     }
///     Ok(())
/// }
///
/// assert!(validate_path("").is_err());
/// assert!(validate_path("/valid/path").is_ok());
/// ```
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TwinheadError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Task name without a registered processor.
    #[error("unknown task: {0}")]
    UnknownTask(String),

    /// Encoder family that cannot be resolved.
    #[error("unknown model type: {0}")]
    UnknownModelType(String),

    /// Output directory already holds files and overwriting was not allowed.
    #[error(
        "output directory ({}) already exists and is not empty; set overwrite_output_dir to overcome",
        .0.display()
    )]
    OutputDirExists(PathBuf),

    /// Mixed precision requested on a device without half-precision support.
    #[error("mixed precision unavailable: {0}")]
    MixedPrecisionUnavailable(String),

    /// A feature cache file exists but cannot be decoded.
    #[error("feature cache at {} is corrupt: {reason}", path.display())]
    CacheCorrupt {
        /// Path of the cache blob.
        path: PathBuf,
        /// Decoder message.
        reason: String,
    },

    /// Model loading or forward error.
    #[error("model error: {0}")]
    Model(String),

    /// Dataset error.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// Training error.
    #[error("training error: {0}")]
    Training(String),

    /// Evaluation error.
    #[error("evaluation error: {0}")]
    Evaluation(String),

    /// Checkpoint error.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Cross-process synchronization failure.
    #[error("barrier error: {0}")]
    Barrier(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV error.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Tokenizer error.
    #[error("tokenizer error: {0}")]
    Tokenizer(#[from] tokenizers::Error),

    /// Progress bar template error.
    #[error("template error: {0}")]
    Template(String),
}

impl From<indicatif::style::TemplateError> for TwinheadError {
    fn from(err: indicatif::style::TemplateError) -> Self {
        TwinheadError::Template(err.to_string())
    }
}

impl TwinheadError {
    /// Whether this error must abort the run.
    ///
    /// Fatal errors come from the run setup: missing or invalid configuration,
    /// output directory collisions and unavailable mixed precision.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TwinheadError::Config(_)
                | TwinheadError::ConfigParse(_)
                | TwinheadError::UnknownTask(_)
                | TwinheadError::UnknownModelType(_)
                | TwinheadError::OutputDirExists(_)
                | TwinheadError::MixedPrecisionUnavailable(_)
        )
    }

    /// The error message followed by every source in its chain.
    #[must_use]
    pub fn chain(&self) -> String {
        let mut out = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            out.push_str(": ");
            out.push_str(&cause.to_string());
            source = cause.source();
        }
        out
    }
}

/// Log-and-continue policy for recoverable units of work.
///
/// Returns the value on success. On failure the error chain and a captured
/// backtrace are logged at `error` level and `None` is returned, so the
/// caller can proceed with partial results.
pub fn recover<T>(context: &str, result: Result<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            let backtrace = Backtrace::capture();
            tracing::error!(
                context = context,
                fatal = err.is_fatal(),
                "{}\n{backtrace}",
                err.chain()
            );
            None
        }
    }
}
