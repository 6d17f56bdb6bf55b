//! Checkpoint directories: layout, discovery and atomic writes.
//!
//! A checkpoint is `<output_dir>/checkpoint-<global_step>/` holding the model
//! weights and config, the tokenizer, the run configuration, and the
//! optimizer and scheduler state needed to resume.

use std::path::{Path, PathBuf};

use tokenizers::Tokenizer;

use crate::config::RunConfig;
use crate::error::{Result, TwinheadError};
use crate::model::{DualHeadClassifier, TOKENIZER_NAME, WEIGHTS_NAME};
use crate::optimizer::{AdamW, OPTIMIZER_META_NAME, OPTIMIZER_STATE_NAME};
use crate::scheduler::{LinearWarmupSchedule, SCHEDULER_NAME};

/// Directory name prefix of checkpoints.
pub const CHECKPOINT_PREFIX: &str = "checkpoint";
/// Run configuration file saved next to model weights.
pub const TRAINING_ARGS_NAME: &str = "training_args.yaml";

/// Path of the checkpoint for `global_step` under `output_dir`.
#[must_use]
pub fn checkpoint_dir(output_dir: &Path, global_step: usize) -> PathBuf {
    output_dir.join(format!("{CHECKPOINT_PREFIX}-{global_step}"))
}

/// Global step encoded in a model path such as `out/checkpoint-500`.
///
/// The step is the text after the last `-` up to the next `/`. Paths that do
/// not exist or do not end in a number resume from step 0.
#[must_use]
pub fn global_step_from_path(model_name_or_path: &str) -> usize {
    if !Path::new(model_name_or_path).exists() {
        return 0;
    }
    parse_step(model_name_or_path).unwrap_or(0)
}

fn parse_step(path: &str) -> Option<usize> {
    let tail = path.rsplit('-').next()?;
    tail.split('/').next()?.parse().ok()
}

/// Every directory under `root` (including `root`) that holds model
/// weights, sorted by path. Hidden directories are not searched.
pub fn find_checkpoints(root: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    collect(root, &mut found)?;
    found.sort();
    Ok(found)
}

fn collect(dir: &Path, found: &mut Vec<PathBuf>) -> Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    if dir.join(WEIGHTS_NAME).is_file() {
        found.push(dir.to_path_buf());
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        // Hidden entries include directories still being staged by a save.
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            collect(&path, found)?;
        }
    }
    Ok(())
}

/// Whether `dir` holds optimizer and scheduler state to resume from.
#[must_use]
pub fn has_training_state(dir: &Path) -> bool {
    dir.join(OPTIMIZER_STATE_NAME).is_file()
        && dir.join(OPTIMIZER_META_NAME).is_file()
        && dir.join(SCHEDULER_NAME).is_file()
}

/// Write model weights, model config, tokenizer and run configuration into
/// `dir`.
pub fn save_model_artifacts(
    dir: &Path,
    model: &DualHeadClassifier,
    tokenizer: &Tokenizer,
    config: &RunConfig,
) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    model.save_pretrained(dir)?;
    tokenizer.save(dir.join(TOKENIZER_NAME), false)?;
    config.to_file(dir.join(TRAINING_ARGS_NAME))?;
    Ok(())
}

/// Everything a resumable checkpoint holds.
pub struct CheckpointParts<'a> {
    /// Model being trained.
    pub model: &'a DualHeadClassifier,
    /// Tokenizer used for feature conversion.
    pub tokenizer: &'a Tokenizer,
    /// Run configuration.
    pub config: &'a RunConfig,
    /// Optimizer moments and step.
    pub optimizer: &'a AdamW,
    /// Schedule position.
    pub scheduler: &'a LinearWarmupSchedule,
}

/// Write a full checkpoint to `target`.
///
/// The files are staged in a sibling directory and renamed into place, so a
/// crash never leaves a half-written `checkpoint-<step>` behind.
pub fn save_checkpoint(target: &Path, parts: &CheckpointParts<'_>) -> Result<()> {
    let name = target
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| TwinheadError::Checkpoint(format!("invalid checkpoint path {}", target.display())))?;
    let staging = target.with_file_name(format!(".{name}.tmp"));
    if staging.exists() {
        std::fs::remove_dir_all(&staging)?;
    }

    save_model_artifacts(&staging, parts.model, parts.tokenizer, parts.config)?;
    parts.optimizer.save(&staging)?;
    parts.scheduler.save(&staging)?;

    if target.exists() {
        std::fs::remove_dir_all(target)?;
    }
    std::fs::rename(&staging, target)?;
    tracing::info!("Saving model checkpoint to {}", target.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_step() {
        assert_eq!(parse_step("out/checkpoint-500"), Some(500));
        assert_eq!(parse_step("out/checkpoint-500/"), Some(500));
        assert_eq!(parse_step("out/checkpoint-12/model"), Some(12));
        assert_eq!(parse_step("bert-base-uncased"), None);
        assert_eq!(parse_step("models/bert"), None);
    }

    #[test]
    fn test_global_step_requires_existing_path() {
        assert_eq!(global_step_from_path("/nonexistent/checkpoint-40"), 0);

        let dir = TempDir::new().unwrap();
        let ckpt = checkpoint_dir(dir.path(), 40);
        std::fs::create_dir_all(&ckpt).unwrap();
        assert_eq!(global_step_from_path(ckpt.to_str().unwrap()), 40);
    }

    #[test]
    fn test_find_checkpoints_sorted_recursive() {
        let dir = TempDir::new().unwrap();
        for rel in ["checkpoint-20", "checkpoint-10", "nested/checkpoint-5", "empty"] {
            std::fs::create_dir_all(dir.path().join(rel)).unwrap();
        }
        for rel in ["checkpoint-20", "checkpoint-10", "nested/checkpoint-5", "."] {
            std::fs::write(dir.path().join(rel).join(WEIGHTS_NAME), b"").unwrap();
        }
        let found = find_checkpoints(dir.path()).unwrap();
        let rel: Vec<_> = found
            .iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(rel, vec!["", "checkpoint-10", "checkpoint-20", "nested/checkpoint-5"]);
    }

    #[test]
    fn test_find_checkpoints_skips_staging_dirs() {
        let dir = TempDir::new().unwrap();
        for rel in ["checkpoint-1", ".checkpoint-3.tmp"] {
            std::fs::create_dir_all(dir.path().join(rel)).unwrap();
            std::fs::write(dir.path().join(rel).join(WEIGHTS_NAME), b"").unwrap();
        }
        let found = find_checkpoints(dir.path()).unwrap();
        assert_eq!(found, vec![dir.path().join("checkpoint-1")]);
    }

    #[test]
    fn test_find_checkpoints_missing_root() {
        assert!(find_checkpoints(Path::new("/nonexistent/out")).unwrap().is_empty());
    }
}
