//! On-disk memoization of converted features.
//!
//! Features are cached per `(split, encoder, max length, task)` in
//! `<data_dir>/cached_<split>_<encoder-id>_<max_len>_<task>`. A cache is
//! reused only when the file for the exact key exists, its embedded key
//! matches and `overwrite_cache` is off. Only the primary process writes.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;

use crate::config::RunConfig;
use crate::distributed::{DistributedContext, SyncPoint};
use crate::error::{Result, TwinheadError};
use crate::features::{Feature, FeatureConverter};
use crate::model::EncoderFamily;
use crate::task::{LabelOrderWorkaround, OutputMode, Split, TaskSpec};

/// Identity of a cached feature set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheKey {
    /// Dataset split.
    pub split: Split,
    /// Last path component of the encoder location.
    pub encoder_id: String,
    /// Padded sequence length.
    pub max_seq_length: usize,
    /// Task (or evaluation slice) name.
    pub task: String,
}

impl CacheKey {
    /// File name of the cache blob.
    ///
    /// ```rust
    /// use twinhead_rs::cache::CacheKey;
    /// use twinhead_rs::task::Split;
    ///
    /// let key = CacheKey {
    ///     split: Split::Train,
    ///     encoder_id: "bert-base-uncased".into(),
    ///     max_seq_length: 128,
    ///     task: "trac".into(),
    /// };
    /// assert_eq!(key.file_name(), "cached_train_bert-base-uncased_128_trac");
    /// ```
    #[must_use]
    pub fn file_name(&self) -> String {
        format!(
            "cached_{}_{}_{}_{}",
            self.split, self.encoder_id, self.max_seq_length, self.task
        )
    }

    /// Path of the cache blob under `data_dir`.
    #[must_use]
    pub fn path(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(self.file_name())
    }
}

/// Serialized form of a cache file.
#[derive(Debug, Serialize, Deserialize)]
struct CachedFeatureSet {
    key: CacheKey,
    output_mode: OutputMode,
    features: Vec<Feature>,
}

/// Loads features through the on-disk cache, converting on a miss.
pub struct FeatureCache<'a> {
    config: &'a RunConfig,
    tokenizer: &'a Tokenizer,
    family: EncoderFamily,
    ctx: &'a DistributedContext,
}

impl<'a> FeatureCache<'a> {
    /// Create a loader for one run.
    #[must_use]
    pub fn new(
        config: &'a RunConfig,
        tokenizer: &'a Tokenizer,
        family: EncoderFamily,
        ctx: &'a DistributedContext,
    ) -> Self {
        Self {
            config,
            tokenizer,
            family,
            ctx,
        }
    }

    /// Key for `slice_task` and `split` under this run's settings.
    #[must_use]
    pub fn key(&self, slice_task: &str, split: Split) -> CacheKey {
        CacheKey {
            split,
            encoder_id: self.config.encoder_id(),
            max_seq_length: self.config.data.max_seq_length,
            task: slice_task.to_string(),
        }
    }

    /// Features of `split` for the evaluation slice (or task) `slice_task`.
    ///
    /// For the training split, workers wait until the primary has written the
    /// cache and then read it.
    pub fn load(&self, task: &TaskSpec, slice_task: &str, split: Split) -> Result<Vec<Feature>> {
        if split == Split::Train {
            self.ctx
                .synchronized(SyncPoint::FeatureCache, || self.load_or_build(task, slice_task, split))
        } else {
            self.load_or_build(task, slice_task, split)
        }
    }

    fn load_or_build(&self, task: &TaskSpec, slice_task: &str, split: Split) -> Result<Vec<Feature>> {
        let key = self.key(slice_task, split);
        let path = key.path(Path::new(&self.config.data_dir));

        if path.exists() && !self.config.data.overwrite_cache {
            if let Some(features) = Self::read(&path, &key, task.output_mode())? {
                tracing::info!("Loading features from cached file {}", path.display());
                return Ok(features);
            }
        }

        tracing::info!("Creating features from dataset file at {}", self.config.data_dir);
        let mut labels = task.labels();
        if let Some(workaround) = LabelOrderWorkaround::for_task(slice_task, self.family) {
            tracing::info!("applying label order workaround {workaround:?}");
            workaround.apply(&mut labels);
        }
        let examples = task.processor().get_examples(
            Path::new(&self.config.data_dir),
            split,
            &self.config.folders,
        )?;
        let converter = FeatureConverter::new(
            self.tokenizer,
            self.config.data.max_seq_length,
            self.family.input_policy(),
            task.output_mode(),
        )?;
        let features = converter.convert(&examples, &labels)?;

        if self.ctx.is_primary() {
            tracing::info!("Saving features into cached file {}", path.display());
            Self::write(&path, key, task.output_mode(), &features)?;
        }
        Ok(features)
    }

    /// Read a cache blob. `Ok(None)` means the blob belongs to another key or
    /// output mode and must be regenerated; an undecodable blob is an error.
    fn read(path: &Path, key: &CacheKey, mode: OutputMode) -> Result<Option<Vec<Feature>>> {
        let bytes = std::fs::read(path)?;
        let cached: CachedFeatureSet =
            serde_json::from_slice(&bytes).map_err(|e| TwinheadError::CacheCorrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        if &cached.key != key || cached.output_mode != mode {
            tracing::warn!(
                "cache {} was written for {:?} ({:?}); regenerating",
                path.display(),
                cached.key,
                cached.output_mode
            );
            return Ok(None);
        }
        Ok(Some(cached.features))
    }

    fn write(path: &Path, key: CacheKey, output_mode: OutputMode, features: &[Feature]) -> Result<()> {
        #[derive(Serialize)]
        struct Borrowed<'f> {
            key: CacheKey,
            output_mode: OutputMode,
            features: &'f [Feature],
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let blob = serde_json::to_vec(&Borrowed {
            key,
            output_mode,
            features,
        })?;
        let tmp = staging_path(path);
        std::fs::write(&tmp, blob)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// `<file name>.partial` next to `path`. The file name is never cut at a
/// dot, since encoder ids may contain one.
fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::tests::tiny_tokenizer;
    use crate::task::{lookup_task, TracProcessor};
    use tempfile::TempDir;

    fn setup() -> (TempDir, RunConfig) {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("train.csv"),
            "ID,Text,Sub-task A,Sub-task B\n1,you are great,NAG,NGEN\n2,go away now,OAG,GEN\n",
        )
        .unwrap();
        let mut config = RunConfig::trac_bert_preset();
        config.data_dir = dir.path().to_string_lossy().into_owned();
        config.folders = Vec::new();
        config.model.model_name_or_path = "models/tiny-bert".into();
        config.data.max_seq_length = 8;
        (dir, config)
    }

    #[test]
    fn test_staging_path_keeps_dotted_names() {
        let dir = Path::new("data");
        assert_eq!(
            staging_path(&dir.join("cached_train_bert-v1.5_128_trac")),
            dir.join("cached_train_bert-v1.5_128_trac.partial")
        );
        assert_ne!(
            staging_path(&dir.join("cached_train_bert-v1.5_128_trac")),
            staging_path(&dir.join("cached_train_bert-v1.7_128_trac"))
        );
    }

    #[test]
    fn test_dotted_encoder_id_writes_full_name() {
        let (dir, mut config) = setup();
        config.model.model_name_or_path = "models/bert-v1.5".into();
        let tokenizer = tiny_tokenizer();
        let ctx = DistributedContext::single_process();
        let task = lookup_task("trac").unwrap();
        FeatureCache::new(&config, &tokenizer, EncoderFamily::Bert, &ctx)
            .load(&task, "trac", Split::Train)
            .unwrap();
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with("cached_"))
            .collect();
        assert_eq!(names, vec!["cached_train_bert-v1.5_8_trac"]);
    }

    #[test]
    fn test_writes_cache_under_key() {
        let (dir, config) = setup();
        let tokenizer = tiny_tokenizer();
        let ctx = DistributedContext::single_process();
        let cache = FeatureCache::new(&config, &tokenizer, EncoderFamily::Bert, &ctx);
        let task = lookup_task("trac").unwrap();
        let features = cache.load(&task, "trac", Split::Train).unwrap();
        assert_eq!(features.len(), 2);
        assert!(dir.path().join("cached_train_tiny-bert_8_trac").exists());
    }

    #[test]
    fn test_reuses_cache_and_is_deterministic() {
        let (dir, config) = setup();
        let tokenizer = tiny_tokenizer();
        let ctx = DistributedContext::single_process();
        let cache = FeatureCache::new(&config, &tokenizer, EncoderFamily::Bert, &ctx);
        let task = lookup_task("trac").unwrap();
        let path = dir.path().join("cached_train_tiny-bert_8_trac");

        let first = cache.load(&task, "trac", Split::Train).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        // Reading must not rewrite the file, and a rebuild must be byte-identical.
        let second = cache.load(&task, "trac", Split::Train).unwrap();
        assert_eq!(first, second);
        assert_eq!(std::fs::read(&path).unwrap(), bytes);

        let mut rebuild = config.clone();
        rebuild.data.overwrite_cache = true;
        let cache = FeatureCache::new(&rebuild, &tokenizer, EncoderFamily::Bert, &ctx);
        cache.load(&task, "trac", Split::Train).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), bytes);
    }

    #[test]
    fn test_corrupt_cache_is_an_error() {
        let (dir, config) = setup();
        std::fs::write(dir.path().join("cached_train_tiny-bert_8_trac"), b"{not json").unwrap();
        let tokenizer = tiny_tokenizer();
        let ctx = DistributedContext::single_process();
        let cache = FeatureCache::new(&config, &tokenizer, EncoderFamily::Bert, &ctx);
        let task = lookup_task("trac").unwrap();
        let err = cache.load(&task, "trac", Split::Train).unwrap_err();
        assert!(matches!(err, TwinheadError::CacheCorrupt { .. }));
    }

    #[test]
    fn test_different_length_uses_different_cache() {
        let (dir, config) = setup();
        let tokenizer = tiny_tokenizer();
        let ctx = DistributedContext::single_process();
        let task = lookup_task("trac").unwrap();
        FeatureCache::new(&config, &tokenizer, EncoderFamily::Bert, &ctx)
            .load(&task, "trac", Split::Train)
            .unwrap();

        let mut longer = config.clone();
        longer.data.max_seq_length = 12;
        let features = FeatureCache::new(&longer, &tokenizer, EncoderFamily::Bert, &ctx)
            .load(&task, "trac", Split::Train)
            .unwrap();
        assert!(features.iter().all(|f| f.input_ids.len() == 12));
        assert!(dir.path().join("cached_train_tiny-bert_12_trac").exists());
    }

    #[test]
    fn test_mismatched_embedded_key_regenerates() {
        let (dir, config) = setup();
        let tokenizer = tiny_tokenizer();
        let ctx = DistributedContext::single_process();
        let task = lookup_task("trac").unwrap();
        let cache = FeatureCache::new(&config, &tokenizer, EncoderFamily::Bert, &ctx);
        cache.load(&task, "trac", Split::Train).unwrap();

        // A blob written for length 8 placed under the length-12 name.
        let mut longer = config.clone();
        longer.data.max_seq_length = 12;
        std::fs::copy(
            dir.path().join("cached_train_tiny-bert_8_trac"),
            dir.path().join("cached_train_tiny-bert_12_trac"),
        )
        .unwrap();
        let features = FeatureCache::new(&longer, &tokenizer, EncoderFamily::Bert, &ctx)
            .load(&task, "trac", Split::Train)
            .unwrap();
        assert!(features.iter().all(|f| f.input_ids.len() == 12));
    }

    #[test]
    fn test_worker_does_not_write() {
        let (dir, config) = setup();
        let tokenizer = tiny_tokenizer();
        let ctx = DistributedContext::new(Some(1), 2, Box::new(crate::distributed::NoopBarrier));
        let task = TaskSpec::new("trac", OutputMode::Classification, Box::new(TracProcessor));
        let features = FeatureCache::new(&config, &tokenizer, EncoderFamily::Bert, &ctx)
            .load(&task, "trac", Split::Dev);
        // No dev file: the error surfaces and nothing is written.
        assert!(features.is_err());
        let cached = FeatureCache::new(&config, &tokenizer, EncoderFamily::Bert, &ctx)
            .load(&task, "trac", Split::Train)
            .unwrap();
        assert_eq!(cached.len(), 2);
        assert!(!dir.path().join("cached_train_tiny-bert_8_trac").exists());
    }
}
