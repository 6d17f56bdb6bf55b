//! Tensorized features, samplers and batches.

use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::error::{Result, TwinheadError};
use crate::features::{Feature, LabelValue};
use crate::task::OutputMode;

/// Features of one split, ready to be batched.
///
/// # Example
///
/// ```rust
/// use twinhead_rs::dataset::FeatureDataset;
/// use twinhead_rs::features::{Feature, LabelValue};
/// use twinhead_rs::task::OutputMode;
///
/// let feature = Feature {
///     input_ids: vec![2, 7, 3, 0],
///     attention_mask: vec![1, 1, 1, 0],
///     token_type_ids: vec![0; 4],
///     label_a: LabelValue::Class(1),
///     label_b: LabelValue::Class(0),
/// };
/// let dataset = FeatureDataset::new(vec![feature], OutputMode::Classification).unwrap();
/// assert_eq!(dataset.len(), 1);
/// assert_eq!(dataset.seq_len(), 4);
/// ```
#[derive(Debug, Clone)]
pub struct FeatureDataset {
    features: Vec<Feature>,
    output_mode: OutputMode,
    seq_len: usize,
}

impl FeatureDataset {
    /// Wrap features; all of them must share one sequence length.
    pub fn new(features: Vec<Feature>, output_mode: OutputMode) -> Result<Self> {
        let seq_len = features.first().map_or(0, |f| f.input_ids.len());
        for (i, f) in features.iter().enumerate() {
            if f.input_ids.len() != seq_len
                || f.attention_mask.len() != seq_len
                || f.token_type_ids.len() != seq_len
            {
                return Err(TwinheadError::Dataset(format!(
                    "feature {i} does not have sequence length {seq_len}"
                )));
            }
        }
        Ok(Self {
            features,
            output_mode,
            seq_len,
        })
    }

    /// Number of features.
    #[must_use]
    pub fn len(&self) -> usize {
        self.features.len()
    }

    /// Whether the dataset is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Sequence length of every feature.
    #[must_use]
    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    /// Output mode the labels are encoded for.
    #[must_use]
    pub fn output_mode(&self) -> OutputMode {
        self.output_mode
    }

    /// Features in order.
    #[must_use]
    pub fn features(&self) -> &[Feature] {
        &self.features
    }
}

/// Collated tensors of a group of features.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Token ids `[B, L]` u32.
    pub input_ids: Tensor,
    /// Attention mask `[B, L]` u32.
    pub attention_mask: Tensor,
    /// Segment ids `[B, L]` u32.
    pub token_type_ids: Tensor,
    /// Head A labels `[B]`: u32 for classification, f32 for regression.
    pub labels_a: Tensor,
    /// Head B labels `[B]`.
    pub labels_b: Tensor,
}

impl Batch {
    /// Stack features into tensors on `device`.
    pub fn collate(features: &[&Feature], output_mode: OutputMode, device: &Device) -> Result<Self> {
        let Some(first) = features.first() else {
            return Err(TwinheadError::Dataset("cannot collate an empty batch".into()));
        };
        let rows = features.len();
        let seq = first.input_ids.len();
        let stack = |pick: fn(&Feature) -> &[u32]| -> Result<Tensor> {
            let flat: Vec<u32> = features.iter().flat_map(|f| pick(f).iter().copied()).collect();
            Ok(Tensor::from_vec(flat, (rows, seq), device)?)
        };
        let input_ids = stack(|f| f.input_ids.as_slice())?;
        let attention_mask = stack(|f| f.attention_mask.as_slice())?;
        let token_type_ids = stack(|f| f.token_type_ids.as_slice())?;

        let labels = |pick: fn(&Feature) -> LabelValue| -> Result<Tensor> {
            Ok(match output_mode {
                OutputMode::Classification => {
                    let v: Vec<u32> = features.iter().map(|f| pick(f).as_class()).collect();
                    Tensor::from_vec(v, rows, device)?
                }
                OutputMode::Regression => {
                    let v: Vec<f32> = features.iter().map(|f| pick(f).as_value()).collect();
                    Tensor::from_vec(v, rows, device)?
                }
            })
        };

        Ok(Self {
            input_ids,
            attention_mask,
            token_type_ids,
            labels_a: labels(|f| f.label_a)?,
            labels_b: labels(|f| f.label_b)?,
        })
    }

    /// Number of rows.
    pub fn len(&self) -> Result<usize> {
        Ok(self.input_ids.dim(0)?)
    }

    /// Rows `start..start + len`.
    pub fn narrow(&self, start: usize, len: usize) -> Result<Self> {
        Ok(Self {
            input_ids: self.input_ids.narrow(0, start, len)?,
            attention_mask: self.attention_mask.narrow(0, start, len)?,
            token_type_ids: self.token_type_ids.narrow(0, start, len)?,
            labels_a: self.labels_a.narrow(0, start, len)?,
            labels_b: self.labels_b.narrow(0, start, len)?,
        })
    }

    /// Split into at most `replicas` contiguous shards of `ceil(B / replicas)`
    /// rows, like a data-parallel scatter. A short batch yields fewer shards.
    pub fn shards(&self, replicas: usize) -> Result<Vec<Self>> {
        let rows = self.len()?;
        if replicas <= 1 || rows <= 1 {
            return Ok(vec![self.clone()]);
        }
        let chunk = rows.div_ceil(replicas);
        let mut shards = Vec::with_capacity(replicas);
        let mut start = 0;
        while start < rows {
            let len = chunk.min(rows - start);
            shards.push(self.narrow(start, len)?);
            start += len;
        }
        Ok(shards)
    }
}

/// Order in which a dataset is visited each epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sampler {
    /// Dataset order.
    Sequential,
    /// A permutation seeded with `seed + epoch`.
    Random {
        /// Base seed.
        seed: u64,
    },
    /// A seeded permutation, padded to a multiple of `world_size` and strided
    /// by rank so every process sees a disjoint, equally sized shard.
    Distributed {
        /// Base seed.
        seed: u64,
        /// This process's rank.
        rank: usize,
        /// Number of processes.
        world_size: usize,
    },
}

impl Sampler {
    fn permutation(len: usize, seed: u64, epoch: usize) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..len).collect();
        let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(epoch as u64));
        indices.shuffle(&mut rng);
        indices
    }

    /// Indices visited in `epoch`.
    #[must_use]
    pub fn indices(&self, len: usize, epoch: usize) -> Vec<usize> {
        match *self {
            Sampler::Sequential => (0..len).collect(),
            Sampler::Random { seed } => Self::permutation(len, seed, epoch),
            Sampler::Distributed {
                seed,
                rank,
                world_size,
            } => {
                if len == 0 {
                    return Vec::new();
                }
                let world_size = world_size.max(1);
                let mut indices = Self::permutation(len, seed, epoch);
                let total = len.div_ceil(world_size) * world_size;
                let mut i = 0;
                while indices.len() < total {
                    indices.push(indices[i]);
                    i += 1;
                }
                indices.into_iter().skip(rank).step_by(world_size).collect()
            }
        }
    }

    /// Number of indices visited per epoch.
    #[must_use]
    pub fn num_samples(&self, len: usize) -> usize {
        match *self {
            Sampler::Sequential | Sampler::Random { .. } => len,
            Sampler::Distributed { world_size, .. } => len.div_ceil(world_size.max(1)),
        }
    }
}

/// Batches a [`FeatureDataset`] in sampler order. The last batch may be short.
#[derive(Debug, Clone)]
pub struct DataLoader<'a> {
    dataset: &'a FeatureDataset,
    batch_size: usize,
    sampler: Sampler,
    device: Device,
}

impl<'a> DataLoader<'a> {
    /// Create a loader.
    pub fn new(dataset: &'a FeatureDataset, batch_size: usize, sampler: Sampler, device: &Device) -> Result<Self> {
        if batch_size == 0 {
            return Err(TwinheadError::Dataset("batch size must be > 0".into()));
        }
        Ok(Self {
            dataset,
            batch_size,
            sampler,
            device: device.clone(),
        })
    }

    /// Batches per epoch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sampler
            .num_samples(self.dataset.len())
            .div_ceil(self.batch_size)
    }

    /// Whether an epoch yields no batch.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate the batches of `epoch`.
    pub fn epoch(&self, epoch: usize) -> impl Iterator<Item = Result<Batch>> + '_ {
        let indices = self.sampler.indices(self.dataset.len(), epoch);
        let batch_size = self.batch_size;
        let n_batches = indices.len().div_ceil(batch_size);
        (0..n_batches).map(move |b| {
            let end = ((b + 1) * batch_size).min(indices.len());
            let rows: Vec<&Feature> = indices[b * batch_size..end]
                .iter()
                .map(|&i| &self.dataset.features[i])
                .collect();
            Batch::collate(&rows, self.dataset.output_mode, &self.device)
        })
    }
}
