//! Process roles and cross-process synchronization.
//!
//! Exactly one process is [`Role::Primary`]. It alone writes the feature cache,
//! checkpoints and the metric log. Workers block at two sync points until the
//! primary has materialized the shared artifact on disk.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::config::RunConfig;
use crate::error::{Result, TwinheadError};

/// Role of this process in a (possibly multi-process) run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The single process that logs, checkpoints and writes caches.
    Primary,
    /// Any other process.
    Worker,
}

impl Role {
    /// Role for a local rank. Single-process runs (no rank) are primary.
    #[must_use]
    pub fn from_rank(rank: Option<usize>) -> Self {
        match rank {
            None | Some(0) => Role::Primary,
            Some(_) => Role::Worker,
        }
    }

    /// Whether this is the primary process.
    #[must_use]
    pub fn is_primary(self) -> bool {
        self == Role::Primary
    }
}

/// Points at which workers wait for the primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPoint {
    /// Pretrained encoder and tokenizer are available locally.
    PretrainedModel,
    /// The training feature cache has been written.
    FeatureCache,
}

impl fmt::Display for SyncPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncPoint::PretrainedModel => f.write_str("pretrained-model"),
            SyncPoint::FeatureCache => f.write_str("feature-cache"),
        }
    }
}

/// One-shot release/wait barrier keyed by [`SyncPoint`].
pub trait Barrier: Send + Sync {
    /// The primary releases `point`; a worker blocks until it is released.
    fn arrive(&self, role: Role, point: SyncPoint) -> Result<()>;
}

/// Barrier for single-process runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBarrier;

impl Barrier for NoopBarrier {
    fn arrive(&self, _role: Role, _point: SyncPoint) -> Result<()> {
        Ok(())
    }
}

/// Barrier over a directory shared by all processes.
///
/// The primary writes `<dir>/<run-id>-<point>.ready`; workers poll for it.
/// The run id comes from `TWINHEAD_RUN_ID` or `TORCHELASTIC_RUN_ID` and keeps
/// markers of earlier launches from releasing a new one.
#[derive(Debug, Clone)]
pub struct FileBarrier {
    dir: PathBuf,
    run_id: String,
    poll: Duration,
    timeout: Duration,
}

impl FileBarrier {
    /// Create a barrier rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>, poll: Duration, timeout: Duration) -> Self {
        let run_id = std::env::var("TWINHEAD_RUN_ID")
            .or_else(|_| std::env::var("TORCHELASTIC_RUN_ID"))
            .unwrap_or_else(|_| "run".into());
        Self {
            dir: dir.into(),
            run_id,
            poll,
            timeout,
        }
    }

    /// Override the run id namespace.
    #[must_use]
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    fn marker(&self, point: SyncPoint) -> PathBuf {
        self.dir.join(format!("{}-{point}.ready", self.run_id))
    }

    /// Remove this run's markers. Called by the primary before any worker
    /// can reach a sync point.
    pub fn reset(&self) -> Result<()> {
        for point in [SyncPoint::PretrainedModel, SyncPoint::FeatureCache] {
            let marker = self.marker(point);
            if marker.exists() {
                std::fs::remove_file(marker)?;
            }
        }
        Ok(())
    }

    fn release(&self, point: SyncPoint) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let marker = self.marker(point);
        let tmp = marker.with_extension("tmp");
        std::fs::write(&tmp, std::process::id().to_string())?;
        std::fs::rename(&tmp, &marker)?;
        tracing::debug!("released barrier {}", marker.display());
        Ok(())
    }

    fn wait(&self, point: SyncPoint) -> Result<()> {
        let marker = self.marker(point);
        let start = Instant::now();
        while !marker.exists() {
            if start.elapsed() >= self.timeout {
                return Err(TwinheadError::Barrier(format!(
                    "timed out after {:?} waiting for {}",
                    self.timeout,
                    marker.display()
                )));
            }
            std::thread::sleep(self.poll);
        }
        tracing::debug!("passed barrier {point}");
        Ok(())
    }

    /// Directory the markers live in.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Barrier for FileBarrier {
    fn arrive(&self, role: Role, point: SyncPoint) -> Result<()> {
        if role.is_primary() {
            self.release(point)
        } else {
            self.wait(point)
        }
    }
}

/// Role, rank and barrier of this process, injected into every component
/// that behaves differently on the primary.
pub struct DistributedContext {
    role: Role,
    local_rank: Option<usize>,
    world_size: usize,
    barrier: Box<dyn Barrier>,
}

impl fmt::Debug for DistributedContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedContext")
            .field("role", &self.role)
            .field("local_rank", &self.local_rank)
            .field("world_size", &self.world_size)
            .finish_non_exhaustive()
    }
}

impl DistributedContext {
    /// Context for a plain single-process run.
    #[must_use]
    pub fn single_process() -> Self {
        Self {
            role: Role::Primary,
            local_rank: None,
            world_size: 1,
            barrier: Box::new(NoopBarrier),
        }
    }

    /// Context with an explicit rank and barrier.
    #[must_use]
    pub fn new(local_rank: Option<usize>, world_size: usize, barrier: Box<dyn Barrier>) -> Self {
        Self {
            role: Role::from_rank(local_rank),
            local_rank,
            world_size: world_size.max(1),
            barrier,
        }
    }

    /// Resolve the context from the run configuration, falling back to the
    /// `LOCAL_RANK` / `WORLD_SIZE` environment of a launcher.
    pub fn from_config(config: &RunConfig) -> Result<Self> {
        let local_rank = match config.distributed.local_rank {
            Some(rank) => Some(rank),
            None => env_usize("LOCAL_RANK")?,
        };
        let Some(rank) = local_rank else {
            return Ok(Self::single_process());
        };
        let world_size = match config.distributed.world_size {
            Some(size) => size,
            None => env_usize("WORLD_SIZE")?.unwrap_or(1),
        };
        if rank >= world_size {
            return Err(TwinheadError::Config(format!(
                "local_rank {rank} must be < world_size {world_size}"
            )));
        }

        let barrier = FileBarrier::new(
            config.sync_dir(),
            Duration::from_millis(config.distributed.barrier_poll_ms),
            Duration::from_secs(config.distributed.barrier_timeout_secs),
        );
        if Role::from_rank(Some(rank)).is_primary() {
            barrier.reset()?;
        }
        tracing::info!(rank, world_size, "distributed process initialized");
        Ok(Self::new(Some(rank), world_size, Box::new(barrier)))
    }

    /// Role of this process.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether this process is the primary.
    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.role.is_primary()
    }

    /// Whether this process is one of several launched processes.
    #[must_use]
    pub fn is_distributed(&self) -> bool {
        self.local_rank.is_some()
    }

    /// Local rank, if launched distributed.
    #[must_use]
    pub fn local_rank(&self) -> Option<usize> {
        self.local_rank
    }

    /// Number of cooperating processes.
    #[must_use]
    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Arrive at `point` in this process's role.
    pub fn barrier(&self, point: SyncPoint) -> Result<()> {
        self.barrier.arrive(self.role, point)
    }

    /// Run `produce` so that workers start it only after the primary
    /// finished its own call. The primary releases the point even when its
    /// call fails, so workers are not left waiting for the timeout.
    pub fn synchronized<T>(&self, point: SyncPoint, produce: impl FnOnce() -> Result<T>) -> Result<T> {
        if !self.is_primary() {
            self.barrier(point)?;
        }
        let produced = produce();
        if self.is_primary() {
            self.barrier(point)?;
        }
        produced
    }
}

fn env_usize(name: &str) -> Result<Option<usize>> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<i64>()
            .map(|parsed| usize::try_from(parsed).ok())
            .map_err(|e| TwinheadError::Config(format!("{name}={value}: {e}"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    #[test]
    fn test_role_from_rank() {
        assert_eq!(Role::from_rank(None), Role::Primary);
        assert_eq!(Role::from_rank(Some(0)), Role::Primary);
        assert_eq!(Role::from_rank(Some(3)), Role::Worker);
        assert!(!Role::Worker.is_primary());
    }

    #[test]
    fn test_file_barrier_release_then_wait() {
        let dir = TempDir::new().unwrap();
        let barrier = FileBarrier::new(dir.path(), Duration::from_millis(5), Duration::from_secs(1))
            .with_run_id("t1");
        barrier.arrive(Role::Primary, SyncPoint::FeatureCache).unwrap();
        assert!(dir.path().join("t1-feature-cache.ready").exists());
        barrier.arrive(Role::Worker, SyncPoint::FeatureCache).unwrap();
    }

    #[test]
    fn test_file_barrier_worker_times_out() {
        let dir = TempDir::new().unwrap();
        let barrier = FileBarrier::new(dir.path(), Duration::from_millis(5), Duration::from_millis(30))
            .with_run_id("t2");
        let err = barrier
            .arrive(Role::Worker, SyncPoint::PretrainedModel)
            .unwrap_err();
        assert!(matches!(err, TwinheadError::Barrier(_)));
    }

    #[test]
    fn test_file_barrier_worker_released_by_other_thread() {
        let dir = TempDir::new().unwrap();
        let barrier = FileBarrier::new(dir.path(), Duration::from_millis(5), Duration::from_secs(5))
            .with_run_id("t3");
        let primary = barrier.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            primary.arrive(Role::Primary, SyncPoint::PretrainedModel)
        });
        barrier.arrive(Role::Worker, SyncPoint::PretrainedModel).unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_reset_removes_markers() {
        let dir = TempDir::new().unwrap();
        let barrier = FileBarrier::new(dir.path(), Duration::from_millis(5), Duration::from_millis(20))
            .with_run_id("t4");
        barrier.arrive(Role::Primary, SyncPoint::FeatureCache).unwrap();
        barrier.reset().unwrap();
        assert!(barrier.arrive(Role::Worker, SyncPoint::FeatureCache).is_err());
    }

    struct RecordingBarrier(Arc<Mutex<Vec<(Role, SyncPoint)>>>);

    impl Barrier for RecordingBarrier {
        fn arrive(&self, role: Role, point: SyncPoint) -> Result<()> {
            self.0.lock().unwrap().push((role, point));
            Ok(())
        }
    }

    #[test]
    fn test_synchronized_orders_barrier_around_work() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let worker = DistributedContext::new(Some(1), 2, Box::new(RecordingBarrier(log.clone())));
        let value = worker
            .synchronized(SyncPoint::FeatureCache, || {
                assert_eq!(log.lock().unwrap().len(), 1);
                Ok(5)
            })
            .unwrap();
        assert_eq!(value, 5);
        assert_eq!(log.lock().unwrap().len(), 1);

        let log = Arc::new(Mutex::new(Vec::new()));
        let primary = DistributedContext::new(Some(0), 2, Box::new(RecordingBarrier(log.clone())));
        let result: Result<()> = primary.synchronized(SyncPoint::PretrainedModel, || {
            assert!(log.lock().unwrap().is_empty());
            Err(TwinheadError::Model("missing weights".into()))
        });
        assert!(result.is_err());
        assert_eq!(
            log.lock().unwrap().as_slice(),
            &[(Role::Primary, SyncPoint::PretrainedModel)]
        );
    }

    #[test]
    fn test_single_process_context() {
        let ctx = DistributedContext::single_process();
        assert!(ctx.is_primary());
        assert!(!ctx.is_distributed());
        assert_eq!(ctx.world_size(), 1);
        ctx.barrier(SyncPoint::FeatureCache).unwrap();
    }
}
