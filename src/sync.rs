//! The single entry point: gates concurrent attempts, runs the cost model,
//! drives both loaders in parallel, and commits or rolls back as one unit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::config::SyncConfig;
use crate::estimate::{download_wins, BuildEstimator, CompileScope, StatsSink, SyncRunStats};
use crate::loader::cache_archive::CacheArchiveLoader;
use crate::loader::module_output::ModuleOutputLoader;
use crate::loader::{load_and_extract, remove_path, IoPool, Loader, LoaderContext};
use crate::remote::CacheClient;
use crate::snapshot::SourceStateStore;

/// Serializes whole sync attempts. A second attempt while one is in flight is
/// rejected immediately, never queued. Injectable so embedders can scope it
/// to a project rather than the process.
#[derive(Debug, Default)]
pub struct RunGuard {
    running: AtomicBool,
}

impl RunGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_acquire(&self) -> Option<RunPermit<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunPermit { guard: self })
    }
}

struct RunPermit<'a> {
    guard: &'a RunGuard,
}

impl Drop for RunPermit<'_> {
    fn drop(&mut self) {
        self.guard.running.store(false, Ordering::Release);
    }
}

/// Terminal state of one sync attempt. Every non-`Committed` outcome leaves
/// persisted state exactly as it was before the attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Both loaders extracted and applied; the commit snapshot is now current.
    Committed,
    /// A loader failed or the run was cancelled; staging was cleaned up.
    RolledBack,
    /// Another sync attempt already holds the run guard.
    AlreadyRunning,
    /// The cost gate decided local compilation is faster, or throughput
    /// could not be measured.
    NotWorthwhile,
    /// The remote service has no snapshot published for the commit.
    NoRemoteState,
}

pub struct SyncOrchestrator {
    config: SyncConfig,
    client: Arc<dyn CacheClient>,
    estimator: Arc<dyn BuildEstimator>,
    stats: Arc<dyn StatsSink>,
    guard: Arc<RunGuard>,
    pool: IoPool,
}

impl SyncOrchestrator {
    pub fn new(
        config: SyncConfig,
        client: Arc<dyn CacheClient>,
        estimator: Arc<dyn BuildEstimator>,
        stats: Arc<dyn StatsSink>,
        guard: Arc<RunGuard>,
    ) -> Self {
        let pool = IoPool::new(config.concurrency);
        Self {
            config,
            client,
            estimator,
            stats,
            guard,
            pool,
        }
    }

    /// Attempt to bring local compiled outputs up to `commit`.
    ///
    /// Synchronization is an optimization, never a hard dependency: every
    /// early return here means the caller falls back to compiling locally.
    pub async fn sync(
        &self,
        commit: &str,
        scope: &CompileScope,
        cancel: CancellationToken,
    ) -> SyncOutcome {
        let Some(_permit) = self.guard.try_acquire() else {
            tracing::warn!(commit, "sync already in progress, rejecting attempt");
            return SyncOutcome::AlreadyRunning;
        };
        tracing::info!(commit, "sync attempt started");

        let Some(throughput) = self.client.measure_throughput().await else {
            tracing::info!("connection throughput unmeasurable, building locally");
            return SyncOutcome::NotWorthwhile;
        };
        let estimate = self.estimator.estimate_build_time(scope).await;
        if !download_wins(
            &throughput,
            estimate,
            self.config.avg_target_archive_bytes,
            self.config.commits_since_full_build,
            self.config.stale_commit_threshold,
        ) {
            tracing::info!(commit, "local build estimated faster than download");
            return SyncOutcome::NotWorthwhile;
        }

        let store = SourceStateStore::new(&self.config.snapshot_file, self.client.clone());
        let Some(commit_snapshot) = store.load_for_commit(commit).await else {
            return SyncOutcome::NoRemoteState;
        };

        if self.config.force {
            tracing::info!(commit, "forced resync, dropping local state");
            store.drop_current().await;
            if let Err(e) = remove_path(&self.config.output_root).await {
                tracing::warn!(
                    "could not clear output root {}: {e}",
                    self.config.output_root.display()
                );
            }
        }
        let current_snapshot = store.load_current().await;

        let mut archive = CacheArchiveLoader::new(&self.config.cache_dir);
        let mut modules = ModuleOutputLoader::new(&self.config.output_root, self.pool.clone());
        let total_downloads = archive
            .calculate_downloads(&commit_snapshot, current_snapshot.as_ref())
            + modules.calculate_downloads(&commit_snapshot, current_snapshot.as_ref());
        tracing::info!(commit, total_downloads, "starting transfer");

        let ctx = LoaderContext {
            commit: commit.to_string(),
            cancel,
            commit_snapshot,
            current_snapshot,
            total_downloads,
            client: self.client.clone(),
        };

        let ((archive_status, archive_extract), (module_status, module_extract)) = tokio::join!(
            load_and_extract(&mut archive, &ctx),
            load_and_extract(&mut modules, &ctx),
        );
        // The loaders extract concurrently, so the wall-clock decompression
        // window is the longer of the two.
        let extract_elapsed = archive_extract.max(module_extract);
        let combined = archive_status.and(module_status);

        if !combined.is_complete() {
            if ctx.cancel.is_cancelled() {
                tracing::info!(commit, "sync cancelled, rolling back");
            } else {
                tracing::warn!(commit, "transfer failed, rolling back");
            }
            tokio::join!(archive.rollback(&ctx), modules.rollback(&ctx));
            return SyncOutcome::RolledBack;
        }

        let apply_started = Instant::now();
        tokio::join!(archive.apply(&ctx), modules.apply(&ctx));
        let apply_elapsed = apply_started.elapsed();

        if let Err(e) = store.persist_current(&ctx.commit_snapshot).await {
            // The outputs are already live; the next run simply re-diffs
            // against the stale snapshot.
            tracing::error!(commit, "could not persist snapshot: {e:#}");
        }

        let extracted = archive.extracted_bytes() + modules.extracted_bytes();
        self.stats
            .record(&SyncRunStats {
                commit: commit.to_string(),
                decompression_bps: rate(extracted, extract_elapsed),
                deletion_bps: rate(modules.deleted_bytes(), apply_elapsed),
            })
            .await;
        tracing::info!(commit, extracted_bytes = extracted, "sync committed");
        SyncOutcome::Committed
    }
}

fn rate(bytes: u64, elapsed: Duration) -> u64 {
    if bytes == 0 {
        return 0;
    }
    (bytes as f64 / elapsed.as_secs_f64().max(0.001)) as u64
}
