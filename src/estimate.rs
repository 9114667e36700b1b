//! Collaborator boundaries for the cost gate: the local build-time estimator,
//! the post-sync statistics sink, and the pure download-vs-build decision.

use std::time::Duration;

use async_trait::async_trait;

use crate::remote::Throughput;

/// Compile scope the build driver is about to run; opaque here beyond the
/// module list. Empty means the whole project.
#[derive(Debug, Clone, Default)]
pub struct CompileScope {
    pub modules: Vec<String>,
}

/// Estimated cost of building the scope locally.
#[derive(Debug, Clone, Copy)]
pub struct BuildEstimate {
    pub build_time: Duration,
    pub target_count: u64,
}

/// Local incremental-compiler collaborator.
#[async_trait]
pub trait BuildEstimator: Send + Sync {
    /// `None` when the estimate is unknowable because the compiler is in a
    /// forced-rebuild state with no incremental data to extrapolate from.
    async fn estimate_build_time(&self, scope: &CompileScope) -> Option<BuildEstimate>;
}

/// Transfer statistics recorded after a committed sync, feeding the next
/// run's cost estimate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRunStats {
    pub commit: String,
    pub decompression_bps: u64,
    pub deletion_bps: u64,
}

#[async_trait]
pub trait StatsSink: Send + Sync {
    async fn record(&self, stats: &SyncRunStats);
}

/// Decide whether downloading cached outputs beats building locally.
///
/// The estimated transfer cost is download + decompression + stale-output
/// deletion time over `target_count * avg_archive_bytes`. A zero or unknown
/// build estimate means the compiler would rebuild everything anyway; then
/// downloads win once the project has drifted more than
/// `stale_commit_threshold` commits past the last full build.
pub fn download_wins(
    throughput: &Throughput,
    estimate: Option<BuildEstimate>,
    avg_archive_bytes: u64,
    commits_since_full_build: u32,
    stale_commit_threshold: u32,
) -> bool {
    let estimate = match estimate {
        Some(e) if !e.build_time.is_zero() => e,
        _ => {
            let wins = commits_since_full_build > stale_commit_threshold;
            tracing::debug!(
                commits_since_full_build,
                stale_commit_threshold,
                wins,
                "no usable local build estimate"
            );
            return wins;
        }
    };

    let bytes = estimate.target_count.saturating_mul(avg_archive_bytes) as f64;
    let secs = bytes / throughput.connection_bps.max(1) as f64
        + bytes / throughput.decompression_bps.max(1) as f64
        + bytes / throughput.deletion_bps.max(1) as f64;
    let transfer = Duration::from_secs_f64(secs);
    tracing::debug!(
        transfer_ms = transfer.as_millis() as u64,
        build_ms = estimate.build_time.as_millis() as u64,
        "cost gate"
    );
    transfer < estimate.build_time
}
