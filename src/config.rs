use std::path::PathBuf;

use crate::retry::RetryConfig;

/// Sync configuration supplied by the build driver.
///
/// Nothing here is parsed from a CLI; the surrounding build driver constructs
/// one per project and hands it to [`crate::sync::SyncOrchestrator`].
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Root under which every target's relative output path resolves.
    pub output_root: PathBuf,
    /// Global cache directory holding the `timestamps` subtree and the
    /// change-tracking marker file.
    pub cache_dir: PathBuf,
    /// Persisted "current" source-state snapshot. Must live outside
    /// `cache_dir`, which is replaced wholesale on every apply.
    pub snapshot_file: PathBuf,

    /// Bound for concurrent downloads, extractions, and apply renames.
    pub concurrency: usize,
    pub retry: RetryConfig,

    /// Average per-target archive size used by the cost gate to turn a target
    /// count into an estimated transfer volume.
    pub avg_target_archive_bytes: u64,
    /// How many commits the local build state lags behind a full build.
    pub commits_since_full_build: u32,
    /// When the local build estimate is unknowable, downloads win once
    /// `commits_since_full_build` exceeds this.
    pub stale_commit_threshold: u32,

    /// Drop the current snapshot and delete the live output root before
    /// running, forcing a cold full sync.
    pub force: bool,
}

impl SyncConfig {
    /// Conventional layout under a project root: `out/` for module outputs,
    /// `cache/` for the global cache, snapshot beside them.
    pub fn for_project(project_root: impl Into<PathBuf>) -> Self {
        let root = project_root.into();
        Self {
            output_root: root.join("out"),
            cache_dir: root.join("cache"),
            snapshot_file: root.join("source-state.json"),
            concurrency: 4,
            retry: RetryConfig::default(),
            avg_target_archive_bytes: 512 * 1024,
            commits_since_full_build: 0,
            stale_commit_threshold: 20,
            force: false,
        }
    }
}
