//! The four-phase loader contract shared by the two cache loaders, plus the
//! filesystem plumbing both of them use.
//!
//! Each loader walks `Idle → Loaded → Extracted → (Applied | RolledBack)`.
//! `load` and `extract` never touch live state; only `apply` does, and the
//! orchestrator calls it only when every loader extracted successfully.

pub mod cache_archive;
pub mod module_output;

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::remote::CacheClient;
use crate::types::{LoaderStatus, SourceStateSnapshot};

/// Injectable bound for the I/O fan-outs (downloads, per-target extraction,
/// per-target apply). Passed in by the build driver instead of living in a
/// process-wide static.
#[derive(Debug, Clone)]
pub struct IoPool {
    concurrency: usize,
}

impl IoPool {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }
}

/// Read-only per-run state injected into every loader before `load`.
pub struct LoaderContext {
    pub commit: String,
    pub cancel: CancellationToken,
    pub commit_snapshot: SourceStateSnapshot,
    pub current_snapshot: Option<SourceStateSnapshot>,
    /// Pre-flight download count across all loaders, for progress sizing.
    pub total_downloads: usize,
    pub client: Arc<dyn CacheClient>,
}

/// One category of synchronized state (the global cache archive, or the
/// per-target module outputs).
///
/// `extract` must clean up its own partial staging artifacts on any failure
/// or cancellation and report it as `Failed`; it never mutates live state.
#[async_trait]
pub trait Loader {
    /// Opaque result carried from `load` into `extract`. Emptiness and
    /// network failure are encoded by the concrete type.
    type Payload: Send;

    fn name(&self) -> &'static str;

    /// Cheap pre-flight download count used purely for progress sizing.
    fn calculate_downloads(
        &self,
        commit: &SourceStateSnapshot,
        current: Option<&SourceStateSnapshot>,
    ) -> usize {
        let _ = (commit, current);
        1
    }

    /// Network I/O only; no filesystem mutation outside the download area.
    async fn load(&mut self, ctx: &LoaderContext) -> Self::Payload;

    /// Unpack and validate the payload into staging.
    async fn extract(&mut self, ctx: &LoaderContext, payload: Self::Payload) -> LoaderStatus;

    /// Move staged artifacts into their live locations, deleting superseded
    /// live artifacts first. Individual failures are logged, not raised: the
    /// transactional gate has already passed.
    async fn apply(&mut self, ctx: &LoaderContext);

    /// Delete staged artifacts, leaving live state untouched.
    async fn rollback(&mut self, ctx: &LoaderContext);
}

/// Drive one loader through its transfer phases, reporting how long the
/// extraction alone took so decompression throughput is not diluted by
/// download time. Cancellation observed before `load` still runs `extract`,
/// which is where payload cleanup lives.
pub(crate) async fn load_and_extract<L: Loader>(
    loader: &mut L,
    ctx: &LoaderContext,
) -> (LoaderStatus, Duration) {
    let payload = loader.load(ctx).await;
    let started = Instant::now();
    let status = loader.extract(ctx, payload).await;
    tracing::debug!(loader = loader.name(), ?status, "extract finished");
    (status, started.elapsed())
}

/// Staging directory for a live path: same parent, `.cache-tmp` suffix.
pub(crate) fn staging_dir_for(live: &Path) -> PathBuf {
    let mut name = live
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".cache-tmp");
    live.with_file_name(name)
}

/// Remove a file or directory tree; a missing path is fine.
pub(crate) async fn remove_path(path: &Path) -> std::io::Result<()> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Unpack a zip archive into `dest`, returning the bytes written. Blocking;
/// call under `spawn_blocking`.
pub(crate) fn unpack_zip(archive: &Path, dest: &Path) -> anyhow::Result<u64> {
    let file = std::fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)?;
    // An empty archive must still yield a dest dir, or the apply-time
    // rename of staging into the live location has nothing to move.
    std::fs::create_dir_all(dest)?;
    let mut bytes = 0u64;
    for index in 0..zip.len() {
        let mut entry = zip.by_index(index)?;
        let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
            // entries escaping the destination are silently dropped
            continue;
        };
        let out = dest.join(relative);
        if entry.is_dir() {
            std::fs::create_dir_all(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut target = std::fs::File::create(&out)?;
        bytes += std::io::copy(&mut entry, &mut target)?;
    }
    Ok(bytes)
}

/// Recursive copy preserving the directory shape. Blocking.
pub(crate) fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Total size in bytes of a file or directory tree; missing paths count as
/// zero. Blocking.
pub(crate) fn path_size(path: &Path) -> u64 {
    let Ok(meta) = std::fs::metadata(path) else {
        return 0;
    };
    if meta.is_file() {
        return meta.len();
    }
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| path_size(&entry.path()))
        .sum()
}
