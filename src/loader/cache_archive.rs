//! Loader for the whole-project cache archive: cross-module auxiliary build
//! state that is independent of the per-target diff.

use std::path::PathBuf;

use async_trait::async_trait;

use super::{copy_dir_recursive, remove_path, staging_dir_for, unpack_zip, Loader, LoaderContext};
use crate::types::LoaderStatus;

/// Subtree of the cache directory carried forward across syncs instead of
/// being taken from the downloaded archive.
pub const TIMESTAMPS_DIR: &str = "timestamps";
/// Change-tracking marker recreated empty on every apply so the compiler
/// rescans from a clean slate.
pub const CHANGE_MARKER: &str = "changed-files.bin";

pub struct CacheArchiveLoader {
    cache_dir: PathBuf,
    staging: Option<PathBuf>,
    extracted_bytes: u64,
}

impl CacheArchiveLoader {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            staging: None,
            extracted_bytes: 0,
        }
    }

    /// Bytes written during extraction, for throughput statistics.
    pub fn extracted_bytes(&self) -> u64 {
        self.extracted_bytes
    }

    async fn discard_staging(&mut self) {
        if let Some(staging) = self.staging.take() {
            if let Err(e) = remove_path(&staging).await {
                tracing::warn!("could not remove staging dir {}: {e}", staging.display());
            }
        }
    }
}

#[async_trait]
impl Loader for CacheArchiveLoader {
    /// `None` means the download failed; `extract` turns that into `Failed`.
    type Payload = Option<PathBuf>;

    fn name(&self) -> &'static str {
        "cache-archive"
    }

    async fn load(&mut self, ctx: &LoaderContext) -> Option<PathBuf> {
        if ctx.cancel.is_cancelled() {
            return None;
        }
        match ctx.client.download_cache_archive(&ctx.commit).await {
            Ok(archive) => Some(archive),
            Err(e) => {
                tracing::warn!(commit = %ctx.commit, "cache archive download failed: {e}");
                None
            }
        }
    }

    async fn extract(&mut self, ctx: &LoaderContext, payload: Option<PathBuf>) -> LoaderStatus {
        let Some(archive) = payload else {
            return LoaderStatus::Failed;
        };

        let staging = staging_dir_for(&self.cache_dir);
        // stale staging from an interrupted earlier run
        let _ = remove_path(&staging).await;
        self.staging = Some(staging.clone());

        if ctx.cancel.is_cancelled() {
            let _ = tokio::fs::remove_file(&archive).await;
            self.discard_staging().await;
            return LoaderStatus::Failed;
        }

        let unpack_archive = archive.clone();
        let unpack_dest = staging.clone();
        let result =
            tokio::task::spawn_blocking(move || unpack_zip(&unpack_archive, &unpack_dest)).await;

        // The archive is deleted right after unpacking, success or not, so a
        // failed run doesn't leak its download.
        if let Err(e) = tokio::fs::remove_file(&archive).await {
            tracing::debug!("could not remove archive {}: {e}", archive.display());
        }

        match result {
            Ok(Ok(bytes)) if !ctx.cancel.is_cancelled() => {
                self.extracted_bytes = bytes;
                LoaderStatus::Complete
            }
            Ok(Ok(_)) => {
                tracing::info!("cache archive extraction cancelled");
                self.discard_staging().await;
                LoaderStatus::Failed
            }
            Ok(Err(e)) => {
                tracing::error!("cache archive extraction failed: {e:#}");
                self.discard_staging().await;
                LoaderStatus::Failed
            }
            Err(e) => {
                tracing::error!("cache archive extraction task panicked: {e}");
                self.discard_staging().await;
                LoaderStatus::Failed
            }
        }
    }

    async fn apply(&mut self, _ctx: &LoaderContext) {
        let Some(staging) = self.staging.take() else {
            return;
        };

        // Timestamps from the archive are someone else's; drop them so the
        // subtree is rebuilt fresh from the live copy below.
        let staged_timestamps = staging.join(TIMESTAMPS_DIR);
        if staged_timestamps.exists() {
            let _ = remove_path(&staged_timestamps).await;
        }

        // Carry the live timestamps forward; failure here is tolerated.
        let live_timestamps = self.cache_dir.join(TIMESTAMPS_DIR);
        if live_timestamps.exists() {
            let copy_result = tokio::task::spawn_blocking(move || {
                copy_dir_recursive(&live_timestamps, &staged_timestamps)
            })
            .await;
            match copy_result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("could not carry timestamps forward: {e}"),
                Err(e) => tracing::warn!("timestamps copy task panicked: {e}"),
            }
        }

        if let Err(e) = tokio::fs::write(staging.join(CHANGE_MARKER), b"").await {
            tracing::warn!("could not recreate change marker: {e}");
        }

        // The swap itself must succeed: delete the old live cache, rename the
        // staged one into place.
        if let Err(e) = remove_path(&self.cache_dir).await {
            tracing::error!(
                "could not delete live cache dir {}: {e}",
                self.cache_dir.display()
            );
            let _ = remove_path(&staging).await;
            return;
        }
        if let Err(e) = tokio::fs::rename(&staging, &self.cache_dir).await {
            tracing::error!(
                "could not move staged cache into {}: {e}",
                self.cache_dir.display()
            );
        }
    }

    async fn rollback(&mut self, _ctx: &LoaderContext) {
        self.discard_staging().await;
    }
}
