//! The diff-and-sync engine for per-target compiled outputs: computes the
//! affected-target set, downloads and extracts per-target archives in
//! parallel, and applies them with atomic directory replacement.

use std::path::PathBuf;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};

use super::{path_size, remove_path, staging_dir_for, unpack_zip, IoPool, Loader, LoaderContext};
use crate::diff::compute_affected;
use crate::remote::DownloadedTarget;
use crate::types::{LoaderStatus, SourceStateSnapshot};

/// One extracted target waiting in staging for apply.
#[derive(Debug)]
struct StagedOutput {
    staging: PathBuf,
    live: PathBuf,
    name: String,
}

enum ExtractOutcome {
    Done(StagedOutput, u64),
    Cancelled(Option<PathBuf>),
    Failed(Option<PathBuf>, String),
}

pub struct ModuleOutputLoader {
    output_root: PathBuf,
    pool: IoPool,
    /// Stale relative paths scheduled during the diff, deleted first in apply.
    delete: Vec<String>,
    staged: Vec<StagedOutput>,
    extracted_bytes: u64,
    deleted_bytes: u64,
}

impl ModuleOutputLoader {
    pub fn new(output_root: impl Into<PathBuf>, pool: IoPool) -> Self {
        Self {
            output_root: output_root.into(),
            pool,
            delete: Vec::new(),
            staged: Vec::new(),
            extracted_bytes: 0,
            deleted_bytes: 0,
        }
    }

    pub fn extracted_bytes(&self) -> u64 {
        self.extracted_bytes
    }

    pub fn deleted_bytes(&self) -> u64 {
        self.deleted_bytes
    }

    async fn discard_staging(&mut self) {
        for staged in self.staged.drain(..) {
            if let Err(e) = remove_path(&staged.staging).await {
                tracing::warn!(
                    target_name = %staged.name,
                    "could not remove staging dir {}: {e}",
                    staged.staging.display()
                );
            }
        }
    }
}

#[async_trait]
impl Loader for ModuleOutputLoader {
    /// `None` on download failure; an empty vec is a valid nothing-to-do run
    /// (the diff may still have scheduled stale-path deletions).
    type Payload = Option<Vec<DownloadedTarget>>;

    fn name(&self) -> &'static str {
        "module-output"
    }

    /// Affected-target count with on-disk probes disabled, for speed.
    fn calculate_downloads(
        &self,
        commit: &SourceStateSnapshot,
        current: Option<&SourceStateSnapshot>,
    ) -> usize {
        compute_affected(current, commit, None).affected.len()
    }

    async fn load(&mut self, ctx: &LoaderContext) -> Option<Vec<DownloadedTarget>> {
        if ctx.cancel.is_cancelled() {
            return None;
        }
        let diff = compute_affected(
            ctx.current_snapshot.as_ref(),
            &ctx.commit_snapshot,
            Some(&self.output_root),
        );
        tracing::info!(
            affected = diff.affected.len(),
            stale = diff.delete.len(),
            expected_downloads = ctx.total_downloads,
            commit = %ctx.commit,
            "module output diff computed"
        );
        self.delete = diff.delete;

        if diff.affected.is_empty() {
            return Some(Vec::new());
        }
        match ctx.client.download_targets(&ctx.commit, &diff.affected).await {
            Ok(downloads) => Some(downloads),
            Err(e) => {
                tracing::warn!(commit = %ctx.commit, "target download failed: {e}");
                None
            }
        }
    }

    /// All-or-nothing extraction: on cancellation or any task failure every
    /// staging dir produced by this run is removed before returning `Failed`.
    async fn extract(
        &mut self,
        ctx: &LoaderContext,
        payload: Option<Vec<DownloadedTarget>>,
    ) -> LoaderStatus {
        let Some(downloads) = payload else {
            return LoaderStatus::Failed;
        };
        if downloads.is_empty() {
            return if ctx.cancel.is_cancelled() {
                LoaderStatus::Failed
            } else {
                LoaderStatus::Complete
            };
        }

        let outcomes: Vec<ExtractOutcome> = stream::iter(downloads)
            .map(|download| {
                let cancel = ctx.cancel.clone();
                let live = self.output_root.join(&download.target.output_path);
                let staging = staging_dir_for(&live);
                let name = download.target.name.clone();
                async move {
                    let archive = download.archive;
                    let task_staging = staging.clone();
                    let result = tokio::task::spawn_blocking(move || {
                        if cancel.is_cancelled() {
                            let _ = std::fs::remove_file(&archive);
                            return Err(None);
                        }
                        let _ = std::fs::remove_dir_all(&task_staging);
                        if let Some(parent) = task_staging.parent() {
                            if let Err(e) = std::fs::create_dir_all(parent) {
                                let _ = std::fs::remove_file(&archive);
                                return Err(Some(e.to_string()));
                            }
                        }
                        let unpacked = unpack_zip(&archive, &task_staging);
                        let _ = std::fs::remove_file(&archive);
                        unpacked.map_err(|e| Some(format!("{e:#}")))
                    })
                    .await;

                    match result {
                        Ok(Ok(bytes)) => {
                            ExtractOutcome::Done(StagedOutput { staging, live, name }, bytes)
                        }
                        Ok(Err(None)) => ExtractOutcome::Cancelled(Some(staging)),
                        Ok(Err(Some(error))) => ExtractOutcome::Failed(Some(staging), error),
                        Err(join_error) => {
                            ExtractOutcome::Failed(Some(staging), join_error.to_string())
                        }
                    }
                }
            })
            .buffer_unordered(self.pool.concurrency())
            .collect()
            .await;

        let mut cancelled = false;
        let mut failed = false;
        let mut leftovers: Vec<PathBuf> = Vec::new();
        for outcome in outcomes {
            match outcome {
                ExtractOutcome::Done(staged, bytes) => {
                    tracing::debug!(target_name = %staged.name, bytes, "target extracted");
                    self.extracted_bytes += bytes;
                    self.staged.push(staged);
                }
                ExtractOutcome::Cancelled(staging) => {
                    cancelled = true;
                    leftovers.extend(staging);
                }
                ExtractOutcome::Failed(staging, error) => {
                    tracing::error!("target extraction failed: {error}");
                    failed = true;
                    leftovers.extend(staging);
                }
            }
        }

        if failed || cancelled || ctx.cancel.is_cancelled() {
            if cancelled || ctx.cancel.is_cancelled() {
                tracing::info!("module output extraction cancelled");
            }
            for staging in leftovers {
                let _ = remove_path(&staging).await;
            }
            self.discard_staging().await;
            return LoaderStatus::Failed;
        }
        LoaderStatus::Complete
    }

    async fn apply(&mut self, _ctx: &LoaderContext) {
        // Stale outputs go first so a renamed target never collides with the
        // directory it is replacing.
        for relative in std::mem::take(&mut self.delete) {
            let path = self.output_root.join(&relative);
            let sized = path.clone();
            let size = tokio::task::spawn_blocking(move || path_size(&sized))
                .await
                .unwrap_or(0);
            match remove_path(&path).await {
                Ok(()) => {
                    self.deleted_bytes += size;
                    tracing::debug!("deleted stale output {relative}");
                }
                Err(e) => tracing::warn!("could not delete stale output {relative}: {e}"),
            }
        }

        let staged = std::mem::take(&mut self.staged);
        stream::iter(staged)
            .map(|output| async move {
                if let Err(e) = remove_path(&output.live).await {
                    tracing::warn!(
                        target_name = %output.name,
                        "could not delete old output {}: {e}",
                        output.live.display()
                    );
                    return;
                }
                if let Err(e) = tokio::fs::rename(&output.staging, &output.live).await {
                    tracing::warn!(
                        target_name = %output.name,
                        "could not move staged output into {}: {e}",
                        output.live.display()
                    );
                }
            })
            .buffer_unordered(self.pool.concurrency())
            .collect::<Vec<()>>()
            .await;
    }

    async fn rollback(&mut self, _ctx: &LoaderContext) {
        self.delete.clear();
        self.discard_staging().await;
    }
}
