//! Remote cache service boundary: the [`CacheClient`] trait the orchestrator
//! and loaders talk to, and the production HTTP implementation.
//!
//! The wire protocol is deliberately not a contract of this crate; only the
//! trait is. [`HttpCacheClient`] downloads archives to `.part` temp files and
//! renames on completion so a killed process never leaves a truncated archive
//! under the final name.

use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::retry::{self, RetryAction, RetryConfig};
use crate::types::AffectedTarget;

/// Observed service-side throughput figures, bytes per second.
///
/// `connection_bps` is measured fresh per sync attempt; the decompression and
/// deletion figures come from previously recorded sync statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Throughput {
    pub connection_bps: u64,
    pub decompression_bps: u64,
    pub deletion_bps: u64,
}

/// One fetched per-target archive, ready for extraction.
#[derive(Debug)]
pub struct DownloadedTarget {
    pub target: AffectedTarget,
    pub archive: PathBuf,
}

/// Typed transport errors enabling retry classification.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("HTTP status {status} fetching {url}")]
    HttpStatus { status: u16, url: String },

    #[error("request failed for {url}: {source}")]
    Http { url: String, source: reqwest::Error },

    #[error("disk error: {0}")]
    Disk(#[from] std::io::Error),

    #[error("gave up on {url} after {retries} retries: {last_error}")]
    RetriesExhausted {
        url: String,
        retries: u32,
        last_error: String,
    },
}

impl RemoteError {
    /// Whether this error is transient and worth retrying. Rate limits and
    /// server errors are; 4xx responses and local disk failures are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            RemoteError::Http { .. } => true,
            RemoteError::Disk(_) => false,
            RemoteError::RetriesExhausted { .. } => false,
        }
    }

    fn status(&self) -> Option<u16> {
        match self {
            RemoteError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Client for the remote build-cache service.
///
/// Object-safe so it can be shared as `Arc<dyn CacheClient>` between the
/// orchestrator and both loaders.
#[async_trait]
pub trait CacheClient: Send + Sync {
    /// Measure current throughput; `None` when the service is unreachable,
    /// which aborts the sync attempt before any state change.
    async fn measure_throughput(&self) -> Option<Throughput>;

    /// Fetch the commit's source-state metadata document into a local temp
    /// file. `Ok(None)` when the commit is unknown to the service.
    async fn fetch_commit_metadata(&self, commit: &str) -> Result<Option<PathBuf>, RemoteError>;

    /// Download the whole-project cache archive published for the commit.
    async fn download_cache_archive(&self, commit: &str) -> Result<PathBuf, RemoteError>;

    /// Download one archive per affected target, as a single batched request
    /// from the caller's point of view. Any individual failure fails the batch.
    async fn download_targets(
        &self,
        commit: &str,
        targets: &[AffectedTarget],
    ) -> Result<Vec<DownloadedTarget>, RemoteError>;
}

/// Decompression/deletion figures carried over from earlier sync runs, used
/// to seed [`Throughput`] until this run records its own.
#[derive(Debug, Clone, Copy)]
pub struct ObservedRates {
    pub decompression_bps: u64,
    pub deletion_bps: u64,
}

impl Default for ObservedRates {
    fn default() -> Self {
        // Conservative figures for a cold start; real ones arrive via the
        // statistics sink after the first committed sync.
        Self {
            decompression_bps: 64 * 1024 * 1024,
            deletion_bps: 128 * 1024 * 1024,
        }
    }
}

/// HTTP implementation of [`CacheClient`].
pub struct HttpCacheClient {
    client: reqwest::Client,
    base_url: String,
    /// Where downloaded metadata and archives land before extraction.
    work_dir: PathBuf,
    retry: RetryConfig,
    concurrency: usize,
    observed: ObservedRates,
}

impl HttpCacheClient {
    pub fn new(
        base_url: impl Into<String>,
        work_dir: impl Into<PathBuf>,
        retry: RetryConfig,
        concurrency: usize,
        observed: ObservedRates,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            work_dir: work_dir.into(),
            retry,
            concurrency: concurrency.max(1),
            observed,
        }
    }

    fn metadata_url(&self, commit: &str) -> String {
        format!("{}/metadata/{commit}.json", self.base_url)
    }

    fn cache_archive_url(&self, commit: &str) -> String {
        format!("{}/caches/{commit}.zip", self.base_url)
    }

    fn target_url(&self, target: &AffectedTarget) -> String {
        // Archives are content-addressed; the hash alone identifies the blob.
        format!("{}/targets/{}/{}.zip", self.base_url, target.type_id, target.hash)
    }

    fn target_dest(&self, target: &AffectedTarget) -> PathBuf {
        self.work_dir
            .join(format!("target-{}-{}.zip", target.type_id, target.hash))
    }

    /// Download `url` to `dest` through a `.part` temp file, retrying
    /// transient failures with backoff.
    async fn download_to(&self, url: &str, dest: &Path) -> Result<(), RemoteError> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let part = part_path(dest);
        let part_ref = &part;

        let result = retry::retry_with_backoff(
            &self.retry,
            |e: &RemoteError| {
                if e.is_retryable() {
                    RetryAction::Retry
                } else {
                    RetryAction::Abort
                }
            },
            move || async move {
                // Always start from scratch so a truncated previous attempt
                // can't survive into the final file.
                let _ = tokio::fs::remove_file(part_ref).await;
                self.attempt_download(url, part_ref).await
            },
        )
        .await;

        match result {
            Ok(()) => {
                tokio::fs::rename(&part, dest).await?;
                Ok(())
            }
            Err(e) if e.is_retryable() => Err(RemoteError::RetriesExhausted {
                url: url.to_string(),
                retries: self.retry.max_retries,
                last_error: e.to_string(),
            }),
            Err(e) => Err(e),
        }
    }

    async fn attempt_download(&self, url: &str, part: &Path) -> Result<(), RemoteError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| RemoteError::Http {
                url: url.to_string(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(RemoteError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let mut file = tokio::fs::File::create(part).await?;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|source| RemoteError::Http {
                url: url.to_string(),
                source,
            })?;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl CacheClient for HttpCacheClient {
    async fn measure_throughput(&self) -> Option<Throughput> {
        let url = format!("{}/probe", self.base_url);
        let started = Instant::now();
        let response = match self.client.get(&url).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                tracing::debug!(status = r.status().as_u16(), "throughput probe rejected");
                return None;
            }
            Err(e) => {
                tracing::debug!("throughput probe failed: {e}");
                return None;
            }
        };
        let body = response.bytes().await.ok()?;
        let elapsed = started.elapsed().as_secs_f64().max(1e-3);
        let connection_bps = ((body.len() as f64 / elapsed) as u64).max(1);
        Some(Throughput {
            connection_bps,
            decompression_bps: self.observed.decompression_bps,
            deletion_bps: self.observed.deletion_bps,
        })
    }

    async fn fetch_commit_metadata(&self, commit: &str) -> Result<Option<PathBuf>, RemoteError> {
        let url = self.metadata_url(commit);
        let dest = self.work_dir.join(format!("metadata-{commit}.json"));
        match self.download_to(&url, &dest).await {
            Ok(()) => Ok(Some(dest)),
            Err(e) if e.status() == Some(404) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn download_cache_archive(&self, commit: &str) -> Result<PathBuf, RemoteError> {
        let url = self.cache_archive_url(commit);
        let dest = self.work_dir.join(format!("cache-{commit}.zip"));
        self.download_to(&url, &dest).await?;
        Ok(dest)
    }

    async fn download_targets(
        &self,
        _commit: &str,
        targets: &[AffectedTarget],
    ) -> Result<Vec<DownloadedTarget>, RemoteError> {
        let jobs: Vec<(AffectedTarget, String, PathBuf)> = targets
            .iter()
            .map(|target| (target.clone(), self.target_url(target), self.target_dest(target)))
            .collect();
        let results: Vec<Result<DownloadedTarget, RemoteError>> = stream::iter(jobs)
            .map(|(target, url, dest)| async move {
                self.download_to(&url, &dest).await?;
                Ok(DownloadedTarget {
                    target,
                    archive: dest,
                })
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        // A failed batch must not leak the archives it already fetched; the
        // loader never sees them, so they are deleted here.
        let mut downloads = Vec::with_capacity(results.len());
        let mut batch_error = None;
        for result in results {
            match result {
                Ok(download) => downloads.push(download),
                Err(e) => batch_error = Some(batch_error.unwrap_or(e)),
            }
        }
        if let Some(e) = batch_error {
            for download in downloads {
                let _ = tokio::fs::remove_file(&download.archive).await;
            }
            return Err(e);
        }
        Ok(downloads)
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_path_appends_suffix() {
        assert_eq!(
            part_path(Path::new("/tmp/a/cache-abc.zip")),
            Path::new("/tmp/a/cache-abc.zip.part")
        );
    }

    #[test]
    fn server_errors_are_retryable() {
        let e = RemoteError::HttpStatus {
            status: 503,
            url: "u".into(),
        };
        assert!(e.is_retryable());
        let e = RemoteError::HttpStatus {
            status: 429,
            url: "u".into(),
        };
        assert!(e.is_retryable());
    }

    #[test]
    fn client_errors_and_disk_are_not_retryable() {
        let e = RemoteError::HttpStatus {
            status: 404,
            url: "u".into(),
        };
        assert!(!e.is_retryable());
        let e = RemoteError::Disk(std::io::Error::other("boom"));
        assert!(!e.is_retryable());
    }

    #[test]
    fn urls_are_content_addressed() {
        let client = HttpCacheClient::new(
            "http://cache.local/",
            "/tmp/work",
            RetryConfig::default(),
            4,
            ObservedRates::default(),
        );
        assert_eq!(
            client.metadata_url("deadbeef"),
            "http://cache.local/metadata/deadbeef.json"
        );
        let target = AffectedTarget {
            type_id: "java-production".into(),
            name: "core".into(),
            hash: "abc123".into(),
            output_path: "production/core".into(),
        };
        assert_eq!(
            client.target_url(&target),
            "http://cache.local/targets/java-production/abc123.zip"
        );
        assert_eq!(
            client.target_dest(&target),
            Path::new("/tmp/work/target-java-production-abc123.zip")
        );
    }
}
