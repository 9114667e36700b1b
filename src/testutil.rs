//! In-memory collaborators and fixture builders shared across the unit tests.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::estimate::{BuildEstimate, BuildEstimator, CompileScope, StatsSink, SyncRunStats};
use crate::loader::LoaderContext;
use crate::remote::{CacheClient, DownloadedTarget, RemoteError, Throughput};
use crate::types::{AffectedTarget, BuildTargetState, SourceStateSnapshot};

/// Build a snapshot from `(type_id, name, hash, output_path)` rows.
pub fn snapshot(rows: &[(&str, &str, &str, &str)]) -> SourceStateSnapshot {
    let mut out = SourceStateSnapshot::default();
    for (type_id, name, hash, path) in rows {
        out.targets
            .entry(type_id.to_string())
            .or_default()
            .insert(
                name.to_string(),
                BuildTargetState {
                    hash: hash.to_string(),
                    path: path.to_string(),
                },
            );
    }
    out
}

/// Write a zip archive with the given `(entry_name, bytes)` pairs.
pub fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
    let file = std::fs::File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::FileOptions::default()
        .compression_method(zip::CompressionMethod::Stored);
    for (name, bytes) in entries {
        zip.start_file(*name, options).unwrap();
        zip.write_all(bytes).unwrap();
    }
    zip.finish().unwrap();
}

/// In-memory remote service writing its "downloads" under a scratch root.
pub struct MockClient {
    root: PathBuf,
    snapshots: HashMap<String, Vec<u8>>,
    cache_entries: Vec<(String, Vec<u8>)>,
    cache_failed: bool,
    cache_corrupt: bool,
    target_entries: HashMap<String, Vec<(String, Vec<u8>)>>,
    failed_targets: HashSet<String>,
    corrupt_targets: HashSet<String>,
    throughput: Option<Throughput>,
    download_requests: AtomicUsize,
}

impl MockClient {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            snapshots: HashMap::new(),
            cache_entries: Vec::new(),
            cache_failed: false,
            cache_corrupt: false,
            target_entries: HashMap::new(),
            failed_targets: HashSet::new(),
            corrupt_targets: HashSet::new(),
            throughput: Some(Throughput {
                connection_bps: 1 << 30,
                decompression_bps: 1 << 30,
                deletion_bps: 1 << 30,
            }),
            download_requests: AtomicUsize::new(0),
        }
    }

    pub fn publish_snapshot(&mut self, commit: &str, snapshot: &SourceStateSnapshot) {
        self.snapshots
            .insert(commit.to_string(), serde_json::to_vec(snapshot).unwrap());
    }

    /// Publish metadata that will not parse as a snapshot.
    pub fn publish_stale(&mut self, commit: &str) {
        self.snapshots
            .insert(commit.to_string(), b"{ not json".to_vec());
    }

    pub fn set_cache_entries(&mut self, entries: &[(&str, &[u8])]) {
        self.cache_entries = entries
            .iter()
            .map(|(name, bytes)| (name.to_string(), bytes.to_vec()))
            .collect();
    }

    pub fn fail_cache_archive(&mut self) {
        self.cache_failed = true;
    }

    pub fn corrupt_cache_archive(&mut self) {
        self.cache_corrupt = true;
    }

    pub fn set_target_entries(&mut self, hash: &str, entries: &[(&str, &[u8])]) {
        self.target_entries.insert(
            hash.to_string(),
            entries
                .iter()
                .map(|(name, bytes)| (name.to_string(), bytes.to_vec()))
                .collect(),
        );
    }

    pub fn fail_target(&mut self, hash: &str) {
        self.failed_targets.insert(hash.to_string());
    }

    pub fn corrupt_target(&mut self, hash: &str) {
        self.corrupt_targets.insert(hash.to_string());
    }

    pub fn set_throughput(&mut self, connection: u64, decompression: u64, deletion: u64) {
        self.throughput = Some(Throughput {
            connection_bps: connection,
            decompression_bps: decompression,
            deletion_bps: deletion,
        });
    }

    pub fn no_throughput(&mut self) {
        self.throughput = None;
    }

    pub fn download_requests(&self) -> usize {
        self.download_requests.load(Ordering::SeqCst)
    }

    fn refused(url: &str) -> RemoteError {
        RemoteError::HttpStatus {
            status: 503,
            url: url.to_string(),
        }
    }

    fn write_archive(&self, path: &Path, entries: &[(String, Vec<u8>)], corrupt: bool) {
        if corrupt {
            std::fs::write(path, b"definitely not a zip").unwrap();
            return;
        }
        let borrowed: Vec<(&str, &[u8])> = entries
            .iter()
            .map(|(name, bytes)| (name.as_str(), bytes.as_slice()))
            .collect();
        write_zip(path, &borrowed);
    }
}

#[async_trait]
impl CacheClient for MockClient {
    async fn measure_throughput(&self) -> Option<Throughput> {
        self.throughput
    }

    async fn fetch_commit_metadata(&self, commit: &str) -> Result<Option<PathBuf>, RemoteError> {
        let Some(bytes) = self.snapshots.get(commit) else {
            return Ok(None);
        };
        let path = self.root.join(format!("metadata-{commit}.json"));
        std::fs::write(&path, bytes)?;
        Ok(Some(path))
    }

    async fn download_cache_archive(&self, commit: &str) -> Result<PathBuf, RemoteError> {
        self.download_requests.fetch_add(1, Ordering::SeqCst);
        if self.cache_failed {
            return Err(Self::refused("mock://cache"));
        }
        let path = self.root.join(format!("cache-{commit}.zip"));
        self.write_archive(&path, &self.cache_entries, self.cache_corrupt);
        Ok(path)
    }

    async fn download_targets(
        &self,
        _commit: &str,
        targets: &[AffectedTarget],
    ) -> Result<Vec<DownloadedTarget>, RemoteError> {
        self.download_requests.fetch_add(1, Ordering::SeqCst);
        let mut out: Vec<DownloadedTarget> = Vec::with_capacity(targets.len());
        for target in targets {
            if self.failed_targets.contains(&target.hash) {
                // Same contract as the real client: a failed batch deletes
                // the archives it already produced.
                for written in out {
                    let _ = std::fs::remove_file(&written.archive);
                }
                return Err(Self::refused("mock://targets"));
            }
            let path = self.root.join(format!("target-{}.zip", target.hash));
            let entries = self
                .target_entries
                .get(&target.hash)
                .cloned()
                .unwrap_or_default();
            self.write_archive(&path, &entries, self.corrupt_targets.contains(&target.hash));
            out.push(DownloadedTarget {
                target: target.clone(),
                archive: path,
            });
        }
        Ok(out)
    }
}

/// Loader context over a fresh token for driving a single loader in a test.
pub fn context_for(
    commit: &str,
    client: MockClient,
    commit_snapshot: SourceStateSnapshot,
    current_snapshot: Option<SourceStateSnapshot>,
) -> LoaderContext {
    LoaderContext {
        commit: commit.to_string(),
        cancel: CancellationToken::new(),
        commit_snapshot,
        current_snapshot,
        total_downloads: 0,
        client: Arc::new(client),
    }
}

pub struct MockEstimator {
    estimate: Option<BuildEstimate>,
}

impl MockEstimator {
    pub fn fixed(build_time: Duration, target_count: u64) -> Self {
        Self {
            estimate: Some(BuildEstimate {
                build_time,
                target_count,
            }),
        }
    }

    /// Forced-rebuild state: no incremental data to extrapolate from.
    pub fn unknown() -> Self {
        Self { estimate: None }
    }
}

#[async_trait]
impl BuildEstimator for MockEstimator {
    async fn estimate_build_time(&self, _scope: &CompileScope) -> Option<BuildEstimate> {
        self.estimate
    }
}

#[derive(Default)]
pub struct RecordingSink {
    recorded: Mutex<Vec<SyncRunStats>>,
}

impl RecordingSink {
    pub fn recorded(&self) -> Vec<SyncRunStats> {
        self.recorded.lock().unwrap().clone()
    }
}

#[async_trait]
impl StatsSink for RecordingSink {
    async fn record(&self, stats: &SyncRunStats) {
        self.recorded.lock().unwrap().push(stats.clone());
    }
}
