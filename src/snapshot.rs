//! Source-state snapshot store: loads per-commit snapshots from the remote
//! service and owns the locally persisted "current" snapshot file.
//!
//! Absence of either document is a normal condition, not an error: a missing
//! commit snapshot means synchronization simply does not proceed, and a
//! missing current snapshot means a first run (cold sync).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;

use crate::remote::CacheClient;
use crate::types::SourceStateSnapshot;

pub struct SourceStateStore {
    snapshot_file: PathBuf,
    client: Arc<dyn CacheClient>,
}

impl SourceStateStore {
    pub fn new(snapshot_file: impl Into<PathBuf>, client: Arc<dyn CacheClient>) -> Self {
        Self {
            snapshot_file: snapshot_file.into(),
            client,
        }
    }

    /// Fetch and parse the snapshot published for `commit`.
    ///
    /// Fetch and parse failures both come back as `None` (logged, non-fatal);
    /// the transient metadata file is deleted after parsing either way.
    pub async fn load_for_commit(&self, commit: &str) -> Option<SourceStateSnapshot> {
        let metadata = match self.client.fetch_commit_metadata(commit).await {
            Ok(Some(path)) => path,
            Ok(None) => {
                tracing::info!(commit, "no source-state snapshot published for commit");
                return None;
            }
            Err(e) => {
                tracing::warn!(commit, "failed to fetch commit snapshot: {e}");
                return None;
            }
        };

        let parsed = read_snapshot(&metadata).await;
        if let Err(e) = tokio::fs::remove_file(&metadata).await {
            tracing::debug!("could not remove metadata file {}: {e}", metadata.display());
        }

        match parsed {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                // Stale/garbled metadata is treated like an unknown commit.
                tracing::warn!(commit, "unparseable commit snapshot: {e:#}");
                None
            }
        }
    }

    /// Read the locally persisted snapshot; `None` on first run.
    pub async fn load_current(&self) -> Option<SourceStateSnapshot> {
        if !self.snapshot_file.exists() {
            tracing::debug!("no current snapshot at {}", self.snapshot_file.display());
            return None;
        }
        match read_snapshot(&self.snapshot_file).await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                tracing::warn!(
                    "current snapshot at {} is unreadable, treating as absent: {e:#}",
                    self.snapshot_file.display()
                );
                None
            }
        }
    }

    /// Persist `snapshot` as the new current snapshot. Called only after a
    /// fully successful apply.
    pub async fn persist_current(&self, snapshot: &SourceStateSnapshot) -> anyhow::Result<()> {
        if let Some(parent) = self.snapshot_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(snapshot).context("serializing snapshot")?;
        tokio::fs::write(&self.snapshot_file, json)
            .await
            .with_context(|| format!("writing {}", self.snapshot_file.display()))?;
        Ok(())
    }

    /// Delete the persisted snapshot so the next sync treats every target as
    /// new. Missing file is fine.
    pub async fn drop_current(&self) {
        match tokio::fs::remove_file(&self.snapshot_file).await {
            Ok(()) => tracing::info!("dropped current snapshot"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                "could not drop snapshot {}: {e}",
                self.snapshot_file.display()
            ),
        }
    }
}

async fn read_snapshot(path: &Path) -> anyhow::Result<SourceStateSnapshot> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{snapshot, MockClient};

    fn store(dir: &Path, client: MockClient) -> SourceStateStore {
        SourceStateStore::new(dir.join("source-state.json"), Arc::new(client))
    }

    #[tokio::test]
    async fn current_snapshot_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), MockClient::new(dir.path()));
        assert!(store.load_current().await.is_none());

        let snap = snapshot(&[("java-production", "core", "h1", "production/core")]);
        store.persist_current(&snap).await.unwrap();
        assert_eq!(store.load_current().await, Some(snap));
    }

    #[tokio::test]
    async fn drop_current_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), MockClient::new(dir.path()));
        store.drop_current().await; // nothing persisted yet

        let snap = snapshot(&[("java-test", "core", "h", "test/core")]);
        store.persist_current(&snap).await.unwrap();
        store.drop_current().await;
        assert!(store.load_current().await.is_none());
    }

    #[tokio::test]
    async fn load_for_commit_parses_and_removes_metadata_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = MockClient::new(dir.path());
        let snap = snapshot(&[("java-production", "app", "abc", "production/app")]);
        client.publish_snapshot("c1", &snap);
        let store = store(dir.path(), client);

        assert_eq!(store.load_for_commit("c1").await, Some(snap));
        // the transient metadata file must be gone
        assert!(!dir.path().join("metadata-c1.json").exists());
    }

    #[tokio::test]
    async fn unknown_commit_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), MockClient::new(dir.path()));
        assert!(store.load_for_commit("missing").await.is_none());
    }

    #[tokio::test]
    async fn stale_metadata_is_none_and_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = MockClient::new(dir.path());
        client.publish_stale("bad");
        let store = store(dir.path(), client);

        assert!(store.load_for_commit("bad").await.is_none());
        assert!(!dir.path().join("metadata-bad.json").exists());
    }
}
