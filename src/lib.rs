//! Remote build-cache synchronization for incremental compilers.
//!
//! After a checkout, the surrounding build driver hands a commit id to
//! [`SyncOrchestrator::sync`]. The orchestrator decides whether downloading
//! prebuilt outputs beats compiling locally, then brings two categories of
//! state up to that commit as one transaction: the global compiler cache
//! (replaced wholesale from a single archive) and the per-target compiled
//! outputs (diffed against the persisted [`SourceStateSnapshot`] and patched
//! target by target). Nothing live is mutated until every loader has staged
//! its work successfully; any failure rolls the whole run back.

pub mod config;
pub mod diff;
pub mod estimate;
pub mod loader;
pub mod remote;
pub mod retry;
pub mod snapshot;
pub mod sync;
pub mod types;

#[cfg(test)]
mod testutil;

pub use config::SyncConfig;
pub use estimate::{BuildEstimate, BuildEstimator, CompileScope, StatsSink, SyncRunStats};
pub use loader::IoPool;
pub use remote::{CacheClient, HttpCacheClient, Throughput};
pub use retry::RetryConfig;
pub use snapshot::SourceStateStore;
pub use sync::{RunGuard, SyncOrchestrator, SyncOutcome};
pub use types::{AffectedTarget, LoaderStatus, SourceStateSnapshot};
