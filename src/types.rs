//! Core value types shared across the sync subsystem.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Target-type id for compiled production classes.
pub const JAVA_PRODUCTION: &str = "java-production";
/// Target-type id for compiled test classes.
pub const JAVA_TEST: &str = "java-test";
/// Target-type id for production resources, paired with [`JAVA_PRODUCTION`].
pub const RESOURCES_PRODUCTION: &str = "resources-production";
/// Target-type id for test resources, paired with [`JAVA_TEST`].
pub const RESOURCES_TEST: &str = "resources-test";

/// Expected content hash and on-disk location of one compiled artifact at a
/// given commit. Equality of both fields is the sole "unchanged" signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildTargetState {
    pub hash: String,
    /// Output path relative to the project's module-output root.
    pub path: String,
}

/// Full mapping of target-type id → target name → expected state, either the
/// locally persisted "current" snapshot or one fetched for a commit.
///
/// Immutable once constructed; the diff in [`crate::diff`] never mutates its
/// inputs. `BTreeMap` keeps the persisted JSON and all iteration stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceStateSnapshot {
    pub targets: BTreeMap<String, BTreeMap<String, BuildTargetState>>,
}

impl SourceStateSnapshot {
    pub fn target_count(&self) -> usize {
        self.targets.values().map(BTreeMap::len).sum()
    }

    pub fn get(&self, type_id: &str, name: &str) -> Option<&BuildTargetState> {
        self.targets.get(type_id)?.get(name)
    }

    /// Whether any target of any type maps to the given relative output path.
    /// Guards stale-path deletion when a target moves between type buckets.
    pub fn maps_path(&self, relative: &str) -> bool {
        self.targets
            .values()
            .flat_map(BTreeMap::values)
            .any(|state| state.path == relative)
    }
}

/// One build target whose local output must be replaced: its hash changed,
/// it is new, or its on-disk output is missing or empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffectedTarget {
    pub type_id: String,
    pub name: String,
    pub hash: String,
    /// Intended output directory, relative to the module-output root.
    pub output_path: String,
}

/// Terminal status of one loader phase.
///
/// Combines like boolean AND: any `Failed` input makes the combined run
/// `Failed`, which is what gates the transactional apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderStatus {
    Complete,
    Failed,
}

impl LoaderStatus {
    pub fn and(self, other: LoaderStatus) -> LoaderStatus {
        match (self, other) {
            (LoaderStatus::Complete, LoaderStatus::Complete) => LoaderStatus::Complete,
            _ => LoaderStatus::Failed,
        }
    }

    pub fn is_complete(self) -> bool {
        self == LoaderStatus::Complete
    }
}
