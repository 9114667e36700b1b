//! Snapshot diffing: which build targets must be (re)downloaded for a commit
//! and which stale output paths should be deleted.
//!
//! Pure over its snapshot inputs; the only side channel is an optional
//! read-only probe of the output root to repair local drift (a target whose
//! metadata matches but whose output directory was wiped on disk).

use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use xxhash_rust::xxh3::xxh3_128;

use crate::types::{
    AffectedTarget, SourceStateSnapshot, JAVA_PRODUCTION, JAVA_TEST, RESOURCES_PRODUCTION,
    RESOURCES_TEST,
};

/// Result of diffing the current snapshot against a commit snapshot.
#[derive(Debug, Default, Clone)]
pub struct DiffOutcome {
    /// Targets to download, production/resources pairs already merged.
    pub affected: Vec<AffectedTarget>,
    /// Relative output paths with no owner in the commit snapshot, ordered
    /// and deduplicated.
    pub delete: Vec<String>,
}

/// Compute the affected-target set and stale-path deletions.
///
/// `current = None` is a cold sync: everything in `commit` is affected.
/// When `disk_root` is given, targets whose hashes match are still affected
/// if their output directory is missing or empty on disk; pass `None` to
/// skip the probes for cheap pre-flight counting.
pub fn compute_affected(
    current: Option<&SourceStateSnapshot>,
    commit: &SourceStateSnapshot,
    disk_root: Option<&Path>,
) -> DiffOutcome {
    let mut affected: Vec<AffectedTarget> = Vec::new();
    let mut delete_candidates: BTreeSet<String> = BTreeSet::new();

    match current {
        None => {
            for (type_id, targets) in &commit.targets {
                for (name, state) in targets {
                    affected.push(AffectedTarget {
                        type_id: type_id.clone(),
                        name: name.clone(),
                        hash: state.hash.clone(),
                        output_path: state.path.clone(),
                    });
                }
            }
        }
        Some(current) => {
            for (type_id, commit_targets) in &commit.targets {
                match current.targets.get(type_id) {
                    // New target type: everything in it is affected.
                    None => {
                        for (name, state) in commit_targets {
                            affected.push(AffectedTarget {
                                type_id: type_id.clone(),
                                name: name.clone(),
                                hash: state.hash.clone(),
                                output_path: state.path.clone(),
                            });
                        }
                    }
                    Some(current_targets) => {
                        for (name, state) in commit_targets {
                            match current_targets.get(name) {
                                None => affected.push(AffectedTarget {
                                    type_id: type_id.clone(),
                                    name: name.clone(),
                                    hash: state.hash.clone(),
                                    output_path: state.path.clone(),
                                }),
                                Some(known) => {
                                    let changed = known.hash != state.hash;
                                    // A moved output dir counts as changed and
                                    // leaves its old location for deletion.
                                    let moved = known.path != state.path;
                                    let drifted = !changed
                                        && !moved
                                        && disk_root.is_some_and(|root| {
                                            !output_dir_intact(&root.join(&state.path))
                                        });
                                    if changed || moved || drifted {
                                        affected.push(AffectedTarget {
                                            type_id: type_id.clone(),
                                            name: name.clone(),
                                            hash: state.hash.clone(),
                                            output_path: state.path.clone(),
                                        });
                                    }
                                    if moved {
                                        delete_candidates.insert(known.path.clone());
                                    }
                                }
                            }
                        }
                        for (name, known) in current_targets {
                            if !commit_targets.contains_key(name) {
                                delete_candidates.insert(known.path.clone());
                            }
                        }
                    }
                }
            }
            // Whole target types that vanished from the commit snapshot.
            for (type_id, current_targets) in &current.targets {
                if !commit.targets.contains_key(type_id) {
                    for known in current_targets.values() {
                        delete_candidates.insert(known.path.clone());
                    }
                }
            }
        }
    }

    // A path is only deleted if no target of any type still maps to it,
    // which covers targets migrating between type buckets.
    let delete = delete_candidates
        .into_iter()
        .filter(|path| !commit.maps_path(path))
        .collect();

    DiffOutcome {
        affected: merge_paired(affected, commit),
        delete,
    }
}

/// Combine two content hashes into one stable merged hash. Order-dependent
/// by design: swapping class and resources hashes yields a different value.
pub fn combine_hashes(class_hash: &str, resources_hash: &str) -> String {
    let mut input = Vec::with_capacity(class_hash.len() + resources_hash.len());
    input.extend_from_slice(class_hash.as_bytes());
    input.extend_from_slice(resources_hash.as_bytes());
    format!("{:032x}", xxh3_128(&input))
}

fn paired_types(type_id: &str) -> Option<(&'static str, &'static str)> {
    match type_id {
        JAVA_PRODUCTION | RESOURCES_PRODUCTION => Some((JAVA_PRODUCTION, RESOURCES_PRODUCTION)),
        JAVA_TEST | RESOURCES_TEST => Some((JAVA_TEST, RESOURCES_TEST)),
        _ => None,
    }
}

/// Merge class targets with their paired resources targets into one logical
/// affected unit per module and role.
///
/// When the commit snapshot carries both members of a pair, either member's
/// change produces a single entry anchored on the class target, whose hash
/// combines both members' commit hashes. The combined hash is recomputed from
/// the same snapshot inputs every time, so merging is idempotent. Unpaired
/// targets pass through unchanged; the result is deduplicated by logical
/// identity.
fn merge_paired(affected: Vec<AffectedTarget>, commit: &SourceStateSnapshot) -> Vec<AffectedTarget> {
    let mut merged = Vec::with_capacity(affected.len());
    let mut seen: HashSet<(String, String)> = HashSet::new();

    for target in affected {
        let unit = match paired_types(&target.type_id) {
            Some((class_type, resources_type)) => {
                let class_state = commit.get(class_type, &target.name);
                let resources_state = commit.get(resources_type, &target.name);
                match (class_state, resources_state) {
                    (Some(class), Some(resources)) => AffectedTarget {
                        type_id: class_type.to_string(),
                        name: target.name.clone(),
                        hash: combine_hashes(&class.hash, &resources.hash),
                        output_path: class.path.clone(),
                    },
                    _ => target,
                }
            }
            None => target,
        };
        if seen.insert((unit.type_id.clone(), unit.name.clone())) {
            merged.push(unit);
        }
    }
    merged
}

/// An output directory counts as intact only if it exists and is non-empty.
fn output_dir_intact(dir: &Path) -> bool {
    match std::fs::read_dir(dir) {
        Ok(mut entries) => entries.next().is_some(),
        Err(_) => false,
    }
}
