//! Storage key derivation and project category promotion.
//!
//! Milestone keys have the shape `{project_root}_milestone_{YYYY-MM-DD}_{ts4}`
//! where `ts4` is the epoch second modulo 10000, zero-padded to four digits.
//! The suffix only disambiguates; two milestones for the same root written in
//! seconds that agree modulo 10000 on the same day produce the same key.

use chrono::{DateTime, Utc};
use tracing::debug;

use neuramemory_shared::{ClassificationResult, MemoryType};

use crate::services::Clock;

/// Prefix carried by every project root key.
pub const PROJECT_PREFIX: &str = "project_";

/// Separator between a project root and its milestone suffix.
pub const MILESTONE_MARKER: &str = "_milestone_";

/// Lowercase and turn every space into an underscore.
///
/// Runs of spaces are not collapsed: `"a  b"` becomes `a__b`.
pub fn normalize_key(key: &str) -> String {
    key.to_lowercase().replace(' ', "_")
}

/// Lowercase and turn underscores into spaces, for phrase and token checks.
pub fn normalize_text(text: &str) -> String {
    text.to_lowercase().replace('_', " ")
}

/// The part of `key` before the first `_milestone_` segment.
///
/// A key without the marker is its own root.
pub fn milestone_root(key: &str) -> &str {
    key.split_once(MILESTONE_MARKER)
        .map_or(key, |(root, _)| root)
}

/// Prefix `key` with `project_` unless it already carries it.
pub fn ensure_project_prefix(key: &str) -> String {
    if key.starts_with(PROJECT_PREFIX) {
        key.to_string()
    } else {
        format!("{PROJECT_PREFIX}{key}")
    }
}

/// Project name of a root key: the `project_` prefix and every underscore removed.
///
/// An empty name means the root identifies no project at all (`project_`, `_`).
pub fn project_name(root: &str) -> String {
    root.strip_prefix(PROJECT_PREFIX)
        .unwrap_or(root)
        .replace('_', "")
}

/// Build a milestone key under `root` stamped with `now`.
pub fn milestone_key(root: &str, now: DateTime<Utc>) -> String {
    let date = now.format("%Y-%m-%d");
    let ts4 = now.timestamp().rem_euclid(10_000);
    format!("{root}{MILESTONE_MARKER}{date}_{ts4:04}")
}

/// Final storage key and category for a fact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedKey {
    pub key: String,
    pub category: MemoryType,
    /// True when a `Project` fact was promoted to `ProjectMilestone`.
    pub promoted: bool,
}

/// Compute the final key and category for `classification`.
///
/// `resolved_root` is the existing project the fact was matched to, if any.
/// Promotion only ever moves `Project` to `ProjectMilestone`.
pub fn derive_key(
    classification: &ClassificationResult,
    resolved_root: Option<&str>,
    clock: &dyn Clock,
) -> DerivedKey {
    let normalized = normalize_key(&classification.key);

    let derived = match (classification.category, resolved_root) {
        (MemoryType::ProjectMilestone, root) => {
            let base = match root {
                Some(root) => root.to_string(),
                None => fallback_root(&normalized),
            };
            DerivedKey {
                key: milestone_key(&base, clock.now()),
                category: MemoryType::ProjectMilestone,
                promoted: false,
            }
        }
        (MemoryType::Project, Some(root)) => DerivedKey {
            key: milestone_key(root, clock.now()),
            category: MemoryType::ProjectMilestone,
            promoted: true,
        },
        (MemoryType::Project, None) => DerivedKey {
            key: ensure_project_prefix(&normalized),
            category: MemoryType::Project,
            promoted: false,
        },
        (category, _) => DerivedKey {
            key: normalized,
            category,
            promoted: false,
        },
    };

    debug!(
        key = %derived.key,
        category = %derived.category,
        promoted = derived.promoted,
        "derived storage key"
    );
    derived
}

/// Root for a milestone whose project could not be resolved.
fn fallback_root(normalized_key: &str) -> String {
    let root = milestone_root(normalized_key).trim_end_matches('_');
    let prefixed = ensure_project_prefix(root);
    prefixed.trim_end_matches('_').to_string()
}
