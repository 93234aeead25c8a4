//! Entity resolution: attach a new fact to a project the user already has.
//!
//! Candidates are tried in pool order and the first match wins. Profile
//! projects are placed before recalled memories, so structured data beats
//! semantic recall on ties.

use std::fmt;

use tracing::{debug, instrument};

use neuramemory_shared::{ClassificationResult, FactRecord, ProjectReference, UserProfile};

use crate::keys::{milestone_root, normalize_key, normalize_text, project_name};

/// Shortest project name eligible for bare substring matching against the value.
const MIN_LOOSE_NAME_LEN: usize = 4;

/// Which rule matched a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchRule {
    /// Candidate root equals the new key.
    Exact,
    /// Candidate root is a substring of the new key.
    Containment,
    /// `"project {name}"` appears in the new value or key.
    Phrase,
    /// The project name is a whole token of the new key.
    Token,
    /// A long project name appears anywhere in the new value.
    LooseName,
}

impl fmt::Display for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Exact => "exact",
            Self::Containment => "containment",
            Self::Phrase => "phrase",
            Self::Token => "token",
            Self::LooseName => "loose_name",
        };
        f.write_str(s)
    }
}

/// A successful resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRoot {
    pub root_key: String,
    pub rule: MatchRule,
    /// Position of the matching candidate in the pool.
    pub position: usize,
}

/// Resolution could not be carried out.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolutionError {
    /// A candidate's key names no project: empty, only `project_`, or only a milestone suffix.
    #[error("candidate #{position} has an empty project root (key: {key:?})")]
    EmptyCandidateRoot { position: usize, key: String },
}

/// `Ok(None)` means no existing project matched; the fact is a new project.
pub type Resolution = std::result::Result<Option<ResolvedRoot>, ResolutionError>;

/// Build the candidate pool: profile projects first, then project-tagged recalled memories.
pub fn build_project_pool<R: FactRecord>(
    profile: &UserProfile,
    recalled: &[R],
) -> Vec<ProjectReference> {
    profile
        .projects
        .iter()
        .cloned()
        .chain(
            recalled
                .iter()
                .filter(|m| m.category().is_project())
                .map(|m| ProjectReference::new(m.key(), m.value())),
        )
        .collect()
}

/// Match `classification` against `pool`, returning the first candidate's root.
#[instrument(skip_all, fields(key = %classification.key, candidates = pool.len()))]
pub fn resolve_project(classification: &ClassificationResult, pool: &[ProjectReference]) -> Resolution {
    let new_key = normalize_key(&classification.key);
    let new_key_text = normalize_text(&classification.key);
    let new_value_text = normalize_text(&classification.value);

    for (position, candidate) in pool.iter().enumerate() {
        let base_key = milestone_root(&candidate.key.to_lowercase()).to_string();
        let name = project_name(&base_key);
        if base_key.is_empty() || name.is_empty() {
            return Err(ResolutionError::EmptyCandidateRoot {
                position,
                key: candidate.key.clone(),
            });
        }

        if let Some(rule) =
            match_candidate(&base_key, &name, &new_key, &new_key_text, &new_value_text)
        {
            debug!(root = %base_key, %rule, position, "resolved existing project");
            return Ok(Some(ResolvedRoot {
                root_key: base_key,
                rule,
                position,
            }));
        }
    }

    debug!("no existing project matched");
    Ok(None)
}

fn match_candidate(
    base_key: &str,
    name: &str,
    new_key: &str,
    new_key_text: &str,
    new_value_text: &str,
) -> Option<MatchRule> {
    if base_key == new_key {
        return Some(MatchRule::Exact);
    }
    if new_key.contains(base_key) {
        return Some(MatchRule::Containment);
    }

    let phrase = format!("project {name}");
    if new_value_text.contains(&phrase) || new_key_text.contains(&phrase) {
        return Some(MatchRule::Phrase);
    }
    if new_key_text.split_whitespace().any(|token| token == name) {
        return Some(MatchRule::Token);
    }
    if name.chars().count() >= MIN_LOOSE_NAME_LEN && new_value_text.contains(name) {
        return Some(MatchRule::LooseName);
    }
    None
}
