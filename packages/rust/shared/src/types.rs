//! Core domain types for NeuraMemory facts.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::NeuraMemoryError;

// ---------------------------------------------------------------------------
// MemoryType
// ---------------------------------------------------------------------------

/// Category assigned to a fact by the classifier (and possibly promoted later).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    /// Name, age, location, job title.
    Personal,
    /// Likes, dislikes, habits.
    Preference,
    /// Project names, IDs, goals.
    Project,
    /// An update attached to an existing project root.
    ProjectMilestone,
    /// Classified but intentionally never persisted.
    Ephemeral,
}

impl MemoryType {
    /// Storage representation, also used as vector metadata.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Personal => "personal",
            Self::Preference => "preference",
            Self::Project => "project",
            Self::ProjectMilestone => "project_milestone",
            Self::Ephemeral => "ephemeral",
        }
    }

    /// True for `Project` and `ProjectMilestone`.
    pub fn is_project(&self) -> bool {
        matches!(self, Self::Project | Self::ProjectMilestone)
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemoryType {
    type Err = NeuraMemoryError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "personal" => Ok(Self::Personal),
            "preference" => Ok(Self::Preference),
            "project" => Ok(Self::Project),
            "project_milestone" => Ok(Self::ProjectMilestone),
            "ephemeral" => Ok(Self::Ephemeral),
            other => Err(NeuraMemoryError::validation(format!(
                "unknown memory category '{other}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// ClassificationResult
// ---------------------------------------------------------------------------

/// Classifier verdict for a single utterance. Never persisted itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub category: MemoryType,
    /// Importance in `[0, 1]`.
    pub importance: f64,
    pub should_store: bool,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub reason: String,
}

impl ClassificationResult {
    /// The canonical "do not remember" outcome, keeping the classifier's reason.
    pub fn discard(reason: impl Into<String>) -> Self {
        Self {
            category: MemoryType::Ephemeral,
            importance: 0.0,
            should_store: false,
            key: String::new(),
            value: String::new(),
            reason: reason.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Fact records
// ---------------------------------------------------------------------------

/// Uniform read access to anything that looks like a remembered fact.
///
/// Recalled memories, stored facts, and profile entries all expose the same
/// `key`/`value`/`category` triple through this trait.
pub trait FactRecord {
    fn key(&self) -> &str;
    fn value(&self) -> &str;
    fn category(&self) -> MemoryType;
}

/// A `{key, value}` pair naming a known project. Read-only input to resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectReference {
    pub key: String,
    pub value: String,
}

impl ProjectReference {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A memory surfaced by semantic recall.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecalledMemory {
    pub key: String,
    pub value: String,
    pub category: MemoryType,
}

impl FactRecord for RecalledMemory {
    fn key(&self) -> &str {
        &self.key
    }
    fn value(&self) -> &str {
        &self.value
    }
    fn category(&self) -> MemoryType {
        self.category
    }
}

/// A single remembered user statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryFact {
    /// Assigned by the structured store on insert.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub user_id: String,
    pub category: MemoryType,
    pub importance: f64,
    /// e.g. `name`, `favorite_language`, `project_alpha_milestone_2024-05-01_1234`.
    pub key: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl FactRecord for MemoryFact {
    fn key(&self) -> &str {
        &self.key
    }
    fn value(&self) -> &str {
        &self.value
    }
    fn category(&self) -> MemoryType {
        self.category
    }
}

/// Partial update applied through the structured store's update path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FactUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<MemoryType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub importance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

// ---------------------------------------------------------------------------
// UserProfile
// ---------------------------------------------------------------------------

/// Structured summary of what is known about a user, grouped by category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default)]
    pub personal: Vec<ProjectReference>,
    #[serde(default)]
    pub preferences: Vec<ProjectReference>,
    #[serde(default)]
    pub projects: Vec<ProjectReference>,
}

impl UserProfile {
    /// Render the profile as plain text for prompt injection.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (label, entries) in [
            ("personal", &self.personal),
            ("preferences", &self.preferences),
            ("projects", &self.projects),
        ] {
            for entry in entries {
                out.push_str(&format!("{label}: {} = {}\n", entry.key, entry.value));
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.personal.is_empty() && self.preferences.is_empty() && self.projects.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Vector index payloads
// ---------------------------------------------------------------------------

/// Metadata stored alongside each embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingMetadata {
    pub category: MemoryType,
    pub key: String,
    pub importance: f64,
    /// Structured fact this embedding was derived from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fact_id: Option<String>,
}

/// A single semantic-search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorMatch {
    pub id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EmbeddingMetadata>,
    /// Cosine similarity in `[-1, 1]`.
    pub similarity: f32,
}
