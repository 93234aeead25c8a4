//! Ingestion pipeline: classification → resolution → key → enrichment → persistence.
//!
//! The pure half ([`plan_fact`]) performs no I/O and can be run as a dry run.
//! [`IngestPipeline::ingest`] adds the fact store and vector index writes.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use neuramemory_shared::{
    ClassificationResult, EmbeddingMetadata, MemoryFact, MemoryType, ProjectReference,
    RecalledMemory, Result, UserProfile,
};

use crate::enrichment::enrich_value;
use crate::keys::{derive_key, project_name};
use crate::resolver::{Resolution, build_project_pool, resolve_project};
use crate::services::{Clock, Embedder, FactStore, SystemClock, VectorIndex};

/// Key, category, and value a fact will be stored under.
#[derive(Debug, Clone, PartialEq)]
pub struct FactPlan {
    /// Raw resolver outcome, kept so callers can tell an error from a miss.
    pub resolution: Resolution,
    pub key: String,
    pub category: MemoryType,
    pub value: String,
    pub promoted: bool,
}

impl FactPlan {
    /// The project root the fact attaches to, if resolution found one.
    pub fn resolved_root(&self) -> Option<&str> {
        match &self.resolution {
            Ok(Some(resolved)) => Some(resolved.root_key.as_str()),
            _ => None,
        }
    }
}

/// Resolve, derive the key, and enrich the value for a storable classification.
pub fn plan_fact(
    classification: &ClassificationResult,
    pool: &[ProjectReference],
    clock: &dyn Clock,
) -> FactPlan {
    let resolution = resolve_project(classification, pool);
    let resolved_root = match &resolution {
        Ok(Some(resolved)) => Some(resolved.root_key.as_str()),
        Ok(None) => None,
        Err(e) => {
            warn!(error = %e, "entity resolution failed, treating as new project");
            None
        }
    };

    let derived = derive_key(classification, resolved_root, clock);
    let value = if derived.category == MemoryType::ProjectMilestone {
        enrich_value(&classification.value, &derived.key, resolved_root)
    } else {
        classification.value.clone()
    };

    FactPlan {
        key: derived.key,
        category: derived.category,
        value,
        promoted: derived.promoted,
        resolution,
    }
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// The classifier decided nothing should be remembered.
    Skipped { reason: String },
    /// Built but not persisted because the final category is ephemeral.
    Ephemeral { fact: MemoryFact },
    /// Written to the fact store and the vector index.
    Stored {
        fact: MemoryFact,
        embedding_id: String,
    },
}

impl IngestOutcome {
    /// The persisted fact, if any.
    pub fn stored_fact(&self) -> Option<&MemoryFact> {
        match self {
            Self::Stored { fact, .. } => Some(fact),
            _ => None,
        }
    }

    pub fn into_stored_fact(self) -> Option<MemoryFact> {
        match self {
            Self::Stored { fact, .. } => Some(fact),
            _ => None,
        }
    }
}

/// Everything the pipeline needs for one conversation turn.
#[derive(Debug, Clone, Copy)]
pub struct TurnInput<'a> {
    pub user_id: &'a str,
    pub user_message: &'a str,
    pub classification: &'a ClassificationResult,
    pub profile: &'a UserProfile,
    pub recalled: &'a [RecalledMemory],
}

/// Text embedded for a fact: `"{key}: {value}"`.
pub fn feature_text(fact: &MemoryFact) -> String {
    format!("{}: {}", fact.key, fact.value)
}

/// Persists classified facts through injected collaborators.
#[derive(Clone)]
pub struct IngestPipeline {
    facts: Arc<dyn FactStore>,
    vectors: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    clock: Arc<dyn Clock>,
}

impl IngestPipeline {
    pub fn new(
        facts: Arc<dyn FactStore>,
        vectors: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            facts,
            vectors,
            embedder,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock used for milestone suffixes.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Run one turn through the pipeline.
    ///
    /// Store and embedding failures propagate to the caller; resolution
    /// failures degrade to "new project".
    #[instrument(skip_all, fields(user_id = %input.user_id, category = %input.classification.category))]
    pub async fn ingest(&self, input: TurnInput<'_>) -> Result<IngestOutcome> {
        let classification = input.classification;
        if !classification.should_store {
            info!(reason = %classification.reason, "classifier chose not to store");
            return Ok(IngestOutcome::Skipped {
                reason: classification.reason.clone(),
            });
        }

        let pool = build_project_pool(input.profile, input.recalled);
        let plan = plan_fact(classification, &pool, self.clock());

        // A bare `project_` root would contain every later project key.
        if plan.category == MemoryType::Project && project_name(&plan.key).is_empty() {
            warn!(key = %plan.key, "project fact has no name, not storing");
            return Ok(IngestOutcome::Skipped {
                reason: format!("project key {:?} names no project", classification.key),
            });
        }

        let fact = MemoryFact {
            id: None,
            user_id: input.user_id.to_string(),
            category: plan.category,
            importance: classification.importance,
            key: plan.key,
            value: plan.value,
            context: Some(format!("Q: {}\nA:", input.user_message)),
            created_at: None,
            updated_at: None,
        };

        if fact.category == MemoryType::Ephemeral {
            info!(key = %fact.key, "ephemeral fact, not persisting");
            return Ok(IngestOutcome::Ephemeral { fact });
        }

        let fact = self.facts.store_fact(fact).await?;

        let text = feature_text(&fact);
        let embedding = self.embedder.embed(&text).await?;
        let metadata = EmbeddingMetadata {
            category: fact.category,
            key: fact.key.clone(),
            importance: fact.importance,
            fact_id: fact.id.clone(),
        };
        let embedding_id = self
            .vectors
            .store_embedding(&fact.user_id, &text, &embedding, &metadata)
            .await?;

        info!(
            key = %fact.key,
            category = %fact.category,
            promoted = plan.promoted,
            fact_id = fact.id.as_deref().unwrap_or("-"),
            "fact stored"
        );

        Ok(IngestOutcome::Stored { fact, embedding_id })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::resolver::{MatchRule, ResolutionError};
    use crate::services::FixedClock;
    use chrono::{TimeZone, Utc};

    struct Harness {
        facts: Arc<RecordingFactStore>,
        vectors: Arc<RecordingVectorIndex>,
        pipeline: IngestPipeline,
    }

    fn harness_with(facts: RecordingFactStore) -> Harness {
        let facts = Arc::new(facts);
        let vectors = Arc::new(RecordingVectorIndex::default());
        // 2024-05-01T00:00:00Z
        let clock = FixedClock(Utc.timestamp_opt(1_714_521_600, 0).single().unwrap());
        let pipeline = IngestPipeline::new(facts.clone(), vectors.clone(), Arc::new(ConstantEmbedder))
            .with_clock(Arc::new(clock));
        Harness {
            facts,
            vectors,
            pipeline,
        }
    }

    fn harness() -> Harness {
        harness_with(RecordingFactStore::default())
    }

    fn classification(category: MemoryType, key: &str, value: &str) -> ClassificationResult {
        ClassificationResult {
            category,
            importance: 0.8,
            should_store: true,
            key: key.into(),
            value: value.into(),
            reason: "test".into(),
        }
    }

    fn profile_with_projects(projects: &[(&str, &str)]) -> UserProfile {
        UserProfile {
            projects: projects
                .iter()
                .map(|(k, v)| ProjectReference::new(*k, *v))
                .collect(),
            ..Default::default()
        }
    }

    fn turn<'a>(
        classification: &'a ClassificationResult,
        profile: &'a UserProfile,
        recalled: &'a [RecalledMemory],
    ) -> TurnInput<'a> {
        TurnInput {
            user_id: "user-1",
            user_message: "hello there",
            classification,
            profile,
            recalled,
        }
    }

    #[tokio::test]
    async fn should_not_store_short_circuits() {
        let h = harness();
        let c = ClassificationResult::discard("greeting");
        let profile = UserProfile::default();
        let outcome = h.pipeline.ingest(turn(&c, &profile, &[])).await.unwrap();

        assert_eq!(
            outcome,
            IngestOutcome::Skipped {
                reason: "greeting".into()
            }
        );
        assert!(h.facts.facts.lock().unwrap().is_empty());
        assert!(h.vectors.stored.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn store_flag_off_wins_over_category() {
        let h = harness();
        let mut c = classification(MemoryType::Project, "project_x", "x");
        c.should_store = false;
        let profile = UserProfile::default();
        let outcome = h.pipeline.ingest(turn(&c, &profile, &[])).await.unwrap();
        assert!(outcome.stored_fact().is_none());
        assert!(h.facts.facts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn ephemeral_facts_are_never_persisted() {
        let h = harness();
        let c = classification(MemoryType::Ephemeral, "mood", "tired today");
        let profile = UserProfile::default();
        let outcome = h.pipeline.ingest(turn(&c, &profile, &[])).await.unwrap();

        match outcome {
            IngestOutcome::Ephemeral { fact } => assert_eq!(fact.key, "mood"),
            other => panic!("expected ephemeral, got {other:?}"),
        }
        assert!(h.facts.facts.lock().unwrap().is_empty());
        assert!(h.vectors.stored.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn project_update_is_promoted_and_embedded() {
        let h = harness();
        let c = classification(MemoryType::Project, "project_y_frontend", "Added login page");
        let profile = profile_with_projects(&[("project_y", "Building Y")]);
        let outcome = h.pipeline.ingest(turn(&c, &profile, &[])).await.unwrap();

        let fact = outcome.stored_fact().expect("stored").clone();
        assert_eq!(fact.category, MemoryType::ProjectMilestone);
        assert_eq!(fact.key, "project_y_milestone_2024-05-01_1600");
        assert_eq!(fact.value, "Added login page");
        assert_eq!(fact.context.as_deref(), Some("Q: hello there\nA:"));
        assert_eq!(fact.id.as_deref(), Some("fact-1"));

        let stored = h.vectors.stored.lock().unwrap();
        assert_eq!(stored.len(), 1);
        let (user_id, text, _, metadata) = &stored[0];
        assert_eq!(user_id, "user-1");
        assert_eq!(text, "project_y_milestone_2024-05-01_1600: Added login page");
        assert_eq!(metadata.category, MemoryType::ProjectMilestone);
        assert_eq!(metadata.key, fact.key);
        assert_eq!(metadata.fact_id.as_deref(), Some("fact-1"));
    }

    #[tokio::test]
    async fn new_project_keeps_category() {
        let h = harness();
        let c = classification(MemoryType::Project, "beta_launch", "Launching the beta");
        let profile = UserProfile::default();
        let fact = h
            .pipeline
            .ingest(turn(&c, &profile, &[]))
            .await
            .unwrap()
            .into_stored_fact()
            .expect("stored");
        assert_eq!(fact.key, "project_beta_launch");
        assert_eq!(fact.category, MemoryType::Project);
    }

    #[tokio::test]
    async fn recalled_project_memories_take_part_in_resolution() {
        let h = harness();
        let c = classification(
            MemoryType::Project,
            "backend",
            "Started working on project NeuraDesk backend",
        );
        let profile = UserProfile::default();
        let recalled = vec![RecalledMemory {
            key: "project_neuradesk".into(),
            value: "AI assistant".into(),
            category: MemoryType::Project,
        }];
        let fact = h
            .pipeline
            .ingest(turn(&c, &profile, &recalled))
            .await
            .unwrap()
            .into_stored_fact()
            .expect("stored");
        assert!(fact.key.starts_with("project_neuradesk_milestone_"));
        assert_eq!(fact.category, MemoryType::ProjectMilestone);
    }

    #[tokio::test]
    async fn store_failures_surface_to_the_caller() {
        let h = harness_with(RecordingFactStore {
            fail: true,
            ..Default::default()
        });
        let c = classification(MemoryType::Personal, "name", "Sarah");
        let profile = UserProfile::default();
        let err = h.pipeline.ingest(turn(&c, &profile, &[])).await.unwrap_err();
        assert!(err.to_string().contains("write rejected"));
        assert!(h.vectors.stored.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_turns_can_both_create_the_same_new_project() {
        // Known limitation: no cross-request locking, so two turns that both
        // miss resolution each create a "new project" entry.
        let h = harness();
        let c = classification(MemoryType::Project, "beta_launch", "Launching the beta");
        let profile = UserProfile::default();
        let (a, b) = tokio::join!(
            h.pipeline.ingest(turn(&c, &profile, &[])),
            h.pipeline.ingest(turn(&c, &profile, &[]))
        );
        assert_eq!(a.unwrap().into_stored_fact().unwrap().key, "project_beta_launch");
        assert_eq!(b.unwrap().into_stored_fact().unwrap().key, "project_beta_launch");
        assert_eq!(h.facts.facts.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn project_with_empty_key_is_skipped() {
        let h = harness();
        let c = classification(MemoryType::Project, "", "Some project");
        let profile = UserProfile::default();
        let outcome = h.pipeline.ingest(turn(&c, &profile, &[])).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Skipped { .. }));
        assert!(h.facts.facts.lock().unwrap().is_empty());
        assert!(h.vectors.stored.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn bare_prefix_project_does_not_swallow_new_projects() {
        let h = harness();
        let c = classification(MemoryType::Project, "project_beta", "Launching beta");
        let profile = profile_with_projects(&[("project_", "stored with an empty key")]);
        let fact = h
            .pipeline
            .ingest(turn(&c, &profile, &[]))
            .await
            .unwrap()
            .into_stored_fact()
            .expect("stored");
        assert_eq!(fact.key, "project_beta");
        assert_eq!(fact.category, MemoryType::Project);
    }

    #[test]
    fn plan_leaves_low_information_milestones_unenriched() {
        let clock = FixedClock(Utc.timestamp_opt(1_714_521_600, 0).single().unwrap());
        let c = classification(MemoryType::ProjectMilestone, "project_x_api_update", "done");
        let plan = plan_fact(&c, &[], &clock);
        // Every key token belongs to the milestone root, so nothing is left to prefix.
        assert_eq!(plan.key, "project_x_api_update_milestone_2024-05-01_1600");
        assert_eq!(plan.value, "done");
        assert_eq!(plan.resolution, Ok(None));
    }

    #[test]
    fn plan_reports_resolution_errors_but_degrades_to_new_project() {
        let clock = FixedClock(Utc.timestamp_opt(1_714_521_600, 0).single().unwrap());
        let c = classification(MemoryType::Project, "beta", "Beta");
        let pool = vec![ProjectReference::new("", "broken")];
        let plan = plan_fact(&c, &pool, &clock);
        assert!(matches!(
            plan.resolution,
            Err(ResolutionError::EmptyCandidateRoot { position: 0, .. })
        ));
        assert_eq!(plan.resolved_root(), None);
        assert_eq!(plan.key, "project_beta");
        assert_eq!(plan.category, MemoryType::Project);
    }

    #[test]
    fn plan_exposes_match_rule() {
        let clock = FixedClock(Utc.timestamp_opt(1_714_521_600, 0).single().unwrap());
        let c = classification(MemoryType::Project, "project_y_frontend", "Added login page");
        let pool = vec![ProjectReference::new("project_y", "Building Y")];
        let plan = plan_fact(&c, &pool, &clock);
        let resolved = plan.resolution.clone().unwrap().unwrap();
        assert_eq!(resolved.rule, MatchRule::Containment);
        assert!(plan.promoted);
        assert_eq!(plan.resolved_root(), Some("project_y"));
    }
}
