//! Memory manager: the per-turn entry point tying classifier, recall, and ingestion together.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use neuramemory_shared::{
    ClassificationResult, MemoryFact, MemoryType, ProjectReference, RecallConfig, RecalledMemory,
    Result, UserProfile, VectorMatch,
};

use crate::pipeline::{FactPlan, IngestOutcome, IngestPipeline, TurnInput, plan_fact};
use crate::resolver::build_project_pool;
use crate::services::{Classifier, Clock, Embedder, FactStore, VectorIndex};

/// Key given to recalled memories whose metadata is missing.
const FALLBACK_RECALL_KEY: &str = "context";

/// Owns the injected services and exposes the turn-level operations.
pub struct MemoryManager {
    classifier: Arc<dyn Classifier>,
    embedder: Arc<dyn Embedder>,
    facts: Arc<dyn FactStore>,
    vectors: Arc<dyn VectorIndex>,
    pipeline: IngestPipeline,
    recall: RecallConfig,
}

impl MemoryManager {
    pub fn new(
        classifier: Arc<dyn Classifier>,
        embedder: Arc<dyn Embedder>,
        facts: Arc<dyn FactStore>,
        vectors: Arc<dyn VectorIndex>,
        recall: RecallConfig,
    ) -> Self {
        let pipeline = IngestPipeline::new(facts.clone(), vectors.clone(), embedder.clone());
        Self {
            classifier,
            embedder,
            facts,
            vectors,
            pipeline,
            recall,
        }
    }

    /// Replace the clock used for milestone suffixes.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.pipeline = self.pipeline.with_clock(clock);
        self
    }

    pub fn pipeline(&self) -> &IngestPipeline {
        &self.pipeline
    }

    /// Structured summary of a user's personal facts, preferences, and projects.
    #[instrument(skip(self))]
    pub async fn get_user_profile(&self, user_id: &str) -> Result<UserProfile> {
        load_profile(self.facts.as_ref(), user_id, self.recall.profile_limit).await
    }

    /// Memories semantically close to `query`.
    #[instrument(skip(self, query))]
    pub async fn get_relevant_memories(
        &self,
        user_id: &str,
        query: &str,
    ) -> Result<Vec<RecalledMemory>> {
        let query_embedding = self.embedder.embed(query).await?;
        let matches = self
            .vectors
            .search_similar(
                user_id,
                &query_embedding,
                self.recall.limit,
                self.recall.match_threshold,
            )
            .await?;

        debug!(count = matches.len(), "recalled memories");
        Ok(matches.into_iter().map(recalled_from_match).collect())
    }

    /// Classify one user message and run it through the ingestion pipeline.
    #[instrument(skip(self, user_message))]
    pub async fn process_turn(&self, user_id: &str, user_message: &str) -> Result<IngestOutcome> {
        let (profile, recalled) = self.gather_context(user_id, user_message).await?;
        let known_facts = render_known_facts(&profile, &recalled);

        let classification = self.classifier.classify(user_message, &known_facts).await?;
        debug!(
            category = %classification.category,
            should_store = classification.should_store,
            "classified turn"
        );

        self.pipeline
            .ingest(TurnInput {
                user_id,
                user_message,
                classification: &classification,
                profile: &profile,
                recalled: &recalled,
            })
            .await
    }

    /// Ingest a classification produced elsewhere.
    #[instrument(skip(self, user_message, classification))]
    pub async fn ingest_classified(
        &self,
        user_id: &str,
        user_message: &str,
        classification: &ClassificationResult,
    ) -> Result<IngestOutcome> {
        let (profile, recalled) = self.gather_context(user_id, user_message).await?;
        self.pipeline
            .ingest(TurnInput {
                user_id,
                user_message,
                classification,
                profile: &profile,
                recalled: &recalled,
            })
            .await
    }

    /// Resolve and derive the key for `classification` without writing anything.
    pub async fn plan_classified(
        &self,
        user_id: &str,
        classification: &ClassificationResult,
    ) -> Result<FactPlan> {
        let profile = self.get_user_profile(user_id).await?;
        let pool = build_project_pool::<RecalledMemory>(&profile, &[]);
        Ok(plan_fact(classification, &pool, self.pipeline.clock()))
    }

    /// Profile plus recall. Recall is best-effort context and degrades to empty.
    async fn gather_context(
        &self,
        user_id: &str,
        user_message: &str,
    ) -> Result<(UserProfile, Vec<RecalledMemory>)> {
        let profile = self.get_user_profile(user_id).await?;
        let recalled = match self.get_relevant_memories(user_id, user_message).await {
            Ok(recalled) => recalled,
            Err(e) => {
                warn!(error = %e, "semantic recall failed, continuing without it");
                Vec::new()
            }
        };
        Ok((profile, recalled))
    }
}

/// Read the profile categories straight from a fact store.
///
/// Only `PROJECT` facts count as projects; milestones stay out of the profile.
pub async fn load_profile(
    facts: &dyn FactStore,
    user_id: &str,
    limit: usize,
) -> Result<UserProfile> {
    let entries = |facts: Vec<MemoryFact>| -> Vec<ProjectReference> {
        facts
            .into_iter()
            .map(|f| ProjectReference::new(f.key, f.value))
            .collect()
    };

    let personal = facts
        .get_facts(user_id, Some(MemoryType::Personal), limit)
        .await?;
    let preferences = facts
        .get_facts(user_id, Some(MemoryType::Preference), limit)
        .await?;
    let projects = facts
        .get_facts(user_id, Some(MemoryType::Project), limit)
        .await?;

    Ok(UserProfile {
        personal: entries(personal),
        preferences: entries(preferences),
        projects: entries(projects),
    })
}

/// Delete a fact owned by `user_id` together with the embeddings derived from it.
///
/// Returns `false` when the user has no such fact; embeddings are then left alone.
#[instrument(skip(facts, vectors))]
pub async fn forget_fact(
    facts: &dyn FactStore,
    vectors: &dyn VectorIndex,
    user_id: &str,
    fact_id: &str,
) -> Result<bool> {
    if !facts.delete_fact(fact_id, user_id).await? {
        debug!("no such fact for user");
        return Ok(false);
    }

    let embedding_ids = vectors.embeddings_for_fact(user_id, fact_id).await?;
    if !embedding_ids.is_empty() {
        vectors.delete_embeddings(user_id, &embedding_ids).await?;
    }
    info!(embeddings = embedding_ids.len(), "fact forgotten");
    Ok(true)
}

fn recalled_from_match(m: VectorMatch) -> RecalledMemory {
    match m.metadata {
        Some(meta) => RecalledMemory {
            key: meta.key,
            value: strip_key_prefix(&m.content),
            category: meta.category,
        },
        None => RecalledMemory {
            key: FALLBACK_RECALL_KEY.to_string(),
            value: m.content,
            category: MemoryType::Ephemeral,
        },
    }
}

/// Stored embedding text is `"{key}: {value}"`; recover the value.
fn strip_key_prefix(content: &str) -> String {
    content
        .split_once(": ")
        .map_or(content, |(_, value)| value)
        .to_string()
}

fn render_known_facts(profile: &UserProfile, recalled: &[RecalledMemory]) -> String {
    let mut out = profile.render();
    for memory in recalled {
        out.push_str(&format!("recalled: {} = {}\n", memory.key, memory.value));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::*;
    use crate::services::FixedClock;
    use chrono::{TimeZone, Utc};
    use neuramemory_shared::EmbeddingMetadata;

    fn stored(user: &str, category: MemoryType, key: &str, value: &str) -> MemoryFact {
        MemoryFact {
            id: None,
            user_id: user.into(),
            category,
            importance: 0.5,
            key: key.into(),
            value: value.into(),
            context: None,
            created_at: None,
            updated_at: None,
        }
    }

    fn manager(
        classification: ClassificationResult,
        facts: Vec<MemoryFact>,
        matches: Vec<VectorMatch>,
    ) -> (MemoryManager, Arc<ScriptedClassifier>, Arc<RecordingFactStore>) {
        let classifier = Arc::new(ScriptedClassifier::new(classification));
        let store = Arc::new(RecordingFactStore {
            facts: std::sync::Mutex::new(facts),
            fail: false,
        });
        let vectors = Arc::new(RecordingVectorIndex {
            matches,
            ..Default::default()
        });
        let clock = FixedClock(Utc.timestamp_opt(1_714_521_600, 0).single().unwrap());
        let manager = MemoryManager::new(
            classifier.clone(),
            Arc::new(ConstantEmbedder),
            store.clone(),
            vectors,
            RecallConfig::default(),
        )
        .with_clock(Arc::new(clock));
        (manager, classifier, store)
    }

    #[tokio::test]
    async fn profile_groups_facts_by_category() {
        let (manager, _, _) = manager(
            ClassificationResult::discard("n/a"),
            vec![
                stored("u1", MemoryType::Personal, "name", "Sarah"),
                stored("u1", MemoryType::Project, "project_y", "Building Y"),
                stored("u1", MemoryType::ProjectMilestone, "project_y_milestone_x", "done"),
                stored("u2", MemoryType::Preference, "favorite_game", "Valorant"),
            ],
            vec![],
        );
        let profile = manager.get_user_profile("u1").await.unwrap();
        assert_eq!(profile.personal, vec![ProjectReference::new("name", "Sarah")]);
        assert!(profile.preferences.is_empty());
        assert_eq!(
            profile.projects,
            vec![ProjectReference::new("project_y", "Building Y")]
        );
    }

    #[tokio::test]
    async fn recall_uses_metadata_and_threshold() {
        let (manager, _, _) = manager(
            ClassificationResult::discard("n/a"),
            vec![],
            vec![
                VectorMatch {
                    id: "e1".into(),
                    content: "project_neuradesk: AI assistant".into(),
                    metadata: Some(EmbeddingMetadata {
                        category: MemoryType::Project,
                        key: "project_neuradesk".into(),
                        importance: 0.9,
                        fact_id: None,
                    }),
                    similarity: 0.92,
                },
                VectorMatch {
                    id: "e2".into(),
                    content: "likes tea".into(),
                    metadata: None,
                    similarity: 0.7,
                },
                VectorMatch {
                    id: "e3".into(),
                    content: "irrelevant".into(),
                    metadata: None,
                    similarity: 0.2,
                },
            ],
        );
        let recalled = manager.get_relevant_memories("u1", "neuradesk").await.unwrap();
        assert_eq!(recalled.len(), 2);
        assert_eq!(recalled[0].key, "project_neuradesk");
        assert_eq!(recalled[0].value, "AI assistant");
        assert_eq!(recalled[0].category, MemoryType::Project);
        assert_eq!(recalled[1].key, "context");
        assert_eq!(recalled[1].category, MemoryType::Ephemeral);
    }

    #[tokio::test]
    async fn process_turn_passes_known_facts_and_promotes() {
        let classification = ClassificationResult {
            category: MemoryType::Project,
            importance: 0.8,
            should_store: true,
            key: "project_y_frontend".into(),
            value: "Added login page".into(),
            reason: "project update".into(),
        };
        let (manager, classifier, store) = manager(
            classification,
            vec![stored("u1", MemoryType::Project, "project_y", "Building Y")],
            vec![],
        );

        let outcome = manager
            .process_turn("u1", "I added a login page to Y")
            .await
            .unwrap();
        let fact = outcome.into_stored_fact().expect("stored");
        assert_eq!(fact.category, MemoryType::ProjectMilestone);
        assert_eq!(fact.key, "project_y_milestone_2024-05-01_1600");

        let seen = classifier.seen.lock().unwrap();
        assert_eq!(seen[0].0, "I added a login page to Y");
        assert!(seen[0].1.contains("projects: project_y = Building Y"));
        assert_eq!(store.facts.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn process_turn_stores_nothing_when_classifier_declines() {
        let (manager, _, store) = manager(ClassificationResult::discard("chit-chat"), vec![], vec![]);
        let outcome = manager.process_turn("u1", "hi!").await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Skipped { .. }));
        assert!(store.facts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn plan_classified_is_a_dry_run() {
        let classification = ClassificationResult {
            category: MemoryType::Project,
            importance: 0.6,
            should_store: true,
            key: "beta_launch".into(),
            value: "Launching beta".into(),
            reason: String::new(),
        };
        let (manager, _, store) = manager(classification.clone(), vec![], vec![]);
        let plan = manager.plan_classified("u1", &classification).await.unwrap();
        assert_eq!(plan.key, "project_beta_launch");
        assert_eq!(plan.category, MemoryType::Project);
        assert!(store.facts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn forget_removes_fact_and_its_embedding() {
        let (manager, _, store) = manager(
            ClassificationResult {
                category: MemoryType::Personal,
                importance: 0.9,
                should_store: true,
                key: "name".into(),
                value: "Sarah".into(),
                reason: String::new(),
            },
            vec![],
            vec![],
        );
        let fact = manager
            .process_turn("u1", "I'm Sarah")
            .await
            .unwrap()
            .into_stored_fact()
            .expect("stored");
        let fact_id = fact.id.expect("id");

        let vectors = RecordingVectorIndex::default();
        vectors
            .store_embedding(
                "u1",
                "name: Sarah",
                &[0.1],
                &EmbeddingMetadata {
                    category: MemoryType::Personal,
                    key: "name".into(),
                    importance: 0.9,
                    fact_id: Some(fact_id.clone()),
                },
            )
            .await
            .unwrap();

        // Wrong owner: nothing happens.
        assert!(!forget_fact(store.as_ref(), &vectors, "u2", &fact_id).await.unwrap());
        assert!(vectors.deleted.lock().unwrap().is_empty());

        assert!(forget_fact(store.as_ref(), &vectors, "u1", &fact_id).await.unwrap());
        assert!(store.facts.lock().unwrap().is_empty());
        assert_eq!(*vectors.deleted.lock().unwrap(), vec!["emb-1".to_string()]);
        assert!(
            vectors
                .embeddings_for_fact("u1", &fact_id)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn strip_key_prefix_recovers_value() {
        assert_eq!(strip_key_prefix("name: Sarah"), "Sarah");
        assert_eq!(strip_key_prefix("no separator"), "no separator");
    }
}
