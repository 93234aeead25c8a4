//! Collaborator interfaces consumed by the ingestion pipeline.
//!
//! Every external service (classifier, embedder, fact store, vector index,
//! clock) is constructed by the caller and handed to the pipeline as an
//! `Arc<dyn ...>`. Nothing in this crate reaches for a global instance.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use neuramemory_shared::{
    ClassificationResult, EmbeddingMetadata, FactUpdate, MemoryFact, MemoryType, Result,
    VectorMatch,
};

/// Decides whether an utterance is worth remembering.
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Classify `user_message` given a rendering of what is already known.
    async fn classify(&self, user_message: &str, known_facts: &str)
    -> Result<ClassificationResult>;
}

/// Turns text into an embedding vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Structured, exact-match storage of facts.
#[async_trait]
pub trait FactStore: Send + Sync {
    /// Persist a new fact, returning it with `id` and timestamps filled in.
    async fn store_fact(&self, fact: MemoryFact) -> Result<MemoryFact>;

    /// Facts for a user, newest first, optionally restricted to one category.
    async fn get_facts(
        &self,
        user_id: &str,
        category: Option<MemoryType>,
        limit: usize,
    ) -> Result<Vec<MemoryFact>>;

    /// Apply a partial update. Returns `None` if no such fact belongs to the user.
    async fn update_fact(
        &self,
        fact_id: &str,
        user_id: &str,
        update: &FactUpdate,
    ) -> Result<Option<MemoryFact>>;

    /// Delete a fact. Returns whether anything was removed.
    async fn delete_fact(&self, fact_id: &str, user_id: &str) -> Result<bool>;
}

/// Embedding storage with similarity search.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Store an embedding and return its identifier.
    async fn store_embedding(
        &self,
        user_id: &str,
        text: &str,
        embedding: &[f32],
        metadata: &EmbeddingMetadata,
    ) -> Result<String>;

    /// Best matches first, only those at or above `match_threshold`.
    async fn search_similar(
        &self,
        user_id: &str,
        query_embedding: &[f32],
        limit: usize,
        match_threshold: f32,
    ) -> Result<Vec<VectorMatch>>;

    /// Ids of the embeddings recorded for `fact_id`.
    async fn embeddings_for_fact(&self, user_id: &str, fact_id: &str) -> Result<Vec<String>>;

    /// Delete embeddings by id. Returns whether anything was removed.
    async fn delete_embeddings(&self, user_id: &str, ids: &[String]) -> Result<bool>;
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Time source for milestone key suffixes.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock pinned to one instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}
