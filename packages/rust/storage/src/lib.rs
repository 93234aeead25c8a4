//! libSQL storage layer for NeuraMemory.
//!
//! The [`Storage`] struct wraps a local libSQL database holding structured
//! facts (`user_memories`) and their embeddings (`memory_embeddings`). It
//! implements both [`FactStore`] and [`VectorIndex`], so one handle can be
//! shared by the pipeline as two collaborators.
//!
//! Similarity search is a linear cosine scan over a user's embeddings.

mod migrations;

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database, params};
use uuid::Uuid;

use neuramemory_core::{FactStore, VectorIndex};
use neuramemory_shared::{
    EmbeddingMetadata, FactUpdate, MemoryFact, MemoryType, NeuraMemoryError, Result, VectorMatch,
};

/// Columns selected for every fact query, in [`row_to_fact`] order.
const FACT_COLUMNS: &str =
    "id, user_id, category, importance, key, value, context, created_at, updated_at";

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| NeuraMemoryError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| NeuraMemoryError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| NeuraMemoryError::Storage(e.to_string()))?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode (profile and recall inspection).
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| NeuraMemoryError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| NeuraMemoryError::Storage(e.to_string()))?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        NeuraMemoryError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(NeuraMemoryError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Fact operations
    // -----------------------------------------------------------------------

    /// Get a single fact owned by `user_id`.
    pub async fn get_fact(&self, fact_id: &str, user_id: &str) -> Result<Option<MemoryFact>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {FACT_COLUMNS} FROM user_memories WHERE id = ?1 AND user_id = ?2"),
                params![fact_id, user_id],
            )
            .await
            .map_err(|e| NeuraMemoryError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_fact(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(NeuraMemoryError::Storage(e.to_string())),
        }
    }
}

#[async_trait]
impl FactStore for Storage {
    async fn store_fact(&self, mut fact: MemoryFact) -> Result<MemoryFact> {
        self.check_writable()?;
        let id = Uuid::now_v7().to_string();
        let now = Utc::now();
        let now_str = now.to_rfc3339_opts(SecondsFormat::Micros, true);
        self.conn
            .execute(
                "INSERT INTO user_memories
                   (id, user_id, category, importance, key, value, context, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    id.as_str(),
                    fact.user_id.as_str(),
                    fact.category.as_str(),
                    fact.importance,
                    fact.key.as_str(),
                    fact.value.as_str(),
                    fact.context.as_deref(),
                    now_str.as_str(),
                    now_str.as_str(),
                ],
            )
            .await
            .map_err(|e| NeuraMemoryError::Storage(e.to_string()))?;

        fact.id = Some(id);
        fact.created_at = Some(now);
        fact.updated_at = Some(now);
        Ok(fact)
    }

    async fn get_facts(
        &self,
        user_id: &str,
        category: Option<MemoryType>,
        limit: usize,
    ) -> Result<Vec<MemoryFact>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut rows = match category {
            Some(category) => {
                self.conn
                    .query(
                        &format!(
                            "SELECT {FACT_COLUMNS} FROM user_memories
                             WHERE user_id = ?1 AND category = ?2
                             ORDER BY created_at DESC, rowid DESC LIMIT ?3"
                        ),
                        params![user_id, category.as_str(), limit],
                    )
                    .await
            }
            None => {
                self.conn
                    .query(
                        &format!(
                            "SELECT {FACT_COLUMNS} FROM user_memories
                             WHERE user_id = ?1
                             ORDER BY created_at DESC, rowid DESC LIMIT ?2"
                        ),
                        params![user_id, limit],
                    )
                    .await
            }
        }
        .map_err(|e| NeuraMemoryError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_fact(&row)?);
        }
        Ok(results)
    }

    async fn update_fact(
        &self,
        fact_id: &str,
        user_id: &str,
        update: &FactUpdate,
    ) -> Result<Option<MemoryFact>> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let changed = self
            .conn
            .execute(
                "UPDATE user_memories SET
                   category   = COALESCE(?1, category),
                   importance = COALESCE(?2, importance),
                   key        = COALESCE(?3, key),
                   value      = COALESCE(?4, value),
                   context    = COALESCE(?5, context),
                   updated_at = ?6
                 WHERE id = ?7 AND user_id = ?8",
                params![
                    update.category.map(|c| c.as_str()),
                    update.importance,
                    update.key.as_deref(),
                    update.value.as_deref(),
                    update.context.as_deref(),
                    now.as_str(),
                    fact_id,
                    user_id,
                ],
            )
            .await
            .map_err(|e| NeuraMemoryError::Storage(e.to_string()))?;

        if changed == 0 {
            return Ok(None);
        }
        self.get_fact(fact_id, user_id).await
    }

    async fn delete_fact(&self, fact_id: &str, user_id: &str) -> Result<bool> {
        self.check_writable()?;
        let deleted = self
            .conn
            .execute(
                "DELETE FROM user_memories WHERE id = ?1 AND user_id = ?2",
                params![fact_id, user_id],
            )
            .await
            .map_err(|e| NeuraMemoryError::Storage(e.to_string()))?;
        Ok(deleted > 0)
    }
}

#[async_trait]
impl VectorIndex for Storage {
    async fn store_embedding(
        &self,
        user_id: &str,
        text: &str,
        embedding: &[f32],
        metadata: &EmbeddingMetadata,
    ) -> Result<String> {
        self.check_writable()?;
        let id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let embedding_json = serde_json::to_string(embedding)
            .map_err(|e| NeuraMemoryError::Storage(format!("encode embedding: {e}")))?;
        let metadata_json = serde_json::to_string(metadata)
            .map_err(|e| NeuraMemoryError::Storage(format!("encode metadata: {e}")))?;

        self.conn
            .execute(
                "INSERT INTO memory_embeddings (id, user_id, content, embedding, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id.as_str(),
                    user_id,
                    text,
                    embedding_json.as_str(),
                    metadata_json.as_str(),
                    now.as_str(),
                ],
            )
            .await
            .map_err(|e| NeuraMemoryError::Storage(e.to_string()))?;
        Ok(id)
    }

    async fn search_similar(
        &self,
        user_id: &str,
        query_embedding: &[f32],
        limit: usize,
        match_threshold: f32,
    ) -> Result<Vec<VectorMatch>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, content, embedding, metadata FROM memory_embeddings WHERE user_id = ?1",
                params![user_id],
            )
            .await
            .map_err(|e| NeuraMemoryError::Storage(e.to_string()))?;

        let mut matches = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let id: String = row
                .get(0)
                .map_err(|e| NeuraMemoryError::Storage(e.to_string()))?;
            let content: String = row
                .get(1)
                .map_err(|e| NeuraMemoryError::Storage(e.to_string()))?;
            let embedding_json: String = row
                .get(2)
                .map_err(|e| NeuraMemoryError::Storage(e.to_string()))?;
            let embedding: Vec<f32> = serde_json::from_str(&embedding_json)
                .map_err(|e| NeuraMemoryError::Storage(format!("decode embedding {id}: {e}")))?;

            let Some(similarity) = cosine_similarity(query_embedding, &embedding) else {
                tracing::debug!(%id, "skipping embedding with mismatched dimensions");
                continue;
            };
            if similarity < match_threshold {
                continue;
            }

            let metadata = row
                .get::<String>(3)
                .ok()
                .and_then(|json| serde_json::from_str::<EmbeddingMetadata>(&json).ok());

            matches.push(VectorMatch {
                id,
                content,
                metadata,
                similarity,
            });
        }

        matches.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        matches.truncate(limit);
        Ok(matches)
    }

    async fn embeddings_for_fact(&self, user_id: &str, fact_id: &str) -> Result<Vec<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id FROM memory_embeddings
                 WHERE user_id = ?1 AND json_extract(metadata, '$.fact_id') = ?2",
                params![user_id, fact_id],
            )
            .await
            .map_err(|e| NeuraMemoryError::Storage(e.to_string()))?;

        let mut ids = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            ids.push(
                row.get::<String>(0)
                    .map_err(|e| NeuraMemoryError::Storage(e.to_string()))?,
            );
        }
        Ok(ids)
    }

    async fn delete_embeddings(&self, user_id: &str, ids: &[String]) -> Result<bool> {
        self.check_writable()?;
        let mut deleted = 0;
        for id in ids {
            deleted += self
                .conn
                .execute(
                    "DELETE FROM memory_embeddings WHERE id = ?1 AND user_id = ?2",
                    params![id.as_str(), user_id],
                )
                .await
                .map_err(|e| NeuraMemoryError::Storage(e.to_string()))?;
        }
        Ok(deleted > 0)
    }
}

/// Cosine similarity, or `None` when dimensions differ or a vector is zero.
fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let (mut dot, mut norm_a, mut norm_b) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some(dot / (norm_a.sqrt() * norm_b.sqrt()))
}

/// Convert a database row to a [`MemoryFact`].
fn row_to_fact(row: &libsql::Row) -> Result<MemoryFact> {
    let category: String = row
        .get(2)
        .map_err(|e| NeuraMemoryError::Storage(e.to_string()))?;
    Ok(MemoryFact {
        id: Some(
            row.get::<String>(0)
                .map_err(|e| NeuraMemoryError::Storage(e.to_string()))?,
        ),
        user_id: row
            .get::<String>(1)
            .map_err(|e| NeuraMemoryError::Storage(e.to_string()))?,
        category: category
            .parse()
            .map_err(|e: NeuraMemoryError| NeuraMemoryError::Storage(e.to_string()))?,
        importance: row
            .get::<f64>(3)
            .map_err(|e| NeuraMemoryError::Storage(e.to_string()))?,
        key: row
            .get::<String>(4)
            .map_err(|e| NeuraMemoryError::Storage(e.to_string()))?,
        value: row
            .get::<String>(5)
            .map_err(|e| NeuraMemoryError::Storage(e.to_string()))?,
        context: row.get::<String>(6).ok(),
        created_at: Some(parse_timestamp(row, 7)?),
        updated_at: Some(parse_timestamp(row, 8)?),
    })
}

fn parse_timestamp(row: &libsql::Row, idx: i32) -> Result<DateTime<Utc>> {
    let s: String = row
        .get(idx)
        .map_err(|e| NeuraMemoryError::Storage(e.to_string()))?;
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| NeuraMemoryError::Storage(format!("invalid date: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Create a temp file storage for testing.
    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("nm_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn fact(user_id: &str, category: MemoryType, key: &str, value: &str) -> MemoryFact {
        MemoryFact {
            id: None,
            user_id: user_id.into(),
            category,
            importance: 0.8,
            key: key.into(),
            value: value.into(),
            context: Some("Q: hi\nA:".into()),
            created_at: None,
            updated_at: None,
        }
    }

    fn metadata(key: &str) -> EmbeddingMetadata {
        EmbeddingMetadata {
            category: MemoryType::Project,
            key: key.into(),
            importance: 0.8,
            fact_id: None,
        }
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        let version = storage.get_schema_version().await;
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("nm_test_{}.db", Uuid::now_v7()));
        let _s1 = Storage::open(&tmp).await.expect("first open");
        drop(_s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn store_assigns_id_and_timestamps() {
        let storage = test_storage().await;
        let stored = storage
            .store_fact(fact("u1", MemoryType::Personal, "name", "Sarah"))
            .await
            .expect("store fact");

        let id = stored.id.clone().expect("id assigned");
        assert!(stored.created_at.is_some());

        let loaded = storage.get_fact(&id, "u1").await.unwrap().expect("found");
        assert_eq!(loaded.key, "name");
        assert_eq!(loaded.category, MemoryType::Personal);
        assert_eq!(loaded.context.as_deref(), Some("Q: hi\nA:"));

        // Other users cannot see it.
        assert!(storage.get_fact(&id, "u2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_facts_filters_by_user_and_category() {
        let storage = test_storage().await;
        for f in [
            fact("u1", MemoryType::Project, "project_a", "A"),
            fact("u1", MemoryType::Project, "project_b", "B"),
            fact("u1", MemoryType::Preference, "favorite_game", "Valorant"),
            fact("u2", MemoryType::Project, "project_c", "C"),
        ] {
            storage.store_fact(f).await.unwrap();
        }

        let projects = storage
            .get_facts("u1", Some(MemoryType::Project), 50)
            .await
            .unwrap();
        let keys: Vec<_> = projects.iter().map(|f| f.key.as_str()).collect();
        assert_eq!(keys, ["project_b", "project_a"]);

        let all = storage.get_facts("u1", None, 2).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn update_and_delete_fact() {
        let storage = test_storage().await;
        let stored = storage
            .store_fact(fact("u1", MemoryType::Project, "project_a", "A"))
            .await
            .unwrap();
        let id = stored.id.unwrap();

        let update = FactUpdate {
            value: Some("A, now with billing".into()),
            importance: Some(0.95),
            ..Default::default()
        };
        let updated = storage
            .update_fact(&id, "u1", &update)
            .await
            .unwrap()
            .expect("updated");
        assert_eq!(updated.value, "A, now with billing");
        assert_eq!(updated.key, "project_a");
        assert!((updated.importance - 0.95).abs() < 1e-9);

        assert!(
            storage
                .update_fact(&id, "u2", &update)
                .await
                .unwrap()
                .is_none()
        );

        assert!(!storage.delete_fact(&id, "u2").await.unwrap());
        assert!(storage.delete_fact(&id, "u1").await.unwrap());
        assert!(storage.get_fact(&id, "u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn similarity_search_ranks_and_thresholds() {
        let storage = test_storage().await;
        storage
            .store_embedding("u1", "project_a: A", &[1.0, 0.0, 0.0], &metadata("project_a"))
            .await
            .unwrap();
        storage
            .store_embedding("u1", "project_b: B", &[0.8, 0.6, 0.0], &metadata("project_b"))
            .await
            .unwrap();
        storage
            .store_embedding("u1", "unrelated", &[0.0, 0.0, 1.0], &metadata("other"))
            .await
            .unwrap();
        storage
            .store_embedding("u2", "project_z: Z", &[1.0, 0.0, 0.0], &metadata("project_z"))
            .await
            .unwrap();

        let matches = storage
            .search_similar("u1", &[1.0, 0.0, 0.0], 5, 0.6)
            .await
            .unwrap();
        let keys: Vec<_> = matches
            .iter()
            .map(|m| m.metadata.as_ref().unwrap().key.as_str())
            .collect();
        assert_eq!(keys, ["project_a", "project_b"]);
        assert!(matches[0].similarity > matches[1].similarity);

        let limited = storage
            .search_similar("u1", &[1.0, 0.0, 0.0], 1, 0.0)
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn embeddings_are_found_and_deleted_per_user() {
        let storage = test_storage().await;
        let meta = EmbeddingMetadata {
            fact_id: Some("f1".into()),
            ..metadata("name")
        };
        let id = storage
            .store_embedding("u1", "name: Sarah", &[0.5, 0.5], &meta)
            .await
            .unwrap();

        assert!(storage.embeddings_for_fact("u2", "f1").await.unwrap().is_empty());
        assert!(!storage.delete_embeddings("u2", &[id.clone()]).await.unwrap());
        assert_eq!(
            storage.embeddings_for_fact("u1", "f1").await.unwrap(),
            vec![id.clone()]
        );
        assert!(storage.delete_embeddings("u1", &[id]).await.unwrap());
        assert!(storage.embeddings_for_fact("u1", "f1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn forgetting_a_fact_drops_its_embedding() {
        let storage = test_storage().await;
        let stored = storage
            .store_fact(fact("u1", MemoryType::Personal, "name", "Sarah"))
            .await
            .unwrap();
        let fact_id = stored.id.clone().unwrap();
        storage
            .store_embedding(
                "u1",
                "name: Sarah",
                &[1.0, 0.0],
                &EmbeddingMetadata {
                    fact_id: Some(fact_id.clone()),
                    ..metadata("name")
                },
            )
            .await
            .unwrap();

        assert!(!neuramemory_core::forget_fact(&storage, &storage, "u2", &fact_id).await.unwrap());
        assert!(neuramemory_core::forget_fact(&storage, &storage, "u1", &fact_id).await.unwrap());

        assert!(storage.get_fact(&fact_id, "u1").await.unwrap().is_none());
        let hits = storage.search_similar("u1", &[1.0, 0.0], 5, 0.0).await.unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn cosine_handles_degenerate_vectors() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), None);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), None);
        let sim = cosine_similarity(&[1.0, 1.0], &[1.0, 1.0]).unwrap();
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("nm_test_{}.db", Uuid::now_v7()));
        let rw = Storage::open(&tmp).await.unwrap();
        rw.store_fact(fact("u1", MemoryType::Personal, "name", "Sarah"))
            .await
            .unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.unwrap();
        let facts = ro.get_facts("u1", None, 10).await.unwrap();
        assert_eq!(facts.len(), 1);

        let result = ro
            .store_fact(fact("u1", MemoryType::Personal, "age", "30"))
            .await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));
    }
}
