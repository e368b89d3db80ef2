//! Reconstruction state store
//!
//! Holds the per-reconstruction image count, the single source of truth for
//! which step an ingested image triggers. The increment must be atomic per id:
//! two uploads racing on one reconstruction each get their own index.

use crate::error::{OrchestratorError, Result};
use crate::reconstruction::ReconstructionId;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sqlx::sqlite::SqlitePool;

/// Per-reconstruction image counter
#[async_trait]
pub trait ReconstructionStore: Send + Sync {
    /// Register a reconstruction with its first image (count = 1)
    async fn create(&self, id: &ReconstructionId) -> Result<()>;

    /// Atomically add one image and return the new count
    async fn increment_and_get(&self, id: &ReconstructionId) -> Result<u32>;

    /// Current image count
    async fn image_count(&self, id: &ReconstructionId) -> Result<u32>;
}

/// In-process store; each key is mutated under its DashMap shard lock
#[derive(Default)]
pub struct InMemoryReconstructionStore {
    counts: DashMap<ReconstructionId, u32>,
}

impl InMemoryReconstructionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReconstructionStore for InMemoryReconstructionStore {
    async fn create(&self, id: &ReconstructionId) -> Result<()> {
        match self.counts.entry(id.clone()) {
            Entry::Occupied(_) => Err(OrchestratorError::AlreadyExists(format!(
                "reconstruction {}",
                id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(1);
                Ok(())
            }
        }
    }

    async fn increment_and_get(&self, id: &ReconstructionId) -> Result<u32> {
        let mut count = self
            .counts
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::ReconstructionNotFound(id.to_string()))?;
        *count += 1;
        Ok(*count)
    }

    async fn image_count(&self, id: &ReconstructionId) -> Result<u32> {
        self.counts
            .get(id)
            .map(|count| *count)
            .ok_or_else(|| OrchestratorError::ReconstructionNotFound(id.to_string()))
    }
}

/// Durable store backed by the `reconstructions` table
pub struct SqliteReconstructionStore {
    pool: SqlitePool,
}

impl SqliteReconstructionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn to_count(raw: i64) -> Result<u32> {
        u32::try_from(raw)
            .map_err(|_| OrchestratorError::serialization(format!("Invalid image count: {}", raw)))
    }
}

#[async_trait]
impl ReconstructionStore for SqliteReconstructionStore {
    async fn create(&self, id: &ReconstructionId) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let inserted = sqlx::query(
            "INSERT INTO reconstructions (id, image_count, created_at, updated_at) VALUES (?1, 1, ?2, ?2)",
        )
        .bind(id.as_str())
        .bind(now.as_str())
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => Err(
                OrchestratorError::AlreadyExists(format!("reconstruction {}", id)),
            ),
            Err(e) => Err(e.into()),
        }
    }

    async fn increment_and_get(&self, id: &ReconstructionId) -> Result<u32> {
        // Single statement: SQLite serializes writers, so no read-modify-write race
        let row: Option<(i64,)> = sqlx::query_as(
            "UPDATE reconstructions SET image_count = image_count + 1, updated_at = ?1 WHERE id = ?2 RETURNING image_count",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((count,)) => Self::to_count(count),
            None => Err(OrchestratorError::ReconstructionNotFound(id.to_string())),
        }
    }

    async fn image_count(&self, id: &ReconstructionId) -> Result<u32> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT image_count FROM reconstructions WHERE id = ?1")
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((count,)) => Self::to_count(count),
            None => Err(OrchestratorError::ReconstructionNotFound(id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    async fn exercise_contract(store: Arc<dyn ReconstructionStore>) {
        let id = ReconstructionId::from("recon-a");

        store.create(&id).await.unwrap();
        assert_eq!(store.image_count(&id).await.unwrap(), 1);

        assert!(matches!(
            store.create(&id).await,
            Err(OrchestratorError::AlreadyExists(_))
        ));

        assert_eq!(store.increment_and_get(&id).await.unwrap(), 2);
        assert_eq!(store.increment_and_get(&id).await.unwrap(), 3);
        assert_eq!(store.image_count(&id).await.unwrap(), 3);

        let unknown = ReconstructionId::from("missing");
        assert!(matches!(
            store.increment_and_get(&unknown).await,
            Err(OrchestratorError::ReconstructionNotFound(_))
        ));
        assert!(matches!(
            store.image_count(&unknown).await,
            Err(OrchestratorError::ReconstructionNotFound(_))
        ));
    }

    async fn exercise_concurrent_increments(store: Arc<dyn ReconstructionStore>) {
        let id = ReconstructionId::from("recon-race");
        store.create(&id).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            let id = id.clone();
            tasks.push(tokio::spawn(
                async move { store.increment_and_get(&id).await },
            ));
        }

        let mut seen = HashSet::new();
        for task in futures::future::join_all(tasks).await {
            let count = task.unwrap().unwrap();
            assert!(seen.insert(count), "count {} handed out twice", count);
        }

        assert_eq!(seen, (2..=21).collect::<HashSet<u32>>());
        assert_eq!(store.image_count(&id).await.unwrap(), 21);
    }

    #[tokio::test]
    async fn test_in_memory_contract() {
        exercise_contract(Arc::new(InMemoryReconstructionStore::new())).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_in_memory_concurrent_increments() {
        exercise_concurrent_increments(Arc::new(InMemoryReconstructionStore::new())).await;
    }

    #[tokio::test]
    async fn test_sqlite_contract() {
        let pool = crate::db::connect("sqlite::memory:").await.unwrap();
        exercise_contract(Arc::new(SqliteReconstructionStore::new(pool))).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sqlite_concurrent_increments() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("state.db").display());
        let pool = crate::db::connect(&url).await.unwrap();
        exercise_concurrent_increments(Arc::new(SqliteReconstructionStore::new(pool))).await;
    }

    #[tokio::test]
    async fn test_sqlite_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("state.db").display());
        let id = ReconstructionId::from("durable");

        {
            let store = SqliteReconstructionStore::new(crate::db::connect(&url).await.unwrap());
            store.create(&id).await.unwrap();
            store.increment_and_get(&id).await.unwrap();
        }

        let reopened = SqliteReconstructionStore::new(crate::db::connect(&url).await.unwrap());
        assert_eq!(reopened.image_count(&id).await.unwrap(), 2);
    }
}
