//! Vector index backends.
//!
//! An index stores embedded chunks per partition and answers k-nearest
//! queries by cosine distance.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use deadpool_postgres::Pool;
use pgvector::Vector;

use super::embeddings::cosine_similarity;
use crate::error::{DatabaseError, RetrievalError};

/// A stored chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRecord {
    pub id: String,
    pub content_id: i64,
    pub chunk_index: usize,
    pub title: String,
    pub text: String,
    pub metadata: serde_json::Value,
    pub embedding: Vec<f32>,
}

/// Backend holding the embedded chunks.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn ensure_partition(&self, partition: &str) -> Result<(), RetrievalError>;

    /// Replace every chunk of `content_id` with `chunks`.
    async fn replace_content(
        &self,
        partition: &str,
        content_id: i64,
        chunks: Vec<ChunkRecord>,
    ) -> Result<(), RetrievalError>;

    /// Remove every chunk of `content_id`, returning how many were removed.
    async fn delete_content(&self, partition: &str, content_id: i64)
    -> Result<u64, RetrievalError>;

    /// The `top_k` nearest chunks with their cosine distance, closest first.
    async fn nearest(
        &self,
        partition: &str,
        query: &[f32],
        top_k: usize,
        content_id: Option<i64>,
    ) -> Result<Vec<(ChunkRecord, f32)>, RetrievalError>;

    /// Every chunk in the partition ordered by content id then chunk index.
    async fn list_chunks(&self, partition: &str) -> Result<Vec<ChunkRecord>, RetrievalError>;

    async fn health(&self) -> bool;
}

/// In-process index with brute-force cosine search.
pub struct InMemoryVectorIndex {
    partitions: RwLock<HashMap<String, BTreeMap<String, ChunkRecord>>>,
    available: AtomicBool,
}

impl Default for InMemoryVectorIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self {
            partitions: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Toggle the health probe, for exercising degraded mode.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), RetrievalError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RetrievalError::Unavailable(
                "in-memory index disabled".to_string(),
            ))
        }
    }

    fn poisoned() -> RetrievalError {
        RetrievalError::Unavailable("index lock poisoned".to_string())
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn ensure_partition(&self, partition: &str) -> Result<(), RetrievalError> {
        self.check()?;
        self.partitions
            .write()
            .map_err(|_| Self::poisoned())?
            .entry(partition.to_string())
            .or_default();
        Ok(())
    }

    async fn replace_content(
        &self,
        partition: &str,
        content_id: i64,
        chunks: Vec<ChunkRecord>,
    ) -> Result<(), RetrievalError> {
        self.check()?;
        let mut partitions = self.partitions.write().map_err(|_| Self::poisoned())?;
        let part = partitions.entry(partition.to_string()).or_default();
        part.retain(|_, c| c.content_id != content_id);
        for chunk in chunks {
            part.insert(chunk.id.clone(), chunk);
        }
        Ok(())
    }

    async fn delete_content(
        &self,
        partition: &str,
        content_id: i64,
    ) -> Result<u64, RetrievalError> {
        self.check()?;
        let mut partitions = self.partitions.write().map_err(|_| Self::poisoned())?;
        let Some(part) = partitions.get_mut(partition) else {
            return Ok(0);
        };
        let before = part.len();
        part.retain(|_, c| c.content_id != content_id);
        Ok((before - part.len()) as u64)
    }

    async fn nearest(
        &self,
        partition: &str,
        query: &[f32],
        top_k: usize,
        content_id: Option<i64>,
    ) -> Result<Vec<(ChunkRecord, f32)>, RetrievalError> {
        self.check()?;
        let partitions = self.partitions.read().map_err(|_| Self::poisoned())?;
        let Some(part) = partitions.get(partition) else {
            return Ok(Vec::new());
        };

        let mut scored: Vec<(ChunkRecord, f32)> = part
            .values()
            .filter(|c| content_id.is_none_or(|id| c.content_id == id))
            .map(|c| (c.clone(), 1.0 - cosine_similarity(query, &c.embedding)))
            .collect();
        scored.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.id.cmp(&b.0.id))
        });
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn list_chunks(&self, partition: &str) -> Result<Vec<ChunkRecord>, RetrievalError> {
        self.check()?;
        let partitions = self.partitions.read().map_err(|_| Self::poisoned())?;
        let mut chunks: Vec<ChunkRecord> = partitions
            .get(partition)
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default();
        chunks.sort_by_key(|c| (c.content_id, c.chunk_index));
        Ok(chunks)
    }

    async fn health(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}

/// pgvector-backed index sharing the relational store's pool.
pub struct PgVectorIndex {
    pool: Pool,
}

impl PgVectorIndex {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> Result<deadpool_postgres::Object, RetrievalError> {
        self.pool
            .get()
            .await
            .map_err(|e| RetrievalError::Database(DatabaseError::from(e)))
    }
}

fn row_to_chunk(row: &tokio_postgres::Row) -> ChunkRecord {
    let embedding: Vector = row.get("embedding");
    ChunkRecord {
        id: row.get("id"),
        content_id: row.get("content_id"),
        chunk_index: row.get::<_, i32>("chunk_index").max(0) as usize,
        title: row.get("title"),
        text: row.get("text"),
        metadata: row.get("metadata"),
        embedding: embedding.to_vec(),
    }
}

fn db_err(e: tokio_postgres::Error) -> RetrievalError {
    RetrievalError::Database(DatabaseError::from(e))
}

#[async_trait]
impl VectorIndex for PgVectorIndex {
    async fn ensure_partition(&self, _partition: &str) -> Result<(), RetrievalError> {
        // Partitions are a column in a shared table.
        Ok(())
    }

    async fn replace_content(
        &self,
        partition: &str,
        content_id: i64,
        chunks: Vec<ChunkRecord>,
    ) -> Result<(), RetrievalError> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await.map_err(db_err)?;

        tx.execute(
            "DELETE FROM retrieval_chunks WHERE partition_id = $1 AND content_id = $2",
            &[&partition, &content_id],
        )
        .await
        .map_err(db_err)?;

        for chunk in chunks {
            let embedding = Vector::from(chunk.embedding);
            tx.execute(
                r#"
                INSERT INTO retrieval_chunks
                    (id, partition_id, content_id, chunk_index, title, text, metadata, embedding)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
                &[
                    &chunk.id,
                    &partition,
                    &chunk.content_id,
                    &(chunk.chunk_index as i32),
                    &chunk.title,
                    &chunk.text,
                    &chunk.metadata,
                    &embedding,
                ],
            )
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)
    }

    async fn delete_content(
        &self,
        partition: &str,
        content_id: i64,
    ) -> Result<u64, RetrievalError> {
        let conn = self.conn().await?;
        conn.execute(
            "DELETE FROM retrieval_chunks WHERE partition_id = $1 AND content_id = $2",
            &[&partition, &content_id],
        )
        .await
        .map_err(db_err)
    }

    async fn nearest(
        &self,
        partition: &str,
        query: &[f32],
        top_k: usize,
        content_id: Option<i64>,
    ) -> Result<Vec<(ChunkRecord, f32)>, RetrievalError> {
        let conn = self.conn().await?;
        let query = Vector::from(query.to_vec());
        let rows = conn
            .query(
                r#"
                SELECT id, content_id, chunk_index, title, text, metadata, embedding,
                       (embedding <=> $2)::REAL AS distance
                FROM retrieval_chunks
                WHERE partition_id = $1 AND ($3::BIGINT IS NULL OR content_id = $3)
                ORDER BY embedding <=> $2, id
                LIMIT $4
                "#,
                &[&partition, &query, &content_id, &(top_k as i64)],
            )
            .await
            .map_err(db_err)?;

        Ok(rows
            .iter()
            .map(|row| (row_to_chunk(row), row.get::<_, f32>("distance")))
            .collect())
    }

    async fn list_chunks(&self, partition: &str) -> Result<Vec<ChunkRecord>, RetrievalError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT id, content_id, chunk_index, title, text, metadata, embedding \
                 FROM retrieval_chunks WHERE partition_id = $1 ORDER BY content_id, chunk_index",
                &[&partition],
            )
            .await
            .map_err(db_err)?;
        Ok(rows.iter().map(row_to_chunk).collect())
    }

    async fn health(&self) -> bool {
        match self.pool.get().await {
            Ok(conn) => conn.simple_query("SELECT 1").await.is_ok(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, content_id: i64, embedding: Vec<f32>) -> ChunkRecord {
        ChunkRecord {
            id: id.to_string(),
            content_id,
            chunk_index: 0,
            title: "t".to_string(),
            text: id.to_string(),
            metadata: serde_json::json!({}),
            embedding,
        }
    }

    #[tokio::test]
    async fn test_replace_overwrites_content_chunks() {
        let index = InMemoryVectorIndex::new();
        index
            .replace_content("p", 1, vec![chunk("a", 1, vec![1.0, 0.0]), chunk("b", 1, vec![0.0, 1.0])])
            .await
            .unwrap();
        index
            .replace_content("p", 1, vec![chunk("a", 1, vec![1.0, 0.0])])
            .await
            .unwrap();
        assert_eq!(index.list_chunks("p").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_nearest_orders_by_distance_and_filters() {
        let index = InMemoryVectorIndex::new();
        index
            .replace_content("p", 1, vec![chunk("near", 1, vec![1.0, 0.1])])
            .await
            .unwrap();
        index
            .replace_content("p", 2, vec![chunk("far", 2, vec![0.0, 1.0])])
            .await
            .unwrap();

        let hits = index.nearest("p", &[1.0, 0.0], 5, None).await.unwrap();
        assert_eq!(hits[0].0.id, "near");
        assert!(hits[0].1 < hits[1].1);

        let only_two = index.nearest("p", &[1.0, 0.0], 5, Some(2)).await.unwrap();
        assert_eq!(only_two.len(), 1);
        assert_eq!(only_two[0].0.id, "far");
    }

    #[tokio::test]
    async fn test_unavailable_index_errors() {
        let index = InMemoryVectorIndex::new();
        index.set_available(false);
        assert!(!index.health().await);
        assert!(matches!(
            index.nearest("p", &[1.0], 1, None).await,
            Err(RetrievalError::Unavailable(_))
        ));
    }
}
