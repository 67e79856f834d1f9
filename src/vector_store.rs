//! Per-guide chunk storage and cosine nearest-neighbour search.

use crate::db::{Database, DbError, NewChunk};
use crate::embedding::{check_dimensions, cosine_similarity, EmbeddingError, EmbeddingProvider};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum VectorStoreError {
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    #[error(transparent)]
    Db(#[from] DbError),
}

/// Text to embed, tied to the block it came from when there is one.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkInput {
    pub block_id: Option<String>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoredChunk {
    pub chunk_id: String,
    pub block_id: Option<String>,
    pub content: String,
    /// `1 - cosine_distance`.
    pub similarity: f32,
}

#[derive(Clone)]
pub struct VectorStore {
    db: Arc<Database>,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl VectorStore {
    pub fn new(db: Arc<Database>, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self { db, embedder }
    }

    pub fn dimensions(&self) -> usize {
        self.embedder.dimensions()
    }

    /// Embeds every input without writing anything. Any provider failure or
    /// wrong-sized vector fails the whole call.
    pub async fn embed_chunks(&self, inputs: &[ChunkInput]) -> Result<Vec<NewChunk>, VectorStoreError> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let texts: Vec<String> = inputs.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embedder.embed_batch(&texts).await?;
        if vectors.len() != inputs.len() {
            return Err(EmbeddingError::CountMismatch {
                requested: inputs.len(),
                returned: vectors.len(),
            }
            .into());
        }
        inputs
            .iter()
            .zip(vectors)
            .map(|(input, vector)| {
                Ok(NewChunk {
                    block_id: input.block_id.clone(),
                    content: input.text.clone(),
                    embedding: check_dimensions(vector, self.dimensions())?,
                })
            })
            .collect()
    }

    /// Embeds and stores chunks, replacing earlier chunks of the same blocks.
    pub async fn upsert_chunks(
        &self,
        guide_id: &str,
        inputs: &[ChunkInput],
    ) -> Result<Vec<String>, VectorStoreError> {
        let chunks = self.embed_chunks(inputs).await?;
        let ids = self.db.upsert_chunks(guide_id, &chunks)?;
        tracing::info!(guide_id, chunks = ids.len(), "stored guide chunks");
        Ok(ids)
    }

    pub fn delete_chunks_for_block(&self, block_id: &str) -> Result<usize, VectorStoreError> {
        Ok(self.db.delete_chunks_for_block(block_id)?)
    }

    pub fn delete_chunks_for_guide(&self, guide_id: &str) -> Result<usize, VectorStoreError> {
        Ok(self.db.delete_chunks_for_guide(guide_id)?)
    }

    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>, VectorStoreError> {
        let vector = self.embedder.embed(text).await?;
        Ok(check_dimensions(vector, self.dimensions())?)
    }

    /// The `limit` chunks of `guide_id` most similar to `query`, best first.
    /// Equal similarities are ordered by chunk id.
    pub fn search(
        &self,
        guide_id: &str,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<ScoredChunk>, VectorStoreError> {
        if query.len() != self.dimensions() {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.dimensions(),
                actual: query.len(),
            }
            .into());
        }

        let rows = self.db.chunk_rows(guide_id)?;
        let mut scored: Vec<ScoredChunk> = rows
            .into_iter()
            .filter(|row| {
                if row.embedding.len() != query.len() {
                    tracing::warn!(
                        chunk_id = %row.id,
                        stored = row.embedding.len(),
                        expected = query.len(),
                        "skipping chunk with stale embedding size"
                    );
                    return false;
                }
                true
            })
            .map(|row| ScoredChunk {
                similarity: cosine_similarity(query, &row.embedding),
                chunk_id: row.id,
                block_id: row.block_id,
                content: row.content,
            })
            .collect();

        scored.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        scored.truncate(limit);
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::BlockType;
    use crate::db::{BlockWrite, NewGuide};
    use crate::testing::FakeEmbedder;

    fn store() -> (VectorStore, Arc<Database>) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let embedder = FakeEmbedder::new(4)
            .with_rule("체크인", [1.0, 0.0, 0.0, 0.0])
            .with_rule("와이파이", [0.0, 1.0, 0.0, 0.0])
            .with_rule("주차", [0.0, 0.0, 1.0, 0.0]);
        (VectorStore::new(db.clone(), Arc::new(embedder)), db)
    }

    fn guide(db: &Database, slug: &str, block_ids: &[&str]) -> String {
        let guide = db
            .create_guide(&NewGuide {
                user_id: "host".into(),
                slug: slug.into(),
                title: slug.into(),
                accommodation_name: None,
            })
            .unwrap();
        let blocks: Vec<BlockWrite> = block_ids
            .iter()
            .map(|id| BlockWrite {
                id: id.to_string(),
                block_type: BlockType::Notice,
                content: serde_json::json!({}),
                is_visible: true,
            })
            .collect();
        db.replace_blocks(&guide.id, &blocks, &[], &[]).unwrap();
        guide.id
    }

    fn input(block_id: &str, text: &str) -> ChunkInput {
        ChunkInput {
            block_id: Some(block_id.into()),
            text: text.into(),
        }
    }

    #[tokio::test]
    async fn search_orders_by_similarity() {
        let (store, db) = store();
        let g = guide(&db, "g", &["b1", "b2", "b3"]);
        store
            .upsert_chunks(
                &g,
                &[
                    input("b1", "체크인 15:00"),
                    input("b2", "와이파이 roomy / 1234"),
                    input("b3", "주차 가능"),
                ],
            )
            .await
            .unwrap();

        let query = store.embed_query("와이파이 비번").await.unwrap();
        let results = store.search(&g, &query, 2).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].block_id.as_deref(), Some("b2"));
        assert!((results[0].similarity - 1.0).abs() < 1e-6);
        assert!(results[0].similarity >= results[1].similarity);
    }

    #[tokio::test]
    async fn search_never_crosses_guides() {
        let (store, db) = store();
        let a = guide(&db, "a", &["a1"]);
        let b = guide(&db, "b", &["b1"]);
        store.upsert_chunks(&a, &[input("a1", "체크인 15:00")]).await.unwrap();
        store.upsert_chunks(&b, &[input("b1", "체크인 15:00")]).await.unwrap();

        let query = store.embed_query("체크인").await.unwrap();
        let results = store.search(&a, &query, 10).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].block_id.as_deref(), Some("a1"));
    }

    #[tokio::test]
    async fn wrong_sized_vectors_fail_at_write() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let g = guide(&db, "g", &["b1"]);
        let store = VectorStore::new(db.clone(), Arc::new(FakeEmbedder::new(4).reporting_dimensions(8)));

        let err = store.upsert_chunks(&g, &[input("b1", "text")]).await.unwrap_err();
        assert!(matches!(
            err,
            VectorStoreError::Embedding(EmbeddingError::DimensionMismatch { expected: 8, actual: 4 })
        ));
        assert!(db.list_chunks(&g).unwrap().is_empty());
    }

    #[tokio::test]
    async fn embedding_failure_writes_nothing() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let g = guide(&db, "g", &["b1"]);
        let store = VectorStore::new(db.clone(), Arc::new(FakeEmbedder::new(4).failing()));

        let err = store.upsert_chunks(&g, &[input("b1", "text")]).await.unwrap_err();
        assert!(matches!(err, VectorStoreError::Embedding(EmbeddingError::Api { .. })));
        assert!(db.list_chunks(&g).unwrap().is_empty());
    }

    #[tokio::test]
    async fn deletes_are_scoped() {
        let (store, db) = store();
        let g = guide(&db, "g", &["b1", "b2"]);
        store
            .upsert_chunks(&g, &[input("b1", "체크인"), input("b2", "주차")])
            .await
            .unwrap();
        assert_eq!(store.delete_chunks_for_block("b1").unwrap(), 1);
        assert_eq!(db.list_chunks(&g).unwrap().len(), 1);
        assert_eq!(store.delete_chunks_for_guide(&g).unwrap(), 1);
        assert!(db.list_chunks(&g).unwrap().is_empty());
    }

    #[test]
    fn query_dimension_mismatch_is_an_error() {
        let (store, _) = store();
        assert!(store.search("any", &[1.0, 0.0], 5).is_err());
    }
}
