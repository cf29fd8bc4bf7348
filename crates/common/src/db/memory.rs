//! In-memory storage engine
//!
//! Implements the same contracts as the Postgres repository with a single
//! `RwLock` around all state, so every write (chunk batches, cascading
//! deletes) is atomic with respect to readers.

use crate::db::models::{Chunk, NewChunk, NewTextbook, ScoredChunk, Textbook};
use crate::db::store::{ChunkStore, TextbookStore, VectorIndex};
use crate::errors::{AppError, Result};
use crate::vector::{compare_distance, cosine_distance, Embedding};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use tokio::sync::RwLock;
use tracing::info;

struct StoredChunk {
    chunk: Chunk,
    embedding: Vec<f32>,
}

#[derive(Default)]
struct Inner {
    next_textbook_id: i64,
    next_chunk_id: i64,
    textbooks: BTreeMap<i64, Textbook>,
    /// Chunks keyed by textbook id
    chunks: BTreeMap<i64, Vec<StoredChunk>>,
}

/// Process-local engine for development and tests
pub struct MemoryStore {
    dimension: usize,
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }
}

#[async_trait]
impl TextbookStore for MemoryStore {
    async fn create_textbook(&self, textbook: NewTextbook) -> Result<Textbook> {
        let mut inner = self.inner.write().await;
        inner.next_textbook_id += 1;

        let model = Textbook {
            id: inner.next_textbook_id,
            user_id: textbook.user_id,
            title: textbook.title,
            s3_key: textbook.s3_key,
            uploaded_at: chrono::Utc::now().into(),
            processed: textbook.processed,
        };
        inner.textbooks.insert(model.id, model.clone());
        Ok(model)
    }

    async fn get_textbook(&self, id: i64) -> Result<Textbook> {
        self.inner
            .read()
            .await
            .textbooks
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::textbook_not_found(id))
    }

    async fn list_textbooks(&self, user_id: i64) -> Result<Vec<Textbook>> {
        let inner = self.inner.read().await;
        let mut textbooks: Vec<Textbook> = inner
            .textbooks
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();

        textbooks.sort_by(|a, b| {
            b.uploaded_at
                .cmp(&a.uploaded_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(textbooks)
    }

    async fn mark_processed(&self, id: i64) -> Result<()> {
        let mut inner = self.inner.write().await;
        let textbook = inner
            .textbooks
            .get_mut(&id)
            .ok_or_else(|| AppError::textbook_not_found(id))?;
        textbook.processed = true;
        Ok(())
    }

    async fn delete_textbook(&self, id: i64, requesting_user_id: i64) -> Result<()> {
        let mut inner = self.inner.write().await;

        let textbook = inner
            .textbooks
            .get(&id)
            .ok_or_else(|| AppError::textbook_not_found(id))?;
        if !textbook.is_owned_by(requesting_user_id) {
            return Err(AppError::not_owner(id));
        }

        let chunks_deleted = inner.chunks.remove(&id).map_or(0, |c| c.len());
        inner.textbooks.remove(&id);

        info!(textbook_id = id, chunks_deleted, "Textbook and chunks deleted");
        Ok(())
    }
}

#[async_trait]
impl ChunkStore for MemoryStore {
    async fn insert_chunks(&self, textbook_id: i64, chunks: Vec<NewChunk>) -> Result<Vec<i64>> {
        let mut inner = self.inner.write().await;
        if !inner.textbooks.contains_key(&textbook_id) {
            return Err(AppError::textbook_not_found(textbook_id));
        }

        // Validate the whole batch before touching state
        let mut taken: HashSet<i32> = inner
            .chunks
            .get(&textbook_id)
            .map(|existing| existing.iter().map(|c| c.chunk.chunk_index).collect())
            .unwrap_or_default();
        let mut validated = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            if !taken.insert(chunk.chunk_index) {
                return Err(AppError::Conflict {
                    message: format!(
                        "chunk_index {} already exists for textbook {}",
                        chunk.chunk_index, textbook_id
                    ),
                });
            }
            let embedding = Embedding::new(chunk.embedding, self.dimension)?;
            validated.push((chunk.content, chunk.page_number, chunk.chunk_index, embedding));
        }

        let now: chrono::DateTime<chrono::FixedOffset> = chrono::Utc::now().into();
        let mut ids = Vec::with_capacity(validated.len());
        let mut stored = Vec::with_capacity(validated.len());
        for (content, page_number, chunk_index, embedding) in validated {
            inner.next_chunk_id += 1;
            let id = inner.next_chunk_id;
            ids.push(id);
            stored.push(StoredChunk {
                chunk: Chunk {
                    id,
                    textbook_id,
                    content,
                    page_number,
                    chunk_index,
                    created_at: now,
                },
                embedding: embedding.as_slice().to_vec(),
            });
        }
        inner.chunks.entry(textbook_id).or_default().extend(stored);

        Ok(ids)
    }

    async fn count_chunks(&self, textbook_id: i64) -> Result<i64> {
        let inner = self.inner.read().await;
        Ok(inner.chunks.get(&textbook_id).map_or(0, |c| c.len() as i64))
    }

    async fn list_chunks(&self, textbook_id: i64) -> Result<Vec<Chunk>> {
        let inner = self.inner.read().await;
        let mut chunks: Vec<Chunk> = inner
            .chunks
            .get(&textbook_id)
            .map(|c| c.iter().map(|s| s.chunk.clone()).collect())
            .unwrap_or_default();
        chunks.sort_by_key(|c| c.chunk_index);
        Ok(chunks)
    }
}

#[async_trait]
impl VectorIndex for MemoryStore {
    async fn nearest_chunks(
        &self,
        textbook_id: i64,
        query: &Embedding,
        limit: u64,
    ) -> Result<Vec<ScoredChunk>> {
        let inner = self.inner.read().await;
        let Some(chunks) = inner.chunks.get(&textbook_id) else {
            return Ok(Vec::new());
        };

        let mut scored: Vec<ScoredChunk> = chunks
            .iter()
            .map(|s| ScoredChunk {
                chunk: s.chunk.clone(),
                distance: cosine_distance(query.as_slice(), &s.embedding),
            })
            .collect();

        scored.sort_by(|a, b| {
            compare_distance(a.distance, b.distance)
                .then_with(|| a.chunk.chunk_index.cmp(&b.chunk.chunk_index))
        });
        scored.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(scored)
    }
}
