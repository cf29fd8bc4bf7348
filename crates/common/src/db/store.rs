//! Storage capabilities consumed by the retrieval layer
//!
//! Each engine (Postgres, in-memory) implements all three traits. Components
//! receive them as `Arc<dyn ...>` at construction time.

use async_trait::async_trait;

use crate::db::models::{Chunk, NewChunk, NewTextbook, ScoredChunk, Textbook};
use crate::errors::Result;
use crate::vector::Embedding;

/// Textbook records and their ownership-checked lifecycle
#[async_trait]
pub trait TextbookStore: Send + Sync {
    /// Persist a textbook handed over by ingestion
    async fn create_textbook(&self, textbook: NewTextbook) -> Result<Textbook>;

    /// Load a textbook, `TextbookNotFound` when absent
    async fn get_textbook(&self, id: i64) -> Result<Textbook>;

    /// Textbooks owned by `user_id`, most recently uploaded first
    async fn list_textbooks(&self, user_id: i64) -> Result<Vec<Textbook>>;

    /// Flip the processed flag once ingestion has written every chunk
    async fn mark_processed(&self, id: i64) -> Result<()>;

    /// Delete a textbook and all of its chunks as one unit.
    ///
    /// `TextbookNotFound` when absent, `Forbidden` when `requesting_user_id` is not
    /// the owner. Nothing is removed unless both steps succeed.
    async fn delete_textbook(&self, id: i64, requesting_user_id: i64) -> Result<()>;

    /// Connectivity check for readiness probes
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Read and write access to committed chunk rows
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Insert all chunks of a textbook atomically, returning their ids
    async fn insert_chunks(&self, textbook_id: i64, chunks: Vec<NewChunk>) -> Result<Vec<i64>>;

    /// Number of committed chunks for a textbook
    async fn count_chunks(&self, textbook_id: i64) -> Result<i64>;

    /// Chunks of a textbook in `chunk_index` order, without embeddings
    async fn list_chunks(&self, textbook_id: i64) -> Result<Vec<Chunk>>;
}

/// Nearest-neighbour ranking over chunk embeddings of one textbook
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Up to `limit` chunks of `textbook_id`, ascending cosine distance to
    /// `query`, ties broken by ascending `chunk_index`
    async fn nearest_chunks(
        &self,
        textbook_id: i64,
        query: &Embedding,
        limit: u64,
    ) -> Result<Vec<ScoredChunk>>;
}
