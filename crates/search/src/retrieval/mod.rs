//! Similarity retrieval over textbook chunks
//!
//! Ranks the chunks of a single textbook by cosine distance between their
//! embeddings and a query embedding.

mod vector;

pub use vector::VectorRetriever;

use serde::{Deserialize, Serialize};
use textbook_rag_common::db::models::ScoredChunk;

/// Retrieved chunk with its distance to the query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    /// Chunk ID
    pub chunk_id: i64,

    /// Chunk content
    pub content: String,

    /// Source page within the textbook
    pub page_number: i32,

    /// Position of the chunk within the textbook
    pub chunk_index: i32,

    /// Cosine distance to the query (0.0 = same direction)
    pub distance: f64,
}

impl From<ScoredChunk> for RetrievedChunk {
    fn from(scored: ScoredChunk) -> Self {
        Self {
            chunk_id: scored.chunk.id,
            content: scored.chunk.content,
            page_number: scored.chunk.page_number,
            chunk_index: scored.chunk.chunk_index,
            distance: scored.distance,
        }
    }
}
