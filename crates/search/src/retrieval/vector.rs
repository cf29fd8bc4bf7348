//! Vector similarity search
//!
//! Validates the query embedding and the requested result count, then hands
//! the ranking to whichever `VectorIndex` the deployment runs on.

use std::sync::Arc;
use std::time::Instant;
use textbook_rag_common::config::AppConfig;
use textbook_rag_common::db::models::ScoredChunk;
use textbook_rag_common::db::VectorIndex;
use textbook_rag_common::errors::Result;
use textbook_rag_common::metrics;
use textbook_rag_common::vector::Embedding;
use tracing::{debug, instrument};

/// Vector retriever over an injected index
#[derive(Clone)]
pub struct VectorRetriever {
    index: Arc<dyn VectorIndex>,
    dimension: usize,
    max_top_k: i64,
}

impl VectorRetriever {
    /// Create a new vector retriever
    pub fn new(index: Arc<dyn VectorIndex>, dimension: usize, max_top_k: i64) -> Self {
        Self {
            index,
            dimension,
            max_top_k,
        }
    }

    /// Retriever configured from `embedding.dimension` and `retrieval.max_top_k`
    pub fn from_config(index: Arc<dyn VectorIndex>, config: &AppConfig) -> Self {
        Self::new(index, config.embedding.dimension, config.retrieval.max_top_k)
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Up to `top_k` chunks of `textbook_id` nearest to `query_embedding`.
    ///
    /// Results are in ascending cosine distance with ties broken by ascending
    /// `chunk_index`. A non-positive `top_k` yields no results without
    /// consulting the index; larger values are capped at `max_top_k`.
    #[instrument(skip(self, query_embedding), fields(dimension = query_embedding.len()))]
    pub async fn search_similar_chunks(
        &self,
        textbook_id: i64,
        query_embedding: Vec<f32>,
        top_k: i64,
    ) -> Result<Vec<ScoredChunk>> {
        if top_k <= 0 {
            return Ok(Vec::new());
        }

        let query = Embedding::new(query_embedding, self.dimension)?;
        let limit = top_k.min(self.max_top_k) as u64;

        let start = Instant::now();
        let chunks = self
            .index
            .nearest_chunks(textbook_id, &query, limit)
            .await
            .inspect_err(|_| metrics::record_storage_error("nearest_chunks"))?;

        metrics::record_search(start.elapsed().as_secs_f64(), chunks.len());
        debug!(textbook_id, limit, returned = chunks.len(), "Similarity search complete");

        Ok(chunks)
    }
}
