//! Ownership-checked textbook operations
//!
//! Every operation resolves the textbook first and compares its owner with
//! the caller before any chunk data is read. The service keeps no state of
//! its own beyond the injected storage capabilities.

use crate::retrieval::VectorRetriever;
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use textbook_rag_common::auth::CallerIdentity;
use textbook_rag_common::config::AppConfig;
use textbook_rag_common::db::models::{Chunk, ScoredChunk, Textbook};
use textbook_rag_common::db::{ChunkStore, Storage, TextbookStore};
use textbook_rag_common::errors::{AppError, Result};
use textbook_rag_common::metrics;
use tracing::{info, instrument, warn};

/// Processing status of one textbook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextbookStatus {
    pub textbook_id: i64,
    pub title: String,
    pub processed: bool,
    /// Committed chunks; 0 when counting failed
    pub chunk_count: i64,
    pub uploaded_at: DateTime<FixedOffset>,
}

/// Retrieval and status operations on behalf of a caller
#[derive(Clone)]
pub struct TextbookService {
    textbooks: Arc<dyn TextbookStore>,
    chunks: Arc<dyn ChunkStore>,
    retriever: VectorRetriever,
}

impl TextbookService {
    pub fn new(
        textbooks: Arc<dyn TextbookStore>,
        chunks: Arc<dyn ChunkStore>,
        retriever: VectorRetriever,
    ) -> Self {
        Self {
            textbooks,
            chunks,
            retriever,
        }
    }

    /// Wire the service to every capability of one storage engine
    pub fn from_storage(storage: &Storage, config: &AppConfig) -> Self {
        Self::new(
            storage.textbooks.clone(),
            storage.chunks.clone(),
            VectorRetriever::from_config(storage.index.clone(), config),
        )
    }

    /// Load a textbook and require the caller to own it
    async fn owned_textbook(&self, caller: CallerIdentity, textbook_id: i64) -> Result<Textbook> {
        let textbook = self.textbooks.get_textbook(textbook_id).await?;
        if !textbook.is_owned_by(caller.user_id) {
            warn!(
                textbook_id,
                user_id = caller.user_id,
                owner_id = textbook.user_id,
                "Textbook access denied"
            );
            return Err(AppError::not_owner(textbook_id));
        }
        Ok(textbook)
    }

    /// Chunks of an owned textbook nearest to `query_embedding`
    #[instrument(skip(self, query_embedding), fields(user_id = caller.user_id))]
    pub async fn search(
        &self,
        caller: CallerIdentity,
        textbook_id: i64,
        query_embedding: Vec<f32>,
        top_k: i64,
    ) -> Result<Vec<ScoredChunk>> {
        self.owned_textbook(caller, textbook_id).await?;
        self.retriever
            .search_similar_chunks(textbook_id, query_embedding, top_k)
            .await
    }

    /// Processing status of an owned textbook.
    ///
    /// A failed chunk count is logged and reported as zero instead of failing
    /// the request.
    #[instrument(skip(self), fields(user_id = caller.user_id))]
    pub async fn status(&self, caller: CallerIdentity, textbook_id: i64) -> Result<TextbookStatus> {
        let textbook = self.owned_textbook(caller, textbook_id).await?;

        let chunk_count = match self.chunks.count_chunks(textbook_id).await {
            Ok(count) => count,
            Err(e) => {
                warn!(textbook_id, error = %e, "Chunk count unavailable, reporting 0");
                metrics::record_degraded_status();
                0
            }
        };

        Ok(TextbookStatus {
            textbook_id: textbook.id,
            title: textbook.title,
            processed: textbook.processed,
            chunk_count,
            uploaded_at: textbook.uploaded_at,
        })
    }

    /// One owned textbook
    #[instrument(skip(self), fields(user_id = caller.user_id))]
    pub async fn get_textbook(&self, caller: CallerIdentity, textbook_id: i64) -> Result<Textbook> {
        self.owned_textbook(caller, textbook_id).await
    }

    /// Every textbook the caller owns, most recent upload first
    #[instrument(skip(self), fields(user_id = caller.user_id))]
    pub async fn list_textbooks(&self, caller: CallerIdentity) -> Result<Vec<Textbook>> {
        self.textbooks.list_textbooks(caller.user_id).await
    }

    /// Chunks of an owned textbook in reading order
    #[instrument(skip(self), fields(user_id = caller.user_id))]
    pub async fn list_chunks(&self, caller: CallerIdentity, textbook_id: i64) -> Result<Vec<Chunk>> {
        self.owned_textbook(caller, textbook_id).await?;
        self.chunks.list_chunks(textbook_id).await
    }

    /// Delete an owned textbook together with all of its chunks
    #[instrument(skip(self), fields(user_id = caller.user_id))]
    pub async fn delete_textbook(&self, caller: CallerIdentity, textbook_id: i64) -> Result<()> {
        // Ownership is re-checked inside the store's transaction
        self.textbooks
            .delete_textbook(textbook_id, caller.user_id)
            .await
            .inspect_err(|e| {
                if e.is_storage_error() {
                    metrics::record_storage_error("delete_textbook");
                }
            })?;

        metrics::record_deletion();
        info!(textbook_id, user_id = caller.user_id, "Textbook deleted");
        Ok(())
    }
}
