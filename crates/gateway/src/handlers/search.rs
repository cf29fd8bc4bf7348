//! Search handlers

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use validator::Validate;

use super::{TextbookId, ValidatedJson};
use crate::AppState;
use textbook_rag_common::{auth::CallerIdentity, errors::Result};
use textbook_rag_search::RetrievedChunk;

/// Similarity search request
#[derive(Debug, Deserialize, Validate)]
pub struct SearchRequest {
    /// Query embedding produced by the same model as the chunk embeddings
    #[validate(length(min = 1, message = "embedding must not be empty"))]
    pub embedding: Vec<f32>,

    /// Maximum results to return
    #[serde(default)]
    pub top_k: Option<i64>,
}

/// Search response
#[derive(Serialize)]
pub struct SearchResponse {
    pub textbook_id: i64,
    pub results: Vec<RetrievedChunk>,
}

/// Rank a textbook's chunks against a query embedding
pub async fn search(
    State(state): State<AppState>,
    caller: CallerIdentity,
    TextbookId(id): TextbookId,
    ValidatedJson(request): ValidatedJson<SearchRequest>,
) -> Result<Json<SearchResponse>> {
    let start = Instant::now();

    let top_k = request
        .top_k
        .unwrap_or(state.config.retrieval.default_top_k);

    let results: Vec<RetrievedChunk> = state
        .service
        .search(caller, id, request.embedding, top_k)
        .await
        .map_err(|e| state.present(e, id))?
        .into_iter()
        .map(RetrievedChunk::from)
        .collect();

    tracing::info!(
        textbook_id = id,
        user_id = caller.user_id,
        top_k,
        results = results.len(),
        latency_ms = start.elapsed().as_millis() as u64,
        "Search completed"
    );

    Ok(Json(SearchResponse {
        textbook_id: id,
        results,
    }))
}
