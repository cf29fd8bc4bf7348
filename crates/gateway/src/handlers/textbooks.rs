//! Textbook management handlers

use axum::{extract::State, Json};
use serde::Serialize;

use super::TextbookId;
use crate::AppState;
use textbook_rag_common::{
    auth::CallerIdentity,
    db::models::{Chunk, Textbook},
    errors::Result,
};
use textbook_rag_search::TextbookStatus;

/// Confirmation returned after a delete
#[derive(Serialize)]
pub struct MessageResponse {
    pub message: String,
}

/// List the caller's textbooks
pub async fn list_textbooks(
    State(state): State<AppState>,
    caller: CallerIdentity,
) -> Result<Json<Vec<Textbook>>> {
    let textbooks = state.service.list_textbooks(caller).await?;
    Ok(Json(textbooks))
}

/// Get a textbook by ID
pub async fn get_textbook(
    State(state): State<AppState>,
    caller: CallerIdentity,
    TextbookId(id): TextbookId,
) -> Result<Json<Textbook>> {
    let textbook = state
        .service
        .get_textbook(caller, id)
        .await
        .map_err(|e| state.present(e, id))?;
    Ok(Json(textbook))
}

/// Delete a textbook and its chunks
pub async fn delete_textbook(
    State(state): State<AppState>,
    caller: CallerIdentity,
    TextbookId(id): TextbookId,
) -> Result<Json<MessageResponse>> {
    state
        .service
        .delete_textbook(caller, id)
        .await
        .map_err(|e| state.present(e, id))?;

    Ok(Json(MessageResponse {
        message: "Textbook deleted successfully".to_string(),
    }))
}

/// Processing status of a textbook
pub async fn textbook_status(
    State(state): State<AppState>,
    caller: CallerIdentity,
    TextbookId(id): TextbookId,
) -> Result<Json<TextbookStatus>> {
    let status = state
        .service
        .status(caller, id)
        .await
        .map_err(|e| state.present(e, id))?;
    Ok(Json(status))
}

/// Chunks of a textbook in reading order, without embeddings
pub async fn list_chunks(
    State(state): State<AppState>,
    caller: CallerIdentity,
    TextbookId(id): TextbookId,
) -> Result<Json<Vec<Chunk>>> {
    let chunks = state
        .service
        .list_chunks(caller, id)
        .await
        .map_err(|e| state.present(e, id))?;
    Ok(Json(chunks))
}
