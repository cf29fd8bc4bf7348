//! API handlers module

pub mod health;
pub mod search;
pub mod textbooks;

use axum::extract::{FromRequest, FromRequestParts, Path, Request};
use axum::http::request::Parts;
use axum::Json;
use serde::de::DeserializeOwned;
use textbook_rag_common::errors::{AppError, Result};
use validator::Validate;

use crate::AppState;

/// Integer textbook id taken from the `{id}` path segment
#[derive(Debug, Clone, Copy)]
pub struct TextbookId(pub i64);

impl<S> FromRequestParts<S> for TextbookId
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self> {
        let Path(id) = Path::<i64>::from_request_parts(parts, state)
            .await
            .map_err(|e| AppError::Validation {
                message: format!("Invalid textbook ID: {}", e.body_text()),
                field: Some("id".to_string()),
            })?;
        Ok(TextbookId(id))
    }
}

/// JSON body that has been deserialized and validated.
///
/// Malformed or mistyped bodies and a missing `application/json` content type
/// are reported through the same error envelope as every other validation
/// failure instead of axum's plain-text rejection.
#[derive(Debug, Clone)]
pub struct ValidatedJson<T>(pub T);

impl<T, S> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|e| AppError::Validation {
                message: e.body_text(),
                field: Some("body".to_string()),
            })?;

        value.validate().map_err(|e| AppError::Validation {
            field: e.field_errors().keys().next().map(|k| k.to_string()),
            message: e.to_string(),
        })?;

        Ok(ValidatedJson(value))
    }
}

impl AppState {
    /// Apply the configured policy for reporting ownership violations
    pub fn present(&self, err: AppError, textbook_id: i64) -> AppError {
        if self.config.auth.conceal_forbidden {
            err.conceal_forbidden(textbook_id)
        } else {
            err
        }
    }
}
