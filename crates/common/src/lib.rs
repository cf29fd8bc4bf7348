//! Textbook RAG Common Library
//!
//! Shared code for the retrieval services including:
//! - Database models, storage capabilities and their engines
//! - Query embedding validation and pgvector encoding
//! - Error types and handling
//! - Configuration management
//! - Caller identity resolution
//! - Metrics and observability

pub mod auth;
pub mod config;
pub mod db;
pub mod errors;
pub mod metrics;
pub mod vector;

// Re-export commonly used types
pub use config::AppConfig;
pub use db::Storage;
pub use errors::{AppError, Result};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default embedding dimension
pub const DEFAULT_EMBEDDING_DIMENSION: usize = 1536;
