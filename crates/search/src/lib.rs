//! Textbook retrieval
//!
//! Provides:
//! - Similarity search over the chunks of one textbook
//! - Ownership-checked textbook reads, status and deletion

pub mod retrieval;
pub mod service;

pub use retrieval::{RetrievedChunk, VectorRetriever};
pub use service::{TextbookService, TextbookStatus};
