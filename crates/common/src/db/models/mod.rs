//! SeaORM entity models
//!
//! Database entities for textbooks and their chunks. The `chunks.embedding`
//! column is not mapped here; it is written and ranked through raw SQL.

mod chunk;
mod textbook;

pub use textbook::{
    ActiveModel as TextbookActiveModel, Column as TextbookColumn, Entity as TextbookEntity,
    Model as Textbook, NewTextbook,
};

pub use chunk::{
    ActiveModel as ChunkActiveModel, Column as ChunkColumn, Entity as ChunkEntity,
    Model as Chunk, NewChunk, ScoredChunk,
};
