//! Chunk entity

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "chunks")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    pub textbook_id: i64,

    #[sea_orm(column_type = "Text")]
    pub content: String,

    pub page_number: i32,

    /// Position within the textbook; unique per textbook and the
    /// tie-breaker for equal distances
    pub chunk_index: i32,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::textbook::Entity",
        from = "Column::TextbookId",
        to = "super::textbook::Column::Id",
        on_delete = "Cascade"
    )]
    Textbook,
}

impl Related<super::textbook::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Textbook.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Chunk as produced by ingestion, embedding included
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewChunk {
    pub content: String,
    pub page_number: i32,
    pub chunk_index: i32,
    pub embedding: Vec<f32>,
}

/// Chunk ranked by a similarity query
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ScoredChunk {
    pub chunk: Model,

    /// Cosine distance to the query; smaller is more similar
    pub distance: f64,
}
