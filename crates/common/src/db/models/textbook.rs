//! Textbook entity

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "textbooks")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    /// Owning user; every read, delete and search is checked against it
    pub user_id: i64,

    #[sea_orm(column_type = "Text")]
    pub title: String,

    /// Opaque object-storage key of the uploaded file
    #[sea_orm(column_type = "Text")]
    pub s3_key: String,

    pub uploaded_at: DateTimeWithTimeZone,

    /// Set by ingestion once every chunk has been written
    pub processed: bool,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::chunk::Entity")]
    Chunks,
}

impl Related<super::chunk::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Chunks.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn is_owned_by(&self, user_id: i64) -> bool {
        self.user_id == user_id
    }
}

/// Textbook record as handed over by the ingestion pipeline
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTextbook {
    pub user_id: i64,
    pub title: String,
    pub s3_key: String,
    #[serde(default)]
    pub processed: bool,
}
