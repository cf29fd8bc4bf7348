//! Postgres storage engine
//!
//! Entity queries go through SeaORM; anything touching the pgvector
//! `embedding` column uses raw statements with the vector literal bound as
//! a parameter.

use crate::db::models::*;
use crate::db::store::{ChunkStore, TextbookStore, VectorIndex};
use crate::db::DbPool;
use crate::errors::{AppError, Result};
use crate::vector::Embedding;
use async_trait::async_trait;
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbBackend, DbErr,
    EntityTrait, FromQueryResult, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set,
    SqlErr, Statement, TransactionTrait,
};
use std::collections::HashSet;
use tracing::{debug, info};

/// Row shape of the similarity query
#[derive(Debug, FromQueryResult)]
struct ScoredChunkRow {
    id: i64,
    textbook_id: i64,
    content: String,
    page_number: i32,
    chunk_index: i32,
    created_at: DateTimeWithTimeZone,
    distance: f64,
}

impl From<ScoredChunkRow> for ScoredChunk {
    fn from(row: ScoredChunkRow) -> Self {
        ScoredChunk {
            chunk: Chunk {
                id: row.id,
                textbook_id: row.textbook_id,
                content: row.content,
                page_number: row.page_number,
                chunk_index: row.chunk_index,
                created_at: row.created_at,
            },
            distance: row.distance,
        }
    }
}

/// Repository over a Postgres pool with the pgvector extension
#[derive(Clone)]
pub struct Repository {
    pool: DbPool,
    dimension: usize,
}

impl Repository {
    /// Create a new repository with the given connection pool
    pub fn new(pool: DbPool, dimension: usize) -> Self {
        Self { pool, dimension }
    }

    fn conn(&self) -> &DatabaseConnection {
        self.pool.connection()
    }
}

#[async_trait]
impl TextbookStore for Repository {
    async fn create_textbook(&self, textbook: NewTextbook) -> Result<Textbook> {
        let model = TextbookActiveModel {
            user_id: Set(textbook.user_id),
            title: Set(textbook.title),
            s3_key: Set(textbook.s3_key),
            uploaded_at: Set(chrono::Utc::now().into()),
            processed: Set(textbook.processed),
            ..Default::default()
        };

        model.insert(self.conn()).await.map_err(Into::into)
    }

    async fn get_textbook(&self, id: i64) -> Result<Textbook> {
        TextbookEntity::find_by_id(id)
            .one(self.conn())
            .await?
            .ok_or_else(|| AppError::textbook_not_found(id))
    }

    async fn list_textbooks(&self, user_id: i64) -> Result<Vec<Textbook>> {
        TextbookEntity::find()
            .filter(TextbookColumn::UserId.eq(user_id))
            .order_by_desc(TextbookColumn::UploadedAt)
            .order_by_desc(TextbookColumn::Id)
            .all(self.conn())
            .await
            .map_err(Into::into)
    }

    async fn mark_processed(&self, id: i64) -> Result<()> {
        let result = TextbookEntity::update_many()
            .col_expr(TextbookColumn::Processed, Expr::value(true))
            .filter(TextbookColumn::Id.eq(id))
            .exec(self.conn())
            .await?;

        if result.rows_affected == 0 {
            return Err(AppError::textbook_not_found(id));
        }
        Ok(())
    }

    async fn delete_textbook(&self, id: i64, requesting_user_id: i64) -> Result<()> {
        let txn = self.conn().begin().await?;

        // Row lock keeps concurrent deletes of the same textbook serialised
        let textbook = TextbookEntity::find_by_id(id)
            .lock_exclusive()
            .one(&txn)
            .await?;

        let textbook = match textbook {
            Some(textbook) => textbook,
            None => {
                txn.rollback().await?;
                return Err(AppError::textbook_not_found(id));
            }
        };

        if !textbook.is_owned_by(requesting_user_id) {
            txn.rollback().await?;
            return Err(AppError::not_owner(id));
        }

        let chunks = ChunkEntity::delete_many()
            .filter(ChunkColumn::TextbookId.eq(id))
            .exec(&txn)
            .await?;

        TextbookEntity::delete_by_id(id).exec(&txn).await?;

        txn.commit().await?;

        info!(
            textbook_id = id,
            chunks_deleted = chunks.rows_affected,
            "Textbook and chunks deleted"
        );
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.pool.ping().await
    }
}

#[async_trait]
impl ChunkStore for Repository {
    async fn insert_chunks(&self, textbook_id: i64, chunks: Vec<NewChunk>) -> Result<Vec<i64>> {
        let mut seen = HashSet::with_capacity(chunks.len());
        let mut rows = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            if !seen.insert(chunk.chunk_index) {
                return Err(AppError::Validation {
                    message: format!("duplicate chunk_index {} in batch", chunk.chunk_index),
                    field: Some("chunk_index".to_string()),
                });
            }
            let embedding = Embedding::new(chunk.embedding, self.dimension)?;
            rows.push((chunk.content, chunk.page_number, chunk.chunk_index, embedding));
        }

        let txn = self.conn().begin().await?;
        let mut ids = Vec::with_capacity(rows.len());

        for (content, page_number, chunk_index, embedding) in rows {
            let stmt = Statement::from_sql_and_values(
                DbBackend::Postgres,
                r#"
                INSERT INTO chunks (textbook_id, content, page_number, chunk_index, embedding, created_at)
                VALUES ($1, $2, $3, $4, $5::vector, NOW())
                RETURNING id
                "#,
                vec![
                    textbook_id.into(),
                    content.into(),
                    page_number.into(),
                    chunk_index.into(),
                    embedding.to_literal().into(),
                ],
            );

            let row = txn
                .query_one(stmt)
                .await
                .map_err(|e| classify_insert_error(e, textbook_id))?
                .ok_or_else(|| DbErr::RecordNotInserted)?;
            ids.push(row.try_get::<i64>("", "id")?);
        }

        txn.commit().await?;

        debug!(textbook_id, inserted = ids.len(), "Chunks inserted");
        Ok(ids)
    }

    async fn count_chunks(&self, textbook_id: i64) -> Result<i64> {
        let count = ChunkEntity::find()
            .filter(ChunkColumn::TextbookId.eq(textbook_id))
            .count(self.conn())
            .await?;

        Ok(count as i64)
    }

    async fn list_chunks(&self, textbook_id: i64) -> Result<Vec<Chunk>> {
        ChunkEntity::find()
            .filter(ChunkColumn::TextbookId.eq(textbook_id))
            .order_by_asc(ChunkColumn::ChunkIndex)
            .all(self.conn())
            .await
            .map_err(Into::into)
    }
}

#[async_trait]
impl VectorIndex for Repository {
    async fn nearest_chunks(
        &self,
        textbook_id: i64,
        query: &Embedding,
        limit: u64,
    ) -> Result<Vec<ScoredChunk>> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            r#"
            SELECT id, textbook_id, content, page_number, chunk_index, created_at,
                   embedding <=> $1::vector AS distance
            FROM chunks
            WHERE textbook_id = $2
            ORDER BY distance ASC, chunk_index ASC
            LIMIT $3
            "#,
            vec![
                query.to_literal().into(),
                textbook_id.into(),
                (limit as i64).into(),
            ],
        );

        let rows = ScoredChunkRow::find_by_statement(stmt)
            .all(self.conn())
            .await?;

        Ok(rows.into_iter().map(ScoredChunk::from).collect())
    }
}

fn classify_insert_error(err: DbErr, textbook_id: i64) -> AppError {
    insert_violation(err.sql_err(), textbook_id).unwrap_or_else(|| err.into())
}

/// Unique and foreign-key violations are caller errors, not storage faults
fn insert_violation(violation: Option<SqlErr>, textbook_id: i64) -> Option<AppError> {
    match violation? {
        SqlErr::UniqueConstraintViolation(message) => Some(AppError::Conflict { message }),
        SqlErr::ForeignKeyConstraintViolation(_) => Some(AppError::textbook_not_found(textbook_id)),
        _ => None,
    }
}
