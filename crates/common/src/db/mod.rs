//! Database layer for textbook retrieval
//!
//! Provides:
//! - SeaORM entity models
//! - Storage capability traits and their Postgres / in-memory engines
//! - Connection pool management and migrations

mod memory;
pub mod models;
mod repository;
mod store;

pub use memory::MemoryStore;
pub use repository::Repository;
pub use store::{ChunkStore, TextbookStore, VectorIndex};

use crate::config::{AppConfig, DatabaseConfig, StorageBackend};
use crate::errors::{AppError, Result};
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbBackend, Statement,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Database connection pool wrapper.
///
/// Reads and writes share one pool so an ownership check or a search never
/// sees a textbook that a committed delete has already removed.
#[derive(Clone)]
pub struct DbPool {
    conn: Arc<DatabaseConnection>,
}

impl DbPool {
    /// Create a new database pool from configuration
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        info!("Connecting to database...");

        let conn = Database::connect(connect_options(&config.url, config))
            .await
            .map_err(|e| AppError::DatabaseConnection {
                message: format!("Failed to connect: {}", e),
            })?;

        info!("Database connection established");

        Ok(Self::from_connection(Arc::new(conn)))
    }

    /// Wrap an already established connection
    pub fn from_connection(conn: Arc<DatabaseConnection>) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.conn
    }

    /// Apply pending migrations from `migrations/`
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations...");
        sqlx::migrate!("../../migrations")
            .run(self.conn.get_postgres_connection_pool())
            .await?;
        Ok(())
    }

    /// Declared dimension of `chunks.embedding`.
    ///
    /// `None` when the table does not exist yet.
    pub async fn embedding_column_dimension(&self) -> Result<Option<i32>> {
        let stmt = Statement::from_string(
            DbBackend::Postgres,
            r#"
            SELECT atttypmod
            FROM pg_attribute
            WHERE attrelid = to_regclass('chunks') AND attname = 'embedding'
            "#,
        );

        match self.conn.query_one(stmt).await? {
            Some(row) => Ok(Some(row.try_get::<i32>("", "atttypmod")?)),
            None => Ok(None),
        }
    }

    /// Ping the database to check connectivity
    pub async fn ping(&self) -> Result<()> {
        self.conn
            .execute_unprepared("SELECT 1")
            .await
            .map_err(|e| AppError::DatabaseConnection {
                message: format!("Ping failed: {}", e),
            })?;
        Ok(())
    }
}

/// Refuse to start when `embedding.dimension` disagrees with the column.
///
/// pgvector stores the declared dimension as the type modifier; `-1` means
/// the column is unconstrained.
fn check_embedding_dimension(column: Option<i32>, configured: usize) -> Result<()> {
    match column {
        Some(declared) if declared > 0 && declared as usize != configured => {
            Err(AppError::Configuration {
                message: format!(
                    "embedding.dimension is {} but chunks.embedding is vector({})",
                    configured, declared
                ),
            })
        }
        _ => Ok(()),
    }
}

fn connect_options(url: &str, config: &DatabaseConfig) -> ConnectOptions {
    let mut opts = ConnectOptions::new(url);
    opts.max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        .sqlx_logging(true);
    opts
}

/// The storage capabilities one engine provides, shared across handlers
#[derive(Clone)]
pub struct Storage {
    pub textbooks: Arc<dyn TextbookStore>,
    pub chunks: Arc<dyn ChunkStore>,
    pub index: Arc<dyn VectorIndex>,
}

impl Storage {
    /// Expose every capability of a single engine
    pub fn from_engine<E>(engine: Arc<E>) -> Self
    where
        E: TextbookStore + ChunkStore + VectorIndex + 'static,
    {
        Self {
            textbooks: engine.clone(),
            chunks: engine.clone(),
            index: engine,
        }
    }

    /// Build the engine selected by `database.backend`
    pub async fn connect(config: &AppConfig) -> Result<Self> {
        let dimension = config.embedding.dimension;
        match config.database.backend {
            StorageBackend::Postgres => {
                let pool = DbPool::new(&config.database).await?;
                if config.database.run_migrations {
                    pool.run_migrations().await?;
                }
                check_embedding_dimension(pool.embedding_column_dimension().await?, dimension)?;
                Ok(Self::from_engine(Arc::new(Repository::new(pool, dimension))))
            }
            StorageBackend::Memory => {
                info!("Using in-memory storage; data is lost on shutdown");
                Ok(Self::from_engine(Arc::new(MemoryStore::new(dimension))))
            }
        }
    }
}
