//! Idempotent schema seeders, run at startup before any transactional work.
//!
//! Seeding failures are fatal to startup; they are not part of the
//! coordinator's error model.

use async_trait::async_trait;
use sqlx::{PgPool, SqlitePool};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{DtxError, DtxResult};

#[async_trait]
pub trait Seeder: Send + Sync {
    async fn seed(&self, cancel: &CancellationToken) -> DtxResult<()>;
}

pub struct PgSeeder {
    pool: PgPool,
}

impl PgSeeder {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Seeder for PgSeeder {
    async fn seed(&self, cancel: &CancellationToken) -> DtxResult<()> {
        if cancel.is_cancelled() {
            return Err(DtxError::Cancelled);
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS items (
                id SERIAL PRIMARY KEY,
                description VARCHAR(100) NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("postgres items table ready");
        Ok(())
    }
}

pub struct SqliteSeeder {
    pool: SqlitePool,
}

impl SqliteSeeder {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Seeder for SqliteSeeder {
    async fn seed(&self, cancel: &CancellationToken) -> DtxResult<()> {
        if cancel.is_cancelled() {
            return Err(DtxError::Cancelled);
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                description TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("sqlite items table ready");
        Ok(())
    }
}
