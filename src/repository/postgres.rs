//! Items stored in the PostgreSQL database.

use sqlx::Row;

use crate::error::DtxResult;
use crate::uow::PgHandle;

/// Row in the Postgres `items` table.
#[derive(Debug, Clone)]
pub struct PgItem {
    pub id: i32,
    pub description: String,
}

pub struct PgItemRepository {
    db: PgHandle,
}

impl PgItemRepository {
    pub fn new(db: PgHandle) -> Self {
        Self { db }
    }

    pub async fn insert(&self, description: &str) -> DtxResult<()> {
        self.db
            .execute(sqlx::query("INSERT INTO items (description) VALUES ($1)").bind(description))
            .await?;
        Ok(())
    }

    pub async fn count(&self) -> DtxResult<i64> {
        let row = self
            .db
            .fetch_one(sqlx::query("SELECT COUNT(*) AS count FROM items"))
            .await?;
        Ok(row.get("count"))
    }

    pub async fn list(&self) -> DtxResult<Vec<PgItem>> {
        let rows = self
            .db
            .fetch_all(sqlx::query("SELECT id, description FROM items ORDER BY id"))
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| PgItem {
                id: row.get("id"),
                description: row.get("description"),
            })
            .collect())
    }
}
