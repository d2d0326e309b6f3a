//! Items stored in the SQLite database.

use sqlx::Row;

use crate::error::DtxResult;
use crate::uow::SqliteHandle;

/// Row in the SQLite `items` table.
#[derive(Debug, Clone)]
pub struct SqliteItem {
    pub id: i64,
    pub description: String,
}

pub struct SqliteItemRepository {
    db: SqliteHandle,
}

impl SqliteItemRepository {
    pub fn new(db: SqliteHandle) -> Self {
        Self { db }
    }

    pub async fn insert(&self, description: &str) -> DtxResult<()> {
        self.db
            .execute(sqlx::query("INSERT INTO items (description) VALUES (?1)").bind(description))
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

    pub async fn list(&self) -> DtxResult<Vec<SqliteItem>> {
        let rows = self
            .db
            .fetch_all(sqlx::query("SELECT id, description FROM items ORDER BY id"))
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| SqliteItem {
                id: row.get("id"),
                description: row.get("description"),
            })
            .collect())
    }
}
