//! Business orchestration entry point.

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::DtxResult;
use crate::isolation::IsolationLevel;
use crate::repository::{PgItemRepository, SqliteItemRepository};
use crate::uow::{LinkedUnitOfWork, UnitOfWork};

/// Writes the same logical item into both stores as one atomic unit.
pub struct DualWriteService {
    uow: LinkedUnitOfWork,
    postgres_items: PgItemRepository,
    sqlite_items: SqliteItemRepository,
    isolation: IsolationLevel,
}

impl DualWriteService {
    pub fn new(
        uow: LinkedUnitOfWork,
        postgres_items: PgItemRepository,
        sqlite_items: SqliteItemRepository,
        isolation: IsolationLevel,
    ) -> Self {
        Self {
            uow,
            postgres_items,
            sqlite_items,
            isolation,
        }
    }

    /// One business operation: insert a timestamped item into both stores,
    /// atomically.
    pub async fn process(&mut self, cancel: &CancellationToken) -> DtxResult<()> {
        let description = format!("Item {}", Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"));
        info!(%description, "beginning distributed insert");

        let postgres_items = &self.postgres_items;
        let sqlite_items = &self.sqlite_items;

        self.uow
            .execute_in_transaction_with_handler(
                || async move {
                    postgres_items.insert(&description).await?;
                    sqlite_items.insert(&description).await?;
                    Ok(())
                },
                |err| error!(%err, "distributed insert failed; rolling back"),
                self.isolation,
                None,
                cancel,
            )
            .await?;

        info!("distributed insert committed");
        Ok(())
    }

    /// Release the coordinator and, through it, both stores.
    pub async fn dispose(&mut self) {
        self.uow.dispose().await;
    }
}
