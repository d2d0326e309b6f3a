//! SQLite unit of work.
//!
//! Same shape as the Postgres implementation; SQLite transactions are
//! always serializable, so the requested isolation level is accepted and
//! logged rather than translated.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteArguments, SqliteQueryResult, SqliteRow};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{abortable, TxState, UnitOfWork};
use crate::ambient::{AmbientTransaction, Enlistment};
use crate::error::{DtxError, DtxResult};
use crate::isolation::IsolationLevel;

type SqliteTxSlot = Arc<Mutex<Option<Transaction<'static, Sqlite>>>>;

/// Unit of work over one SQLite store.
pub struct SqliteUnitOfWork {
    label: String,
    pool: SqlitePool,
    slot: SqliteTxSlot,
    state: TxState,
}

impl SqliteUnitOfWork {
    pub fn new(label: impl Into<String>, pool: SqlitePool) -> Self {
        Self {
            label: label.into(),
            pool,
            slot: Arc::new(Mutex::new(None)),
            state: TxState::Idle,
        }
    }

    /// Cloneable executor handle for repositories bound to this unit of
    /// work.
    pub fn handle(&self) -> SqliteHandle {
        SqliteHandle {
            slot: self.slot.clone(),
            pool: self.pool.clone(),
        }
    }
}

#[async_trait]
impl UnitOfWork for SqliteUnitOfWork {
    fn label(&self) -> &str {
        &self.label
    }

    async fn in_transaction(&self) -> bool {
        matches!(self.state, TxState::Local | TxState::Enlisted)
    }

    async fn begin_transaction(
        &mut self,
        isolation: IsolationLevel,
        ambient: Option<&Arc<AmbientTransaction>>,
        cancel: &CancellationToken,
    ) -> DtxResult<()> {
        match self.state {
            TxState::Disposed => return Err(DtxError::Disposed),
            TxState::Local | TxState::Enlisted => return Err(DtxError::AlreadyInTransaction),
            TxState::Idle => {}
        }
        // An enlisted transaction stays parked after local confirmation;
        // it blocks a new begin until the ambient context resolves it.
        if self.slot.lock().await.is_some() {
            return Err(DtxError::AlreadyInTransaction);
        }

        let tx = abortable(cancel, self.pool.begin()).await?;
        if isolation != IsolationLevel::Serializable {
            debug!(uow = %self.label, ?isolation, "sqlite transactions are serializable; requested level accepted");
        }

        *self.slot.lock().await = Some(tx);

        match ambient {
            Some(ctx) => {
                ctx.enlist(Box::new(SqliteEnlistment {
                    label: self.label.clone(),
                    slot: self.slot.clone(),
                }))
                .await;
                self.state = TxState::Enlisted;
                debug!(uow = %self.label, ambient = %ctx.id(), "enlisted in ambient transaction");
            }
            None => {
                self.state = TxState::Local;
                debug!(uow = %self.label, "local transaction started");
            }
        }

        Ok(())
    }

    async fn commit(&mut self, cancel: &CancellationToken) -> DtxResult<()> {
        match self.state {
            TxState::Disposed => return Err(DtxError::Disposed),
            TxState::Idle => return Ok(()),
            TxState::Enlisted => {
                self.state = TxState::Idle;
                return Ok(());
            }
            TxState::Local => {}
        }

        let tx = self.slot.lock().await.take();
        self.state = TxState::Idle;

        if let Some(tx) = tx {
            if let Err(err) = abortable(cancel, tx.commit()).await {
                let _ = self.rollback(&CancellationToken::new()).await;
                return Err(DtxError::commit_failed(self.label.clone(), err));
            }
        }

        Ok(())
    }

    async fn rollback(&mut self, cancel: &CancellationToken) -> DtxResult<()> {
        if self.state == TxState::Disposed {
            return Err(DtxError::Disposed);
        }

        let tx = self.slot.lock().await.take();
        self.state = TxState::Idle;

        if let Some(tx) = tx {
            if let Err(err) = abortable(cancel, tx.rollback()).await {
                warn!(uow = %self.label, %err, "rollback failed; ignoring");
            }
        }

        Ok(())
    }

    async fn dispose(&mut self) {
        if self.state == TxState::Disposed {
            return;
        }

        if let Some(tx) = self.slot.lock().await.take() {
            if let Err(err) = tx.rollback().await {
                warn!(uow = %self.label, %err, "rollback during dispose failed; ignoring");
            }
        }

        self.state = TxState::Disposed;
        self.pool.close().await;
        debug!(uow = %self.label, "disposed");
    }
}

/// Cloneable executor handle bound to one [`SqliteUnitOfWork`].
#[derive(Clone)]
pub struct SqliteHandle {
    slot: SqliteTxSlot,
    pool: SqlitePool,
}

impl SqliteHandle {
    pub async fn execute<'a>(
        &self,
        query: sqlx::query::Query<'a, Sqlite, SqliteArguments<'a>>,
    ) -> DtxResult<SqliteQueryResult> {
        let mut slot = self.slot.lock().await;
        match slot.as_mut() {
            Some(tx) => Ok(query.execute(&mut **tx).await?),
            None => Ok(query.execute(&self.pool).await?),
        }
    }

    pub async fn fetch_one<'a>(
        &self,
        query: sqlx::query::Query<'a, Sqlite, SqliteArguments<'a>>,
    ) -> DtxResult<SqliteRow> {
        let mut slot = self.slot.lock().await;
        match slot.as_mut() {
            Some(tx) => Ok(query.fetch_one(&mut **tx).await?),
            None => Ok(query.fetch_one(&self.pool).await?),
        }
    }

    pub async fn fetch_all<'a>(
        &self,
        query: sqlx::query::Query<'a, Sqlite, SqliteArguments<'a>>,
    ) -> DtxResult<Vec<SqliteRow>> {
        let mut slot = self.slot.lock().await;
        match slot.as_mut() {
            Some(tx) => Ok(query.fetch_all(&mut **tx).await?),
            None => Ok(query.fetch_all(&self.pool).await?),
        }
    }
}

struct SqliteEnlistment {
    label: String,
    slot: SqliteTxSlot,
}

#[async_trait]
impl Enlistment for SqliteEnlistment {
    fn label(&self) -> &str {
        &self.label
    }

    async fn prepare(&self) -> DtxResult<()> {
        let mut slot = self.slot.lock().await;
        match slot.as_mut() {
            Some(tx) => {
                sqlx::query("SELECT 1").execute(&mut **tx).await?;
                Ok(())
            }
            None => Err(DtxError::TransactionGone(self.label.clone())),
        }
    }

    async fn commit(&self) -> DtxResult<()> {
        match self.slot.lock().await.take() {
            Some(tx) => {
                tx.commit().await?;
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn rollback(&self) -> DtxResult<()> {
        match self.slot.lock().await.take() {
            Some(tx) => {
                tx.rollback().await?;
                Ok(())
            }
            None => Ok(()),
        }
    }
}
