//! PostgreSQL unit of work.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgQueryResult, PgRow};
use sqlx::{PgPool, Postgres, Transaction};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{abortable, TxState, UnitOfWork};
use crate::ambient::{AmbientTransaction, Enlistment};
use crate::error::{DtxError, DtxResult};
use crate::isolation::IsolationLevel;

type PgTxSlot = Arc<Mutex<Option<Transaction<'static, Postgres>>>>;

/// Unit of work over one PostgreSQL store.
///
/// The active transaction is parked in a shared slot so that repositories
/// (via [`PgHandle`]) and an ambient enlistment can reach it without locking
/// the unit of work itself. Taking the transaction out of the slot is the
/// single release point.
pub struct PgUnitOfWork {
    label: String,
    pool: PgPool,
    slot: PgTxSlot,
    state: TxState,
}

impl PgUnitOfWork {
    /// The pool connects lazily; the store is opened on first use.
    pub fn new(label: impl Into<String>, pool: PgPool) -> Self {
        Self {
            label: label.into(),
            pool,
            slot: Arc::new(Mutex::new(None)),
            state: TxState::Idle,
        }
    }

    /// Cloneable executor handle for repositories bound to this unit of
    /// work.
    pub fn handle(&self) -> PgHandle {
        PgHandle {
            slot: self.slot.clone(),
            pool: self.pool.clone(),
        }
    }
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
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

        let mut tx = abortable(cancel, self.pool.begin()).await?;
        sqlx::query(isolation.postgres_sql())
            .execute(&mut *tx)
            .await?;

        *self.slot.lock().await = Some(tx);

        match ambient {
            Some(ctx) => {
                ctx.enlist(Box::new(PgEnlistment {
                    label: self.label.clone(),
                    slot: self.slot.clone(),
                }))
                .await;
                self.state = TxState::Enlisted;
                debug!(uow = %self.label, ambient = %ctx.id(), "enlisted in ambient transaction");
            }
            None => {
                self.state = TxState::Local;
                debug!(uow = %self.label, ?isolation, "local transaction started");
            }
        }

        Ok(())
    }

    async fn commit(&mut self, cancel: &CancellationToken) -> DtxResult<()> {
        match self.state {
            TxState::Disposed => return Err(DtxError::Disposed),
            TxState::Idle => return Ok(()),
            TxState::Enlisted => {
                // Local confirmation only: the parked transaction is
                // finished when the ambient context resolves.
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

/// Cloneable executor handle bound to one [`PgUnitOfWork`].
///
/// Statements run on the parked transaction when one is live, otherwise
/// directly on the pool.
#[derive(Clone)]
pub struct PgHandle {
    slot: PgTxSlot,
    pool: PgPool,
}

impl PgHandle {
    pub async fn execute(
        &self,
        query: sqlx::query::Query<'_, Postgres, PgArguments>,
    ) -> DtxResult<PgQueryResult> {
        let mut slot = self.slot.lock().await;
        match slot.as_mut() {
            Some(tx) => Ok(query.execute(&mut **tx).await?),
            None => Ok(query.execute(&self.pool).await?),
        }
    }

    pub async fn fetch_one(
        &self,
        query: sqlx::query::Query<'_, Postgres, PgArguments>,
    ) -> DtxResult<PgRow> {
        let mut slot = self.slot.lock().await;
        match slot.as_mut() {
            Some(tx) => Ok(query.fetch_one(&mut **tx).await?),
            None => Ok(query.fetch_one(&self.pool).await?),
        }
    }

    pub async fn fetch_all(
        &self,
        query: sqlx::query::Query<'_, Postgres, PgArguments>,
    ) -> DtxResult<Vec<PgRow>> {
        let mut slot = self.slot.lock().await;
        match slot.as_mut() {
            Some(tx) => Ok(query.fetch_all(&mut **tx).await?),
            None => Ok(query.fetch_all(&self.pool).await?),
        }
    }
}

struct PgEnlistment {
    label: String,
    slot: PgTxSlot,
}

#[async_trait]
impl Enlistment for PgEnlistment {
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
