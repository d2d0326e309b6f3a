//! The unit-of-work contract, uniform across single-store implementations
//! and the linked coordinator.

mod linked;
mod postgres;
mod sqlite;

pub use linked::{LinkedUnitOfWork, SharedUnitOfWork};
pub use postgres::{PgHandle, PgUnitOfWork};
pub use sqlite::{SqliteHandle, SqliteUnitOfWork};

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::ambient::AmbientTransaction;
use crate::error::{DtxError, DtxResult};
use crate::isolation::IsolationLevel;

/// Lifecycle state of a single-store unit of work.
///
/// `Disposed` is terminal; only repeated `dispose` is valid afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxState {
    Idle,
    Local,
    Enlisted,
    Disposed,
}

/// A unit of work coordinating the transactional lifecycle of one logical
/// operation.
///
/// Instances are for a single logical caller: the contract is not safe for
/// concurrent lifecycle calls on the same instance, so shared instances sit
/// behind an async mutex.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Symbolic identity of the resource ("postgres", "sqlite", "linked").
    fn label(&self) -> &str;

    async fn in_transaction(&self) -> bool;

    /// Begin a transaction.
    ///
    /// Fails with [`DtxError::AlreadyInTransaction`] when one is active;
    /// the failed attempt leaves the instance unchanged. When an ambient
    /// context is supplied the resource enlists in it instead of keeping a
    /// private transaction; that decision is made once per call and never
    /// re-evaluated mid-transaction.
    async fn begin_transaction(
        &mut self,
        isolation: IsolationLevel,
        ambient: Option<&Arc<AmbientTransaction>>,
        cancel: &CancellationToken,
    ) -> DtxResult<()>;

    /// Commit the current transaction. A no-op success when none is active.
    /// A commit failure triggers an internal rollback and surfaces as
    /// [`DtxError::CommitFailed`]; the transaction is released either way.
    async fn commit(&mut self, cancel: &CancellationToken) -> DtxResult<()>;

    /// Roll back the current transaction. A no-op success when none is
    /// active; errors during the rollback itself are swallowed so they can
    /// never mask the error that triggered it.
    async fn rollback(&mut self, cancel: &CancellationToken) -> DtxResult<()>;

    /// Release the unit of work and its resource handle. Idempotent.
    async fn dispose(&mut self);

    /// Run `action` inside a transaction: begin, run, commit on success,
    /// roll back and re-raise on failure. The value returned by `action` is
    /// threaded through to the caller after the commit.
    async fn execute_in_transaction<A, Fut, T>(
        &mut self,
        action: A,
        isolation: IsolationLevel,
        ambient: Option<&Arc<AmbientTransaction>>,
        cancel: &CancellationToken,
    ) -> DtxResult<T>
    where
        Self: Sized,
        A: FnOnce() -> Fut + Send,
        Fut: Future<Output = DtxResult<T>> + Send,
        T: Send,
    {
        self.execute_in_transaction_with_handler(action, |_| {}, isolation, ambient, cancel)
            .await
    }

    /// [`execute_in_transaction`](Self::execute_in_transaction) with a
    /// failure observer. The handler runs exactly once, strictly before the
    /// error propagates, and can never suppress it. It observes commit
    /// failures as well as action failures.
    async fn execute_in_transaction_with_handler<A, Fut, T, H>(
        &mut self,
        action: A,
        handler: H,
        isolation: IsolationLevel,
        ambient: Option<&Arc<AmbientTransaction>>,
        cancel: &CancellationToken,
    ) -> DtxResult<T>
    where
        Self: Sized,
        A: FnOnce() -> Fut + Send,
        Fut: Future<Output = DtxResult<T>> + Send,
        T: Send,
        H: FnOnce(&DtxError) + Send,
    {
        self.begin_transaction(isolation, ambient, cancel).await?;

        let err = match action().await {
            Ok(value) => match self.commit(cancel).await {
                Ok(()) => return Ok(value),
                Err(err) => err,
            },
            Err(err) => err,
        };

        handler(&err);

        // Rollback-on-failure must run even when the caller's token has
        // already fired.
        if let Err(rollback_err) = self.rollback(&CancellationToken::new()).await {
            warn!(uow = self.label(), %rollback_err, "rollback after failure also failed; ignoring");
        }

        Err(err)
    }
}

/// Race an in-flight database operation against the caller's token.
///
/// `biased` so that an already-signalled token wins before any I/O is
/// issued.
pub(crate) async fn abortable<T>(
    cancel: &CancellationToken,
    op: impl Future<Output = Result<T, sqlx::Error>>,
) -> DtxResult<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DtxError::Cancelled),
        result = op => result.map_err(DtxError::from),
    }
}
