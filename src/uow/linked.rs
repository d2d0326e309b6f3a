//! Linked unit of work: one atomic outcome across independent stores.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::UnitOfWork;
use crate::ambient::{self, AmbientOptions, AmbientTransaction, ScopeOption};
use crate::error::{DtxError, DtxResult};
use crate::isolation::IsolationLevel;

/// A unit of work shared between the coordinator and its repositories.
pub type SharedUnitOfWork = Arc<Mutex<dyn UnitOfWork>>;

/// Composes an ordered sequence of unit-of-work instances under one ambient
/// transaction context, making their combined outcome atomic.
///
/// Members keep their construction order for both begin and commit so that
/// partial-failure diagnostics are deterministic. The coordinator holds
/// non-exclusive references to its members (they may be used independently)
/// but exclusively owns the contexts it creates.
pub struct LinkedUnitOfWork {
    members: Vec<SharedUnitOfWork>,
    options: AmbientOptions,
    ambient: Option<Arc<AmbientTransaction>>,
    owns_context: bool,
    disposed: bool,
}

impl LinkedUnitOfWork {
    /// Link members with default ambient options.
    pub fn new(members: Vec<SharedUnitOfWork>) -> DtxResult<Self> {
        Self::with_options(members, AmbientOptions::default())
    }

    /// Fails with [`DtxError::EmptyComposition`] for zero members.
    pub fn with_options(members: Vec<SharedUnitOfWork>, options: AmbientOptions) -> DtxResult<Self> {
        if members.is_empty() {
            return Err(DtxError::EmptyComposition);
        }
        Ok(Self {
            members,
            options,
            ambient: None,
            owns_context: false,
            disposed: false,
        })
    }

    /// The live ambient context, if a linked transaction is in progress.
    pub fn context(&self) -> Option<&Arc<AmbientTransaction>> {
        self.ambient.as_ref()
    }
}

#[async_trait]
impl UnitOfWork for LinkedUnitOfWork {
    fn label(&self) -> &str {
        "linked"
    }

    async fn in_transaction(&self) -> bool {
        if self.ambient.is_some() {
            return true;
        }
        for member in &self.members {
            if member.lock().await.in_transaction().await {
                return true;
            }
        }
        false
    }

    async fn begin_transaction(
        &mut self,
        isolation: IsolationLevel,
        ambient: Option<&Arc<AmbientTransaction>>,
        cancel: &CancellationToken,
    ) -> DtxResult<()> {
        if self.disposed {
            return Err(DtxError::Disposed);
        }
        if self.ambient.is_some() {
            return Err(DtxError::AlreadyInTransaction);
        }

        let (ctx, owned) = match (self.options.scope, ambient) {
            (ScopeOption::Required, Some(outer)) => (outer.clone(), false),
            _ => {
                let options = AmbientOptions {
                    scope: self.options.scope,
                    isolation,
                    timeout: self.options.timeout,
                };
                (ambient::create(&options), true)
            }
        };
        self.owns_context = owned;
        self.ambient = Some(ctx.clone());

        debug!(
            ambient = %ctx.id(),
            owned,
            members = self.members.len(),
            "beginning linked transaction"
        );

        // Fixed member order. On a member failure the already-begun members
        // stay enlisted in a context that a later rollback or dispose
        // resolves as an abort; the context is never marked complete.
        for member in &self.members {
            let mut uow = member.lock().await;
            if let Err(err) = uow.begin_transaction(isolation, Some(&ctx), cancel).await {
                warn!(member = uow.label(), %err, "member failed to begin; linked transaction will roll back");
                return Err(err);
            }
        }

        Ok(())
    }

    async fn commit(&mut self, cancel: &CancellationToken) -> DtxResult<()> {
        if self.disposed {
            return Err(DtxError::Disposed);
        }

        // Each member's commit is its local confirmation step; the
        // authoritative outcome is decided by the context resolution below.
        let mut failure = None;
        for member in &self.members {
            let mut uow = member.lock().await;
            if let Err(err) = uow.commit(cancel).await {
                warn!(member = uow.label(), %err, "member commit failed; rolling back linked transaction");
                failure = Some(err);
                break;
            }
        }

        if let Some(err) = failure {
            let _ = self.rollback(&CancellationToken::new()).await;
            return Err(err);
        }

        if let Some(ctx) = self.ambient.take() {
            if self.owns_context {
                ctx.complete();
                ctx.resolve(cancel).await?;
            }
            // A joined context is completed and resolved by its owner.
        }

        Ok(())
    }

    async fn rollback(&mut self, cancel: &CancellationToken) -> DtxResult<()> {
        if self.disposed {
            return Err(DtxError::Disposed);
        }

        for member in &self.members {
            let mut uow = member.lock().await;
            if let Err(err) = uow.rollback(cancel).await {
                warn!(member = uow.label(), %err, "member rollback failed; ignoring");
            }
        }

        if let Some(ctx) = self.ambient.take() {
            if self.owns_context {
                // Not completed, so this resolves as an abort of anything
                // still enlisted.
                if let Err(err) = ctx.resolve(cancel).await {
                    warn!(%err, "ambient rollback failed; ignoring");
                }
            }
        }

        Ok(())
    }

    async fn dispose(&mut self) {
        if self.disposed {
            return;
        }

        for member in &self.members {
            member.lock().await.dispose().await;
        }

        if let Some(ctx) = self.ambient.take() {
            if self.owns_context {
                let _ = ctx.resolve(&CancellationToken::new()).await;
            }
        }

        self.disposed = true;
        debug!("linked unit of work disposed");
    }
}
