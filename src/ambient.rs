//! Ambient transaction context shared by every participant of one
//! distributed transaction.
//!
//! There is no hidden thread- or task-local lookup: the context is an
//! `Arc<AmbientTransaction>` handed explicitly to each unit of work at
//! `begin_transaction` time, alongside the cancellation token. A unit of
//! work that receives one enlists in it instead of keeping a private
//! transaction; the context then owns the combined outcome and drives a
//! lightweight two-phase commit (prepare-all, then commit-all else
//! rollback-all) over the enlisted participants.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::{DtxError, DtxResult};
use crate::isolation::IsolationLevel;

/// Platform default transaction timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// How a coordinator acquires its ambient context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScopeOption {
    /// Join a caller-supplied ambient context when one is present,
    /// otherwise create a fresh one.
    #[default]
    Required,
    /// Always create a fresh context, even inside an outer one.
    RequiresNew,
}

/// Options recognised by the ambient context factory.
#[derive(Debug, Clone, Default)]
pub struct AmbientOptions {
    pub scope: ScopeOption,
    pub isolation: IsolationLevel,
    /// `None` falls back to [`DEFAULT_TIMEOUT`].
    pub timeout: Option<Duration>,
}

/// A resource enlisted in an ambient transaction.
///
/// Implementations hold a clone of their unit of work's transaction slot;
/// taking the transaction out of the slot is the single release point, so
/// resolving a participant that was already finished locally is a no-op.
#[async_trait]
pub trait Enlistment: Send + Sync {
    fn label(&self) -> &str;

    /// Vote on the outcome: verify the participant can still commit.
    async fn prepare(&self) -> DtxResult<()>;

    async fn commit(&self) -> DtxResult<()>;

    async fn rollback(&self) -> DtxResult<()>;
}

/// One logical cross-resource transaction.
pub struct AmbientTransaction {
    id: Uuid,
    isolation: IsolationLevel,
    timeout: Duration,
    started_at: Instant,
    completed: AtomicBool,
    resolved: AtomicBool,
    participants: Mutex<Vec<Box<dyn Enlistment>>>,
}

/// Create a fresh ambient transaction context.
///
/// Pure construction: no state is shared between calls and nothing happens
/// until participants enlist, so this is safe to call repeatedly and
/// concurrently.
pub fn create(options: &AmbientOptions) -> Arc<AmbientTransaction> {
    let ctx = Arc::new(AmbientTransaction {
        id: Uuid::new_v4(),
        isolation: options.isolation,
        timeout: options.timeout.unwrap_or(DEFAULT_TIMEOUT),
        started_at: Instant::now(),
        completed: AtomicBool::new(false),
        resolved: AtomicBool::new(false),
        participants: Mutex::new(Vec::new()),
    });
    debug!(ambient = %ctx.id, scope = ?options.scope, timeout = ?ctx.timeout, "ambient transaction created");
    ctx
}

impl AmbientTransaction {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register a participant. Called by a unit of work at enlistment time.
    pub async fn enlist(&self, participant: Box<dyn Enlistment>) {
        debug!(ambient = %self.id, participant = participant.label(), "participant enlisted");
        self.participants.lock().await.push(participant);
    }

    pub async fn participant_count(&self) -> usize {
        self.participants.lock().await.len()
    }

    /// Mark the transaction as complete. The coordinator calls this only
    /// after every member's local step has succeeded; resolution without it
    /// rolls every participant back.
    pub fn complete(&self) {
        self.completed.store(true, Ordering::SeqCst);
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::SeqCst)
    }

    /// Drive every enlisted participant to its final outcome.
    ///
    /// Consumes the participant set; a second call is a no-op. When the
    /// context was not marked complete this is an implicit rollback of all
    /// enlisted work and never fails.
    pub async fn resolve(&self, cancel: &CancellationToken) -> DtxResult<()> {
        if self.resolved.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let participants = std::mem::take(&mut *self.participants.lock().await);

        if !self.is_completed() {
            debug!(ambient = %self.id, "resolving uncompleted ambient transaction as rollback");
            rollback_all(participants).await;
            return Ok(());
        }

        let elapsed = self.started_at.elapsed();
        if elapsed > self.timeout {
            warn!(ambient = %self.id, ?elapsed, "ambient transaction exceeded its timeout; rolling back");
            rollback_all(participants).await;
            return Err(DtxError::Timeout {
                elapsed,
                limit: self.timeout,
            });
        }

        if cancel.is_cancelled() {
            rollback_all(participants).await;
            return Err(DtxError::Cancelled);
        }

        // Prepare phase: every participant votes before anything commits.
        let mut vote_failure = None;
        for participant in &participants {
            if let Err(err) = participant.prepare().await {
                warn!(
                    ambient = %self.id,
                    participant = participant.label(),
                    %err,
                    "prepare failed; rolling back distributed transaction"
                );
                vote_failure = Some((participant.label().to_owned(), err));
                break;
            }
        }
        if let Some((label, err)) = vote_failure {
            rollback_all(participants).await;
            return Err(DtxError::commit_failed(label, err));
        }

        // Commit phase: the outcome is decided, so every participant is
        // driven to commit even if an earlier one fails. The first failure
        // surfaces to the caller.
        let mut first_failure = None;
        for participant in &participants {
            if let Err(err) = participant.commit().await {
                error!(
                    ambient = %self.id,
                    participant = participant.label(),
                    %err,
                    "commit phase failure"
                );
                if first_failure.is_none() {
                    first_failure = Some(DtxError::commit_failed(participant.label(), err));
                }
            }
        }

        match first_failure {
            None => {
                debug!(ambient = %self.id, participants = participants.len(), "ambient transaction committed");
                Ok(())
            }
            Some(err) => Err(err),
        }
    }
}

impl Drop for AmbientTransaction {
    fn drop(&mut self) {
        if !self.is_resolved() {
            let participants = self.participants.get_mut();
            if !participants.is_empty() {
                // The parked sqlx transactions roll back when dropped, so
                // correctness holds, but the coordinator skipped a step.
                warn!(
                    ambient = %self.id,
                    participants = participants.len(),
                    "ambient transaction dropped unresolved; enlisted work rolls back"
                );
            }
        }
    }
}

async fn rollback_all(participants: Vec<Box<dyn Enlistment>>) {
    for participant in participants {
        if let Err(err) = participant.rollback().await {
            warn!(participant = participant.label(), %err, "participant rollback failed; ignoring");
        }
    }
}
