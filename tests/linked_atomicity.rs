//! End-to-end lifecycle and atomicity tests over two independent SQLite
//! stores.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tempfile::TempDir;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use dtx::ambient::{self, AmbientOptions};
use dtx::repository::SqliteItemRepository;
use dtx::seed::{Seeder, SqliteSeeder};
use dtx::uow::{LinkedUnitOfWork, SharedUnitOfWork, SqliteUnitOfWork, UnitOfWork};
use dtx::{DtxError, IsolationLevel};

async fn open_store(dir: &TempDir, name: &str, seeded: bool) -> SqlitePool {
    let options = SqliteConnectOptions::new()
        .filename(dir.path().join(name))
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(2)
        .connect_with(options)
        .await
        .expect("open sqlite store");
    if seeded {
        SqliteSeeder::new(pool.clone())
            .seed(&CancellationToken::new())
            .await
            .expect("seed sqlite store");
    }
    pool
}

struct Fixture {
    _dir: TempDir,
    a: Arc<Mutex<SqliteUnitOfWork>>,
    b: Arc<Mutex<SqliteUnitOfWork>>,
    a_items: SqliteItemRepository,
    b_items: SqliteItemRepository,
    linked: LinkedUnitOfWork,
}

async fn fixture(seed_b: bool) -> Fixture {
    let dir = TempDir::new().expect("tempdir");
    let pool_a = open_store(&dir, "a.db", true).await;
    let pool_b = open_store(&dir, "b.db", seed_b).await;

    let uow_a = SqliteUnitOfWork::new("store-a", pool_a);
    let uow_b = SqliteUnitOfWork::new("store-b", pool_b);
    let a_items = SqliteItemRepository::new(uow_a.handle());
    let b_items = SqliteItemRepository::new(uow_b.handle());

    let a = Arc::new(Mutex::new(uow_a));
    let b = Arc::new(Mutex::new(uow_b));
    let members: Vec<SharedUnitOfWork> = vec![a.clone(), b.clone()];
    let linked = LinkedUnitOfWork::new(members).expect("two members");

    Fixture {
        _dir: dir,
        a,
        b,
        a_items,
        b_items,
        linked,
    }
}

#[tokio::test]
async fn dual_insert_commits_in_both_stores() {
    let mut fx = fixture(true).await;
    let cancel = CancellationToken::new();

    let a_items = &fx.a_items;
    let b_items = &fx.b_items;
    fx.linked
        .execute_in_transaction(
            || async move {
                a_items.insert("X").await?;
                b_items.insert("X").await?;
                Ok(())
            },
            IsolationLevel::ReadCommitted,
            None,
            &cancel,
        )
        .await
        .expect("dual insert commits");

    assert!(!fx.linked.in_transaction().await);
    assert!(!fx.a.lock().await.in_transaction().await);
    assert!(!fx.b.lock().await.in_transaction().await);

    let a_rows = fx.a_items.list().await.unwrap();
    let b_rows = fx.b_items.list().await.unwrap();
    assert_eq!(a_rows.len(), 1);
    assert_eq!(b_rows.len(), 1);
    assert_eq!(a_rows[0].description, "X");
    assert_eq!(b_rows[0].description, "X");
}

#[tokio::test]
async fn action_failure_rolls_back_every_store() {
    let mut fx = fixture(true).await;
    let cancel = CancellationToken::new();
    let handler_calls = AtomicUsize::new(0);

    let a_items = &fx.a_items;
    let err = fx
        .linked
        .execute_in_transaction_with_handler(
            || async move {
                a_items.insert("X").await?;
                Err::<(), _>(DtxError::action(anyhow::anyhow!("boom")))
            },
            |_err| {
                handler_calls.fetch_add(1, Ordering::SeqCst);
            },
            IsolationLevel::ReadCommitted,
            None,
            &cancel,
        )
        .await
        .unwrap_err();

    // The triggering error propagates unchanged, after the handler ran
    // exactly once.
    assert!(matches!(err, DtxError::Action(_)));
    assert_eq!(err.to_string(), "boom");
    assert_eq!(handler_calls.load(Ordering::SeqCst), 1);

    assert!(!fx.linked.in_transaction().await);
    assert_eq!(fx.a_items.count().await.unwrap(), 0);
    assert_eq!(fx.b_items.count().await.unwrap(), 0);
}

#[tokio::test]
async fn second_store_failure_rolls_back_first() {
    // Store B has no items table, so its insert always fails.
    let mut fx = fixture(false).await;
    let cancel = CancellationToken::new();

    let a_items = &fx.a_items;
    let b_items = &fx.b_items;
    let err = fx
        .linked
        .execute_in_transaction(
            || async move {
                a_items.insert("X").await?;
                b_items.insert("X").await?;
                Ok(())
            },
            IsolationLevel::ReadCommitted,
            None,
            &cancel,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, DtxError::Database(_)));
    assert!(!err.is_caller_error());
    assert!(!fx.linked.in_transaction().await);
    assert_eq!(fx.a_items.count().await.unwrap(), 0);
}

#[tokio::test]
async fn begin_twice_is_rejected() {
    let dir = TempDir::new().unwrap();
    let pool = open_store(&dir, "solo.db", true).await;
    let mut uow = SqliteUnitOfWork::new("solo", pool);
    let cancel = CancellationToken::new();

    uow.begin_transaction(IsolationLevel::ReadCommitted, None, &cancel)
        .await
        .unwrap();
    let err = uow
        .begin_transaction(IsolationLevel::ReadCommitted, None, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, DtxError::AlreadyInTransaction));
    assert!(err.is_caller_error());

    // The failed attempt left the original transaction untouched.
    assert!(uow.in_transaction().await);
    uow.rollback(&cancel).await.unwrap();
    assert!(!uow.in_transaction().await);
}

#[tokio::test]
async fn commit_and_rollback_are_noops_when_idle() {
    let dir = TempDir::new().unwrap();
    let pool = open_store(&dir, "solo.db", true).await;
    let mut uow = SqliteUnitOfWork::new("solo", pool);
    let cancel = CancellationToken::new();

    uow.commit(&cancel).await.unwrap();
    uow.rollback(&cancel).await.unwrap();
    assert!(!uow.in_transaction().await);
}

#[tokio::test]
async fn dispose_is_idempotent_and_terminal() {
    let dir = TempDir::new().unwrap();
    let pool = open_store(&dir, "solo.db", true).await;
    let mut uow = SqliteUnitOfWork::new("solo", pool);
    let cancel = CancellationToken::new();

    uow.dispose().await;
    uow.dispose().await;

    let err = uow
        .begin_transaction(IsolationLevel::ReadCommitted, None, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, DtxError::Disposed));
}

#[tokio::test]
async fn empty_composition_is_rejected() {
    let err = LinkedUnitOfWork::new(Vec::new()).err().expect("must fail");
    assert!(matches!(err, DtxError::EmptyComposition));
}

#[tokio::test]
async fn typed_result_is_threaded_through() {
    let mut fx = fixture(true).await;
    let cancel = CancellationToken::new();

    let a_items = &fx.a_items;
    let inserted = fx
        .linked
        .execute_in_transaction(
            || async move {
                a_items.insert("X").await?;
                a_items.count().await
            },
            IsolationLevel::ReadCommitted,
            None,
            &cancel,
        )
        .await
        .unwrap();

    assert_eq!(inserted, 1);
    assert_eq!(fx.a_items.count().await.unwrap(), 1);
}

#[tokio::test]
async fn enlistment_defers_outcome_to_context() {
    let dir = TempDir::new().unwrap();
    let pool = open_store(&dir, "solo.db", true).await;
    let mut uow = SqliteUnitOfWork::new("solo", pool);
    let items = SqliteItemRepository::new(uow.handle());
    let cancel = CancellationToken::new();

    let ctx = ambient::create(&AmbientOptions::default());
    uow.begin_transaction(IsolationLevel::ReadCommitted, Some(&ctx), &cancel)
        .await
        .unwrap();
    assert_eq!(ctx.participant_count().await, 1);

    items.insert("X").await.unwrap();

    // The member's commit is only its local confirmation; the row lands
    // when the context resolves.
    uow.commit(&cancel).await.unwrap();
    assert!(!uow.in_transaction().await);

    ctx.complete();
    ctx.resolve(&cancel).await.unwrap();
    assert_eq!(items.count().await.unwrap(), 1);
}

#[tokio::test]
async fn begin_is_rejected_while_enlisted_transaction_is_parked() {
    let dir = TempDir::new().unwrap();
    let pool = open_store(&dir, "solo.db", true).await;
    let mut uow = SqliteUnitOfWork::new("solo", pool);
    let items = SqliteItemRepository::new(uow.handle());
    let cancel = CancellationToken::new();

    let ctx = ambient::create(&AmbientOptions::default());
    uow.begin_transaction(IsolationLevel::ReadCommitted, Some(&ctx), &cancel)
        .await
        .unwrap();
    items.insert("enlisted").await.unwrap();
    uow.commit(&cancel).await.unwrap();

    // Local confirmation parks the transaction for the context; a new
    // begin must not displace it.
    let err = uow
        .begin_transaction(IsolationLevel::ReadCommitted, None, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, DtxError::AlreadyInTransaction));

    ctx.complete();
    ctx.resolve(&cancel).await.unwrap();
    assert_eq!(items.count().await.unwrap(), 1);
    let rows = items.list().await.unwrap();
    assert_eq!(rows[0].description, "enlisted");

    // With the context resolved the slot is free again.
    uow.begin_transaction(IsolationLevel::ReadCommitted, None, &cancel)
        .await
        .unwrap();
    uow.rollback(&cancel).await.unwrap();
}

#[tokio::test]
async fn context_is_exposed_only_mid_transaction() {
    let mut fx = fixture(true).await;
    let cancel = CancellationToken::new();

    assert!(fx.linked.context().is_none());
    fx.linked
        .begin_transaction(IsolationLevel::ReadCommitted, None, &cancel)
        .await
        .unwrap();
    assert!(fx.linked.context().is_some());

    fx.linked.rollback(&cancel).await.unwrap();
    assert!(fx.linked.context().is_none());
}

#[tokio::test]
async fn uncompleted_context_discards_enlisted_work() {
    let dir = TempDir::new().unwrap();
    let pool = open_store(&dir, "solo.db", true).await;
    let mut uow = SqliteUnitOfWork::new("solo", pool);
    let items = SqliteItemRepository::new(uow.handle());
    let cancel = CancellationToken::new();

    let ctx = ambient::create(&AmbientOptions::default());
    uow.begin_transaction(IsolationLevel::ReadCommitted, Some(&ctx), &cancel)
        .await
        .unwrap();
    items.insert("X").await.unwrap();
    uow.commit(&cancel).await.unwrap();

    // Resolution without complete() is an implicit rollback.
    ctx.resolve(&cancel).await.unwrap();
    assert_eq!(items.count().await.unwrap(), 0);
}

#[tokio::test]
async fn member_begin_failure_leaves_recoverable_state() {
    let mut fx = fixture(true).await;
    let cancel = CancellationToken::new();

    fx.b.lock().await.dispose().await;

    let err = fx
        .linked
        .begin_transaction(IsolationLevel::ReadCommitted, None, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, DtxError::Disposed));

    // Store A is still enlisted in a context that rollback resolves.
    assert!(fx.linked.in_transaction().await);
    fx.linked.rollback(&cancel).await.unwrap();
    assert!(!fx.linked.in_transaction().await);
    assert_eq!(fx.a_items.count().await.unwrap(), 0);
}

#[tokio::test]
async fn pre_cancelled_token_aborts_before_io() {
    let dir = TempDir::new().unwrap();
    let pool = open_store(&dir, "solo.db", true).await;
    let mut uow = SqliteUnitOfWork::new("solo", pool);

    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = uow
        .begin_transaction(IsolationLevel::ReadCommitted, None, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, DtxError::Cancelled));
    assert!(!uow.in_transaction().await);
}
