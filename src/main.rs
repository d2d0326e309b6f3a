//! Demo binary: seed both stores, then run one distributed dual-write.

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use dtx::ambient::AmbientOptions;
use dtx::config::Settings;
use dtx::repository::{PgItemRepository, SqliteItemRepository};
use dtx::seed::{PgSeeder, Seeder, SqliteSeeder};
use dtx::service::DualWriteService;
use dtx::uow::{LinkedUnitOfWork, PgUnitOfWork, SharedUnitOfWork, SqliteUnitOfWork};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Starting dtx v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load()?;

    let pg_pool = PgPoolOptions::new()
        .max_connections(settings.postgres.max_connections)
        .min_connections(settings.postgres.min_connections)
        .connect_lazy(&settings.postgres.url)
        .context("invalid postgres url")?;

    let sqlite_pool = SqlitePoolOptions::new().connect_lazy_with(
        SqliteConnectOptions::new()
            .filename(&settings.sqlite.path)
            .create_if_missing(settings.sqlite.create_if_missing),
    );

    let cancel = CancellationToken::new();

    // Schema first; a failure here is fatal to startup.
    PgSeeder::new(pg_pool.clone())
        .seed(&cancel)
        .await
        .context("postgres seeding failed")?;
    SqliteSeeder::new(sqlite_pool.clone())
        .seed(&cancel)
        .await
        .context("sqlite seeding failed")?;
    info!("stores seeded");

    let pg_uow = PgUnitOfWork::new("postgres", pg_pool);
    let sqlite_uow = SqliteUnitOfWork::new("sqlite", sqlite_pool);

    let pg_items = PgItemRepository::new(pg_uow.handle());
    let sqlite_items = SqliteItemRepository::new(sqlite_uow.handle());

    let members: Vec<SharedUnitOfWork> = vec![
        Arc::new(Mutex::new(pg_uow)),
        Arc::new(Mutex::new(sqlite_uow)),
    ];
    let linked = LinkedUnitOfWork::with_options(
        members,
        AmbientOptions {
            timeout: settings.transaction.timeout(),
            ..Default::default()
        },
    )?;

    let mut service = DualWriteService::new(
        linked,
        pg_items,
        sqlite_items,
        settings.transaction.isolation,
    );

    let outcome = service.process(&cancel).await;
    service.dispose().await;
    outcome.context("distributed insert failed")?;

    info!("done");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,dtx=debug,sqlx=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();
}
