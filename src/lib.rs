//! dtx - treat writes against independent transactional stores as one
//! atomic unit.
//!
//! The core is the [`uow::UnitOfWork`] contract: a per-resource
//! begin/commit/rollback lifecycle that either runs a private local
//! transaction or enlists in an explicitly passed [`ambient`] transaction
//! context. [`uow::LinkedUnitOfWork`] composes several units of work under
//! one context and resolves their combined outcome with a lightweight
//! two-phase commit.

pub mod ambient;
pub mod config;
pub mod error;
pub mod isolation;
pub mod repository;
pub mod seed;
pub mod service;
pub mod uow;

pub use error::{DtxError, DtxResult};
pub use isolation::IsolationLevel;
pub use uow::{LinkedUnitOfWork, PgUnitOfWork, SqliteUnitOfWork, UnitOfWork};
