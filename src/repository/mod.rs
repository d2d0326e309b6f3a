//! Data-access collaborators.
//!
//! Repositories consume the executor handle of their unit of work and issue
//! statements scoped to whatever transaction it currently holds; they never
//! manage transaction lifecycle themselves.

mod postgres;
mod sqlite;

pub use postgres::{PgItem, PgItemRepository};
pub use sqlite::{SqliteItem, SqliteItemRepository};
