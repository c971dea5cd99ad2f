//! The shared document store boundary.
//!
//! The coordinator never talks to a database directly; it goes through the
//! [`DocumentStore`] trait, which offers single-record transactions, plain
//! writes, one-shot queries and push-based change feeds. Two backends ship
//! here: [`MemoryStore`] for in-process use and tests, and [`PgStore`] for a
//! PostgreSQL instance shared by many clients.

use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;

pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use store::{
    ChangeFeed, DocumentStore, Query, RecordPath, SetOptions, StoredRecord, TxnOp, TxnOutcome,
};

pub type DbPool = sqlx::PgPool;

/// Embedded schema migrations for [`PgStore`].
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Create a connection pool from a database URL.
pub async fn create_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .connect(database_url)
        .await
}

/// Round-trip a trivial query to verify connectivity.
pub async fn health_check(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Apply pending migrations.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    MIGRATOR.run(pool).await
}
