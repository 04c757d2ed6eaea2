//! Local persistence for imagegen.
//!
//! A single SQLite file holds the per-model parameter records and a small
//! settings table. Schema changes ship as embedded `sqlx` migrations and
//! are applied by [`ModelParameterStore::init`].

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

pub mod models;
pub mod repositories;
pub mod store;

pub use store::{ModelParameterStore, StoreError};

pub type DbPool = sqlx::SqlitePool;

/// Create a connection pool from a database URL, creating the file if
/// it does not exist.
pub async fn create_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
}

/// Pool over a private in-memory database.
///
/// Pinned to one connection that never expires: every new connection to
/// `sqlite::memory:` would see an empty database.
pub async fn open_in_memory() -> Result<DbPool, sqlx::Error> {
    SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
}

/// Apply embedded migrations.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// Verify the database is reachable.
pub async fn health_check(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}
