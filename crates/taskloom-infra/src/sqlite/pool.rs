//! SQLite connection pools for the execution store.
//!
//! Transition appends are the hot write path and SQLite admits a single
//! writer, so writes go through a one-connection pool while reads (status
//! polling, transition listings) share a read-only pool. Both run in WAL
//! mode with foreign keys on, which the `transitions -> executions` cascade
//! depends on.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

/// File name of the execution database inside the data directory.
pub const DATABASE_FILE: &str = "taskloom.db";

const READER_CONNECTIONS: u32 = 8;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct DatabasePool {
    /// Read-only, up to `READER_CONNECTIONS` connections.
    pub reader: SqlitePool,
    /// Single connection; every INSERT/UPDATE goes here.
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Connect to `database_url`, creating the file if needed, and apply
    /// pending migrations.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT)
            .create_if_missing(true);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options.clone())
            .await?;

        // The read-only pool cannot create tables, so migrate first
        sqlx::migrate!("../../migrations").run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(READER_CONNECTIONS)
            .connect_with(options.read_only(true))
            .await?;

        tracing::debug!(url = %database_url, "execution database ready");
        Ok(Self { reader, writer })
    }

    /// Open `{data_dir}/taskloom.db`.
    pub async fn open(data_dir: &Path) -> Result<Self, sqlx::Error> {
        Self::new(&database_url(data_dir)).await
    }
}

pub fn database_url(data_dir: &Path) -> String {
    format!("sqlite://{}/{DATABASE_FILE}", data_dir.display())
}
