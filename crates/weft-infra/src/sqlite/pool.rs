//! SQLite connection pools for the run store.
//!
//! The runtime writes one checkpoint per settled step and updates the run
//! record at start and finish; those writes go through a single-connection
//! writer pool, which also owns schema migrations. Lookups (`get_run`,
//! `latest_checkpoint`, `list_runs`, `load_flow`) use a read-only pool, so
//! inspecting a run never waits behind a checkpoint append. The database runs
//! in WAL mode so readers see committed checkpoints while a write is open.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::config::default_data_dir;

/// Database file created inside the data directory.
pub const DATABASE_FILE: &str = "weft.db";

/// Read-only connections kept for run and checkpoint lookups.
const READER_CONNECTIONS: u32 = 8;

/// Reader and writer pools over one weft database.
#[derive(Clone)]
pub struct DatabasePool {
    pub reader: SqlitePool,
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Connect to `database_url`, creating the file when missing, and apply
    /// pending migrations before any reader connects.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let base_opts = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(base_opts.clone())
            .await?;
        sqlx::migrate!("../../migrations").run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(READER_CONNECTIONS)
            .connect_with(base_opts.read_only(true))
            .await?;

        tracing::debug!(url = database_url, "run store database ready");
        Ok(Self { reader, writer })
    }

    /// Open `<data_dir>/weft.db`, creating the directory first.
    pub async fn open(data_dir: &Path) -> Result<Self, sqlx::Error> {
        tokio::fs::create_dir_all(data_dir).await?;
        Self::new(&database_url(data_dir)).await
    }

    /// Close readers, then the writer, waiting for in-flight checkpoint writes.
    pub async fn close(&self) {
        self.reader.close().await;
        self.writer.close().await;
    }
}

/// `sqlite://<data_dir>/weft.db`.
pub fn database_url(data_dir: &Path) -> String {
    format!("sqlite://{}", data_dir.join(DATABASE_FILE).display())
}

/// [`database_url`] for the default data dir (`WEFT_DATA_DIR` or `~/.weft`).
pub fn default_database_url() -> String {
    database_url(&default_data_dir())
}
