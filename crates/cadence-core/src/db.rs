use crate::error::CoreError;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;

pub use sqlx::SqlitePool as DbPool;

/// Opens (creating if needed) the SQLite store at `db_path` and applies the
/// embedded migrations.
///
/// WAL journaling lets the scheduler loop and CLI readers share the file;
/// foreign keys guard the instance -> template and intent -> instance links.
pub async fn establish_connection(db_path: &str) -> Result<SqlitePool, CoreError> {
    // Create the parent directory if it doesn't exist
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    // Run migrations
    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}
