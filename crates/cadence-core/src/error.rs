use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Database error")]
    Database(#[from] sqlx::Error),

    #[error("Migration error")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("IO error")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid recurrence rule: {0}")]
    InvalidRule(String),

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("Transient calendar sync failure: {0}")]
    TransientSyncFailure(String),

    #[error("Permanent calendar sync failure: {0}")]
    PermanentSyncFailure(String),

    #[error("Store write failed: {0}")]
    StoreWriteFailure(String),

    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Scheduler is not running")]
    NotRunning,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Ambiguous short ID. Did you mean one of these?")]
    AmbiguousId(Vec<(String, String)>), // Vec of (ID, Title)
}

impl CoreError {
    /// Wraps a failed write so callers can tell it apart from read failures.
    pub fn write_failure(err: impl std::fmt::Display) -> Self {
        CoreError::StoreWriteFailure(err.to_string())
    }
}
