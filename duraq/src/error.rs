use thiserror::Error;

/// Errors surfaced at the persistence boundary.
///
/// These never corrupt claim atomicity: a failed claim transaction claims
/// nothing, and the engine treats every storage error as local to the
/// operation that raised it.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("payload serialization error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}
