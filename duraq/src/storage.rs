mod sqlite;

pub use sqlite::Sqlite;

use serde_json::Value as JsonValue;

use crate::{Job, StorageError};

/// Durable, crash-safe home for jobs, and the sole authority for claim
/// atomicity.
#[async_trait::async_trait]
pub trait Storage: Send + Sync {
    /// Append a new job with `attempts = 0` and `in_flight = false` and
    /// return the stored record.
    async fn persist(&self, task: &str, payload: JsonValue) -> Result<Job, StorageError>;

    /// Select up to `limit` unclaimed jobs in ascending id order and mark
    /// them in-flight, atomically: two concurrent calls never return
    /// overlapping job ids. Returns an empty list when nothing is eligible
    /// or `limit` is zero.
    async fn claim_up_to(&self, limit: u32) -> Result<Vec<Job>, StorageError>;

    /// Increment `attempts` and clear the claim flag so the job becomes
    /// eligible for reclaim. A no-op if the job no longer exists.
    async fn record_retry(&self, id: i64) -> Result<(), StorageError>;

    /// Remove the job. A no-op if already removed; resolution paths race
    /// harmlessly against `clear`.
    async fn delete(&self, id: i64) -> Result<(), StorageError>;

    /// Clear the claim flag on every job. Run once at startup to recover
    /// jobs left in-flight by a prior crash.
    async fn reset_claims(&self) -> Result<(), StorageError>;

    /// Delete all jobs.
    async fn clear(&self) -> Result<(), StorageError>;

    async fn count(&self) -> Result<u64, StorageError>;

    async fn count_for_task(&self, task: &str) -> Result<u64, StorageError>;

    async fn exists(&self, task: &str) -> Result<bool, StorageError>;

    /// The oldest job for `task`, claimed or not. Never mutates claim state.
    async fn peek(&self, task: &str) -> Result<Option<Job>, StorageError>;

    /// The oldest job overall, claimed or not. Never mutates claim state.
    async fn peek_any(&self) -> Result<Option<Job>, StorageError>;
}
