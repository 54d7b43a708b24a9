use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::StorageError;

/// A persisted unit of work.
///
/// Rows live in the `jobs` table from creation until a successful or
/// exhausted resolution deletes them. `id` is assigned by the store,
/// monotonically, and is never reused after deletion. `task` and `payload`
/// are immutable once created; only `attempts` and `in_flight` change over
/// a job's lifetime.
#[derive(Clone, Debug, Serialize, Deserialize, sqlx::FromRow)]
pub struct Job {
    pub id: i64,
    pub task: String,
    pub payload: JsonValue,
    /// Failed attempts so far. Incremented only on a retryable failure.
    pub attempts: i64,
    /// Claim flag. True while a worker holds the job; cleared on a
    /// retryable failure, never cleared on success (the row is deleted).
    pub in_flight: bool,
    pub enqueued_at: DateTime<Utc>,
}

impl Job {
    /// Deserialize the payload into a caller type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, StorageError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}
