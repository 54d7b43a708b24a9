use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::storage::Storage;
use crate::{Job, StorageError};

/// SQLite-backed [`Storage`].
///
/// Claiming relies on SQLite's single-writer transaction semantics: the
/// claim is one `UPDATE ... RETURNING` statement, so concurrent claims
/// serialize on the database write lock and return disjoint id sets.
pub struct Sqlite {
    pub pool: Arc<SqlitePool>,
}

impl Sqlite {
    /// Open (creating if missing) the database at `path` and run migrations.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new().connect_with(options).await?;

        let storage = Self::new(pool);
        storage.migrate().await?;

        Ok(storage)
    }

    /// Open an in-memory database and run migrations. The pool is pinned to
    /// a single connection that is never reaped, since the database lives
    /// and dies with that connection.
    pub async fn connect_in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new().filename(":memory:");

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let storage = Self::new(pool);
        storage.migrate().await?;

        Ok(storage)
    }

    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("./migrations").run(&*self.pool).await?;
        Ok(())
    }
}

impl From<SqlitePool> for Sqlite {
    fn from(pool: SqlitePool) -> Self {
        Self::new(pool)
    }
}

impl From<Arc<SqlitePool>> for Sqlite {
    fn from(pool: Arc<SqlitePool>) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl Storage for Sqlite {
    async fn persist(&self, task: &str, payload: JsonValue) -> Result<Job, StorageError> {
        let job = sqlx::query_as::<_, Job>(
            r#"
            INSERT INTO jobs (task, payload, attempts, in_flight, enqueued_at)
            VALUES (?1, ?2, 0, 0, ?3)
            RETURNING *
            "#,
        )
        .bind(task)
        .bind(payload)
        .bind(Utc::now())
        .fetch_one(&*self.pool)
        .await?;

        Ok(job)
    }

    async fn claim_up_to(&self, limit: u32) -> Result<Vec<Job>, StorageError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut jobs = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs
            SET in_flight = 1
            WHERE id IN (
                SELECT id
                FROM jobs
                WHERE in_flight = 0
                ORDER BY id ASC
                LIMIT ?1
            )
            RETURNING *
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await?;

        // RETURNING does not guarantee row order.
        jobs.sort_by_key(|job| job.id);

        Ok(jobs)
    }

    async fn record_retry(&self, id: i64) -> Result<(), StorageError> {
        sqlx::query(r#"UPDATE jobs SET attempts = attempts + 1, in_flight = 0 WHERE id = ?1"#)
            .bind(id)
            .execute(&*self.pool)
            .await
            .map(|_| ())
            .map_err(Into::into)
    }

    async fn delete(&self, id: i64) -> Result<(), StorageError> {
        sqlx::query(r#"DELETE FROM jobs WHERE id = ?1"#)
            .bind(id)
            .execute(&*self.pool)
            .await
            .map(|_| ())
            .map_err(Into::into)
    }

    async fn reset_claims(&self) -> Result<(), StorageError> {
        sqlx::query(r#"UPDATE jobs SET in_flight = 0 WHERE in_flight = 1"#)
            .execute(&*self.pool)
            .await
            .map(|_| ())
            .map_err(Into::into)
    }

    async fn clear(&self) -> Result<(), StorageError> {
        sqlx::query(r#"DELETE FROM jobs"#)
            .execute(&*self.pool)
            .await
            .map(|_| ())
            .map_err(Into::into)
    }

    async fn count(&self) -> Result<u64, StorageError> {
        let count = sqlx::query_scalar::<_, i64>(r#"SELECT COUNT(*) FROM jobs"#)
            .fetch_one(&*self.pool)
            .await?;

        Ok(count as u64)
    }

    async fn count_for_task(&self, task: &str) -> Result<u64, StorageError> {
        let count = sqlx::query_scalar::<_, i64>(r#"SELECT COUNT(*) FROM jobs WHERE task = ?1"#)
            .bind(task)
            .fetch_one(&*self.pool)
            .await?;

        Ok(count as u64)
    }

    async fn exists(&self, task: &str) -> Result<bool, StorageError> {
        let exists =
            sqlx::query_scalar::<_, bool>(r#"SELECT EXISTS(SELECT 1 FROM jobs WHERE task = ?1)"#)
                .bind(task)
                .fetch_one(&*self.pool)
                .await?;

        Ok(exists)
    }

    async fn peek(&self, task: &str) -> Result<Option<Job>, StorageError> {
        let job = sqlx::query_as::<_, Job>(
            r#"SELECT * FROM jobs WHERE task = ?1 ORDER BY id ASC LIMIT 1"#,
        )
        .bind(task)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(job)
    }

    async fn peek_any(&self) -> Result<Option<Job>, StorageError> {
        let job = sqlx::query_as::<_, Job>(r#"SELECT * FROM jobs ORDER BY id ASC LIMIT 1"#)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(job)
    }
}
