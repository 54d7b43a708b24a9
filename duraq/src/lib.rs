//! Durable in-process job queue backed by SQLite.
//!
//! Jobs are persisted before they are claimed, so the queue survives
//! process restarts; a bounded pool of tokio tasks executes them through a
//! caller-supplied [`Processor`], and each outcome drives retry-with-limit
//! or permanent removal. Delivery is at-least-once with bounded retries.
//!
//! ```no_run
//! use std::sync::Arc;
//! use duraq::prelude::*;
//! use duraq::Sqlite;
//! use serde_json::json;
//!
//! struct Mailer;
//!
//! #[duraq::async_trait]
//! impl Processor for Mailer {
//!     async fn process(&self, job: &Job) -> ProcessResult {
//!         // send the email described by job.payload ...
//!         Outcome::Success.into()
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let storage = Arc::new(Sqlite::connect("queue.db").await?);
//! let queue = Queue::builder()
//!     .storage(storage)
//!     .processor(Arc::new(Mailer))
//!     .concurrency(4)
//!     .retry_limit(4)
//!     .build();
//!
//! queue.start();
//! queue.enqueue("email", json!({"to": "someone@example.com"})).await?;
//! # Ok(())
//! # }
//! ```

pub use async_trait::async_trait;

mod config;
mod error;
mod model;
mod notifier;
mod queue;
mod result;
mod storage;

pub use config::Config;
pub use error::StorageError;
pub use model::Job;
pub use notifier::{ChannelNotifier, Notifier, NullNotifier, QueueEvent};
pub use queue::Queue;
pub use result::{Outcome, ProcessError, ProcessResult};
pub use storage::{Sqlite, Storage};

/// A prelude for building processors against the queue.
pub mod prelude {
    pub use crate::{Job, Outcome, ProcessResult, Processor, Queue, QueueEvent};
}

/// The external processing callback invoked once per dispatched job.
///
/// The async contract subsumes both delegate shapes: a synchronous
/// processor returns a ready outcome, an asynchronous one awaits before
/// returning — the engine resolves identically either way, and the future
/// resolving once guarantees exactly one outcome per dispatch. There is no
/// timeout: a processor that never returns permanently occupies one
/// concurrency slot.
#[async_trait::async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, job: &Job) -> ProcessResult;
}
