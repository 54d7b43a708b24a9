use std::sync::Arc;

use duraq::prelude::*;
use duraq::{ChannelNotifier, Config, Sqlite};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, instrument};

#[derive(Debug, Deserialize)]
struct Email {
    to: String,
    subject: String,
}

struct Mailer;

#[duraq::async_trait]
impl Processor for Mailer {
    #[instrument(skip(self, job), fields(id = job.id))]
    async fn process(&self, job: &Job) -> ProcessResult {
        let email: Email = job.payload_as()?;
        info!("sending '{}' to {}", email.subject, email.to);

        Outcome::Success.into()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::load()?;
    let storage = Arc::new(Sqlite::connect(&config.database_path).await?);

    let (notifier, mut events) = ChannelNotifier::new();

    let queue = Queue::builder()
        .storage(storage)
        .processor(Arc::new(Mailer))
        .notifier(Arc::new(notifier))
        .concurrency(config.concurrency)
        .retry_limit(config.retry_limit)
        .build();

    queue.start();

    queue
        .enqueue("email", json!({"to": "amy@example.com", "subject": "hello"}))
        .await?;
    queue
        .enqueue("email", json!({"to": "sam@example.com", "subject": "again"}))
        .await?;

    while let Some(event) = events.recv().await {
        info!(?event, "queue event");
        if matches!(event, QueueEvent::Drained) {
            break;
        }
    }

    Ok(())
}
