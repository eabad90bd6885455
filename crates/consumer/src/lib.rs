//! The deduplicating consumer: hashes each event's file, classifies it, and
//! resolves it against the [`filebox_store::HashStore`].

mod classify;
mod consumer;
mod error;
mod hash;

pub use classify::{AllowList, DEFAULT_PROCESSING_TOKEN, SizeTier, suffix};
pub use consumer::{Consumer, ConsumerStats, Resolution, duplicate_path};
pub use error::{ConsumerError, Stage};
pub use hash::{hash_bytes, hash_file};

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::info;

use filebox_channel::{ReconnectPolicy, Subscriber, subscribe};

/// Feed every delivery from `subscriber` to `consumer` until `shutdown`
/// flips to `true`, then close the connection.
///
/// Fails when the subscription or the dead-letter queue cannot be declared,
/// or when reconnects run out.
pub async fn run_consumer(
    subscriber: &mut dyn Subscriber,
    consumer: &mut Consumer,
    policy: &ReconnectPolicy,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let result = consume(subscriber, consumer, policy, shutdown).await;
    subscriber.close().await;

    let stats = consumer.stats();
    info!(
        received = stats.received,
        registered = stats.registered,
        duplicates = stats.duplicates,
        removed = stats.removed,
        logged = stats.logged,
        skipped = stats.skipped,
        abandoned = stats.abandoned,
        "consumer stopped"
    );
    result
}

async fn consume(
    subscriber: &mut dyn Subscriber,
    consumer: &mut Consumer,
    policy: &ReconnectPolicy,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    if let Some(queue) = consumer.dead_letter_queue().map(str::to_owned) {
        subscriber
            .declare_dead_letter(&queue)
            .await
            .with_context(|| format!("failed to declare dead-letter queue '{queue}'"))?;
    }
    subscribe(subscriber, consumer, policy, shutdown)
        .await
        .context("consumer subscription failed")
}
