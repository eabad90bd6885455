//! Directory watcher and the notifier that forwards its events.

mod normalize;
mod notifier;
mod rename;
mod watcher;

pub use normalize::normalize;
pub use notifier::Notifier;
pub use rename::{Paired, RENAME_GRACE, RenamePairing};
pub use watcher::{CreatedEntry, CreatedLog, Watcher};

use anyhow::Result;
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

use filebox_channel::{ChannelError, MqttPublisher, MqttSettings};
use filebox_config::WatcherConfig;

/// Client id for a notifier session.  Notifiers publish only, so each one
/// gets a unique id and never takes over the consumer's persistent session.
pub fn notifier_client_id(base: &str) -> String {
    format!("{base}-notifier-{}", Uuid::new_v4().simple())
}

/// Connect an MQTT publisher for the notifier.
pub async fn connect_mqtt_publisher(settings: MqttSettings) -> Result<MqttPublisher, ChannelError> {
    let client_id = notifier_client_id(&settings.client_id);
    MqttPublisher::connect(settings.with_client_id(client_id)).await
}

/// Watch `config.source_dir` and publish every event through `notifier`
/// until `shutdown` flips to `true`.
///
/// Fails only when the watcher cannot start or the notifier runs out of
/// reconnect attempts.  Other publish failures are logged and skipped.
pub async fn run_watcher(
    config: &WatcherConfig,
    mut notifier: Notifier,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut watcher = match Watcher::start(&config.source_dir, config.recursive) {
        Ok(watcher) => watcher,
        Err(err) => {
            notifier.close().await;
            return Err(err);
        }
    };
    println!(
        "[+] Started File Handler, observing the directory '{}'.",
        watcher.root().display()
    );
    info!(root = %watcher.root().display(), recursive = config.recursive, "watcher started");

    let result = loop {
        if *shutdown.borrow() {
            break Ok(());
        }
        tokio::select! {
            event = watcher.next_event() => {
                let Some(event) = event else {
                    info!("filesystem watcher closed");
                    break Ok(());
                };
                match notifier.notify(&event).await {
                    Ok(()) => {}
                    Err(err @ ChannelError::RetriesExhausted { .. }) => {
                        error!(%err, "notifier lost the broker");
                        break Err(anyhow::Error::new(err).context("notifier could not reach the broker"));
                    }
                    Err(err) => error!(%err, event = %event, "failed to publish event"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break Ok(());
                }
            }
        }
    };

    notifier.close().await;
    for entry in watcher.created_log().entries() {
        debug!(path = %entry.path.display(), observed_at = %entry.observed_at, "created");
    }
    info!(
        created = watcher.created_log().len(),
        published = notifier.published(),
        "watcher stopped"
    );
    println!("[+] Stopped File Handler.");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use filebox_channel::{MemoryBroker, ReconnectPolicy};

    #[test]
    fn notifier_ids_are_unique() {
        let a = notifier_client_id("filebox");
        let b = notifier_client_id("filebox");
        assert!(a.starts_with("filebox-notifier-"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn run_watcher_publishes_until_shutdown() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = WatcherConfig {
            source_dir: dir.path().to_string_lossy().into_owned(),
            recursive: true,
        };
        let broker = MemoryBroker::new();
        let publisher = broker.publisher("file-box").unwrap();
        let notifier = Notifier::new(Box::new(publisher), ReconnectPolicy::default())
            .await
            .unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move { run_watcher(&config, notifier, shutdown_rx).await });
        // Give the OS watcher a moment to register.
        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();

        let queue = broker.declare("file-box");
        tokio::time::timeout(Duration::from_secs(5), async {
            while !queue.peek_ready().iter().any(|m| m.starts_with("created ") && m.ends_with("a.txt")) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn run_watcher_fails_for_missing_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = WatcherConfig {
            source_dir: dir.path().join("missing").to_string_lossy().into_owned(),
            recursive: true,
        };
        let broker = MemoryBroker::new();
        let publisher = broker.publisher("file-box").unwrap();
        let notifier = Notifier::new(Box::new(publisher), ReconnectPolicy::default())
            .await
            .unwrap();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        assert!(run_watcher(&config, notifier, shutdown_rx).await.is_err());
    }
}
