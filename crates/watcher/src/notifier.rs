use tracing::{debug, info, warn};

use filebox_channel::{ChannelError, FileEvent, Publisher, ReconnectPolicy};

/// Publishes file events onto the channel.
///
/// When a publish finds the connection gone, the notifier reconnects under
/// its [`ReconnectPolicy`] and republishes the same event, so a single broker
/// drop loses nothing.
pub struct Notifier {
    publisher: Box<dyn Publisher>,
    policy: ReconnectPolicy,
    published: u64,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("policy", &self.policy)
            .field("published", &self.published)
            .finish()
    }
}

impl Notifier {
    /// Declare the queue on `publisher` and wrap it.
    pub async fn new(
        mut publisher: Box<dyn Publisher>,
        policy: ReconnectPolicy,
    ) -> Result<Self, ChannelError> {
        publisher.declare().await?;
        Ok(Self {
            publisher,
            policy,
            published: 0,
        })
    }

    pub fn published(&self) -> u64 {
        self.published
    }

    pub async fn notify(&mut self, event: &FileEvent) -> Result<(), ChannelError> {
        let body = event.encode();
        let rounds = self.policy.max_attempts.max(1);
        let mut round = 0;
        loop {
            match self.publisher.publish(&body).await {
                Ok(()) => {
                    self.published += 1;
                    debug!(kind = %event.kind, path = %event.path().display(), "event published");
                    return Ok(());
                }
                Err(err) if err.is_connection_lost() && round < rounds => {
                    round += 1;
                    println!("[!] Unable to send event to the broker, Error: {err}, trying to reconnect...");
                    warn!(%err, event = %body, "publish failed, reconnecting");
                    self.policy.reconnect(self.publisher.as_mut()).await?;
                    info!(event = %body, "republishing after reconnect");
                }
                Err(err) if err.is_connection_lost() => {
                    return Err(ChannelError::RetriesExhausted { attempts: rounds });
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub async fn close(&mut self) {
        self.publisher.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use filebox_channel::{EventKind, MemoryBroker};

    fn fast_policy() -> ReconnectPolicy {
        ReconnectPolicy {
            backoff: Duration::from_millis(1),
            multiplier: 2.0,
            max_backoff: Duration::from_millis(4),
            max_attempts: 3,
        }
    }

    async fn notifier(broker: &MemoryBroker) -> Notifier {
        let publisher = broker.publisher("file-box").unwrap();
        Notifier::new(Box::new(publisher), fast_policy()).await.unwrap()
    }

    #[tokio::test]
    async fn publishes_encoded_events() {
        let broker = MemoryBroker::new();
        let mut notifier = notifier(&broker).await;
        notifier
            .notify(&FileEvent::new(EventKind::Created, "/box/a b.txt"))
            .await
            .unwrap();

        let queue = broker.queue("file-box").unwrap();
        assert_eq!(queue.peek_ready(), vec!["created /box/a b.txt".to_string()]);
        assert_eq!(notifier.published(), 1);
    }

    #[tokio::test]
    async fn republishes_after_broker_drop() {
        let broker = MemoryBroker::new();
        let mut notifier = notifier(&broker).await;
        notifier
            .notify(&FileEvent::new(EventKind::Created, "/box/a.txt"))
            .await
            .unwrap();

        broker.sever();
        notifier
            .notify(&FileEvent::new(EventKind::Deleted, "/box/a.txt"))
            .await
            .unwrap();

        let queue = broker.queue("file-box").unwrap();
        assert_eq!(
            queue.peek_ready(),
            vec!["created /box/a.txt".to_string(), "deleted /box/a.txt".to_string()]
        );
    }

    #[tokio::test]
    async fn unreachable_broker_exhausts_retries() {
        let broker = MemoryBroker::new();
        let mut notifier = notifier(&broker).await;
        broker.set_available(false);
        broker.sever();

        let err = notifier
            .notify(&FileEvent::new(EventKind::Created, "/box/a.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::RetriesExhausted { attempts: 3 }));
        assert_eq!(notifier.published(), 0);
    }
}
