use tokio::sync::watch;
use tracing::{info, warn};

use crate::{ChannelError, DeliveryHandler, ReconnectPolicy, Subscriber};

/// Declare the queue on `subscriber` and feed every delivery to `handler`,
/// one at a time, in queue order.
///
/// A dropped connection is recovered with `policy`; the loop fails only when
/// the policy runs out of attempts or the transport reports a non-connection
/// error.  Returns `Ok(())` when `shutdown` flips to `true`, its sender goes
/// away, or the subscriber is closed.  A handler already running is allowed
/// to finish.
pub async fn subscribe(
    subscriber: &mut dyn Subscriber,
    handler: &mut dyn DeliveryHandler,
    policy: &ReconnectPolicy,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ChannelError> {
    subscriber.declare().await?;
    let mut delivered: u64 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }
        let next = tokio::select! {
            next = subscriber.next_delivery() => next,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        match next {
            Ok(Some(delivery)) => {
                delivered += 1;
                handler.on_delivery(delivery).await;
            }
            Ok(None) => {
                info!("subscriber closed");
                break;
            }
            Err(err) if err.is_connection_lost() => {
                println!("[!] Connection closed due to {err}, trying to reconnect...");
                warn!(%err, "subscriber connection lost");
                tokio::select! {
                    result = policy.reconnect(&mut *subscriber) => result?,
                    _ = shutdown.changed() => break,
                }
            }
            Err(err) => return Err(err),
        }
    }

    info!(delivered, "subscription stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use crate::{Connection, Delivery, MemoryBroker, Publisher};

    struct Recorder {
        tx: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl DeliveryHandler for Recorder {
        async fn on_delivery(&mut self, mut delivery: Delivery) {
            delivery.ack().await.unwrap();
            self.tx.send(delivery.text().into_owned()).unwrap();
        }
    }

    fn fast_policy() -> ReconnectPolicy {
        ReconnectPolicy {
            backoff: Duration::from_millis(5),
            multiplier: 1.0,
            max_backoff: Duration::from_millis(5),
            max_attempts: 3,
        }
    }

    #[tokio::test]
    async fn handler_sees_messages_in_order_and_stops_on_shutdown() {
        let broker = MemoryBroker::new();
        let mut subscriber = broker.subscriber("file-box").unwrap();
        let mut publisher = broker.publisher("file-box").unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            let mut handler = Recorder { tx };
            subscribe(&mut subscriber, &mut handler, &fast_policy(), shutdown_rx).await
        });

        publisher.publish("created /a.txt").await.unwrap();
        publisher.publish("deleted /a.txt").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "created /a.txt");
        assert_eq!(rx.recv().await.unwrap(), "deleted /a.txt");

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn reconnects_after_sever_and_keeps_consuming() {
        let broker = MemoryBroker::new();
        let mut subscriber = broker.subscriber("file-box").unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            let mut handler = Recorder { tx };
            subscribe(&mut subscriber, &mut handler, &fast_policy(), shutdown_rx).await
        });

        let mut publisher = broker.publisher("file-box").unwrap();
        publisher.publish("created /a.txt").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "created /a.txt");

        broker.sever();
        publisher.reconnect().await.unwrap();
        publisher.publish("created /b.txt").await.unwrap();
        let next = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(next.unwrap(), "created /b.txt");

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn exhausted_reconnects_are_fatal() {
        let broker = MemoryBroker::new();
        let mut subscriber = broker.subscriber("file-box").unwrap();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (tx, _rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            let mut handler = Recorder { tx };
            subscribe(&mut subscriber, &mut handler, &fast_policy(), shutdown_rx).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.set_available(false);
        broker.sever();

        let result = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(matches!(result, Err(ChannelError::RetriesExhausted { attempts: 3 })));
    }
}
