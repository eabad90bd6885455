use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;
use rumqttc::{AsyncClient, QoS};

use crate::ChannelError;
use crate::memory::{MemoryBroker, MemoryQueue};

/// Reject names that cannot address a single queue.  MQTT wildcards would
/// turn the queue into a topic filter.
pub fn validate_queue_name(name: &str) -> Result<(), ChannelError> {
    if name.trim().is_empty() || name.contains(['#', '+']) || name.contains('\0') {
        return Err(ChannelError::InvalidQueue(name.to_string()));
    }
    Ok(())
}

/// Lifecycle shared by both ends of the channel.
#[async_trait]
pub trait Connection: Send {
    /// Drop the current connection (if any), connect again, and re-declare
    /// the queue.
    async fn reconnect(&mut self) -> Result<(), ChannelError>;

    /// Close the connection.  Idempotent; failures are logged, not returned.
    async fn close(&mut self);
}

#[async_trait]
pub trait Publisher: Connection {
    /// Declare the queue.  Declaring an existing queue is a no-op.
    async fn declare(&mut self) -> Result<(), ChannelError>;

    /// Publish one message body.  Fails with
    /// [`ChannelError::ConnectionClosed`] when the connection has dropped.
    async fn publish(&mut self, body: &str) -> Result<(), ChannelError>;
}

#[async_trait]
pub trait Subscriber: Connection {
    /// Declare the queue and start receiving from it.  Idempotent.
    async fn declare(&mut self) -> Result<(), ChannelError>;

    /// Make sure messages sent to the dead-letter `queue` are kept until
    /// someone reads them.  Idempotent.
    async fn declare_dead_letter(&mut self, queue: &str) -> Result<(), ChannelError>;

    /// Wait for the next message.  `Ok(None)` means the subscriber was closed.
    async fn next_delivery(&mut self) -> Result<Option<Delivery>, ChannelError>;
}

/// Callback registered through [`crate::subscribe`], invoked once per
/// delivered message.  The handler owns acknowledgement.
#[async_trait]
pub trait DeliveryHandler: Send {
    async fn on_delivery(&mut self, delivery: Delivery);
}

pub(crate) enum Acker {
    Mqtt {
        client: AsyncClient,
        publish: rumqttc::Publish,
    },
    Memory {
        broker: MemoryBroker,
        queue: Arc<MemoryQueue>,
        generation: u64,
    },
}

/// A message handed to a subscriber, pending acknowledgement.
pub struct Delivery {
    tag: u64,
    body: Vec<u8>,
    acked: bool,
    acker: Acker,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("tag", &self.tag)
            .field("body", &self.text())
            .field("acked", &self.acked)
            .finish()
    }
}

impl Delivery {
    pub(crate) fn new(tag: u64, body: Vec<u8>, acker: Acker) -> Self {
        Self {
            tag,
            body,
            acked: false,
            acker,
        }
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn is_acked(&self) -> bool {
        self.acked
    }

    /// Acknowledge the message so the transport never redelivers it.
    /// Acknowledging twice is a no-op.
    pub async fn ack(&mut self) -> Result<(), ChannelError> {
        if self.acked {
            return Ok(());
        }
        match &self.acker {
            Acker::Mqtt { client, publish } => client
                .ack(publish)
                .await
                .map_err(|e| ChannelError::Ack(e.to_string()))?,
            Acker::Memory {
                broker,
                queue,
                generation,
            } => {
                broker.ensure_generation(*generation)?;
                queue.ack(self.tag);
            }
        }
        self.acked = true;
        Ok(())
    }

    /// Copy the body onto `queue` over the same connection, then acknowledge
    /// the original.
    pub async fn dead_letter(&mut self, queue: &str) -> Result<(), ChannelError> {
        validate_queue_name(queue)?;
        match &self.acker {
            Acker::Mqtt { client, .. } => client
                .publish(queue, QoS::AtLeastOnce, false, self.body.clone())
                .await
                .map_err(|e| ChannelError::Publish(e.to_string()))?,
            Acker::Memory {
                broker, generation, ..
            } => {
                broker.ensure_generation(*generation)?;
                broker.declare(queue).push(self.body.clone());
            }
        }
        self.ack().await
    }
}
