//! Event transport between the watcher's notifier and the consumer.
//!
//! A single named queue carries plain-text [`FileEvent`] messages from one
//! publisher to one subscriber, in order, at least once.  Two transports
//! implement the [`Publisher`] / [`Subscriber`] traits: an MQTT broker
//! ([`mqtt`]) for multi-process deployments and a process-local
//! [`MemoryBroker`] for single-process runs and tests.

mod error;
pub mod memory;
pub mod message;
pub mod mqtt;
mod reconnect;
mod subscription;
mod transport;

pub use error::ChannelError;
pub use memory::MemoryBroker;
pub use message::{EventKind, FileEvent, MessageError};
pub use mqtt::{MqttPublisher, MqttSettings, MqttSubscriber, drain_dead_letters};
pub use reconnect::ReconnectPolicy;
pub use subscription::subscribe;
pub use transport::{Connection, Delivery, DeliveryHandler, Publisher, Subscriber, validate_queue_name};
