//! MQTT transport using rumqttc.
//!
//! The named queue is an MQTT topic.  The subscriber keeps a persistent
//! session (`clean_session = false`, fixed client id) and subscribes at QoS 1
//! with manual acknowledgements, so the broker buffers messages for it while
//! it is away and redelivers anything it never acknowledged.  Dead letters
//! are parked the same way, on a second persistent session subscribed to the
//! dead-letter topic.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use filebox_config::BrokerConfig;

use crate::transport::{Acker, Connection, Delivery, Publisher, Subscriber, validate_queue_name};
use crate::ChannelError;

/// Request channel capacity between the client handle and its event loop.
const CLIENT_CAP: usize = 64;

/// Default MQTT port when the broker url omits one.
const DEFAULT_PORT: u16 = 1883;

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub queue: String,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
}

impl MqttSettings {
    pub fn from_config(config: &BrokerConfig) -> Result<Self, ChannelError> {
        let (host, port) = parse_broker_url(&config.url)?;
        Ok(Self {
            host,
            port,
            client_id: config.client_id.clone(),
            queue: config.queue.clone(),
            keep_alive: Duration::from_secs(config.keep_alive_secs.max(5)),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs.max(1)),
        })
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// Settings for the persistent session that parks messages sent to the
    /// dead-letter `queue`.  The client id is fixed so every run resumes the
    /// same session.
    pub fn dead_letter_session(&self, queue: &str) -> Self {
        Self {
            client_id: format!("{}-dead-letter", self.client_id),
            queue: queue.to_string(),
            ..self.clone()
        }
    }

    fn options(&self, persistent: bool) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(!persistent);
        options.set_manual_acks(persistent);
        options
    }
}

/// Parse `mqtt://host:port`, `tcp://host:port` or bare `host[:port]`.
pub fn parse_broker_url(url: &str) -> Result<(String, u16), ChannelError> {
    let stripped = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("tcp://"))
        .unwrap_or(url)
        .trim_end_matches('/');

    let (host, port) = match stripped.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| ChannelError::InvalidUrl(format!("invalid port in '{url}'")))?;
            (host, port)
        }
        None => (stripped, DEFAULT_PORT),
    };

    if host.is_empty() {
        return Err(ChannelError::InvalidUrl(format!("missing host in '{url}'")));
    }
    Ok((host.to_string(), port))
}

/// Poll `event_loop` until the broker accepts the connection.
async fn wait_for_connack(
    event_loop: &mut EventLoop,
    timeout: Duration,
) -> Result<(), ChannelError> {
    let wait = async {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    debug!(session_present = ack.session_present, "broker accepted connection");
                    return Ok(());
                }
                Ok(_) => continue,
                Err(err) => return Err(ChannelError::Connect(err.to_string())),
            }
        }
    };
    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| ChannelError::Connect(format!("no answer from broker within {timeout:?}")))?
}

// ── Publisher ────────────────────────────────────────────────────────────────

/// Pause between redials while the broker is unreachable.
const REDIAL_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Up,
    Down,
}

/// Publishing end.  One event loop runs on a background task for the whole
/// life of the publisher.  While the link is down [`Publisher::publish`]
/// reports [`ChannelError::ConnectionClosed`].
pub struct MqttPublisher {
    settings: MqttSettings,
    client: AsyncClient,
    link: watch::Receiver<Link>,
    driver: JoinHandle<()>,
}

impl std::fmt::Debug for MqttPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttPublisher")
            .field("settings", &self.settings)
            .field("link", &*self.link.borrow())
            .finish()
    }
}

impl MqttPublisher {
    pub async fn connect(settings: MqttSettings) -> Result<Self, ChannelError> {
        validate_queue_name(&settings.queue)?;
        let (client, link, driver) = Self::open(&settings).await?;
        println!(
            "[+] Notifier connected successfully to queue '{}'.",
            settings.queue
        );
        info!(host = %settings.host, port = settings.port, queue = %settings.queue, "publisher connected");
        Ok(Self {
            settings,
            client,
            link,
            driver,
        })
    }

    async fn open(
        settings: &MqttSettings,
    ) -> Result<(AsyncClient, watch::Receiver<Link>, JoinHandle<()>), ChannelError> {
        let (client, mut event_loop) = AsyncClient::new(settings.options(false), CLIENT_CAP);
        wait_for_connack(&mut event_loop, settings.connect_timeout).await?;
        let (link_tx, link) = watch::channel(Link::Up);
        let driver = tokio::spawn(drive_publisher(event_loop, link_tx));
        Ok((client, link, driver))
    }

    fn is_up(&self) -> bool {
        !self.driver.is_finished() && *self.link.borrow() == Link::Up
    }
}

impl Drop for MqttPublisher {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// Poll the publisher's event loop until it sends DISCONNECT.  After a drop
/// the same loop redials, and once the broker accepts it again every publish
/// still waiting for a PUBACK is sent again.
async fn drive_publisher(mut event_loop: EventLoop, link: watch::Sender<Link>) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("publisher link restored");
                link.send_replace(Link::Up);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("publisher disconnect sent");
                break;
            }
            Ok(_) => {}
            Err(ConnectionError::RequestsDone) => break,
            Err(err) => {
                if link.send_replace(Link::Down) == Link::Up {
                    warn!(%err, "publisher connection dropped");
                } else {
                    debug!(%err, "broker still unreachable");
                }
                tokio::time::sleep(REDIAL_PAUSE).await;
            }
        }
    }
}

#[async_trait]
impl Connection for MqttPublisher {
    async fn reconnect(&mut self) -> Result<(), ChannelError> {
        if self.driver.is_finished() {
            let (client, link, driver) = Self::open(&self.settings).await?;
            self.client = client;
            self.link = link;
            self.driver = driver;
        } else {
            let timeout = self.settings.connect_timeout;
            let mut link = self.link.clone();
            let restored = async { link.wait_for(|state| *state == Link::Up).await.map(|_| ()) };
            match tokio::time::timeout(timeout, restored).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    return Err(ChannelError::ConnectionClosed(
                        "publisher event loop stopped".to_string(),
                    ));
                }
                Err(_) => {
                    return Err(ChannelError::Connect(format!(
                        "broker still unreachable after {timeout:?}"
                    )));
                }
            }
        }
        println!("[+] Notifier reconnected to queue '{}'.", self.settings.queue);
        Ok(())
    }

    async fn close(&mut self) {
        if self.driver.is_finished() {
            return;
        }
        if let Err(err) = self.client.disconnect().await {
            debug!(%err, "publisher already disconnected");
        }
        if tokio::time::timeout(Duration::from_secs(2), &mut self.driver)
            .await
            .is_err()
        {
            self.driver.abort();
        }
        info!("publisher connection closed");
    }
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn declare(&mut self) -> Result<(), ChannelError> {
        // The broker creates topics on first use; only the name needs checking.
        validate_queue_name(&self.settings.queue)
    }

    async fn publish(&mut self, body: &str) -> Result<(), ChannelError> {
        if !self.is_up() {
            return Err(ChannelError::ConnectionClosed(
                "publisher is not connected".to_string(),
            ));
        }
        self.client
            .publish(
                self.settings.queue.as_str(),
                QoS::AtLeastOnce,
                false,
                body.as_bytes().to_vec(),
            )
            .await
            .map_err(|e| ChannelError::ConnectionClosed(e.to_string()))?;
        debug!(bytes = body.len(), queue = %self.settings.queue, "published event");
        Ok(())
    }
}

// ── Subscriber ───────────────────────────────────────────────────────────────

/// Receiving end.  Polls its own event loop inside
/// [`Subscriber::next_delivery`].
pub struct MqttSubscriber {
    settings: MqttSettings,
    client: AsyncClient,
    event_loop: EventLoop,
    closed: bool,
}

impl std::fmt::Debug for MqttSubscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttSubscriber")
            .field("settings", &self.settings)
            .field("closed", &self.closed)
            .finish()
    }
}

impl MqttSubscriber {
    pub async fn connect(settings: MqttSettings) -> Result<Self, ChannelError> {
        let (host, port) = (settings.host.clone(), settings.port);
        let subscriber = match Self::open(settings).await {
            Ok(subscriber) => subscriber,
            Err(err) => {
                println!("[!] Unable to connect to the message broker.");
                error!(%err, %host, port, "subscriber failed to connect");
                return Err(err);
            }
        };
        println!(
            "[+] Consumer connected successfully to queue '{}'.",
            subscriber.settings.queue
        );
        info!(%host, port, queue = %subscriber.settings.queue, "subscriber connected");
        Ok(subscriber)
    }

    async fn open(settings: MqttSettings) -> Result<Self, ChannelError> {
        validate_queue_name(&settings.queue)?;
        let (client, mut event_loop) = AsyncClient::new(settings.options(true), CLIENT_CAP);
        wait_for_connack(&mut event_loop, settings.connect_timeout).await?;
        Ok(Self {
            settings,
            client,
            event_loop,
            closed: false,
        })
    }

    /// Poll until the broker confirms the subscription.  Messages that arrive
    /// meanwhile stay unacknowledged, so the broker keeps them.
    async fn wait_for_suback(&mut self) -> Result<(), ChannelError> {
        let timeout = self.settings.connect_timeout;
        let wait = async {
            loop {
                match self.event_loop.poll().await {
                    Ok(Event::Incoming(Packet::SubAck(ack))) => {
                        if ack.return_codes.contains(&SubscribeReasonCode::Failure) {
                            return Err(ChannelError::Subscribe(format!(
                                "broker refused '{}'",
                                self.settings.queue
                            )));
                        }
                        return Ok(());
                    }
                    Ok(_) => {}
                    Err(err) => return Err(ChannelError::ConnectionClosed(err.to_string())),
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            ChannelError::Subscribe(format!("no SUBACK from broker within {timeout:?}"))
        })?
    }

    /// Send DISCONNECT and flush it.  Returns `false` when already closed.
    async fn disconnect(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        if let Err(err) = self.client.disconnect().await {
            debug!(%err, "subscriber already disconnected");
            return false;
        }
        let flush = async {
            loop {
                match self.event_loop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        let _ = tokio::time::timeout(Duration::from_secs(2), flush).await;
        true
    }
}

#[async_trait]
impl Connection for MqttSubscriber {
    async fn reconnect(&mut self) -> Result<(), ChannelError> {
        let (client, mut event_loop) = AsyncClient::new(self.settings.options(true), CLIENT_CAP);
        wait_for_connack(&mut event_loop, self.settings.connect_timeout).await?;
        self.client = client;
        self.event_loop = event_loop;
        self.closed = false;
        Subscriber::declare(self).await
    }

    async fn close(&mut self) {
        if self.disconnect().await {
            println!("[+] Consumer connection has been closed.");
        }
    }
}

#[async_trait]
impl Subscriber for MqttSubscriber {
    async fn declare(&mut self) -> Result<(), ChannelError> {
        self.client
            .subscribe(self.settings.queue.as_str(), QoS::AtLeastOnce)
            .await
            .map_err(|e| ChannelError::Subscribe(e.to_string()))?;
        debug!(queue = %self.settings.queue, "subscription requested");
        Ok(())
    }

    /// Register a persistent session subscribed to `queue`, then leave.  The
    /// broker holds every message sent to the topic for that session until
    /// [`drain_dead_letters`] collects it.
    async fn declare_dead_letter(&mut self, queue: &str) -> Result<(), ChannelError> {
        let mut parking = Self::open(self.settings.dead_letter_session(queue)).await?;
        Subscriber::declare(&mut parking).await?;
        let confirmed = parking.wait_for_suback().await;
        parking.disconnect().await;
        confirmed?;
        info!(queue, client_id = %parking.settings.client_id, "dead-letter session declared");
        Ok(())
    }

    async fn next_delivery(&mut self) -> Result<Option<Delivery>, ChannelError> {
        loop {
            if self.closed {
                return Ok(None);
            }
            match self.event_loop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if publish.topic != self.settings.queue {
                        debug!(topic = %publish.topic, "ignoring message from foreign topic");
                        if let Err(err) = self.client.ack(&publish).await {
                            debug!(%err, "failed to ack foreign message");
                        }
                        continue;
                    }
                    let tag = u64::from(publish.pkid);
                    let body = publish.payload.to_vec();
                    let acker = Acker::Mqtt {
                        client: self.client.clone(),
                        publish,
                    };
                    return Ok(Some(Delivery::new(tag, body, acker)));
                }
                Ok(Event::Incoming(Packet::SubAck(_))) => {
                    debug!(queue = %self.settings.queue, "subscription acknowledged");
                }
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    info!(session_present = ack.session_present, "broker session resumed");
                }
                Ok(_) => {}
                Err(err) => return Err(ChannelError::ConnectionClosed(err.to_string())),
            }
        }
    }
}

/// Collect and acknowledge every message held for the dead-letter session
/// of `queue`.  Stops once nothing arrives for `idle`.
pub async fn drain_dead_letters(
    settings: &MqttSettings,
    queue: &str,
    idle: Duration,
) -> Result<Vec<String>, ChannelError> {
    let mut session = MqttSubscriber::open(settings.dead_letter_session(queue)).await?;
    Subscriber::declare(&mut session).await?;

    let mut bodies = Vec::new();
    let drained = loop {
        match tokio::time::timeout(idle, session.next_delivery()).await {
            Ok(Ok(Some(mut delivery))) => {
                bodies.push(delivery.text().into_owned());
                if let Err(err) = delivery.ack().await {
                    break Err(err);
                }
            }
            Ok(Ok(None)) | Err(_) => break Ok(()),
            Ok(Err(err)) => break Err(err),
        }
    };
    session.disconnect().await;
    drained?;
    debug!(queue, count = bodies.len(), "dead letters drained");
    Ok(bodies)
}
