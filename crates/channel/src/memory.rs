//! Process-local broker with named FIFO queues.
//!
//! Mirrors the broker contract closely enough to run the whole pipeline in
//! one process: queues are declared idempotently, deliveries stay unacked
//! until the handler acknowledges them, and unacked deliveries go back to the
//! head of their queue when the subscriber reconnects.
//!
//! Every connection remembers the broker generation it was opened in.
//! [`MemoryBroker::sever`] bumps the generation, which makes every open
//! connection fail with [`ChannelError::ConnectionClosed`] until it
//! reconnects.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::transport::{Acker, Connection, Delivery, Publisher, Subscriber, validate_queue_name};
use crate::ChannelError;

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<(u64, Vec<u8>)>,
    unacked: BTreeMap<u64, Vec<u8>>,
    next_tag: u64,
}

#[derive(Debug)]
pub struct MemoryQueue {
    name: String,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl MemoryQueue {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // A poisoned queue only means a test panicked mid-operation; the data
        // itself is still consistent.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn push(&self, body: Vec<u8>) {
        {
            let mut state = self.lock();
            state.next_tag += 1;
            let tag = state.next_tag;
            state.ready.push_back((tag, body));
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<(u64, Vec<u8>)> {
        let mut state = self.lock();
        let (tag, body) = state.ready.pop_front()?;
        state.unacked.insert(tag, body.clone());
        Some((tag, body))
    }

    pub(crate) fn ack(&self, tag: u64) {
        self.lock().unacked.remove(&tag);
    }

    /// Put every unacked delivery back at the head of the queue, oldest first.
    fn requeue_unacked(&self) -> usize {
        let requeued = {
            let mut state = self.lock();
            let unacked = std::mem::take(&mut state.unacked);
            let count = unacked.len();
            for (tag, body) in unacked.into_iter().rev() {
                state.ready.push_front((tag, body));
            }
            count
        };
        if requeued > 0 {
            self.notify.notify_one();
        }
        requeued
    }

    /// Messages waiting for delivery.
    pub fn ready_len(&self) -> usize {
        self.lock().ready.len()
    }

    /// Messages delivered but not yet acknowledged.
    pub fn unacked_len(&self) -> usize {
        self.lock().unacked.len()
    }

    /// Bodies waiting for delivery, in order.  For inspection only.
    pub fn peek_ready(&self) -> Vec<String> {
        self.lock()
            .ready
            .iter()
            .map(|(_, body)| String::from_utf8_lossy(body).into_owned())
            .collect()
    }
}

#[derive(Debug)]
struct BrokerInner {
    queues: Mutex<HashMap<String, Arc<MemoryQueue>>>,
    generation: AtomicU64,
    available: AtomicBool,
}

#[derive(Debug, Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                queues: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                available: AtomicBool::new(true),
            }),
        }
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<String, Arc<MemoryQueue>>> {
        self.inner
            .queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Return the queue called `name`, creating it on first use.
    pub fn declare(&self, name: &str) -> Arc<MemoryQueue> {
        let mut queues = self.queues();
        queues
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(queue = name, "memory queue created");
                Arc::new(MemoryQueue::new(name))
            })
            .clone()
    }

    pub fn queue(&self, name: &str) -> Option<Arc<MemoryQueue>> {
        self.queues().get(name).cloned()
    }

    pub fn queue_count(&self) -> usize {
        self.queues().len()
    }

    /// Drop every open connection, as a broker restart would.
    pub fn sever(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        for queue in self.queues().values() {
            queue.notify.notify_waiters();
        }
        info!("memory broker severed all connections");
    }

    /// Make new connections fail (`false`) or succeed (`true`).
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    fn open_connection(&self) -> Result<u64, ChannelError> {
        if !self.inner.available.load(Ordering::SeqCst) {
            return Err(ChannelError::Connect("memory broker unavailable".to_string()));
        }
        Ok(self.generation())
    }

    pub(crate) fn ensure_generation(&self, generation: u64) -> Result<(), ChannelError> {
        if generation != self.generation() {
            return Err(ChannelError::ConnectionClosed(
                "memory broker connection was severed".to_string(),
            ));
        }
        Ok(())
    }

    pub fn publisher(&self, queue: &str) -> Result<MemoryPublisher, ChannelError> {
        validate_queue_name(queue)?;
        let generation = self.open_connection()?;
        Ok(MemoryPublisher {
            broker: self.clone(),
            queue_name: queue.to_string(),
            queue: None,
            generation,
            closed: false,
        })
    }

    pub fn subscriber(&self, queue: &str) -> Result<MemorySubscriber, ChannelError> {
        validate_queue_name(queue)?;
        let generation = self.open_connection()?;
        Ok(MemorySubscriber {
            broker: self.clone(),
            queue_name: queue.to_string(),
            queue: None,
            generation,
            closed: false,
        })
    }
}

#[derive(Debug)]
pub struct MemoryPublisher {
    broker: MemoryBroker,
    queue_name: String,
    queue: Option<Arc<MemoryQueue>>,
    generation: u64,
    closed: bool,
}

#[async_trait]
impl Connection for MemoryPublisher {
    async fn reconnect(&mut self) -> Result<(), ChannelError> {
        self.generation = self.broker.open_connection()?;
        self.closed = false;
        Publisher::declare(self).await
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn declare(&mut self) -> Result<(), ChannelError> {
        self.broker.ensure_generation(self.generation)?;
        self.queue = Some(self.broker.declare(&self.queue_name));
        Ok(())
    }

    async fn publish(&mut self, body: &str) -> Result<(), ChannelError> {
        if self.closed {
            return Err(ChannelError::ConnectionClosed("publisher closed".to_string()));
        }
        self.broker.ensure_generation(self.generation)?;
        let queue = match &self.queue {
            Some(queue) => queue.clone(),
            None => {
                let queue = self.broker.declare(&self.queue_name);
                self.queue = Some(queue.clone());
                queue
            }
        };
        queue.push(body.as_bytes().to_vec());
        Ok(())
    }
}

#[derive(Debug)]
pub struct MemorySubscriber {
    broker: MemoryBroker,
    queue_name: String,
    queue: Option<Arc<MemoryQueue>>,
    generation: u64,
    closed: bool,
}

#[async_trait]
impl Connection for MemorySubscriber {
    async fn reconnect(&mut self) -> Result<(), ChannelError> {
        self.generation = self.broker.open_connection()?;
        self.closed = false;
        Subscriber::declare(self).await?;
        if let Some(queue) = &self.queue {
            let requeued = queue.requeue_unacked();
            if requeued > 0 {
                info!(queue = %self.queue_name, requeued, "returned unacked deliveries to queue");
            }
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.closed = true;
        if let Some(queue) = &self.queue {
            queue.notify.notify_waiters();
        }
    }
}

#[async_trait]
impl Subscriber for MemorySubscriber {
    async fn declare(&mut self) -> Result<(), ChannelError> {
        self.broker.ensure_generation(self.generation)?;
        self.queue = Some(self.broker.declare(&self.queue_name));
        Ok(())
    }

    async fn declare_dead_letter(&mut self, queue: &str) -> Result<(), ChannelError> {
        validate_queue_name(queue)?;
        self.broker.ensure_generation(self.generation)?;
        self.broker.declare(queue);
        Ok(())
    }

    async fn next_delivery(&mut self) -> Result<Option<Delivery>, ChannelError> {
        let queue = match &self.queue {
            Some(queue) => queue.clone(),
            None => {
                Subscriber::declare(self).await?;
                self.broker.declare(&self.queue_name)
            }
        };

        loop {
            let notified = queue.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.closed {
                return Ok(None);
            }
            self.broker.ensure_generation(self.generation)?;
            if let Some((tag, body)) = queue.pop() {
                let acker = Acker::Memory {
                    broker: self.broker.clone(),
                    queue: queue.clone(),
                    generation: self.generation,
                };
                return Ok(Some(Delivery::new(tag, body, acker)));
            }

            notified.await;
        }
    }
}
