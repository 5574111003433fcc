//! In-process transport
//!
//! Mirrors NSQ's delivery model without a network:
//! - a topic copies each message to every one of its channels
//! - consumers of the same channel compete for its messages
//! - messages published before a topic has any channel wait in a backlog
//!   and go to the first channel that appears
//! - a handler error requeues the message with its attempt count bumped,
//!   until `max_attempts` is exceeded
//!
//! Addresses are only used to simulate unreachable nodes through
//! `mark_unreachable`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;

use crate::transport::{
    Consumer, ConsumerSpec, InboundHandler, InboundMessage, MessageId, Producer, Transport,
    TransportConfig, TransportLogger, is_valid_name,
};
use crate::utils::error::TransportError;

#[derive(Clone)]
struct ChannelQueue {
    tx: mpsc::UnboundedSender<InboundMessage>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<InboundMessage>>>,
}

impl ChannelQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }
}

#[derive(Default)]
struct TopicState {
    backlog: Vec<InboundMessage>,
    channels: HashMap<String, ChannelQueue>,
}

#[derive(Default)]
struct Inner {
    topics: StdMutex<HashMap<String, TopicState>>,
    unreachable: StdMutex<HashSet<String>>,
    fail_publishes: AtomicBool,
    open_consumers: AtomicUsize,
    open_producers: AtomicUsize,
    next_id: AtomicU64,
}

/// Shared in-process broker. Clones share the same topics.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<Inner>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes producer and lookupd connections to `addr` fail.
    pub fn mark_unreachable(&self, addr: impl Into<String>) {
        self.inner
            .unreachable
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(addr.into());
    }

    /// Makes every publish fail while set.
    pub fn fail_publishes(&self, fail: bool) {
        self.inner.fail_publishes.store(fail, Ordering::Release);
    }

    /// Consumers created and not yet stopped.
    pub fn open_consumers(&self) -> usize {
        self.inner.open_consumers.load(Ordering::Acquire)
    }

    /// Producers connected and not yet stopped.
    pub fn open_producers(&self) -> usize {
        self.inner.open_producers.load(Ordering::Acquire)
    }

    /// Messages waiting for the first channel of `topic`.
    pub fn backlog(&self, topic: &str) -> usize {
        self.topics()
            .get(topic)
            .map(|state| state.backlog.len())
            .unwrap_or(0)
    }

    fn topics(&self) -> std::sync::MutexGuard<'_, HashMap<String, TopicState>> {
        self.inner
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn check_reachable(&self, addr: &str) -> Result<(), TransportError> {
        let unreachable = self
            .inner
            .unreachable
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if unreachable.contains(addr) {
            return Err(TransportError::Unreachable(addr.to_string()));
        }
        Ok(())
    }

    fn check_publish(&self) -> Result<(), TransportError> {
        if self.inner.fail_publishes.load(Ordering::Acquire) {
            return Err(TransportError::Injected("publish rejected".to_string()));
        }
        Ok(())
    }

    fn next_message(&self, body: &[u8]) -> InboundMessage {
        let seq = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut id: MessageId = [0; 16];
        id.copy_from_slice(format!("{seq:016x}").as_bytes());
        InboundMessage {
            id,
            attempts: 1,
            timestamp: Utc::now(),
            body: body.to_vec(),
        }
    }

    fn deliver(&self, topic: &str, message: InboundMessage) {
        let mut topics = self.topics();
        let state = topics.entry(topic.to_string()).or_default();
        if state.channels.is_empty() {
            state.backlog.push(message);
            return;
        }
        for queue in state.channels.values() {
            let _ = queue.tx.send(message.clone());
        }
    }

    fn deliver_after(&self, topic: &str, delay: Duration, message: InboundMessage) {
        if delay.is_zero() {
            self.deliver(topic, message);
            return;
        }
        let transport = self.clone();
        let topic = topic.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            transport.deliver(&topic, message);
        });
    }

    fn attach(&self, topic: &str, channel: &str) -> ChannelQueue {
        let mut topics = self.topics();
        let state = topics.entry(topic.to_string()).or_default();
        let first = state.channels.is_empty();
        let queue = state
            .channels
            .entry(channel.to_string())
            .or_insert_with(ChannelQueue::new)
            .clone();
        if first {
            for message in state.backlog.drain(..) {
                let _ = queue.tx.send(message);
            }
        }
        queue
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect_producer(
        &self,
        addr: &str,
        _config: &TransportConfig,
        logger: TransportLogger,
    ) -> Result<Arc<dyn Producer>, TransportError> {
        self.check_reachable(addr)?;
        self.inner.open_producers.fetch_add(1, Ordering::AcqRel);
        logger.info(format!("({addr}) connected to in-memory nsqd"));
        Ok(Arc::new(MemoryProducer {
            transport: self.clone(),
            logger,
            stopped: AtomicBool::new(false),
        }))
    }

    fn new_consumer(
        &self,
        spec: ConsumerSpec,
        config: &TransportConfig,
        logger: TransportLogger,
    ) -> Result<Box<dyn Consumer>, TransportError> {
        if !is_valid_name(&spec.topic) || !is_valid_name(&spec.channel) {
            return Err(TransportError::Protocol(format!(
                "invalid topic/channel '{}/{}'",
                spec.topic, spec.channel
            )));
        }
        self.inner.open_consumers.fetch_add(1, Ordering::AcqRel);
        let (shutdown, _) = watch::channel(false);
        Ok(Box::new(MemoryConsumer {
            transport: self.clone(),
            spec,
            config: config.clone(),
            logger,
            queue: None,
            shutdown,
            tasks: Vec::new(),
            stopped: false,
        }))
    }
}

struct MemoryProducer {
    transport: MemoryTransport,
    logger: TransportLogger,
    stopped: AtomicBool,
}

impl MemoryProducer {
    fn ready(&self) -> Result<(), TransportError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.transport.check_publish()
    }
}

#[async_trait]
impl Producer for MemoryProducer {
    async fn publish(&self, topic: &str, body: &[u8]) -> Result<(), TransportError> {
        self.ready()?;
        self.transport
            .deliver(topic, self.transport.next_message(body));
        Ok(())
    }

    async fn multi_publish(&self, topic: &str, bodies: &[Vec<u8>]) -> Result<(), TransportError> {
        self.ready()?;
        for body in bodies {
            self.transport
                .deliver(topic, self.transport.next_message(body));
        }
        Ok(())
    }

    async fn deferred_publish(
        &self,
        topic: &str,
        delay: Duration,
        body: &[u8],
    ) -> Result<(), TransportError> {
        self.ready()?;
        self.transport
            .deliver_after(topic, delay, self.transport.next_message(body));
        Ok(())
    }

    async fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.transport
                .inner
                .open_producers
                .fetch_sub(1, Ordering::AcqRel);
            self.logger.info("producer stopped");
        }
    }
}

struct MemoryConsumer {
    transport: MemoryTransport,
    spec: ConsumerSpec,
    config: TransportConfig,
    logger: TransportLogger,
    queue: Option<ChannelQueue>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    stopped: bool,
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn connect_to_lookupd(&mut self, addr: &str) -> Result<(), TransportError> {
        if self.stopped {
            return Err(TransportError::Closed);
        }
        self.transport.check_reachable(addr)?;
        if self.queue.is_some() {
            return Ok(());
        }

        let queue = self.transport.attach(&self.spec.topic, &self.spec.channel);
        for _ in 0..self.spec.concurrency.max(1) {
            self.tasks.push(tokio::spawn(work_loop(
                queue.clone(),
                self.spec.handler.clone(),
                self.config.clone(),
                self.logger.clone(),
                self.shutdown.subscribe(),
            )));
        }
        self.queue = Some(queue);
        self.logger
            .info(format!("connected to in-memory nsqlookupd {addr}"));
        Ok(())
    }

    async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        let _ = self.shutdown.send(true);

        let handles = std::mem::take(&mut self.tasks);
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(self.config.shutdown_timeout, join_all(handles))
            .await
            .is_err()
        {
            self.logger.warn("handlers still running, aborting them");
            for abort in aborts {
                abort.abort();
            }
        }
        self.queue = None;
        self.transport
            .inner
            .open_consumers
            .fetch_sub(1, Ordering::AcqRel);
        self.logger.info("stopped");
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

async fn work_loop(
    queue: ChannelQueue,
    handler: Arc<dyn InboundHandler>,
    config: TransportConfig,
    logger: TransportLogger,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let next = tokio::select! {
            _ = shutdown.changed() => None,
            message = async { queue.rx.lock().await.recv().await } => message,
        };
        let Some(mut message) = next else { break };

        if config.max_attempts > 0 && message.attempts > config.max_attempts {
            logger.warn(format!(
                "msg {} attempted {} times, giving up",
                String::from_utf8_lossy(&message.id),
                message.attempts
            ));
            continue;
        }

        if let Err(err) = handler.handle(&message).await {
            let delay = config.requeue_delay(message.attempts);
            logger.warn(format!(
                "msg {} handler failed, requeueing in {delay:?} - {err}",
                String::from_utf8_lossy(&message.id)
            ));
            message.attempts = message.attempts.saturating_add(1);
            requeue(&queue, delay, message);
        }
    }
}

fn requeue(queue: &ChannelQueue, delay: Duration, message: InboundMessage) {
    if delay.is_zero() {
        let _ = queue.tx.send(message);
        return;
    }
    let tx = queue.tx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = tx.send(message);
    });
}
