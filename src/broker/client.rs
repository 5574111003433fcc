use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, RwLock};

use tokio::sync::Mutex;

use crate::broker::admin::TopicAdmin;
use crate::broker::handler::{MessageHandler, QueueDispatcher};
use crate::config::{
    DEFAULT_NSQ_ADDR, DEFAULT_NSQ_LOOKUPD_ADDR, HostConfig, NSQ_ADDR_KEY, NSQ_LOOKUPD_ADDR_KEY,
    Settings,
};
use crate::message::QueueEntry;
use crate::transport::{
    Consumer, ConsumerSpec, LogLevel, NsqTransport, Producer, Transport, TransportConfig,
    TransportLogger, is_valid_name,
};
use crate::utils::error::{BrokerError, Result, TransportError};
use crate::utils::logging::{LogSink, TracingSink};

/// Construction options for a `BrokerClient`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    /// Connection tuning. `TransportConfig::default()` when `None`.
    pub config: Option<TransportConfig>,
    pub log_level: LogLevel,
    /// Create the topic through nsqlookupd before subscribing to it.
    pub auto_create_topic: bool,
    /// Handler tasks per subscription.
    pub concurrency: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            config: None,
            log_level: LogLevel::Info,
            auto_create_topic: false,
            concurrency: 1,
        }
    }
}

impl From<&Settings> for ClientOptions {
    fn from(settings: &Settings) -> Self {
        let log_level = settings.log_level.parse::<LogLevel>().unwrap_or_else(|err| {
            tracing::warn!("{err}, using {}", LogLevel::default());
            LogLevel::default()
        });
        Self {
            config: Some(TransportConfig {
                max_in_flight: settings.max_in_flight as u64,
                ..TransportConfig::default()
            }),
            log_level,
            auto_create_topic: settings.auto_create_topic,
            concurrency: settings.concurrency,
        }
    }
}

/// Addresses resolved during `init`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    /// nsqd TCP address used by the producer.
    pub nsqd: String,
    /// nsqlookupd HTTP address used for discovery and topic creation.
    pub lookupd: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            nsqd: DEFAULT_NSQ_ADDR.to_string(),
            lookupd: DEFAULT_NSQ_LOOKUPD_ADDR.to_string(),
        }
    }
}

#[derive(Default)]
struct Subscriptions {
    active: HashMap<String, Box<dyn Consumer>>,
    // queue name -> ticket of the subscribe call still connecting it
    pending: HashMap<String, u64>,
}

/// Owns the producer and every consumer of a process, plus the queue
/// registry.
///
/// ```no_run
/// use std::sync::Arc;
/// use nsqlink::broker::{BrokerClient, ClientOptions, HandlerFn};
/// use nsqlink::config::load_config;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let settings = load_config()?;
/// let client = BrokerClient::new(ClientOptions::from(&settings));
/// client.init(&settings).await?;
///
/// let handler = HandlerFn::new(|queue, message| async move {
///     println!("{queue}: {:?}", message.data());
///     Ok(())
/// });
/// client.subscribe("orders", Arc::new(handler)).await?;
/// client.publish("orders", b"hello").await?;
/// client.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct BrokerClient {
    transport: Arc<dyn Transport>,
    config: TransportConfig,
    log_level: LogLevel,
    auto_create_topic: bool,
    concurrency: usize,
    sink: Arc<dyn LogSink>,
    endpoints: RwLock<Endpoints>,
    producer: RwLock<Option<Arc<dyn Producer>>>,
    // serializes producer dials with close
    lifecycle: Mutex<()>,
    // never held across an await
    consumers: StdMutex<Subscriptions>,
    next_ticket: AtomicU64,
    queues: StdMutex<HashMap<String, QueueEntry>>,
    admin: TopicAdmin,
}

impl BrokerClient {
    /// Client backed by the NSQ TCP transport.
    pub fn new(options: ClientOptions) -> Self {
        Self::with_transport(Arc::new(NsqTransport), options)
    }

    pub fn with_transport(transport: Arc<dyn Transport>, options: ClientOptions) -> Self {
        let config = options.config.unwrap_or_default();
        let admin = TopicAdmin::new(config.http_timeout, config.user_agent.clone());
        Self {
            transport,
            log_level: options.log_level,
            auto_create_topic: options.auto_create_topic,
            concurrency: options.concurrency.max(1),
            sink: Arc::new(TracingSink),
            endpoints: RwLock::new(Endpoints::default()),
            producer: RwLock::new(None),
            lifecycle: Mutex::new(()),
            consumers: StdMutex::new(Subscriptions::default()),
            next_ticket: AtomicU64::new(0),
            queues: StdMutex::new(HashMap::new()),
            admin,
            config,
        }
    }

    /// Routes transport log lines to `sink` instead of `tracing`.
    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = sink;
        self
    }

    fn logger(&self, context: impl Into<String>) -> TransportLogger {
        TransportLogger::new(self.sink.clone(), self.log_level).with_context(context)
    }

    pub fn endpoints(&self) -> Endpoints {
        self.endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Resolves the nsqd and nsqlookupd addresses from `host` and connects
    /// the producer.
    ///
    /// Calling it again replaces the producer: the new connection is made
    /// first, then the previous producer is stopped once its in-flight
    /// command completes. On failure the previous producer stays in place.
    pub async fn init(&self, host: &dyn HostConfig) -> Result<()> {
        let resolved = self.resolve_endpoints(host);
        tracing::info!(nsqd = %resolved.nsqd, lookupd = %resolved.lookupd, "initializing broker client");
        self.connect_producer_to("Init", &resolved.nsqd).await
    }

    /// Reads `NSQ_ADDR` and `NSQ_LOOKUPD_ADDR` from `host` and stores them,
    /// without connecting anything.
    pub fn resolve_endpoints(&self, host: &dyn HostConfig) -> Endpoints {
        let resolved = Endpoints {
            nsqd: host.get_or(NSQ_ADDR_KEY, DEFAULT_NSQ_ADDR),
            lookupd: host.get_or(NSQ_LOOKUPD_ADDR_KEY, DEFAULT_NSQ_LOOKUPD_ADDR),
        };
        *self
            .endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner) = resolved.clone();
        resolved
    }

    /// Connects a producer to the current nsqd address. Same replacement
    /// rules as `init`.
    pub async fn connect_to_producer(&self) -> Result<()> {
        let addr = self.endpoints().nsqd;
        self.connect_producer_to("ConnectToProducer", &addr).await
    }

    async fn connect_producer_to(&self, operation: &'static str, addr: &str) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let producer = self
            .transport
            .connect_producer(addr, &self.config, self.logger(addr))
            .await
            .map_err(|source| BrokerError::Connection {
                operation,
                addr: addr.to_string(),
                source,
            })?;

        let previous = self
            .producer
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(producer);
        if let Some(previous) = previous {
            tracing::info!(addr, "replacing producer");
            previous.stop().await;
        }
        Ok(())
    }

    /// Whether a producer is available for publishing.
    pub fn is_connected(&self) -> bool {
        self.producer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn subscriptions_guard(&self) -> MutexGuard<'_, Subscriptions> {
        self.consumers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribes to `queue_name` on a channel of the same name and returns
    /// the subscriber id (the queue name).
    ///
    /// An existing subscription to the same queue is stopped first. If the
    /// new one then fails, the queue is left without a consumer. The
    /// registry is not locked while connecting; an `unsubscribe`, `close` or
    /// newer `subscribe` of the same queue that lands meanwhile wins, and
    /// this call returns `Superseded`.
    pub async fn subscribe(
        &self,
        queue_name: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<String> {
        validate_name("Subscribe", queue_name)?;

        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let existing = {
            let mut subs = self.subscriptions_guard();
            subs.pending.insert(queue_name.to_string(), ticket);
            subs.active.remove(queue_name)
        };
        if let Some(mut existing) = existing {
            tracing::info!(queue = queue_name, "replacing existing subscription");
            existing.stop().await;
        }

        let lookupd = self.endpoints().lookupd;
        let connected = self.connect_consumer(queue_name, handler, &lookupd).await;

        let unclaimed = {
            let mut subs = self.subscriptions_guard();
            if subs.pending.get(queue_name) != Some(&ticket) {
                connected.map(Some)
            } else {
                subs.pending.remove(queue_name);
                match connected {
                    Ok(consumer) => {
                        subs.active.insert(queue_name.to_string(), consumer);
                        Ok(None)
                    }
                    Err(err) => Err(err),
                }
            }
        }?;
        if let Some(mut consumer) = unclaimed {
            consumer.stop().await;
            tracing::info!(queue = queue_name, "subscription superseded while connecting");
            return Err(BrokerError::Superseded {
                queue: queue_name.to_string(),
            });
        }

        tracing::info!(queue = queue_name, lookupd = %lookupd, "subscribed");
        Ok(queue_name.to_string())
    }

    /// Builds a consumer for `queue_name` and connects it to `lookupd`,
    /// creating the topic first when `auto_create_topic` is set. The
    /// consumer is stopped on failure.
    async fn connect_consumer(
        &self,
        queue_name: &str,
        handler: Arc<dyn MessageHandler>,
        lookupd: &str,
    ) -> Result<Box<dyn Consumer>> {
        let spec = ConsumerSpec {
            topic: queue_name.to_string(),
            channel: queue_name.to_string(),
            concurrency: self.concurrency,
            handler: Arc::new(QueueDispatcher::new(queue_name, handler)),
        };
        let mut consumer = self
            .transport
            .new_consumer(
                spec,
                &self.config,
                self.logger(format!("{queue_name}/{queue_name}")),
            )
            .map_err(|source| BrokerError::Subscription {
                queue: queue_name.to_string(),
                source,
            })?;

        if self.auto_create_topic {
            if let Err(err) = self.admin.create_topic(lookupd, queue_name).await {
                consumer.stop().await;
                return Err(err);
            }
        }

        if let Err(source) = consumer.connect_to_lookupd(lookupd).await {
            consumer.stop().await;
            return Err(BrokerError::Subscription {
                queue: queue_name.to_string(),
                source,
            });
        }
        Ok(consumer)
    }

    /// Stops the consumer registered under `subscriber_id`, if any. A
    /// subscribe of that queue still connecting is cancelled.
    pub async fn unsubscribe(&self, subscriber_id: &str) {
        let removed = {
            let mut subs = self.subscriptions_guard();
            subs.pending.remove(subscriber_id);
            subs.active.remove(subscriber_id)
        };
        if let Some(mut consumer) = removed {
            consumer.stop().await;
            tracing::info!(queue = subscriber_id, "unsubscribed");
        }
    }

    /// Names of the queues with a live consumer, sorted.
    pub async fn subscriptions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.subscriptions_guard().active.keys().cloned().collect();
        names.sort();
        names
    }

    fn producer(&self, operation: &'static str) -> Result<Arc<dyn Producer>> {
        self.producer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(BrokerError::NotConnected { operation })
    }

    pub async fn publish(&self, queue_name: &str, data: &[u8]) -> Result<()> {
        let producer = self.producer("Publish")?;
        validate_name("Publish", queue_name)?;
        producer
            .publish(queue_name, data)
            .await
            .map_err(|source| publish_error("Publish", queue_name, source))
    }

    /// Publishes a batch atomically with a single MPUB.
    pub async fn multi_publish(&self, queue_name: &str, messages: &[Vec<u8>]) -> Result<()> {
        let producer = self.producer("MultiPublish")?;
        validate_name("MultiPublish", queue_name)?;
        if messages.is_empty() {
            return Err(BrokerError::validation("MultiPublish", "no messages to publish"));
        }
        producer
            .multi_publish(queue_name, messages)
            .await
            .map_err(|source| publish_error("MultiPublish", queue_name, source))
    }

    /// Publishes a message that nsqd holds back for `delay`, sent with
    /// millisecond precision.
    pub async fn deferred_publish(
        &self,
        queue_name: &str,
        delay: chrono::Duration,
        data: &[u8],
    ) -> Result<()> {
        let delay = delay.to_std().map_err(|_| {
            BrokerError::validation("DeferredPublish", format!("negative delay {delay}"))
        })?;
        let producer = self.producer("DeferredPublish")?;
        validate_name("DeferredPublish", queue_name)?;
        producer
            .deferred_publish(queue_name, delay, data)
            .await
            .map_err(|source| publish_error("DeferredPublish", queue_name, source))
    }

    pub fn get_queue(&self, name: &str) -> Option<QueueEntry> {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Registers `entry` under `name`, replacing any previous entry.
    pub fn set_queue(&self, name: impl Into<String>, entry: QueueEntry) {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), entry);
    }

    /// Creates `name` through nsqlookupd's admin endpoint. Safe to repeat.
    pub async fn create_topic(&self, name: &str) -> Result<()> {
        let lookupd = self.endpoints().lookupd;
        self.admin.create_topic(&lookupd, name).await
    }

    /// Stops every consumer, then the producer, and clears the queue
    /// registry. Each stop is bounded by `shutdown_timeout`. A second call
    /// finds nothing to release.
    pub async fn close(&self) -> Result<()> {
        let drained: Vec<(String, Box<dyn Consumer>)> = {
            let mut subs = self.subscriptions_guard();
            subs.pending.clear();
            subs.active.drain().collect()
        };
        for (queue, mut consumer) in drained {
            consumer.stop().await;
            tracing::debug!(queue = %queue, "consumer stopped");
        }

        // waits for a dial in flight so its producer is released here
        let _lifecycle = self.lifecycle.lock().await;
        let producer = self
            .producer
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(producer) = producer {
            producer.stop().await;
        }

        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        tracing::info!("broker client closed");
        Ok(())
    }
}

fn validate_name(operation: &'static str, queue_name: &str) -> Result<()> {
    if queue_name.is_empty() {
        return Err(BrokerError::validation(operation, "queue name is empty"));
    }
    if !is_valid_name(queue_name) {
        return Err(BrokerError::validation(
            operation,
            format!("invalid queue name '{queue_name}'"),
        ));
    }
    Ok(())
}

fn publish_error(
    operation: &'static str,
    queue_name: &str,
    source: TransportError,
) -> BrokerError {
    BrokerError::Publish {
        operation,
        queue: queue_name.to_string(),
        source,
    }
}
