//! The `transport` module is the seam between the `BrokerClient` and the
//! message queue it talks to.
//!
//! A `Transport` creates producers and consumers. The client never touches a
//! socket itself: it only calls the `Producer` and `Consumer` traits, and
//! receives inbound messages through an `InboundHandler`.
//!
//! Two implementations are provided:
//! - `nsq`: the NSQ TCP protocol with nsqlookupd discovery (the default).
//! - `memory`: an in-process broker with the same delivery contract, used in
//!   tests and for embedding.

mod config;
pub mod memory;
pub mod nsq;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use crate::utils::logging::{LogLevel, TransportLogger};
use crate::utils::error::{HandlerError, TransportError};
pub use config::TransportConfig;
pub use memory::MemoryTransport;
pub use nsq::NsqTransport;

/// NSQ message ids are 16 ASCII bytes.
pub type MessageId = [u8; 16];

/// A message as delivered by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub id: MessageId,
    /// Delivery count, starting at 1.
    pub attempts: u16,
    pub timestamp: DateTime<Utc>,
    pub body: Vec<u8>,
}

/// Callback invoked by a consumer for every delivered message.
///
/// `Ok` acknowledges the message. `Err` hands it back to the broker for
/// redelivery.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle(&self, message: &InboundMessage) -> Result<(), HandlerError>;
}

/// What a consumer is bound to and who processes its messages.
#[derive(Clone)]
pub struct ConsumerSpec {
    pub topic: String,
    pub channel: String,
    /// Number of concurrent handler tasks.
    pub concurrency: usize,
    pub handler: Arc<dyn InboundHandler>,
}

/// Outbound connection used to publish.
#[async_trait]
pub trait Producer: Send + Sync {
    async fn publish(&self, topic: &str, body: &[u8]) -> Result<(), TransportError>;

    async fn multi_publish(&self, topic: &str, bodies: &[Vec<u8>]) -> Result<(), TransportError>;

    async fn deferred_publish(
        &self,
        topic: &str,
        delay: Duration,
        body: &[u8],
    ) -> Result<(), TransportError>;

    /// Close the connection once the command in flight has completed.
    /// Calling it again is a no-op.
    async fn stop(&self);
}

/// Live subscription to one topic/channel pair.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Discover nsqd nodes through nsqlookupd and start receiving.
    async fn connect_to_lookupd(&mut self, addr: &str) -> Result<(), TransportError>;

    /// Stop receiving and release every connection and task.
    /// Bounded by `TransportConfig::shutdown_timeout`. Idempotent.
    async fn stop(&mut self);
}

/// Factory for producers and consumers.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect_producer(
        &self,
        addr: &str,
        config: &TransportConfig,
        logger: TransportLogger,
    ) -> Result<Arc<dyn Producer>, TransportError>;

    fn new_consumer(
        &self,
        spec: ConsumerSpec,
        config: &TransportConfig,
        logger: TransportLogger,
    ) -> Result<Box<dyn Consumer>, TransportError>;
}

/// Checks a topic or channel name against NSQ's naming rules:
/// 1 to 64 characters from `[.a-zA-Z0-9_-]`, optionally ending in
/// `#ephemeral`.
pub fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 64 {
        return false;
    }
    let base = name.strip_suffix("#ephemeral").unwrap_or(name);
    !base.is_empty()
        && base
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

/// Base URL for an nsqlookupd address given as `host:port` or a full URL.
pub fn http_base(addr: &str) -> String {
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.trim_end_matches('/').to_string()
    } else {
        format!("http://{}", addr.trim_end_matches('/'))
    }
}
