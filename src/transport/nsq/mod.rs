//! NSQ TCP transport.
//!
//! `protocol` holds the V2 framing, `conn` the handshake and timeouts,
//! `producer` and `consumer` the two connection roles.

mod conn;
mod consumer;
mod producer;
pub mod protocol;

use std::sync::Arc;

use async_trait::async_trait;

pub use consumer::NsqConsumer;
pub use producer::NsqProducer;

use crate::transport::{Consumer, ConsumerSpec, Producer, Transport, TransportConfig, TransportLogger};
use crate::utils::error::TransportError;

/// Transport talking to real nsqd/nsqlookupd processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct NsqTransport;

#[async_trait]
impl Transport for NsqTransport {
    async fn connect_producer(
        &self,
        addr: &str,
        config: &TransportConfig,
        logger: TransportLogger,
    ) -> Result<Arc<dyn Producer>, TransportError> {
        let producer = NsqProducer::connect(addr, config.clone(), logger).await?;
        Ok(Arc::new(producer))
    }

    fn new_consumer(
        &self,
        spec: ConsumerSpec,
        config: &TransportConfig,
        logger: TransportLogger,
    ) -> Result<Box<dyn Consumer>, TransportError> {
        Ok(Box::new(NsqConsumer::new(spec, config.clone(), logger)?))
    }
}

#[cfg(test)]
mod tests;
