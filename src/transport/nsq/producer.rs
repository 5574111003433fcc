use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::conn::Connection;
use super::protocol::{self, Command, Frame};
use crate::transport::{Producer, TransportConfig, TransportLogger};
use crate::utils::error::TransportError;

/// Publishing connection to a single nsqd.
///
/// Commands are serialized through one connection. After any failure the
/// connection is dropped and the next publish dials again.
pub struct NsqProducer {
    addr: String,
    config: TransportConfig,
    logger: TransportLogger,
    conn: Mutex<Option<Connection>>,
    stopped: AtomicBool,
}

impl NsqProducer {
    /// Dials nsqd and completes the handshake before returning.
    pub async fn connect(
        addr: &str,
        config: TransportConfig,
        logger: TransportLogger,
    ) -> Result<Self, TransportError> {
        let conn = Connection::dial(addr, &config, &logger).await?;
        Ok(Self {
            addr: addr.to_string(),
            config,
            logger,
            conn: Mutex::new(Some(conn)),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn round_trip(&self, command: Command<'_>) -> Result<(), TransportError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let mut guard = self.conn.lock().await;
        // stop() may have run while we waited for the lock
        if self.stopped.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if guard.is_none() {
            *guard = Some(Connection::dial(&self.addr, &self.config, &self.logger).await?);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(TransportError::Closed);
        };

        let result = exchange(conn, &command).await;
        if let Err(err) = &result {
            self.logger
                .error(format!("({}) dropping connection: {err}", self.addr));
            *guard = None;
        }
        result
    }
}

async fn exchange(conn: &mut Connection, command: &Command<'_>) -> Result<(), TransportError> {
    conn.writer.send(command).await?;
    loop {
        match conn.reader.read_frame().await? {
            frame if frame.is_heartbeat() => conn.writer.send(&Command::Nop).await?,
            Frame::Response(_) => return Ok(()),
            Frame::Error(data) => return Err(TransportError::Response(protocol::frame_text(&data))),
            Frame::Message(_) => {
                return Err(TransportError::Protocol(
                    "unexpected message frame on a producer connection".to_string(),
                ));
            }
        }
    }
}

#[async_trait]
impl Producer for NsqProducer {
    async fn publish(&self, topic: &str, body: &[u8]) -> Result<(), TransportError> {
        self.round_trip(Command::Pub { topic, body }).await
    }

    async fn multi_publish(&self, topic: &str, bodies: &[Vec<u8>]) -> Result<(), TransportError> {
        self.round_trip(Command::Mpub { topic, bodies }).await
    }

    async fn deferred_publish(
        &self,
        topic: &str,
        delay: Duration,
        body: &[u8],
    ) -> Result<(), TransportError> {
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.round_trip(Command::Dpub {
            topic,
            delay_ms,
            body,
        })
        .await
    }

    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        // waiting for the lock lets an in-flight publish finish first
        let close = async {
            if let Some(mut conn) = self.conn.lock().await.take() {
                conn.writer.shutdown().await;
            }
        };
        if tokio::time::timeout(self.config.shutdown_timeout, close)
            .await
            .is_err()
        {
            self.logger.warn(format!(
                "({}) timed out waiting for in-flight commands, closing anyway",
                self.addr
            ));
        }
        self.logger.info(format!("({}) producer stopped", self.addr));
    }
}
