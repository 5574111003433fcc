use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::timeout;

use super::protocol::{self, Command, Frame, MAGIC_V2};
use crate::transport::{TransportConfig, TransportLogger};
use crate::utils::error::TransportError;

#[derive(Debug, Serialize)]
struct Identify<'a> {
    client_id: &'a str,
    hostname: &'a str,
    user_agent: &'a str,
    heartbeat_interval: u64,
    feature_negotiation: bool,
}

/// Read side of an nsqd connection.
pub(crate) struct FrameReader {
    inner: BufReader<OwnedReadHalf>,
    read_timeout: Duration,
}

impl FrameReader {
    pub async fn read_frame(&mut self) -> Result<Frame, TransportError> {
        timeout(self.read_timeout, protocol::read_frame(&mut self.inner))
            .await
            .map_err(|_| TransportError::Timeout {
                operation: "read",
                after: self.read_timeout,
            })?
    }
}

/// Write side of an nsqd connection.
pub(crate) struct FrameWriter {
    inner: OwnedWriteHalf,
    write_timeout: Duration,
}

impl FrameWriter {
    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        timeout(self.write_timeout, self.inner.write_all(bytes))
            .await
            .map_err(|_| TransportError::Timeout {
                operation: "write",
                after: self.write_timeout,
            })??;
        Ok(())
    }

    pub async fn send(&mut self, command: &Command<'_>) -> Result<(), TransportError> {
        self.write(&command.encode()?).await
    }

    pub async fn shutdown(&mut self) {
        let _ = timeout(self.write_timeout, self.inner.shutdown()).await;
    }
}

/// An nsqd connection that has completed the V2 handshake and IDENTIFY.
pub(crate) struct Connection {
    pub reader: FrameReader,
    pub writer: FrameWriter,
}

impl Connection {
    pub async fn dial(
        addr: &str,
        config: &TransportConfig,
        logger: &TransportLogger,
    ) -> Result<Self, TransportError> {
        logger.info(format!("({addr}) connecting to nsqd"));
        let stream = timeout(config.dial_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout {
                operation: "dial",
                after: config.dial_timeout,
            })??;
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        let mut conn = Connection {
            reader: FrameReader {
                inner: BufReader::new(read_half),
                read_timeout: config.read_timeout,
            },
            writer: FrameWriter {
                inner: write_half,
                write_timeout: config.write_timeout,
            },
        };

        conn.writer.write(MAGIC_V2).await?;
        conn.identify(config).await?;
        logger.debug(format!("({addr}) IDENTIFY complete"));
        Ok(conn)
    }

    async fn identify(&mut self, config: &TransportConfig) -> Result<(), TransportError> {
        let client_id = uuid::Uuid::new_v4().simple().to_string();
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| client_id.clone());
        let body = serde_json::to_vec(&Identify {
            client_id: &client_id,
            hostname: &hostname,
            user_agent: &config.user_agent,
            heartbeat_interval: config.heartbeat_interval.as_millis() as u64,
            feature_negotiation: false,
        })
        .map_err(|err| TransportError::Protocol(format!("encoding IDENTIFY: {err}")))?;

        self.writer.send(&Command::Identify(body)).await?;
        self.expect_ok("IDENTIFY").await
    }

    /// Reads the acknowledgement of a command, answering heartbeats meanwhile.
    pub async fn expect_ok(&mut self, command: &str) -> Result<(), TransportError> {
        loop {
            match self.reader.read_frame().await? {
                frame if frame.is_heartbeat() => self.writer.send(&Command::Nop).await?,
                Frame::Response(data) if data == protocol::OK => return Ok(()),
                Frame::Response(data) => {
                    return Err(TransportError::Protocol(format!(
                        "unexpected response to {command}: {}",
                        protocol::frame_text(&data)
                    )));
                }
                Frame::Error(data) => {
                    return Err(TransportError::Response(protocol::frame_text(&data)));
                }
                Frame::Message(_) => {
                    return Err(TransportError::Protocol(format!(
                        "unexpected message frame while waiting for {command}"
                    )));
                }
            }
        }
    }

    pub fn into_split(self) -> (FrameReader, FrameWriter) {
        (self.reader, self.writer)
    }
}
