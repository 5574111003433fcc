//! NSQ V2 framing.
//!
//! Commands are newline terminated, optionally followed by a 4 byte
//! big-endian body size and the body. Everything nsqd sends back is a frame:
//! `size (4) | frame type (4) | data (size - 4)`. Message frames carry
//! `timestamp ns (8) | attempts (2) | id (16) | body`.

use chrono::{TimeZone, Utc};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::transport::{InboundMessage, MessageId};
use crate::utils::error::TransportError;

pub const MAGIC_V2: &[u8; 4] = b"  V2";

pub const FRAME_TYPE_RESPONSE: i32 = 0;
pub const FRAME_TYPE_ERROR: i32 = 1;
pub const FRAME_TYPE_MESSAGE: i32 = 2;

pub const HEARTBEAT: &[u8] = b"_heartbeat_";
pub const OK: &[u8] = b"OK";

const MESSAGE_HEADER_LEN: usize = 8 + 2 + 16;
// nsqd's default --max-msg-size is 1 MiB; leave room for larger deployments
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    Identify(Vec<u8>),
    Sub { topic: &'a str, channel: &'a str },
    Rdy(u64),
    Fin(&'a MessageId),
    Req { id: &'a MessageId, delay_ms: u64 },
    Nop,
    Cls,
    Pub { topic: &'a str, body: &'a [u8] },
    Mpub { topic: &'a str, bodies: &'a [Vec<u8>] },
    Dpub { topic: &'a str, delay_ms: u64, body: &'a [u8] },
}

impl Command<'_> {
    /// Serializes the command. Fails when a body or batch is too large for
    /// the 4 byte size header.
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        let mut buf = Vec::new();
        match self {
            Command::Identify(body) => {
                buf.extend_from_slice(b"IDENTIFY\n");
                put_body(&mut buf, body)?;
            }
            Command::Sub { topic, channel } => {
                buf.extend_from_slice(format!("SUB {topic} {channel}\n").as_bytes());
            }
            Command::Rdy(count) => {
                buf.extend_from_slice(format!("RDY {count}\n").as_bytes());
            }
            Command::Fin(id) => {
                buf.extend_from_slice(b"FIN ");
                buf.extend_from_slice(&id[..]);
                buf.push(b'\n');
            }
            Command::Req { id, delay_ms } => {
                buf.extend_from_slice(b"REQ ");
                buf.extend_from_slice(&id[..]);
                buf.extend_from_slice(format!(" {delay_ms}\n").as_bytes());
            }
            Command::Nop => buf.extend_from_slice(b"NOP\n"),
            Command::Cls => buf.extend_from_slice(b"CLS\n"),
            Command::Pub { topic, body } => {
                buf.extend_from_slice(format!("PUB {topic}\n").as_bytes());
                put_body(&mut buf, body)?;
            }
            Command::Mpub { topic, bodies } => {
                buf.extend_from_slice(format!("MPUB {topic}\n").as_bytes());
                let size = bodies
                    .iter()
                    .try_fold(4usize, |acc, b| acc.checked_add(4)?.checked_add(b.len()))
                    .ok_or_else(|| TransportError::Protocol("MPUB batch size overflows".into()))?;
                buf.extend_from_slice(&wire_len(size)?.to_be_bytes());
                buf.extend_from_slice(&wire_len(bodies.len())?.to_be_bytes());
                for body in bodies.iter() {
                    put_body(&mut buf, body)?;
                }
            }
            Command::Dpub {
                topic,
                delay_ms,
                body,
            } => {
                buf.extend_from_slice(format!("DPUB {topic} {delay_ms}\n").as_bytes());
                put_body(&mut buf, body)?;
            }
        }
        Ok(buf)
    }
}

/// Converts a length to its 4 byte wire form.
pub(crate) fn wire_len(len: usize) -> Result<u32, TransportError> {
    u32::try_from(len).map_err(|_| {
        TransportError::Protocol(format!("length {len} does not fit a 4 byte size header"))
    })
}

fn put_body(buf: &mut Vec<u8>, body: &[u8]) -> Result<(), TransportError> {
    buf.extend_from_slice(&wire_len(body.len())?.to_be_bytes());
    buf.extend_from_slice(body);
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Response(Vec<u8>),
    Error(Vec<u8>),
    Message(InboundMessage),
}

impl Frame {
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Frame::Response(data) if data == HEARTBEAT)
    }
}

/// Reads one frame. Not cancel safe: a dropped read loses the frame.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, TransportError>
where
    R: AsyncRead + Unpin,
{
    let size = reader.read_u32().await? as usize;
    if size < 4 {
        return Err(TransportError::Protocol(format!(
            "frame size {size} is too small"
        )));
    }
    if size > MAX_FRAME_SIZE {
        return Err(TransportError::Protocol(format!(
            "frame size {size} exceeds {MAX_FRAME_SIZE}"
        )));
    }
    let frame_type = reader.read_i32().await?;
    let mut data = vec![0; size - 4];
    reader.read_exact(&mut data).await?;
    decode_frame(frame_type, data)
}

pub fn decode_frame(frame_type: i32, data: Vec<u8>) -> Result<Frame, TransportError> {
    match frame_type {
        FRAME_TYPE_RESPONSE => Ok(Frame::Response(data)),
        FRAME_TYPE_ERROR => Ok(Frame::Error(data)),
        FRAME_TYPE_MESSAGE => decode_message(&data).map(Frame::Message),
        other => Err(TransportError::Protocol(format!(
            "unknown frame type {other}"
        ))),
    }
}

pub fn decode_message(data: &[u8]) -> Result<InboundMessage, TransportError> {
    if data.len() < MESSAGE_HEADER_LEN {
        return Err(TransportError::Protocol(format!(
            "message frame of {} bytes is shorter than its header",
            data.len()
        )));
    }
    let mut timestamp = [0u8; 8];
    timestamp.copy_from_slice(&data[..8]);
    let mut attempts = [0u8; 2];
    attempts.copy_from_slice(&data[8..10]);
    let mut id: MessageId = [0u8; 16];
    id.copy_from_slice(&data[10..MESSAGE_HEADER_LEN]);

    Ok(InboundMessage {
        id,
        attempts: u16::from_be_bytes(attempts),
        timestamp: Utc.timestamp_nanos(i64::from_be_bytes(timestamp)),
        body: data[MESSAGE_HEADER_LEN..].to_vec(),
    })
}

/// Text of an error or response frame, for logs and errors.
pub fn frame_text(data: &[u8]) -> String {
    String::from_utf8_lossy(data).into_owned()
}
