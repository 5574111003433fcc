use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{Json, Router, routing::get};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use super::protocol::{self, Command, Frame};
use super::{NsqConsumer, NsqProducer};
use crate::transport::{
    Consumer, ConsumerSpec, InboundHandler, InboundMessage, LogLevel, Producer, TransportConfig,
    TransportLogger,
};
use crate::utils::error::{HandlerError, TransportError};

fn test_config() -> TransportConfig {
    TransportConfig {
        read_timeout: Duration::from_secs(2),
        shutdown_timeout: Duration::from_millis(500),
        ..TransportConfig::default()
    }
}

fn logger() -> TransportLogger {
    TransportLogger::tracing(LogLevel::Debug).with_context("test")
}

fn frame(frame_type: i32, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&((data.len() + 4) as u32).to_be_bytes());
    buf.extend_from_slice(&frame_type.to_be_bytes());
    buf.extend_from_slice(data);
    buf
}

fn message_frame(attempts: u16, id: &[u8; 16], body: &[u8]) -> Vec<u8> {
    let mut data = Vec::new();
    data.extend_from_slice(&1_700_000_000_000_000_000i64.to_be_bytes());
    data.extend_from_slice(&attempts.to_be_bytes());
    data.extend_from_slice(id);
    data.extend_from_slice(body);
    frame(protocol::FRAME_TYPE_MESSAGE, &data)
}

async fn read_line(stream: &mut BufReader<TcpStream>) -> String {
    let mut line = Vec::new();
    stream.read_until(b'\n', &mut line).await.unwrap();
    String::from_utf8(line).unwrap()
}

async fn read_body(stream: &mut BufReader<TcpStream>) -> Vec<u8> {
    let len = stream.read_u32().await.unwrap() as usize;
    let mut body = vec![0; len];
    stream.read_exact(&mut body).await.unwrap();
    body
}

/// Accepts one client and completes the magic + IDENTIFY exchange.
async fn accept_handshake(listener: &TcpListener) -> BufReader<TcpStream> {
    let (socket, _) = listener.accept().await.unwrap();
    let mut stream = BufReader::new(socket);
    let mut magic = [0u8; 4];
    stream.read_exact(&mut magic).await.unwrap();
    assert_eq!(&magic, protocol::MAGIC_V2);
    assert_eq!(read_line(&mut stream).await, "IDENTIFY\n");
    let identify: serde_json::Value = serde_json::from_slice(&read_body(&mut stream).await).unwrap();
    assert_eq!(identify["feature_negotiation"], false);
    stream
        .write_all(&frame(protocol::FRAME_TYPE_RESPONSE, protocol::OK))
        .await
        .unwrap();
    stream
}

#[test]
fn test_encode_pub() {
    let encoded = Command::Pub {
        topic: "orders",
        body: b"hello",
    }
    .encode()
    .unwrap();
    let mut expected = b"PUB orders\n".to_vec();
    expected.extend_from_slice(&5u32.to_be_bytes());
    expected.extend_from_slice(b"hello");
    assert_eq!(encoded, expected);
}

#[test]
fn test_encode_mpub() {
    let bodies = vec![b"a".to_vec(), b"bc".to_vec()];
    let encoded = Command::Mpub {
        topic: "t",
        bodies: &bodies,
    }
    .encode()
    .unwrap();

    let mut expected = b"MPUB t\n".to_vec();
    // count + (4 + 1) + (4 + 2)
    expected.extend_from_slice(&15u32.to_be_bytes());
    expected.extend_from_slice(&2u32.to_be_bytes());
    expected.extend_from_slice(&1u32.to_be_bytes());
    expected.extend_from_slice(b"a");
    expected.extend_from_slice(&2u32.to_be_bytes());
    expected.extend_from_slice(b"bc");
    assert_eq!(encoded, expected);
}

#[test]
fn test_encode_dpub_and_acks() {
    let encoded = Command::Dpub {
        topic: "t",
        delay_ms: 1500,
        body: b"x",
    }
    .encode()
    .unwrap();
    assert!(encoded.starts_with(b"DPUB t 1500\n"));

    let id = *b"0123456789abcdef";
    assert_eq!(Command::Fin(&id).encode().unwrap(), b"FIN 0123456789abcdef\n".to_vec());
    assert_eq!(
        Command::Req { id: &id, delay_ms: 90000 }.encode().unwrap(),
        b"REQ 0123456789abcdef 90000\n".to_vec()
    );
    assert_eq!(Command::Rdy(3).encode().unwrap(), b"RDY 3\n".to_vec());
    assert_eq!(
        Command::Sub { topic: "t", channel: "c" }.encode().unwrap(),
        b"SUB t c\n".to_vec()
    );
}

#[test]
#[cfg(target_pointer_width = "64")]
fn test_size_header_rejects_lengths_over_u32() {
    assert_eq!(protocol::wire_len(u32::MAX as usize).unwrap(), u32::MAX);
    assert!(matches!(
        protocol::wire_len(u32::MAX as usize + 1),
        Err(TransportError::Protocol(_))
    ));
}

#[test]
fn test_decode_message() {
    let raw = message_frame(3, b"0123456789abcdef", b"payload");
    // skip size and frame type
    let message = protocol::decode_message(&raw[8..]).unwrap();
    assert_eq!(message.attempts, 3);
    assert_eq!(&message.id, b"0123456789abcdef");
    assert_eq!(message.body, b"payload");
    assert_eq!(message.timestamp.timestamp(), 1_700_000_000);
}

#[test]
fn test_decode_message_too_short() {
    let err = protocol::decode_message(&[0; 10]).unwrap_err();
    assert!(matches!(err, TransportError::Protocol(_)));
}

#[tokio::test]
async fn test_read_frame_variants() {
    let mut bytes = frame(protocol::FRAME_TYPE_RESPONSE, protocol::HEARTBEAT);
    bytes.extend(frame(protocol::FRAME_TYPE_ERROR, b"E_INVALID"));
    bytes.extend(message_frame(1, b"aaaaaaaaaaaaaaaa", b""));
    let mut reader = bytes.as_slice();

    assert!(protocol::read_frame(&mut reader).await.unwrap().is_heartbeat());
    assert_eq!(
        protocol::read_frame(&mut reader).await.unwrap(),
        Frame::Error(b"E_INVALID".to_vec())
    );
    match protocol::read_frame(&mut reader).await.unwrap() {
        Frame::Message(message) => assert!(message.body.is_empty()),
        other => panic!("expected a message frame, got {other:?}"),
    }
    // end of stream
    assert!(matches!(
        protocol::read_frame(&mut reader).await,
        Err(TransportError::Io(_))
    ));
}

#[tokio::test]
async fn test_read_frame_rejects_bad_sizes_and_types() {
    let mut reader: &[u8] = &2u32.to_be_bytes();
    assert!(matches!(
        protocol::read_frame(&mut reader).await,
        Err(TransportError::Protocol(_))
    ));

    let bytes = frame(7, b"??");
    let mut reader = bytes.as_slice();
    assert!(matches!(
        protocol::read_frame(&mut reader).await,
        Err(TransportError::Protocol(_))
    ));
}

#[tokio::test]
async fn test_producer_publishes_to_nsqd() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let server = tokio::spawn(async move {
        let mut stream = accept_handshake(&listener).await;

        assert_eq!(read_line(&mut stream).await, "PUB orders\n");
        assert_eq!(read_body(&mut stream).await, b"hello");
        // a heartbeat may arrive before the acknowledgement
        stream
            .write_all(&frame(protocol::FRAME_TYPE_RESPONSE, protocol::HEARTBEAT))
            .await
            .unwrap();
        assert_eq!(read_line(&mut stream).await, "NOP\n");
        stream
            .write_all(&frame(protocol::FRAME_TYPE_RESPONSE, protocol::OK))
            .await
            .unwrap();

        assert_eq!(read_line(&mut stream).await, "DPUB orders 250\n");
        assert_eq!(read_body(&mut stream).await, b"later");
        stream
            .write_all(&frame(protocol::FRAME_TYPE_ERROR, b"E_DPUB_FAILED"))
            .await
            .unwrap();
    });

    let producer = NsqProducer::connect(&addr, test_config(), logger())
        .await
        .unwrap();
    assert_eq!(producer.addr(), addr);
    producer.publish("orders", b"hello").await.unwrap();

    let err = producer
        .deferred_publish("orders", Duration::from_millis(250), b"later")
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Response(text) if text == "E_DPUB_FAILED"));

    server.await.unwrap();
    producer.stop().await;
    producer.stop().await;
    assert!(matches!(
        producer.publish("orders", b"late").await,
        Err(TransportError::Closed)
    ));
}

#[tokio::test]
async fn test_producer_connect_refused() {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().to_string()
    };
    let result = NsqProducer::connect(&addr, test_config(), logger()).await;
    assert!(matches!(result, Err(TransportError::Io(_))));
}

struct Forward(mpsc::UnboundedSender<InboundMessage>);

#[async_trait]
impl InboundHandler for Forward {
    async fn handle(&self, message: &InboundMessage) -> Result<(), HandlerError> {
        let _ = self.0.send(message.clone());
        Ok(())
    }
}

struct Failing(Arc<AtomicUsize>);

#[async_trait]
impl InboundHandler for Failing {
    async fn handle(&self, _message: &InboundMessage) -> Result<(), HandlerError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Err("handler failure".into())
    }
}

async fn mock_lookupd(producers: serde_json::Value) -> String {
    serve_lookupd(Arc::new(StdMutex::new(producers))).await
}

/// `/lookup` answering with whatever `producers` holds at request time.
async fn serve_lookupd(producers: Arc<StdMutex<serde_json::Value>>) -> String {
    let app = Router::new().route(
        "/lookup",
        get(move || {
            let producers = producers.lock().unwrap().clone();
            async move { Json(json!({ "channels": [], "producers": producers })) }
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn spec(handler: Arc<dyn InboundHandler>) -> ConsumerSpec {
    ConsumerSpec {
        topic: "orders".to_string(),
        channel: "orders".to_string(),
        concurrency: 1,
        handler,
    }
}

#[tokio::test]
async fn test_consumer_rejects_invalid_names() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut bad = spec(Arc::new(Forward(tx)));
    bad.topic = "not a topic".to_string();
    assert!(matches!(
        NsqConsumer::new(bad, test_config(), logger()),
        Err(TransportError::Protocol(_))
    ));
}

#[tokio::test]
async fn test_consumer_rejects_zero_poll_interval() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let config = TransportConfig {
        lookupd_poll_interval: Duration::ZERO,
        ..test_config()
    };
    assert!(matches!(
        NsqConsumer::new(spec(Arc::new(Forward(tx))), config, logger()),
        Err(TransportError::Protocol(_))
    ));
}

#[tokio::test]
async fn test_consumer_with_no_producers() {
    let lookupd = mock_lookupd(json!([])).await;
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut consumer = NsqConsumer::new(spec(Arc::new(Forward(tx))), test_config(), logger()).unwrap();

    consumer.connect_to_lookupd(&lookupd).await.unwrap();
    assert!(consumer.connected_nodes().await.is_empty());
    consumer.stop().await;
    assert!(matches!(
        consumer.connect_to_lookupd(&lookupd).await,
        Err(TransportError::Closed)
    ));
}

#[tokio::test]
async fn test_consumer_unreachable_lookupd() {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().to_string()
    };
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut consumer = NsqConsumer::new(spec(Arc::new(Forward(tx))), test_config(), logger()).unwrap();
    assert!(matches!(
        consumer.connect_to_lookupd(&addr).await,
        Err(TransportError::Http(_))
    ));
    consumer.stop().await;
}

#[tokio::test]
async fn test_consumer_receives_and_finishes() {
    let nsqd = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = nsqd.local_addr().unwrap().port();
    let lookupd = mock_lookupd(json!([
        { "broadcast_address": "127.0.0.1", "tcp_port": port }
    ]))
    .await;

    let (fin_tx, mut fin_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut stream = accept_handshake(&nsqd).await;
        assert_eq!(read_line(&mut stream).await, "SUB orders orders\n");
        stream
            .write_all(&frame(protocol::FRAME_TYPE_RESPONSE, protocol::OK))
            .await
            .unwrap();
        assert_eq!(read_line(&mut stream).await, "RDY 1\n");
        stream
            .write_all(&message_frame(1, b"0000000000000001", b"hello"))
            .await
            .unwrap();
        let _ = fin_tx.send(read_line(&mut stream).await);
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut consumer = NsqConsumer::new(spec(Arc::new(Forward(tx))), test_config(), logger()).unwrap();
    consumer.connect_to_lookupd(&lookupd).await.unwrap();

    let message = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.body, b"hello");
    let fin = tokio::time::timeout(Duration::from_secs(2), fin_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fin, "FIN 0000000000000001\n");

    consumer.stop().await;
    assert!(consumer.connected_nodes().await.is_empty());
}

async fn next_line(lines: &mut mpsc::UnboundedReceiver<String>) -> String {
    tokio::time::timeout(Duration::from_secs(2), lines.recv())
        .await
        .unwrap()
        .unwrap()
}

/// Subscribes a fresh connection on `nsqd`, then forwards every command
/// line the consumer sends until it disconnects.
fn fake_nsqd(nsqd: TcpListener, messages: Vec<Vec<u8>>) -> mpsc::UnboundedReceiver<String> {
    let (lines_tx, lines) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut stream = accept_handshake(&nsqd).await;
        assert_eq!(read_line(&mut stream).await, "SUB orders orders\n");
        stream
            .write_all(&frame(protocol::FRAME_TYPE_RESPONSE, protocol::OK))
            .await
            .unwrap();
        let _ = lines_tx.send(read_line(&mut stream).await);
        for message in messages {
            stream.write_all(&message).await.unwrap();
        }
        loop {
            let line = read_line(&mut stream).await;
            if line.is_empty() || lines_tx.send(line).is_err() {
                break;
            }
        }
    });
    lines
}

#[tokio::test]
async fn test_consumer_requeues_failures_and_gives_up_after_max_attempts() {
    let nsqd = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = nsqd.local_addr().unwrap().port();
    let lookupd = mock_lookupd(json!([
        { "broadcast_address": "127.0.0.1", "tcp_port": port }
    ]))
    .await;
    let mut lines = fake_nsqd(
        nsqd,
        vec![
            message_frame(2, b"0000000000000001", b"retry me"),
            message_frame(6, b"0000000000000002", b"exhausted"),
        ],
    );

    let calls = Arc::new(AtomicUsize::new(0));
    let mut consumer =
        NsqConsumer::new(spec(Arc::new(Failing(calls.clone()))), test_config(), logger()).unwrap();
    consumer.connect_to_lookupd(&lookupd).await.unwrap();

    assert_eq!(next_line(&mut lines).await, "RDY 1\n");
    // 90s base delay times two attempts
    assert_eq!(next_line(&mut lines).await, "REQ 0000000000000001 180000\n");
    // past max_attempts (5) the message is finished without the handler
    assert_eq!(next_line(&mut lines).await, "FIN 0000000000000002\n");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    consumer.stop().await;
    assert_eq!(next_line(&mut lines).await, "CLS\n");
}

#[tokio::test]
async fn test_consumer_dials_nodes_found_on_later_polls() {
    let nsqd = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let node = nsqd.local_addr().unwrap().to_string();
    let port = nsqd.local_addr().unwrap().port();
    let producers = Arc::new(StdMutex::new(json!([])));
    let lookupd = serve_lookupd(producers.clone()).await;

    let config = TransportConfig {
        lookupd_poll_interval: Duration::from_millis(100),
        ..test_config()
    };
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut consumer = NsqConsumer::new(spec(Arc::new(Forward(tx))), config, logger()).unwrap();
    consumer.connect_to_lookupd(&lookupd).await.unwrap();
    assert!(consumer.connected_nodes().await.is_empty());

    let mut lines = fake_nsqd(nsqd, Vec::new());
    *producers.lock().unwrap() = json!([
        { "broadcast_address": "127.0.0.1", "tcp_port": port }
    ]);

    assert_eq!(next_line(&mut lines).await, "RDY 1\n");
    assert_eq!(consumer.connected_nodes().await, vec![node]);

    consumer.stop().await;
    assert_eq!(next_line(&mut lines).await, "CLS\n");
}
