//! NSQ consumer
//!
//! One consumer is bound to a topic/channel pair and may be connected to
//! several nsqd nodes at once:
//! - nsqlookupd is queried for the nodes carrying the topic, on connect and
//!   then every `lookupd_poll_interval`
//! - each node connection gets a reader task (frames in, heartbeats answered)
//!   and a writer task (FIN/REQ/NOP/CLS out)
//! - messages from every node feed a shared queue drained by `concurrency`
//!   worker tasks that run the handler and respond on the originating node
//!
//! Shutdown is driven by a watch channel. `stop` sends CLS to every node,
//! flips the signal and joins all tasks within `shutdown_timeout`, aborting
//! whatever is still running after that.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;

use super::conn::{Connection, FrameReader, FrameWriter};
use super::protocol::{self, Command, Frame};
use crate::transport::{
    Consumer, ConsumerSpec, InboundHandler, InboundMessage, TransportConfig, TransportLogger,
    http_base, is_valid_name,
};
use crate::utils::error::TransportError;

type CommandSender = mpsc::UnboundedSender<Vec<u8>>;

struct Delivery {
    message: InboundMessage,
    respond: CommandSender,
}

#[derive(Debug, Default, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    producers: Vec<Peer>,
    // nsqlookupd before 1.0 wraps the payload in `data`
    #[serde(default)]
    data: Option<LookupData>,
}

#[derive(Debug, Default, Deserialize)]
struct LookupData {
    #[serde(default)]
    producers: Vec<Peer>,
}

#[derive(Debug, Deserialize)]
struct Peer {
    broadcast_address: String,
    tcp_port: u16,
}

impl LookupResponse {
    fn into_addrs(self) -> Vec<String> {
        let legacy = self.data.map(|d| d.producers).unwrap_or_default();
        self.producers
            .into_iter()
            .chain(legacy)
            .map(|peer| format!("{}:{}", peer.broadcast_address, peer.tcp_port))
            .collect()
    }
}

struct Shared {
    topic: String,
    channel: String,
    config: TransportConfig,
    logger: TransportLogger,
    http: reqwest::Client,
    shutdown: watch::Receiver<bool>,
    lookupds: StdMutex<Vec<String>>,
    deliveries: StdMutex<Option<mpsc::UnboundedSender<Delivery>>>,
    nodes: Mutex<HashMap<String, CommandSender>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn track(&self, handles: impl IntoIterator<Item = JoinHandle<()>>) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(handles);
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn lookup(&self, lookupd: &str) -> Result<Vec<String>, TransportError> {
        let url = format!("{}/lookup?topic={}", http_base(lookupd), self.topic);
        self.logger.debug(format!("querying nsqlookupd {url}"));
        let response = self
            .http
            .get(&url)
            .header("Accept", "application/vnd.nsq; version=1.0")
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            // the topic has not been created on any node yet
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(TransportError::HttpStatus(status.as_u16()));
        }
        let body: LookupResponse = response.json().await?;
        Ok(body.into_addrs())
    }

    async fn discover(self: &Arc<Self>, lookupd: &str) -> Result<(), TransportError> {
        for addr in self.lookup(lookupd).await? {
            if let Err(err) = connect_to_nsqd(self, &addr).await {
                self.logger.error(format!("({addr}) error connecting to nsqd - {err}"));
            }
        }
        Ok(())
    }
}

/// Consumer speaking the NSQ TCP protocol.
pub struct NsqConsumer {
    shared: Arc<Shared>,
    handler: Arc<dyn InboundHandler>,
    concurrency: usize,
    shutdown: watch::Sender<bool>,
    work: Arc<Mutex<mpsc::UnboundedReceiver<Delivery>>>,
    started: bool,
    stopped: bool,
}

impl NsqConsumer {
    pub fn new(
        spec: ConsumerSpec,
        config: TransportConfig,
        logger: TransportLogger,
    ) -> Result<Self, TransportError> {
        if !is_valid_name(&spec.topic) {
            return Err(TransportError::Protocol(format!(
                "invalid topic name '{}'",
                spec.topic
            )));
        }
        if !is_valid_name(&spec.channel) {
            return Err(TransportError::Protocol(format!(
                "invalid channel name '{}'",
                spec.channel
            )));
        }

        if config.lookupd_poll_interval.is_zero() {
            return Err(TransportError::Protocol(
                "lookupd_poll_interval must be greater than zero".into(),
            ));
        }

        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .user_agent(config.user_agent.clone())
            .build()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (work_tx, work_rx) = mpsc::unbounded_channel();

        Ok(Self {
            shared: Arc::new(Shared {
                topic: spec.topic,
                channel: spec.channel,
                config,
                logger,
                http,
                shutdown: shutdown_rx,
                lookupds: StdMutex::new(Vec::new()),
                deliveries: StdMutex::new(Some(work_tx)),
                nodes: Mutex::new(HashMap::new()),
                tasks: StdMutex::new(Vec::new()),
            }),
            handler: spec.handler,
            concurrency: spec.concurrency.max(1),
            shutdown: shutdown_tx,
            work: Arc::new(Mutex::new(work_rx)),
            started: false,
            stopped: false,
        })
    }

    /// Addresses of the nsqd nodes currently connected.
    pub async fn connected_nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self.shared.nodes.lock().await.keys().cloned().collect();
        nodes.sort();
        nodes
    }

    fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;

        let workers = (0..self.concurrency).map(|_| {
            tokio::spawn(work_loop(
                self.shared.clone(),
                self.handler.clone(),
                self.work.clone(),
            ))
        });
        self.shared.track(workers);
        self.shared
            .track([tokio::spawn(poll_loop(self.shared.clone()))]);
    }

    fn shutdown_signal(&self) {
        let _ = self.shutdown.send(true);
        self.shared
            .deliveries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

#[async_trait]
impl Consumer for NsqConsumer {
    async fn connect_to_lookupd(&mut self, addr: &str) -> Result<(), TransportError> {
        if self.stopped {
            return Err(TransportError::Closed);
        }
        {
            let lookupds = self
                .shared
                .lookupds
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if lookupds.iter().any(|known| known == addr) {
                return Ok(());
            }
        }

        // the first query decides whether the address is usable at all
        let nodes = self.shared.lookup(addr).await?;
        self.shared
            .lookupds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(addr.to_string());
        self.shared
            .logger
            .info(format!("connected to nsqlookupd {addr}, {} node(s)", nodes.len()));

        self.start();
        for node in nodes {
            if let Err(err) = connect_to_nsqd(&self.shared, &node).await {
                self.shared
                    .logger
                    .error(format!("({node}) error connecting to nsqd - {err}"));
            }
        }
        Ok(())
    }

    async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        let logger = self.shared.logger.clone();
        logger.info("stopping...");

        {
            // holding the node lock keeps new connections out while signalling
            let mut nodes = self.shared.nodes.lock().await;
            for respond in nodes.values() {
                queue_command(respond, &Command::Cls, &logger);
            }
            self.shutdown_signal();
            nodes.clear();
        }

        let handles = std::mem::take(
            &mut *self
                .shared
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let timeout = self.shared.config.shutdown_timeout;
        if tokio::time::timeout(timeout, join_all(handles)).await.is_err() {
            logger.warn(format!(
                "tasks still running after {timeout:?}, aborting them"
            ));
            for abort in aborts {
                abort.abort();
            }
        }
        logger.info("stopped");
    }
}

impl Drop for NsqConsumer {
    fn drop(&mut self) {
        if !self.stopped {
            self.shutdown_signal();
        }
    }
}

async fn connect_to_nsqd(shared: &Arc<Shared>, addr: &str) -> Result<(), TransportError> {
    let mut nodes = shared.nodes.lock().await;
    if nodes.contains_key(addr) || shared.is_shutting_down() {
        return Ok(());
    }
    let Some(deliveries) = shared
        .deliveries
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
    else {
        return Ok(());
    };

    let mut conn = Connection::dial(addr, &shared.config, &shared.logger).await?;
    conn.writer
        .send(&Command::Sub {
            topic: &shared.topic,
            channel: &shared.channel,
        })
        .await?;
    conn.expect_ok("SUB").await?;
    conn.writer
        .send(&Command::Rdy(shared.config.max_in_flight.max(1)))
        .await?;

    let (reader, writer) = conn.into_split();
    let (respond, commands) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_loop(
        addr.to_string(),
        writer,
        commands,
        shared.logger.clone(),
    ));
    let reader_task = tokio::spawn(read_loop(
        shared.clone(),
        addr.to_string(),
        reader,
        respond.clone(),
        deliveries,
    ));
    shared.track([writer_task, reader_task]);
    nodes.insert(addr.to_string(), respond);
    shared.logger.info(format!("({addr}) subscribed"));
    Ok(())
}

async fn read_loop(
    shared: Arc<Shared>,
    addr: String,
    mut reader: FrameReader,
    respond: CommandSender,
    deliveries: mpsc::UnboundedSender<Delivery>,
) {
    let logger = shared.logger.clone();
    let mut shutdown = shared.shutdown.clone();
    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => break,
            frame = reader.read_frame() => frame,
        };
        match frame {
            Ok(frame) if frame.is_heartbeat() => {
                logger.debug(format!("({addr}) heartbeat received"));
                if !queue_command(&respond, &Command::Nop, &logger) {
                    break;
                }
            }
            Ok(Frame::Response(data)) => {
                logger.debug(format!("({addr}) response {}", protocol::frame_text(&data)));
            }
            Ok(Frame::Error(data)) => {
                logger.error(format!("({addr}) protocol error - {}", protocol::frame_text(&data)));
            }
            Ok(Frame::Message(message)) => {
                let delivery = Delivery {
                    message,
                    respond: respond.clone(),
                };
                if deliveries.send(delivery).is_err() {
                    break;
                }
            }
            Err(err) => {
                if !shared.is_shutting_down() {
                    logger.error(format!("({addr}) IO error - {err}"));
                }
                break;
            }
        }
    }

    shared.nodes.lock().await.remove(&addr);
    logger.info(format!("({addr}) connection closed"));
}

async fn write_loop(
    addr: String,
    mut writer: FrameWriter,
    mut commands: mpsc::UnboundedReceiver<Vec<u8>>,
    logger: TransportLogger,
) {
    while let Some(bytes) = commands.recv().await {
        if let Err(err) = writer.write(&bytes).await {
            logger.error(format!("({addr}) error writing command - {err}"));
            break;
        }
    }
    writer.shutdown().await;
}

async fn work_loop(
    shared: Arc<Shared>,
    handler: Arc<dyn InboundHandler>,
    work: Arc<Mutex<mpsc::UnboundedReceiver<Delivery>>>,
) {
    loop {
        let next = work.lock().await.recv().await;
        let Some(delivery) = next else { break };
        process(&shared, handler.as_ref(), delivery).await;
    }
}

async fn process(shared: &Shared, handler: &dyn InboundHandler, delivery: Delivery) {
    let Delivery { message, respond } = delivery;
    let config = &shared.config;
    let logger = &shared.logger;
    let id = protocol::frame_text(&message.id);

    let command = if config.max_attempts > 0 && message.attempts > config.max_attempts {
        logger.warn(format!(
            "msg {id} attempted {} times, giving up",
            message.attempts
        ));
        Command::Fin(&message.id)
    } else {
        match handler.handle(&message).await {
            Ok(()) => Command::Fin(&message.id),
            Err(err) => {
                let delay = config.requeue_delay(message.attempts);
                logger.warn(format!(
                    "msg {id} handler failed, requeueing in {delay:?} - {err}"
                ));
                Command::Req {
                    id: &message.id,
                    delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                }
            }
        }
    };

    if !queue_command(&respond, &command, logger) {
        logger.error(format!("msg {id} connection closed before it could be acknowledged"));
    }
}

/// Queues `command` on a node's writer. Returns false once the writer is gone.
fn queue_command(
    respond: &CommandSender,
    command: &Command<'_>,
    logger: &TransportLogger,
) -> bool {
    match command.encode() {
        Ok(bytes) => respond.send(bytes).is_ok(),
        Err(err) => {
            logger.error(format!("error encoding command - {err}"));
            true
        }
    }
}

async fn poll_loop(shared: Arc<Shared>) {
    let mut shutdown = shared.shutdown.clone();
    let mut ticker = tokio::time::interval(shared.config.lookupd_poll_interval);
    // the first tick completes immediately and connect already queried
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }
        let lookupds = shared
            .lookupds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for lookupd in lookupds {
            if let Err(err) = shared.discover(&lookupd).await {
                shared
                    .logger
                    .warn(format!("error querying nsqlookupd {lookupd} - {err}"));
            }
        }
    }
}
