//! The `error` module defines the error types used across `nsqlink`.
//!
//! `BrokerError` is what callers of the `BrokerClient` see. Each variant names
//! the operation that failed and, where relevant, the queue it targeted.
//! `TransportError` describes failures of the underlying producer/consumer
//! connections and is carried as the `source` of a `BrokerError`.

use std::time::Duration;

use thiserror::Error;

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Boxed error returned by message handlers.
///
/// Any error returned from a handler is treated as a negative acknowledgement
/// and the message is handed back to the broker for redelivery.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by the `BrokerClient`.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The producer could not reach nsqd.
    #[error("{operation}: failed to connect to {addr}: {source}")]
    Connection {
        operation: &'static str,
        addr: String,
        #[source]
        source: TransportError,
    },

    /// Consumer creation or the connection to nsqlookupd failed.
    #[error("Subscribe: failed to subscribe to '{queue}': {source}")]
    Subscription {
        queue: String,
        #[source]
        source: TransportError,
    },

    /// An unsubscribe, close or newer subscribe to the same queue ran while
    /// this subscription was still connecting.
    #[error("Subscribe: subscription to '{queue}' was superseded while connecting")]
    Superseded { queue: String },

    /// A message could not be handed to nsqd.
    #[error("{operation}: failed to publish to '{queue}': {source}")]
    Publish {
        operation: &'static str,
        queue: String,
        #[source]
        source: TransportError,
    },

    /// Topic provisioning failed or returned a non-2xx status.
    #[error("CreateTopic: failed to create topic '{topic}'{}: {source}", status_suffix(.status))]
    TopicCreation {
        topic: String,
        status: Option<u16>,
        #[source]
        source: TransportError,
    },

    /// Malformed caller input.
    #[error("{operation}: {reason}")]
    Validation {
        operation: &'static str,
        reason: String,
    },

    /// A publish was attempted before `init`/`connect_to_producer`.
    #[error("{operation}: producer is not connected")]
    NotConnected { operation: &'static str },
}

impl BrokerError {
    pub(crate) fn validation(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            operation,
            reason: reason.into(),
        }
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!(" (HTTP status {code})"),
        None => String::new(),
    }
}

/// Errors raised by a transport implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// An `E_*` error frame sent by nsqd.
    #[error("nsqd responded with {0}")]
    Response(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected http status {0}")]
    HttpStatus(u16),

    #[error("{0} is unreachable")]
    Unreachable(String),

    #[error("connection is closed")]
    Closed,

    /// Failure injected by the in-memory transport.
    #[error("injected failure: {0}")]
    Injected(String),
}
