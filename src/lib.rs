//! # nsqlink
//!
//! `nsqlink` is a client-side publish/subscribe adapter for NSQ. It hides
//! the wire protocol, nsqlookupd discovery and connection lifecycle behind a
//! small set of operations on a `BrokerClient`: publish, multi-publish,
//! deferred publish, subscribe, unsubscribe and topic creation.
//!
//! ## Core Modules
//!
//! - `broker`: the `BrokerClient`, its options and the `MessageHandler` trait.
//! - `message`: the `MessageEnvelope` handed to handlers and the queue registry entry.
//! - `transport`: the producer/consumer seam, with the NSQ TCP implementation and
//!   an in-process one.
//! - `config`: settings loading and the `HostConfig` lookup used by `init`.
//! - `utils`: error types and logging.

pub mod broker;
pub mod config;
pub mod message;
pub mod transport;
pub mod utils;
