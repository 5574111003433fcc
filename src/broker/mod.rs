//! The `broker` module is the client-side lifecycle manager.
//!
//! `BrokerClient` owns the producer, one consumer per subscribed queue and the
//! queue registry. Incoming messages are wrapped in a `MessageEnvelope` and
//! routed to the `MessageHandler` given at subscription time.

mod admin;
mod client;
mod handler;

pub use client::{BrokerClient, ClientOptions, Endpoints};
pub use handler::{HandlerFn, MessageHandler};
