//! The `message` module holds the two plain data types exchanged with the
//! host application: the payload envelope handed to handlers, and the queue
//! registry entry.

mod envelope;
mod queue;

pub use envelope::MessageEnvelope;
pub use queue::QueueEntry;
