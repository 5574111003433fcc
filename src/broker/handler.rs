use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::message::MessageEnvelope;
use crate::transport::{InboundHandler, InboundMessage};
use crate::utils::error::HandlerError;

/// Application callback for messages delivered to a subscribed queue.
///
/// Returning `Err` is a negative acknowledgement: the message goes back to
/// nsqd and is redelivered later.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(
        &self,
        queue_name: &str,
        message: MessageEnvelope,
    ) -> Result<(), HandlerError>;
}

/// Adapts an async closure into a `MessageHandler`.
///
/// ```ignore
/// let handler = HandlerFn::new(|queue, message| async move {
///     println!("{queue}: {:?}", message.data());
///     Ok(())
/// });
/// ```
pub struct HandlerFn<F> {
    f: F,
}

impl<F, Fut> HandlerFn<F>
where
    F: Fn(String, MessageEnvelope) -> Fut,
    Fut: Future<Output = Result<(), HandlerError>>,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> MessageHandler for HandlerFn<F>
where
    F: Fn(String, MessageEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle_message(
        &self,
        queue_name: &str,
        message: MessageEnvelope,
    ) -> Result<(), HandlerError> {
        (self.f)(queue_name.to_string(), message).await
    }
}

/// Bridges transport deliveries to a `MessageHandler`, tagging each message
/// with the queue it was consumed from.
pub(crate) struct QueueDispatcher {
    queue_name: String,
    handler: Arc<dyn MessageHandler>,
}

impl QueueDispatcher {
    pub fn new(queue_name: impl Into<String>, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            queue_name: queue_name.into(),
            handler,
        }
    }
}

#[async_trait]
impl InboundHandler for QueueDispatcher {
    async fn handle(&self, message: &InboundMessage) -> Result<(), HandlerError> {
        let envelope = MessageEnvelope::new(message.body.clone());
        self.handler
            .handle_message(&self.queue_name, envelope)
            .await
    }
}
