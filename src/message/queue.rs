use std::fmt;
use std::sync::Arc;

use crate::broker::MessageHandler;
use crate::utils::error::{BrokerError, Result};

/// Named binding between a queue and the handler meant to process it.
///
/// A plain lookup record kept in the client's queue registry. It holds no
/// connection and exists independently of any live subscription.
#[derive(Clone, Default)]
pub struct QueueEntry {
    name: String,
    handler: Option<Arc<dyn MessageHandler>>,
}

impl QueueEntry {
    pub fn new(name: impl Into<String>, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            name: name.into(),
            handler: Some(handler),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rename the entry. Empty names are rejected.
    pub fn set_name(&mut self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        if name.is_empty() {
            return Err(BrokerError::validation("SetName", "queue name is empty"));
        }
        self.name = name;
        Ok(())
    }

    pub fn handler(&self) -> Option<Arc<dyn MessageHandler>> {
        self.handler.clone()
    }

    pub fn set_handler(&mut self, handler: Option<Arc<dyn MessageHandler>>) -> Result<()> {
        self.handler = handler;
        Ok(())
    }
}

/// Entries are equal when they share a name and point at the same handler.
impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        let same_handler = match (&self.handler, &other.handler) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        self.name == other.name && same_handler
    }
}

impl fmt::Debug for QueueEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueEntry")
            .field("name", &self.name)
            .field("handler", &self.handler.as_ref().map(|_| "MessageHandler"))
            .finish()
    }
}
