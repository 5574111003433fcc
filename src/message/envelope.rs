/// Transport-neutral wrapper around a message payload.
///
/// The payload is optional: a null envelope (`MessageEnvelope::null()`) and an
/// envelope holding an empty byte sequence are different states, and
/// `data()` reports them as `None` and `Some(&[])` respectively.
///
/// # Example
///
/// ```rust
/// use nsqlink::message::MessageEnvelope;
///
/// let msg = MessageEnvelope::new(b"hello".to_vec());
/// assert_eq!(msg.data(), Some(&b"hello"[..]));
/// assert!(MessageEnvelope::null().data().is_none());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct MessageEnvelope {
    data: Option<Vec<u8>>,
}

impl MessageEnvelope {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: Some(data.into()),
        }
    }

    pub fn null() -> Self {
        Self { data: None }
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    pub fn is_null(&self) -> bool {
        self.data.is_none()
    }

    pub fn into_data(self) -> Option<Vec<u8>> {
        self.data
    }
}

impl From<Vec<u8>> for MessageEnvelope {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

impl From<Option<Vec<u8>>> for MessageEnvelope {
    fn from(data: Option<Vec<u8>>) -> Self {
        Self { data }
    }
}
