//! Broker-level message: an opaque body plus headers.

/// Number of failed handling attempts so far.
pub const ATTEMPTS_HEADER: &str = "x-delivery-attempts";
/// Routing key the message was first published with (set on retried copies).
pub const ORIGINAL_ROUTING_KEY_HEADER: &str = "x-original-routing-key";
/// Why the message landed in a dead-letter queue.
pub const DEAD_LETTER_REASON_HEADER: &str = "x-dead-letter-reason";

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A message as handed to or received from the broker.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    /// Message id (the envelope's event id for domain events)
    pub id: String,
    /// Serialized body
    pub payload: Vec<u8>,
    /// Header table, in insertion order
    pub metadata: Vec<(String, String)>,
    /// Ask the broker to write the message to disk
    pub persistent: bool,
    /// MIME type of the body
    pub content_type: Option<String>,
}

impl Message {
    /// Create a transient message with no headers.
    pub fn new(id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            payload,
            metadata: Vec::new(),
            persistent: false,
            content_type: None,
        }
    }

    /// Create a persistent JSON message.
    pub fn json(id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self::new(id, payload)
            .persistent()
            .with_content_type(JSON_CONTENT_TYPE)
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Add a header. An existing header with the same key is replaced.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_metadata(key, value);
        self
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.metadata.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.metadata.push((key, value)),
        }
    }

    /// Look up a header value.
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Failed handling attempts recorded on this message (0 when absent or unparseable).
    pub fn attempts(&self) -> u32 {
        self.metadata(ATTEMPTS_HEADER)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Get the payload as a string (if valid UTF-8).
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}
