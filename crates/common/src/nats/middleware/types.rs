use async_nats::HeaderMap;
use bytes::Bytes;

/// One message on its way to JetStream.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub subject: String,
    pub payload: Bytes,
    /// Trace context is injected here by the tracing layer.
    pub headers: HeaderMap,
    /// Sent as `Nats-Msg-Id`, letting the server drop retried duplicates
    /// inside the stream's duplicate window.
    pub message_id: Option<String>,
    /// Device the message belongs to, for logs and spans.
    pub partition_key: Option<String>,
}

impl PublishRequest {
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            payload: payload.into(),
            headers: HeaderMap::new(),
            message_id: None,
            partition_key: None,
        }
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn with_partition_key(mut self, partition_key: impl Into<String>) -> Self {
        self.partition_key = Some(partition_key.into());
        self
    }
}

#[derive(Debug)]
pub struct PublishResponse {
    pub subject: String,
    /// Attempts it took, including the successful one.
    pub attempts: u32,
}
