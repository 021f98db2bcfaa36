use anyhow::Result;
use async_nats::jetstream;
use async_nats::HeaderMap;
use async_trait::async_trait;
use std::time::Duration;

/// Creates durable pull consumers on a JetStream stream.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait JetStreamConsumer: Send + Sync {
    /// Create the consumer, or bind to it when a durable consumer with the same
    /// name already exists so its acknowledged position is kept.
    async fn create_consumer(
        &self,
        config: jetstream::consumer::pull::Config,
        stream_name: &str,
    ) -> Result<Box<dyn PullConsumer>>;
}

/// Fetches batches from a pull consumer.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait PullConsumer: Send + Sync {
    /// Returns up to `max_messages`, waiting at most `expires` for the first one.
    async fn fetch_messages(
        &self,
        max_messages: usize,
        expires: Duration,
    ) -> Result<Vec<jetstream::Message>>;
}

/// Acknowledged publishing into a stream.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait JetStreamPublisher: Send + Sync {
    /// Publish and wait for the stream's acknowledgment. A message the server
    /// recognises as a duplicate by its `Nats-Msg-Id` still counts as success.
    async fn publish_with_headers(
        &self,
        subject: String,
        headers: HeaderMap,
        payload: bytes::Bytes,
    ) -> Result<()>;
}
