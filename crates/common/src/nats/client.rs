use crate::nats::traits::{JetStreamConsumer, JetStreamPublisher, PullConsumer};
use anyhow::{Context, Result};
use async_nats::jetstream::{self, stream::Config as StreamConfig};
use async_nats::HeaderMap;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument};

use super::subject::all_partitions_subject;

pub struct NatsClient {
    client: async_nats::Client,
    jetstream: jetstream::Context,
}

impl NatsClient {
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self> {
        info!(url = %url, timeout_ms = timeout.as_millis(), "connecting to NATS");

        let client = async_nats::ConnectOptions::new()
            .connection_timeout(timeout)
            .connect(url)
            .await
            .context("failed to connect to NATS")?;

        let jetstream = jetstream::new(client.clone());

        info!("connected to NATS");
        Ok(Self { client, jetstream })
    }

    /// Create the vitals stream if it does not exist yet. The stream captures
    /// every partition subject below `stream_name`.
    pub async fn ensure_stream(&self, stream_name: &str) -> Result<()> {
        info!(stream = %stream_name, "ensuring stream exists");

        match self.jetstream.get_stream(stream_name).await {
            Ok(_) => {
                info!(stream = %stream_name, "stream already exists");
            }
            Err(_) => {
                let stream_config = StreamConfig {
                    name: stream_name.to_string(),
                    subjects: vec![all_partitions_subject(stream_name)],
                    description: Some("Normalized CareChain vital events".to_string()),
                    storage: jetstream::stream::StorageType::File,
                    ..Default::default()
                };
                self.jetstream
                    .create_stream(stream_config)
                    .await
                    .context("failed to create stream")?;
                info!(stream = %stream_name, "created stream");
            }
        }

        Ok(())
    }

    pub fn create_consumer_client(&self) -> Arc<dyn JetStreamConsumer> {
        Arc::new(NatsJetStreamConsumer::new(self.jetstream.clone()))
    }

    pub fn create_publisher_client(&self) -> Arc<dyn JetStreamPublisher> {
        Arc::new(NatsJetStreamPublisher::new(self.jetstream.clone()))
    }

    /// Flush pending publishes before the connection is dropped.
    pub async fn close(self) -> Result<()> {
        info!("closing NATS connection");
        self.client
            .flush()
            .await
            .context("failed to flush NATS connection")?;
        Ok(())
    }
}

pub struct NatsJetStreamConsumer {
    context: jetstream::Context,
}

impl NatsJetStreamConsumer {
    pub fn new(context: jetstream::Context) -> Self {
        Self { context }
    }
}

#[async_trait]
impl JetStreamConsumer for NatsJetStreamConsumer {
    async fn create_consumer(
        &self,
        config: jetstream::consumer::pull::Config,
        stream_name: &str,
    ) -> Result<Box<dyn PullConsumer>> {
        let durable_name = config
            .durable_name
            .clone()
            .context("pull consumers must be durable")?;

        let stream = self
            .context
            .get_stream(stream_name)
            .await
            .context("failed to get stream")?;

        let consumer = stream
            .get_or_create_consumer(&durable_name, config)
            .await
            .context("failed to create consumer")?;

        Ok(Box::new(NatsPullConsumer { consumer }))
    }
}

pub struct NatsPullConsumer {
    consumer: jetstream::consumer::PullConsumer,
}

#[async_trait]
impl PullConsumer for NatsPullConsumer {
    async fn fetch_messages(
        &self,
        max_messages: usize,
        expires: Duration,
    ) -> Result<Vec<jetstream::Message>> {
        use futures::StreamExt;

        let mut messages = self
            .consumer
            .fetch()
            .max_messages(max_messages)
            .expires(expires)
            .messages()
            .await
            .context("failed to fetch messages")?;

        let mut result = Vec::new();
        while let Some(msg) = messages.next().await {
            match msg {
                Ok(message) => result.push(message),
                Err(e) => {
                    error!(error = %e, "error receiving message");
                }
            }
        }
        Ok(result)
    }
}

pub struct NatsJetStreamPublisher {
    context: jetstream::Context,
}

impl NatsJetStreamPublisher {
    pub fn new(context: jetstream::Context) -> Self {
        Self { context }
    }
}

#[async_trait]
impl JetStreamPublisher for NatsJetStreamPublisher {
    #[instrument(skip(self, headers, payload), fields(subject = %subject, payload_size = payload.len()))]
    async fn publish_with_headers(
        &self,
        subject: String,
        headers: HeaderMap,
        payload: bytes::Bytes,
    ) -> Result<()> {
        let ack = self
            .context
            .publish_with_headers(subject, headers, payload)
            .await
            .context("failed to publish message to JetStream")?;

        let ack = ack
            .await
            .context("failed to receive JetStream acknowledgment")?;
        if ack.duplicate {
            debug!(stream = %ack.stream, sequence = ack.sequence, "server dropped duplicate publish");
        }
        Ok(())
    }
}
