use crate::domain::{
    Delivery, DeliveryAcker, DeliveryStream, DomainError, DomainResult, EventSubscriber,
    RedeliveryBackoff,
};
use crate::nats::{
    all_partitions_subject, extract_trace_context, partition_consumer_name, partition_subject,
    JetStreamConsumer, PullConsumer,
};
use crate::wire::decode_event;
use async_nats::jetstream::{self, AckKind};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info_span};
use tracing_opentelemetry::OpenTelemetrySpanExt;

#[derive(Debug, Clone)]
pub struct NatsSubscriberConfig {
    pub stream: String,
    pub consumer_name: String,
    pub batch_size: usize,
    pub max_wait: Duration,
    /// Delay the server waits before redelivering a nak'd message.
    pub redelivery_backoff: RedeliveryBackoff,
}

/// Durable JetStream subscriptions with explicit acks.
///
/// Consumers are bound by durable name, so a new subscription with the same
/// name continues from the server-side ack floor and gets everything that was
/// left unacknowledged redelivered.
pub struct NatsEventSubscriber {
    consumer_client: Arc<dyn JetStreamConsumer>,
    config: NatsSubscriberConfig,
}

impl NatsEventSubscriber {
    pub fn new(consumer_client: Arc<dyn JetStreamConsumer>, config: NatsSubscriberConfig) -> Self {
        Self {
            consumer_client,
            config,
        }
    }

    async fn open(&self, consumer_name: String, filter_subject: String) -> DomainResult<DeliveryStream> {
        debug!(
            stream = %self.config.stream,
            consumer = %consumer_name,
            filter_subject = %filter_subject,
            "opening durable subscription"
        );

        let config = jetstream::consumer::pull::Config {
            name: Some(consumer_name.clone()),
            durable_name: Some(consumer_name.clone()),
            filter_subject,
            ack_policy: jetstream::consumer::AckPolicy::Explicit,
            ..Default::default()
        };

        let consumer = self
            .consumer_client
            .create_consumer(config, &self.config.stream)
            .await
            .map_err(|e| {
                DomainError::ProcessingError(format!(
                    "failed to create consumer {}: {:#}",
                    consumer_name, e
                ))
            })?;

        let state = FetchState {
            consumer,
            buffer: VecDeque::new(),
            batch_size: self.config.batch_size,
            max_wait: self.config.max_wait,
            redelivery_backoff: self.config.redelivery_backoff,
        };

        Ok(futures::stream::unfold(state, next_delivery).boxed())
    }
}

#[async_trait]
impl EventSubscriber for NatsEventSubscriber {
    async fn subscribe(&self, partition_key: &str) -> DomainResult<DeliveryStream> {
        self.open(
            partition_consumer_name(&self.config.consumer_name, partition_key),
            partition_subject(&self.config.stream, partition_key),
        )
        .await
    }

    async fn subscribe_all(&self) -> DomainResult<DeliveryStream> {
        self.open(
            self.config.consumer_name.clone(),
            all_partitions_subject(&self.config.stream),
        )
        .await
    }
}

struct FetchState {
    consumer: Box<dyn PullConsumer>,
    buffer: VecDeque<jetstream::Message>,
    batch_size: usize,
    max_wait: Duration,
    redelivery_backoff: RedeliveryBackoff,
}

async fn next_delivery(mut state: FetchState) -> Option<(DomainResult<Delivery>, FetchState)> {
    loop {
        if let Some(message) = state.buffer.pop_front() {
            if let Some(delivery) = into_delivery(message, state.redelivery_backoff).await {
                return Some((Ok(delivery), state));
            }
            continue;
        }

        match state
            .consumer
            .fetch_messages(state.batch_size, state.max_wait)
            .await
        {
            Ok(batch) => {
                if !batch.is_empty() {
                    debug!(message_count = batch.len(), "received message batch");
                }
                state.buffer.extend(batch);
            }
            Err(e) => {
                let err = DomainError::ProcessingError(format!("fetch failed: {:#}", e));
                return Some((Err(err), state));
            }
        }
    }
}

/// Undecodable messages can never succeed, so they are terminated instead of
/// being handed to a consumer.
async fn into_delivery(
    message: jetstream::Message,
    redelivery_backoff: RedeliveryBackoff,
) -> Option<Delivery> {
    let event = match decode_event(&message.payload) {
        Ok(event) => event,
        Err(e) => {
            error!(subject = %message.subject, error = %e, "dropping undecodable message");
            if let Err(e) = message.ack_with(AckKind::Term).await {
                error!(subject = %message.subject, error = %e, "failed to terminate message");
            }
            return None;
        }
    };

    let delivery_attempt = message
        .info()
        .map(|info| info.delivered.max(1) as u64)
        .unwrap_or(1);

    let span = info_span!(
        target: "nats",
        "nats_consume",
        otel.name = "nats_consume",
        messaging.system = "nats",
        messaging.operation = "receive",
        messaging.destination.name = %message.subject,
        device_id = %event.device_id,
        metric = %event.metric,
        sequence_number = event.sequence_number,
        delivery_attempt,
    );
    if let Some(headers) = &message.headers {
        span.set_parent(extract_trace_context(headers));
    }

    let acker = NatsAcker {
        message,
        redelivery_delay: redelivery_backoff.delay_for(delivery_attempt),
    };
    Some(Delivery::new(event, delivery_attempt, Box::new(acker)).with_span(span))
}

struct NatsAcker {
    message: jetstream::Message,
    redelivery_delay: Duration,
}

#[async_trait]
impl DeliveryAcker for NatsAcker {
    async fn ack(&self) -> DomainResult<()> {
        self.message
            .ack()
            .await
            .map_err(|e| DomainError::ProcessingError(format!("failed to ack message: {}", e)))
    }

    async fn nak(&self, reason: &str) -> DomainResult<()> {
        debug!(
            subject = %self.message.subject,
            reason = %reason,
            delay_ms = self.redelivery_delay.as_millis() as u64,
            "requesting redelivery"
        );
        self.message
            .ack_with(AckKind::Nak(Some(self.redelivery_delay)))
            .await
            .map_err(|e| DomainError::ProcessingError(format!("failed to nak message: {}", e)))
    }
}
