use crate::domain::{DomainError, DomainResult, EventPublisher, NormalizedEvent};
use crate::nats::{partition_subject, LayeredPublisher, PublishRequest};
use crate::wire::encode_event;
use async_trait::async_trait;
use tower::ServiceExt;
use tracing::{debug, instrument};

/// Publishes normalized events to `{stream}.{device}` through the layered
/// NATS publisher.
#[derive(Clone)]
pub struct NatsEventPublisher {
    publisher: LayeredPublisher,
    stream: String,
}

impl NatsEventPublisher {
    pub fn new(publisher: LayeredPublisher, stream: impl Into<String>) -> Self {
        Self {
            publisher,
            stream: stream.into(),
        }
    }
}

#[async_trait]
impl EventPublisher for NatsEventPublisher {
    #[instrument(
        skip(self, event),
        fields(
            device_id = %event.device_id,
            metric = %event.metric,
            sequence_number = event.sequence_number,
        )
    )]
    async fn publish(&self, event: &NormalizedEvent) -> DomainResult<()> {
        let subject = partition_subject(&self.stream, event.partition_key());
        let payload = encode_event(event)?;

        let response = self
            .publisher
            .clone()
            .oneshot(
                PublishRequest::new(subject, payload)
                    .with_message_id(event.idempotency_key.as_str())
                    .with_partition_key(event.partition_key()),
            )
            .await
            .map_err(|e| match e.downcast::<DomainError>() {
                Ok(domain_error) => domain_error,
                Err(other) => DomainError::PublishError(format!("{:#}", other)),
            })?;

        debug!(
            subject = %response.subject,
            attempts = response.attempts,
            "event published"
        );
        Ok(())
    }
}
