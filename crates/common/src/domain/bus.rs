use crate::domain::reading::NormalizedEvent;
use crate::domain::result::DomainResult;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;
use std::time::Duration;
use tracing::Span;

/// Publishes normalized events onto the durable bus, partitioned by device.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Resolves once the bus has durably accepted the event. Retries happen
    /// inside the adapter; an error here means they were exhausted.
    async fn publish(&self, event: &NormalizedEvent) -> DomainResult<()>;
}

/// Settles one delivery with the bus.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self) -> DomainResult<()>;

    /// Ask for redelivery.
    async fn nak(&self, reason: &str) -> DomainResult<()>;
}

/// Delay before a nak'd delivery is offered again. Doubles with every
/// delivery attempt up to `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedeliveryBackoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for RedeliveryBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

impl RedeliveryBackoff {
    pub fn delay_for(&self, delivery_attempt: u64) -> Duration {
        let exponent = delivery_attempt.saturating_sub(1).min(16) as u32;
        self.initial
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max)
    }
}

/// One event handed to a consumer together with its ack/nak handle.
///
/// Dropping a delivery without settling it leaves it pending on the bus,
/// which redelivers it later.
pub struct Delivery {
    pub event: NormalizedEvent,
    /// 1 on first delivery, incremented on every redelivery.
    pub delivery_attempt: u64,
    acker: Box<dyn DeliveryAcker>,
    span: Span,
}

impl Delivery {
    pub fn new(event: NormalizedEvent, delivery_attempt: u64, acker: Box<dyn DeliveryAcker>) -> Self {
        Self {
            event,
            delivery_attempt,
            acker,
            span: Span::none(),
        }
    }

    /// Attach the span carrying the publisher's trace context.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn partition_key(&self) -> &str {
        self.event.partition_key()
    }

    pub async fn ack(self) -> DomainResult<()> {
        self.acker.ack().await
    }

    pub async fn nak(self, reason: &str) -> DomainResult<()> {
        self.acker.nak(reason).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("event", &self.event)
            .field("delivery_attempt", &self.delivery_attempt)
            .finish_non_exhaustive()
    }
}

/// Lazy stream of deliveries. Ends when the subscription is closed.
pub type DeliveryStream = BoxStream<'static, DomainResult<Delivery>>;

/// Durable, at-least-once subscriptions on the bus.
///
/// Subscriptions resume from the last acknowledged position, so subscribing
/// again after a crash or restart redelivers everything left unacknowledged.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    /// Ordered deliveries for a single partition.
    async fn subscribe(&self, partition_key: &str) -> DomainResult<DeliveryStream>;

    /// Deliveries for every partition through one consumer. Order holds within
    /// a partition, not across partitions.
    async fn subscribe_all(&self) -> DomainResult<DeliveryStream>;
}
