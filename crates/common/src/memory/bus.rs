use crate::domain::{
    Delivery, DeliveryAcker, DeliveryStream, DomainResult, EventPublisher, EventSubscriber,
    NormalizedEvent, RedeliveryBackoff,
};
use crate::wire::{decode_event, encode_event};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info_span};

const ALL_PARTITIONS_CONSUMER: &str = "all";

struct StoredMessage {
    partition_key: String,
    payload: Bytes,
}

/// Durable position of one named consumer. Survives resubscription.
#[derive(Default)]
struct ConsumerState {
    /// Next log offset never handed out.
    next_offset: usize,
    /// Delivered but not yet acknowledged, with delivery counts.
    in_flight: BTreeMap<usize, u64>,
    /// Offsets waiting for redelivery, oldest first.
    redeliver: VecDeque<usize>,
    /// Nak'd offsets still inside their redelivery delay.
    backing_off: HashSet<usize>,
}

#[derive(Default)]
struct BusState {
    log: Vec<StoredMessage>,
    consumers: HashMap<String, ConsumerState>,
    closed: bool,
}

struct BusInner {
    state: Mutex<BusState>,
    notify: Notify,
    redelivery_backoff: RedeliveryBackoff,
}

/// Process-local bus with the same contract as the JetStream adapter:
/// an append-only log, durable per-consumer checkpoints, explicit acks and
/// redelivery of anything nak'd (after a growing delay) or left
/// unacknowledged when a subscription is replaced.
#[derive(Clone)]
pub struct InMemoryEventBus {
    inner: Arc<BusInner>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::with_redelivery_backoff(RedeliveryBackoff::default())
    }

    pub fn with_redelivery_backoff(redelivery_backoff: RedeliveryBackoff) -> Self {
        Self {
            inner: Arc::new(BusInner {
                state: Mutex::new(BusState::default()),
                notify: Notify::new(),
                redelivery_backoff,
            }),
        }
    }

    /// End every open subscription stream once it has drained.
    pub async fn close(&self) {
        self.inner.state.lock().await.closed = true;
        self.inner.notify.notify_waiters();
    }

    pub async fn published_count(&self) -> usize {
        self.inner.state.lock().await.log.len()
    }

    /// Deliveries of `consumer` that are neither acked nor terminated.
    async fn unsettled(&self, consumer: &str) -> usize {
        let state = self.inner.state.lock().await;
        state
            .consumers
            .get(consumer)
            .map(|c| c.in_flight.len())
            .unwrap_or(0)
    }

    /// Unsettled deliveries of the all-partitions consumer.
    pub async fn unsettled_all(&self) -> usize {
        self.unsettled(ALL_PARTITIONS_CONSUMER).await
    }

    async fn open(&self, consumer: String, partition: Option<String>) -> DeliveryStream {
        {
            let mut state = self.inner.state.lock().await;
            let entry = state.consumers.entry(consumer.clone()).or_default();

            // The previous subscriber is gone; whatever it left open comes back.
            let abandoned: Vec<usize> = entry
                .in_flight
                .keys()
                .copied()
                .filter(|offset| {
                    !entry.redeliver.contains(offset) && !entry.backing_off.contains(offset)
                })
                .collect();
            for offset in abandoned.into_iter().rev() {
                entry.redeliver.push_front(offset);
            }
            debug!(
                consumer = %consumer,
                next_offset = entry.next_offset,
                pending_redelivery = entry.redeliver.len(),
                "subscription opened"
            );
        }

        let cursor = Cursor {
            bus: self.clone(),
            consumer,
            partition,
        };

        futures::stream::unfold(cursor, |cursor| async move {
            loop {
                let inner = Arc::clone(&cursor.bus.inner);
                let notified = inner.notify.notified();
                match cursor.poll_once().await {
                    Poll::Ready(delivery) => return Some((Ok(delivery), cursor)),
                    Poll::Closed => return None,
                    Poll::Retry => continue,
                    Poll::Pending => notified.await,
                }
            }
        })
        .boxed()
    }

    /// Queue a nak'd offset for redelivery once its delay has passed.
    async fn end_backoff(&self, consumer: &str, offset: usize) {
        {
            let mut state = self.inner.state.lock().await;
            if let Some(consumer) = state.consumers.get_mut(consumer) {
                if consumer.backing_off.remove(&offset)
                    && consumer.in_flight.contains_key(&offset)
                    && !consumer.redeliver.contains(&offset)
                {
                    consumer.redeliver.push_back(offset);
                }
            }
        }
        self.inner.notify.notify_waiters();
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

enum Poll {
    Ready(Delivery),
    /// A poisoned entry was skipped; look again right away.
    Retry,
    Pending,
    Closed,
}

struct Cursor {
    bus: InMemoryEventBus,
    consumer: String,
    partition: Option<String>,
}

impl Cursor {
    async fn poll_once(&self) -> Poll {
        let mut guard = self.bus.inner.state.lock().await;
        let BusState {
            log,
            consumers,
            closed,
        } = &mut *guard;
        let consumer = consumers.entry(self.consumer.clone()).or_default();

        let mut next = None;
        while let Some(offset) = consumer.redeliver.pop_front() {
            if let Some(attempts) = consumer.in_flight.get_mut(&offset) {
                *attempts += 1;
                next = Some((offset, *attempts));
                break;
            }
        }

        if next.is_none() {
            while consumer.next_offset < log.len() {
                let offset = consumer.next_offset;
                consumer.next_offset += 1;
                let wanted = self
                    .partition
                    .as_ref()
                    .map_or(true, |p| *p == log[offset].partition_key);
                if wanted {
                    consumer.in_flight.insert(offset, 1);
                    next = Some((offset, 1));
                    break;
                }
            }
        }

        let Some((offset, attempts)) = next else {
            return if *closed && consumer.backing_off.is_empty() {
                Poll::Closed
            } else {
                Poll::Pending
            };
        };

        match decode_event(&log[offset].payload) {
            Ok(event) => {
                let span = info_span!(
                    "memory_consume",
                    device_id = %event.device_id,
                    metric = %event.metric,
                    sequence_number = event.sequence_number,
                    delivery_attempt = attempts,
                );
                let acker = InMemoryAcker {
                    bus: self.bus.clone(),
                    consumer: self.consumer.clone(),
                    offset,
                };
                Poll::Ready(Delivery::new(event, attempts, Box::new(acker)).with_span(span))
            }
            Err(e) => {
                error!(offset, error = %e, "dropping undecodable message");
                consumer.in_flight.remove(&offset);
                Poll::Retry
            }
        }
    }
}

struct InMemoryAcker {
    bus: InMemoryEventBus,
    consumer: String,
    offset: usize,
}

#[async_trait]
impl DeliveryAcker for InMemoryAcker {
    async fn ack(&self) -> DomainResult<()> {
        let mut state = self.bus.inner.state.lock().await;
        if let Some(consumer) = state.consumers.get_mut(&self.consumer) {
            consumer.in_flight.remove(&self.offset);
        }
        Ok(())
    }

    async fn nak(&self, reason: &str) -> DomainResult<()> {
        let delay = {
            let mut state = self.bus.inner.state.lock().await;
            let Some(consumer) = state.consumers.get_mut(&self.consumer) else {
                return Ok(());
            };
            let attempts = match consumer.in_flight.get(&self.offset) {
                Some(attempts) if !consumer.redeliver.contains(&self.offset) => *attempts,
                _ => return Ok(()),
            };
            if !consumer.backing_off.insert(self.offset) {
                return Ok(());
            }
            self.bus.inner.redelivery_backoff.delay_for(attempts)
        };

        debug!(
            offset = self.offset,
            reason = %reason,
            delay_ms = delay.as_millis() as u64,
            "redelivery requested"
        );

        let bus = self.bus.clone();
        let consumer = self.consumer.clone();
        let offset = self.offset;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            bus.end_backoff(&consumer, offset).await;
        });
        Ok(())
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventBus {
    async fn publish(&self, event: &NormalizedEvent) -> DomainResult<()> {
        let payload = encode_event(event)?;
        {
            let mut state = self.inner.state.lock().await;
            state.log.push(StoredMessage {
                partition_key: event.partition_key().to_string(),
                payload,
            });
        }
        self.inner.notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl EventSubscriber for InMemoryEventBus {
    async fn subscribe(&self, partition_key: &str) -> DomainResult<DeliveryStream> {
        Ok(self
            .open(
                format!("partition:{}", partition_key),
                Some(partition_key.to_string()),
            )
            .await)
    }

    async fn subscribe_all(&self) -> DomainResult<DeliveryStream> {
        Ok(self.open(ALL_PARTITIONS_CONSUMER.to_string(), None).await)
    }
}
