use crate::domain::{ApplyOutcome, DomainEventProcessor};
use anyhow::Context;
use common::domain::{Delivery, DomainError, EventSubscriber};
use futures::{FutureExt, StreamExt};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

const FETCH_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Deliveries buffered or in processing across all partitions. The
    /// dispatcher stops pulling from the bus while the limit is reached.
    pub max_buffered_deliveries: usize,
    /// A partition worker with nothing to do for this long retires.
    pub idle_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_buffered_deliveries: 1024,
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// Fans one durable subscription out to one worker task per device.
///
/// Devices are processed in parallel; deliveries of one device are processed
/// one at a time in the order the bus handed them out. Each delivery is acked
/// once it has been applied or skipped and nak'd when processing fails.
/// Partition queues are unbounded so a slow device never blocks dispatch to
/// the others; the pool-wide buffer limit bounds memory instead.
pub struct PartitionedWorkerPool {
    subscriber: Arc<dyn EventSubscriber>,
    processor: Arc<DomainEventProcessor>,
    config: WorkerPoolConfig,
}

/// A delivery plus its slot in the pool-wide buffer.
struct Queued {
    delivery: Delivery,
    _permit: OwnedSemaphorePermit,
}

struct Partitions {
    senders: HashMap<String, mpsc::UnboundedSender<Queued>>,
    /// Deliveries that arrived while their partition's worker was retiring.
    parked: HashMap<String, Vec<Queued>>,
    workers: JoinSet<String>,
}

impl PartitionedWorkerPool {
    pub fn new(
        subscriber: Arc<dyn EventSubscriber>,
        processor: Arc<DomainEventProcessor>,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            subscriber,
            processor,
            config,
        }
    }

    /// Dispatch until cancelled or the subscription ends, then wait for the
    /// in-flight deliveries. Buffered ones are left unacknowledged.
    pub async fn run(self, token: CancellationToken) -> anyhow::Result<()> {
        let mut stream = self
            .subscriber
            .subscribe_all()
            .await
            .context("failed to subscribe to vitals events")?;

        info!(
            max_buffered_deliveries = self.config.max_buffered_deliveries,
            idle_timeout_secs = self.config.idle_timeout.as_secs(),
            "partitioned worker pool started"
        );

        let buffer = Arc::new(Semaphore::new(self.config.max_buffered_deliveries.max(1)));
        let mut partitions = Partitions {
            senders: HashMap::new(),
            parked: HashMap::new(),
            workers: JoinSet::new(),
        };
        let mut reserved: Option<OwnedSemaphorePermit> = None;

        loop {
            let permit = match reserved.take() {
                Some(permit) => permit,
                None => tokio::select! {
                    biased;

                    _ = token.cancelled() => {
                        debug!("cancellation received, stopping dispatch");
                        break;
                    }
                    Some(finished) = partitions.workers.join_next(), if !partitions.workers.is_empty() => {
                        self.on_join(finished, &mut partitions, &token);
                        continue;
                    }
                    permit = Arc::clone(&buffer).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                },
            };

            tokio::select! {
                biased;

                _ = token.cancelled() => {
                    debug!("cancellation received, stopping dispatch");
                    break;
                }
                Some(finished) = partitions.workers.join_next(), if !partitions.workers.is_empty() => {
                    self.on_join(finished, &mut partitions, &token);
                    reserved = Some(permit);
                }
                next = stream.next() => match next {
                    Some(Ok(delivery)) => self.dispatch(
                        Queued { delivery, _permit: permit },
                        &mut partitions,
                        &token,
                    ),
                    Some(Err(e)) => {
                        warn!(error = %e, "failed to receive deliveries");
                        reserved = Some(permit);
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = tokio::time::sleep(FETCH_ERROR_BACKOFF) => {}
                        }
                    }
                    None => {
                        info!("subscription ended");
                        break;
                    }
                },
            }
        }

        let Partitions {
            senders,
            parked,
            mut workers,
        } = partitions;
        drop(senders);
        drop(parked);

        info!(workers = workers.len(), "waiting for partition workers");
        while let Some(finished) = workers.join_next().await {
            if let Err(e) = finished {
                error!(error = %e, "partition worker failed");
            }
        }

        info!("partitioned worker pool stopped");
        Ok(())
    }

    fn on_join(
        &self,
        finished: Result<String, tokio::task::JoinError>,
        partitions: &mut Partitions,
        token: &CancellationToken,
    ) {
        match finished {
            Ok(key) => self.on_worker_exit(key, partitions, token),
            // Workers catch panics per delivery, so this only happens on abort.
            Err(e) => error!(error = %e, "partition worker failed"),
        }
    }

    fn dispatch(&self, queued: Queued, partitions: &mut Partitions, token: &CancellationToken) {
        let key = queued.delivery.partition_key().to_string();

        if let Some(parked) = partitions.parked.get_mut(&key) {
            parked.push(queued);
            return;
        }

        let sender = match partitions.senders.get(&key) {
            Some(sender) => sender.clone(),
            None => self.spawn_worker(key.clone(), partitions, token),
        };

        if let Err(mpsc::error::SendError(queued)) = sender.send(queued) {
            // The worker closed its channel on idle and is still draining.
            debug!(partition = %key, "parking delivery until retiring worker exits");
            partitions.parked.insert(key, vec![queued]);
        }
    }

    fn on_worker_exit(&self, key: String, partitions: &mut Partitions, token: &CancellationToken) {
        partitions.senders.remove(&key);

        let Some(parked) = partitions.parked.remove(&key) else {
            return;
        };

        debug!(partition = %key, parked = parked.len(), "respawning partition worker");
        let sender = self.spawn_worker(key, partitions, token);
        for queued in parked {
            if sender.send(queued).is_err() {
                return;
            }
        }
    }

    fn spawn_worker(
        &self,
        key: String,
        partitions: &mut Partitions,
        token: &CancellationToken,
    ) -> mpsc::UnboundedSender<Queued> {
        let (sender, receiver) = mpsc::unbounded_channel();
        partitions.senders.insert(key.clone(), sender.clone());

        debug!(partition = %key, "spawning partition worker");
        partitions.workers.spawn(run_partition_worker(
            key,
            receiver,
            Arc::clone(&self.processor),
            self.config.idle_timeout,
            token.clone(),
        ));

        sender
    }
}

async fn run_partition_worker(
    key: String,
    mut receiver: mpsc::UnboundedReceiver<Queued>,
    processor: Arc<DomainEventProcessor>,
    idle_timeout: Duration,
    token: CancellationToken,
) -> String {
    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            next = tokio::time::timeout(idle_timeout, receiver.recv()) => next,
        };

        match next {
            Ok(Some(queued)) => handle_delivery(&processor, queued.delivery).await,
            Ok(None) => break,
            Err(_) => {
                // Refuse new sends, then finish whatever slipped in meanwhile.
                receiver.close();
                while let Some(queued) = receiver.recv().await {
                    if token.is_cancelled() {
                        break;
                    }
                    handle_delivery(&processor, queued.delivery).await;
                }
                debug!(partition = %key, "partition worker retired after idling");
                break;
            }
        }
    }

    key
}

async fn handle_delivery(processor: &DomainEventProcessor, delivery: Delivery) {
    let span = delivery.span().clone();

    async move {
        let result = AssertUnwindSafe(processor.apply(&delivery.event))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(DomainError::ProcessingError(
                    "event processing panicked".to_string(),
                ))
            });

        match result {
            Ok(outcome) => {
                if let ApplyOutcome::Skipped(reason) = &outcome {
                    debug!(reason = reason.as_str(), "acknowledging skipped event");
                }
                if let Err(e) = delivery.ack().await {
                    warn!(error = %e, "failed to acknowledge delivery");
                }
            }
            Err(e) => {
                if e.is_transient() {
                    warn!(error = %e, attempt = delivery.delivery_attempt, "processing failed, requesting redelivery");
                } else {
                    error!(error = %e, attempt = delivery.delivery_attempt, "processing failed, requesting redelivery");
                }
                if let Err(nak_error) = delivery.nak(&e.to_string()).await {
                    warn!(error = %nak_error, "failed to nak delivery");
                }
            }
        }
    }
    .instrument(span)
    .await
}
