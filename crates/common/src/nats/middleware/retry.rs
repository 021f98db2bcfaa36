use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use super::types::{PublishRequest, PublishResponse};
use crate::domain::DomainError;
use tower::{Layer, Service, ServiceExt};
use tracing::warn;

/// Bounded exponential backoff for publishes. Every attempt is capped by
/// `attempt_timeout`; the delay doubles after each failure up to `max_backoff`.
#[derive(Clone, Debug)]
pub struct PublishRetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub attempt_timeout: Duration,
}

impl Default for PublishRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            attempt_timeout: Duration::from_secs(5),
        }
    }
}

impl PublishRetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[derive(Clone)]
pub struct NatsPublishRetryLayer {
    policy: PublishRetryPolicy,
}

impl NatsPublishRetryLayer {
    pub fn new(policy: PublishRetryPolicy) -> Self {
        Self { policy }
    }
}

impl<S> Layer<S> for NatsPublishRetryLayer {
    type Service = NatsPublishRetryService<S>;

    fn layer(&self, service: S) -> Self::Service {
        NatsPublishRetryService {
            inner: service,
            policy: self.policy.clone(),
        }
    }
}

/// Retries failed or timed out publishes. Once the attempts are used up the
/// error is a `DomainError::DeliveryFailure` wrapped in `anyhow`.
#[derive(Clone)]
pub struct NatsPublishRetryService<S> {
    inner: S,
    policy: PublishRetryPolicy,
}

impl<S> Service<PublishRequest> for NatsPublishRetryService<S>
where
    S: Service<PublishRequest, Response = PublishResponse, Error = anyhow::Error>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    type Response = PublishResponse;
    type Error = anyhow::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Readiness is checked per attempt on a fresh clone.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: PublishRequest) -> Self::Future {
        let inner = self.inner.clone();
        let policy = self.policy.clone();

        Box::pin(async move {
            let max_attempts = policy.max_attempts.max(1);
            let mut last_error = String::new();

            for attempt in 1..=max_attempts {
                let outcome =
                    tokio::time::timeout(policy.attempt_timeout, inner.clone().oneshot(req.clone()))
                        .await;

                match outcome {
                    Ok(Ok(mut response)) => {
                        response.attempts = attempt;
                        return Ok(response);
                    }
                    Ok(Err(e)) => last_error = format!("{:#}", e),
                    Err(_) => {
                        last_error = format!(
                            "attempt timed out after {}ms",
                            policy.attempt_timeout.as_millis()
                        )
                    }
                }

                if attempt < max_attempts {
                    let backoff = policy.backoff_for(attempt);
                    warn!(
                        subject = %req.subject,
                        attempt,
                        max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %last_error,
                        "publish attempt failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }

            Err(anyhow::Error::new(DomainError::DeliveryFailure {
                attempts: max_attempts,
                reason: last_error,
            }))
        })
    }
}
