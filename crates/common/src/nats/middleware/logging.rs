use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use super::types::{PublishRequest, PublishResponse};
use tower::{Layer, Service};
use tracing::{debug, error, info, Instrument, Span};

#[derive(Clone, Default)]
pub struct NatsPublishLoggingLayer;

impl NatsPublishLoggingLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for NatsPublishLoggingLayer {
    type Service = NatsPublishLoggingService<S>;

    fn layer(&self, service: S) -> Self::Service {
        NatsPublishLoggingService { inner: service }
    }
}

/// One log line per event publish. Sits outside the retry layer, so a
/// publish that needed retries is reported once with its attempt count.
#[derive(Clone)]
pub struct NatsPublishLoggingService<S> {
    inner: S,
}

struct PublishLogFields {
    subject: String,
    device_id: String,
    message_id: String,
    payload_bytes: usize,
}

impl PublishLogFields {
    fn from_request(req: &PublishRequest) -> Self {
        Self {
            subject: req.subject.clone(),
            device_id: req.partition_key.clone().unwrap_or_default(),
            message_id: req.message_id.clone().unwrap_or_default(),
            payload_bytes: req.payload.len(),
        }
    }

    fn succeeded(&self, response: &PublishResponse, started: Instant) {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        if response.attempts > 1 {
            info!(
                subject = %self.subject,
                device_id = %self.device_id,
                message_id = %self.message_id,
                attempts = response.attempts,
                elapsed_ms,
                "event published after retries"
            );
        } else {
            debug!(
                subject = %self.subject,
                device_id = %self.device_id,
                payload_bytes = self.payload_bytes,
                elapsed_ms,
                "event published"
            );
        }
    }

    fn failed(&self, error: &dyn std::fmt::Display, started: Instant) {
        error!(
            subject = %self.subject,
            device_id = %self.device_id,
            message_id = %self.message_id,
            payload_bytes = self.payload_bytes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            error = %error,
            "event publish failed"
        );
    }
}

impl<S> Service<PublishRequest> for NatsPublishLoggingService<S>
where
    S: Service<PublishRequest, Response = PublishResponse> + Clone + Send + 'static,
    S::Error: std::fmt::Display + Send,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: PublishRequest) -> Self::Future {
        let fields = PublishLogFields::from_request(&req);
        let started = Instant::now();
        let mut inner = self.inner.clone();

        Box::pin(
            async move {
                let result = inner.call(req).await;
                match &result {
                    Ok(response) => fields.succeeded(response, started),
                    Err(e) => fields.failed(e, started),
                }
                result
            }
            .instrument(Span::current()),
        )
    }
}
