use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use super::types::{PublishRequest, PublishResponse};
use crate::nats::trace_context::inject_trace_context;
use tower::{Layer, Service};
use tracing::{field, info_span, Instrument, Span};

#[derive(Clone, Debug, Default)]
pub struct NatsTracingConfig {
    /// Reported as `service.name` on publish spans.
    pub service_name: String,
}

impl NatsTracingConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }
}

#[derive(Clone)]
pub struct NatsPublishTracingLayer {
    config: NatsTracingConfig,
}

impl NatsPublishTracingLayer {
    pub fn new(config: NatsTracingConfig) -> Self {
        Self { config }
    }
}

impl<S> Layer<S> for NatsPublishTracingLayer {
    type Service = NatsPublishTracingService<S>;

    fn layer(&self, service: S) -> Self::Service {
        NatsPublishTracingService {
            inner: service,
            config: self.config.clone(),
        }
    }
}

/// Producer span per event. Its W3C context goes into the message headers
/// before any attempt is made, so every retry carries the same parent and the
/// worker's processing span joins the ingest trace.
#[derive(Clone)]
pub struct NatsPublishTracingService<S> {
    inner: S,
    config: NatsTracingConfig,
}

fn producer_span(req: &PublishRequest, service_name: &str) -> Span {
    info_span!(
        target: "nats",
        "vitals_publish",
        otel.name = %format!("{} publish", req.subject),
        otel.kind = "producer",
        otel.status_code = field::Empty,
        messaging.system = "nats",
        messaging.operation = "publish",
        messaging.destination.name = %req.subject,
        messaging.destination.partition.id = req.partition_key.as_deref().unwrap_or(""),
        messaging.message.id = req.message_id.as_deref().unwrap_or(""),
        messaging.message.body.size = req.payload.len(),
        messaging.attempts = field::Empty,
        service.name = %service_name,
    )
}

impl<S> Service<PublishRequest> for NatsPublishTracingService<S>
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

    fn call(&mut self, mut req: PublishRequest) -> Self::Future {
        let span = producer_span(&req, &self.config.service_name);
        span.in_scope(|| inject_trace_context(&mut req.headers));

        let mut inner = self.inner.clone();
        let recorder = span.clone();

        Box::pin(
            async move {
                let result = inner.call(req).await;
                match &result {
                    Ok(response) => {
                        recorder.record("otel.status_code", "OK");
                        recorder.record("messaging.attempts", response.attempts);
                    }
                    Err(_) => {
                        recorder.record("otel.status_code", "ERROR");
                    }
                }
                result
            }
            .instrument(span),
        )
    }
}
