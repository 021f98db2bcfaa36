use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use super::types::{PublishRequest, PublishResponse};
use super::{
    NatsPublishLoggingLayer, NatsPublishLoggingService, NatsPublishRetryLayer,
    NatsPublishRetryService, NatsPublishTracingLayer, NatsPublishTracingService,
    NatsTracingConfig, PublishRetryPolicy,
};
use crate::nats::JetStreamPublisher;
use anyhow::Result;
use async_nats::header::NATS_MESSAGE_ID;
use tower::{Service, ServiceBuilder};

/// Innermost service: one acknowledged publish, no retries.
#[derive(Clone)]
pub struct NatsPublishService {
    publisher: Arc<dyn JetStreamPublisher>,
}

impl NatsPublishService {
    pub fn new(publisher: Arc<dyn JetStreamPublisher>) -> Self {
        Self { publisher }
    }
}

impl Service<PublishRequest> for NatsPublishService {
    type Response = PublishResponse;
    type Error = anyhow::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: PublishRequest) -> Self::Future {
        let publisher = Arc::clone(&self.publisher);
        let subject = req.subject.clone();
        let mut headers = req.headers;
        if let Some(message_id) = &req.message_id {
            headers.insert(NATS_MESSAGE_ID, message_id.as_str());
        }

        Box::pin(async move {
            publisher
                .publish_with_headers(subject.clone(), headers, req.payload)
                .await?;
            Ok(PublishResponse {
                subject,
                attempts: 1,
            })
        })
    }
}

/// Full publish stack, outermost first: Tracing -> Logging -> Retry -> Publish.
pub type LayeredPublisher = NatsPublishTracingService<
    NatsPublishLoggingService<NatsPublishRetryService<NatsPublishService>>,
>;

pub struct NatsPublisherBuilder {
    publisher: Arc<dyn JetStreamPublisher>,
    tracing_config: NatsTracingConfig,
    retry_policy: PublishRetryPolicy,
}

impl NatsPublisherBuilder {
    pub fn new(publisher: Arc<dyn JetStreamPublisher>) -> Self {
        Self {
            publisher,
            tracing_config: NatsTracingConfig::default(),
            retry_policy: PublishRetryPolicy::default(),
        }
    }

    pub fn with_tracing(mut self, config: NatsTracingConfig) -> Self {
        self.tracing_config = config;
        self
    }

    pub fn with_retry(mut self, policy: PublishRetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn build(self) -> LayeredPublisher {
        ServiceBuilder::new()
            .layer(NatsPublishTracingLayer::new(self.tracing_config))
            .layer(NatsPublishLoggingLayer::new())
            .layer(NatsPublishRetryLayer::new(self.retry_policy))
            .service(NatsPublishService::new(self.publisher))
    }
}
