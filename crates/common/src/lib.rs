pub mod domain;
pub mod garde;
pub mod memory;
pub mod nats;
pub mod postgres;
pub mod redis;
pub mod telemetry;
pub mod wire;

#[cfg(any(test, feature = "testing"))]
pub use domain::MockDeliveryAcker;
#[cfg(any(test, feature = "testing"))]
pub use domain::MockEventPublisher;
#[cfg(any(test, feature = "testing"))]
pub use domain::MockEventSubscriber;
#[cfg(any(test, feature = "testing"))]
pub use domain::MockReadModelCache;
#[cfg(any(test, feature = "testing"))]
pub use domain::MockVitalStateRepository;
#[cfg(any(test, feature = "testing"))]
pub use nats::MockJetStreamConsumer;
#[cfg(any(test, feature = "testing"))]
pub use nats::MockJetStreamPublisher;
#[cfg(any(test, feature = "testing"))]
pub use nats::MockPullConsumer;
