mod client;
mod event_publisher;
mod event_subscriber;
mod middleware;
mod subject;
mod trace_context;
mod traits;

pub use client::*;
pub use event_publisher::*;
pub use event_subscriber::*;
pub use middleware::*;
pub use subject::*;
pub use trace_context::*;
pub use traits::*;
