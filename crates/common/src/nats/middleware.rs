mod logging;
mod publisher;
mod retry;
mod tracing;
mod types;

pub use logging::*;
pub use publisher::*;
pub use retry::*;
pub use tracing::*;
pub use types::*;
