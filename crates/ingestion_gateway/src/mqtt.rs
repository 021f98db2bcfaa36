mod subscriber;
mod topic;

pub use subscriber::*;
pub use topic::*;
