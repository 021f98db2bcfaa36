pub mod domain;
pub mod partition;
pub mod vitals_worker;

pub use domain::*;
pub use partition::*;
pub use vitals_worker::*;
