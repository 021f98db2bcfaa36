pub mod domain;
pub mod ingestion_gateway;
pub mod mqtt;

pub use domain::*;
pub use ingestion_gateway::*;
pub use mqtt::*;
