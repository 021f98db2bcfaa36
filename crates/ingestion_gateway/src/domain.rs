mod ingestion_service;
mod normalizer;

pub use ingestion_service::*;
pub use normalizer::*;
