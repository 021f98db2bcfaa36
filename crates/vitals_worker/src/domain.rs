mod event_processor;
mod vital_state_machine;
mod vital_state_query_service;

pub use event_processor::*;
pub use vital_state_machine::*;
pub use vital_state_query_service::*;
