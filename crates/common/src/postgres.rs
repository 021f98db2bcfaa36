mod client;
mod vital_state_repository;

pub use client::*;
pub use vital_state_repository::*;
