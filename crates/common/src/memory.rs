mod bus;
mod cache;
mod repository;

pub use bus::*;
pub use cache::*;
pub use repository::*;
