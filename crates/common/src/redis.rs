mod read_model_cache;

pub use read_model_cache::*;
