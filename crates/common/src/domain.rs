mod alert;
mod bus;
mod cache;
mod metric;
mod reading;
mod result;
mod vital_state;

pub use alert::*;
pub use bus::*;
pub use cache::*;
pub use metric::*;
pub use reading::*;
pub use result::*;
pub use vital_state::*;
