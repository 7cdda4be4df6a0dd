pub mod domain;
pub mod status_worker;

pub use domain::*;
pub use status_worker::*;
