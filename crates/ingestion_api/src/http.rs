mod dashboard_handler;
mod error;
mod server;
mod webhook_handler;

pub use dashboard_handler::*;
pub use error::*;
pub use server::*;
pub use webhook_handler::*;
