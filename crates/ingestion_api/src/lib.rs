pub mod broadcast;
pub mod domain;
pub mod http;
pub mod ingestion_api;
pub mod mail;

pub use broadcast::*;
pub use domain::*;
pub use http::*;
pub use ingestion_api::*;
pub use mail::*;
