mod alert_rule_repository;
mod client;
mod config;
mod device_identity_repository;
mod heartbeat_repository;
mod sensor_reading_repository;
mod webhook_config_repository;

pub use alert_rule_repository::*;
pub use client::*;
pub use config::*;
pub use device_identity_repository::*;
pub use heartbeat_repository::*;
pub use sensor_reading_repository::*;
pub use webhook_config_repository::*;
