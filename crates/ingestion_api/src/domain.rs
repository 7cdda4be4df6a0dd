mod alert_evaluator;
mod device_event;
mod device_identity_resolver;
mod event_normalizer;
mod heartbeat_recorder;
mod notification_dispatcher;
mod telemetry_recorder;
mod webhook_authenticator;
mod webhook_ingestion_service;

pub use alert_evaluator::*;
pub use device_event::*;
pub use device_identity_resolver::*;
pub use event_normalizer::*;
pub use heartbeat_recorder::*;
pub use notification_dispatcher::*;
pub use telemetry_recorder::*;
pub use webhook_authenticator::*;
pub use webhook_ingestion_service::*;
