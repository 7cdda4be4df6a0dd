mod alert_rule;
mod broadcast;
mod device_identity;
mod heartbeat;
mod notification;
mod result;
mod sensor_reading;
mod webhook_config;

pub use alert_rule::*;
pub use broadcast::*;
pub use device_identity::*;
pub use heartbeat::*;
pub use notification::*;
pub use result::*;
pub use sensor_reading::*;
pub use webhook_config::*;
