mod http_mail_sender;
mod log_notification_sender;

pub use http_mail_sender::*;
pub use log_notification_sender::*;
