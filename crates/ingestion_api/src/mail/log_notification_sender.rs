use async_trait::async_trait;
use common::domain::{DomainResult, NotificationSender};
use tracing::info;

/// Writes alerts to the log instead of mailing them
///
/// Used when no mail relay is configured.
#[derive(Debug, Default, Clone)]
pub struct LogNotificationSender;

#[async_trait]
impl NotificationSender for LogNotificationSender {
    async fn send(&self, recipients: &[String], subject: &str, body: &str) -> DomainResult<()> {
        info!(?recipients, subject, body, "alert notification (log only)");
        Ok(())
    }
}
