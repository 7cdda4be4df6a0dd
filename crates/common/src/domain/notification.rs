use crate::domain::result::DomainResult;
use async_trait::async_trait;

/// Outbound notification transport (e-mail)
///
/// Returns `Ok(())` only once the transport confirmed acceptance.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, recipients: &[String], subject: &str, body: &str) -> DomainResult<()>;
}
