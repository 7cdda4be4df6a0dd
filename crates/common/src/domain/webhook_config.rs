use crate::domain::result::DomainResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Stored webhook settings, read once per inbound request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub verification_token: Option<String>,
    pub webhook_secret: Option<String>,
    pub webhook_uuid: Option<String>,
}

/// Summary of the last batch that processed at least one event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookActivity {
    pub received_at: DateTime<Utc>,
    pub events_received: u32,
    pub events_processed: u32,
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait WebhookConfigRepository: Send + Sync {
    /// `None` when the webhook was never configured
    async fn get_webhook_config(&self) -> DomainResult<Option<WebhookConfig>>;

    async fn save_webhook_config(&self, config: WebhookConfig) -> DomainResult<()>;

    async fn get_last_activity(&self) -> DomainResult<Option<WebhookActivity>>;

    async fn record_webhook_activity(&self, activity: WebhookActivity) -> DomainResult<()>;
}
