use crate::domain::{
    DomainError, DomainResult, WebhookActivity, WebhookConfig, WebhookConfigRepository,
};
use crate::postgres::PostgresClient;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

/// Single-row `webhook_settings` storage
#[derive(Clone)]
pub struct PostgresWebhookConfigRepository {
    client: PostgresClient,
}

impl PostgresWebhookConfigRepository {
    pub fn new(client: PostgresClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WebhookConfigRepository for PostgresWebhookConfigRepository {
    #[instrument(skip(self))]
    async fn get_webhook_config(&self) -> DomainResult<Option<WebhookConfig>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let row = conn
            .query_opt(
                "SELECT enabled, verification_token, webhook_secret, webhook_uuid
                 FROM webhook_settings WHERE id = 1",
                &[],
            )
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        Ok(row.map(|row| WebhookConfig {
            enabled: row.get(0),
            verification_token: row.get(1),
            webhook_secret: row.get(2),
            webhook_uuid: row.get(3),
        }))
    }

    #[instrument(skip(self, config), fields(enabled = config.enabled))]
    async fn save_webhook_config(&self, config: WebhookConfig) -> DomainResult<()> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        conn.execute(
            "INSERT INTO webhook_settings (id, enabled, verification_token, webhook_secret, webhook_uuid, updated_at)
             VALUES (1, $1, $2, $3, $4, NOW())
             ON CONFLICT (id) DO UPDATE
             SET enabled = EXCLUDED.enabled,
                 verification_token = EXCLUDED.verification_token,
                 webhook_secret = EXCLUDED.webhook_secret,
                 webhook_uuid = EXCLUDED.webhook_uuid,
                 updated_at = EXCLUDED.updated_at",
            &[
                &config.enabled,
                &config.verification_token,
                &config.webhook_secret,
                &config.webhook_uuid,
            ],
        )
        .await
        .map_err(|e| DomainError::RepositoryError(e.into()))?;

        debug!("saved webhook settings");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_last_activity(&self) -> DomainResult<Option<WebhookActivity>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let row = conn
            .query_opt(
                "SELECT last_received_at, last_events_received, last_events_processed
                 FROM webhook_settings
                 WHERE id = 1 AND last_received_at IS NOT NULL",
                &[],
            )
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        Ok(row.map(|row| {
            let received_at: DateTime<Utc> = row.get(0);
            let events_received: Option<i32> = row.get(1);
            let events_processed: Option<i32> = row.get(2);
            WebhookActivity {
                received_at,
                events_received: events_received.and_then(|v| u32::try_from(v).ok()).unwrap_or(0),
                events_processed: events_processed
                    .and_then(|v| u32::try_from(v).ok())
                    .unwrap_or(0),
            }
        }))
    }

    #[instrument(skip(self, activity), fields(events_processed = activity.events_processed))]
    async fn record_webhook_activity(&self, activity: WebhookActivity) -> DomainResult<()> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let events_received = i32::try_from(activity.events_received).unwrap_or(i32::MAX);
        let events_processed = i32::try_from(activity.events_processed).unwrap_or(i32::MAX);

        conn.execute(
            "INSERT INTO webhook_settings (id, last_received_at, last_events_received, last_events_processed)
             VALUES (1, $1, $2, $3)
             ON CONFLICT (id) DO UPDATE
             SET last_received_at = EXCLUDED.last_received_at,
                 last_events_received = EXCLUDED.last_events_received,
                 last_events_processed = EXCLUDED.last_events_processed",
            &[&activity.received_at, &events_received, &events_processed],
        )
        .await
        .map_err(|e| DomainError::RepositoryError(e.into()))?;

        Ok(())
    }
}
