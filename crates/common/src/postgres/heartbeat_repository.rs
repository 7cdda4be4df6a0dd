use crate::domain::{
    DeviceStatus, DomainError, DomainResult, Heartbeat, HeartbeatRepository, HeartbeatSource,
};
use crate::postgres::PostgresClient;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::instrument;

/// Latest-wins PostgreSQL implementation of HeartbeatRepository
#[derive(Clone)]
pub struct PostgresHeartbeatRepository {
    client: PostgresClient,
}

impl PostgresHeartbeatRepository {
    pub fn new(client: PostgresClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HeartbeatRepository for PostgresHeartbeatRepository {
    #[instrument(skip(self, heartbeat), fields(canonical_id = %heartbeat.canonical_id))]
    async fn record_heartbeat(&self, heartbeat: &Heartbeat) -> DomainResult<()> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        conn.execute(
            "INSERT INTO device_heartbeats (canonical_id, observed_at, source)
             VALUES ($1, $2, $3)
             ON CONFLICT (canonical_id) DO UPDATE
             SET observed_at = EXCLUDED.observed_at, source = EXCLUDED.source
             WHERE device_heartbeats.observed_at <= EXCLUDED.observed_at",
            &[
                &heartbeat.canonical_id,
                &heartbeat.observed_at,
                &heartbeat.source.as_str(),
            ],
        )
        .await
        .map_err(|e| DomainError::RepositoryError(e.into()))?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_heartbeat(&self, canonical_id: &str) -> DomainResult<Option<Heartbeat>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let row = conn
            .query_opt(
                "SELECT canonical_id, observed_at FROM device_heartbeats WHERE canonical_id = $1",
                &[&canonical_id],
            )
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        // webhook is the only source written today
        Ok(row.map(|row| Heartbeat {
            canonical_id: row.get(0),
            observed_at: row.get(1),
            source: HeartbeatSource::Webhook,
        }))
    }

    #[instrument(skip(self))]
    async fn list_silent_devices(&self, silent_since: DateTime<Utc>) -> DomainResult<Vec<String>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let rows = conn
            .query(
                "SELECT h.canonical_id
                 FROM device_heartbeats h
                 INNER JOIN device_identities d ON d.canonical_id = h.canonical_id
                 WHERE h.observed_at < $1 AND d.last_status = $2
                 ORDER BY h.canonical_id",
                &[&silent_since, &DeviceStatus::Online.as_str()],
            )
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        Ok(rows.iter().map(|row| row.get(0)).collect())
    }
}
