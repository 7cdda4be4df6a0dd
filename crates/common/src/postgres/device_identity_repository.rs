use crate::domain::{
    AlertRecipient, CreateDeviceIdentityRepoInput, DeviceIdentity, DeviceIdentityRepository,
    DeviceStatus, DomainError, DomainResult, KeyRelease, MarkOfflineInput, MergeDeviceIdentitiesInput,
    MergeReport, RefreshDeviceIdentityInput,
};
use crate::memory::merge_recipients;
use crate::postgres::PostgresClient;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::types::Json;
use tokio_postgres::Row;
use tracing::{debug, instrument};

const IDENTITY_COLUMNS: &str = "canonical_id, vendor_device_id, serial_number, dev_eui, name, model, last_status, last_seen_at, created_at, updated_at";

/// Device identity row for PostgreSQL storage
#[derive(Debug, Clone)]
pub struct DeviceIdentityRow {
    pub canonical_id: String,
    pub vendor_device_id: Option<String>,
    pub serial_number: Option<String>,
    pub dev_eui: Option<String>,
    pub name: String,
    pub model: Option<String>,
    pub last_status: String,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Row> for DeviceIdentityRow {
    fn from(row: &Row) -> Self {
        DeviceIdentityRow {
            canonical_id: row.get(0),
            vendor_device_id: row.get(1),
            serial_number: row.get(2),
            dev_eui: row.get(3),
            name: row.get(4),
            model: row.get(5),
            last_status: row.get(6),
            last_seen_at: row.get(7),
            created_at: row.get(8),
            updated_at: row.get(9),
        }
    }
}

impl TryFrom<DeviceIdentityRow> for DeviceIdentity {
    type Error = DomainError;

    fn try_from(row: DeviceIdentityRow) -> Result<Self, Self::Error> {
        Ok(DeviceIdentity {
            last_status: row.last_status.parse()?,
            canonical_id: row.canonical_id,
            vendor_device_id: row.vendor_device_id,
            serial_number: row.serial_number,
            dev_eui: row.dev_eui,
            name: row.name,
            model: row.model,
            last_seen_at: row.last_seen_at,
            created_at: Some(row.created_at),
            updated_at: Some(row.updated_at),
        })
    }
}

fn map_unique_violation(e: tokio_postgres::Error, key: &str) -> DomainError {
    if let Some(db_err) = e.as_db_error() {
        // 23505 is unique_violation
        if db_err.code().code() == "23505" {
            return DomainError::DeviceIdentityAlreadyExists(key.to_string());
        }
    }
    DomainError::RepositoryError(e.into())
}

/// PostgreSQL implementation of DeviceIdentityRepository
#[derive(Clone)]
pub struct PostgresDeviceIdentityRepository {
    client: PostgresClient,
}

impl PostgresDeviceIdentityRepository {
    pub fn new(client: PostgresClient) -> Self {
        Self { client }
    }

    async fn find_one(&self, column: &str, value: &str) -> DomainResult<Option<DeviceIdentity>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let sql = format!(
            "SELECT {} FROM device_identities WHERE {} = $1",
            IDENTITY_COLUMNS, column
        );
        let row = conn
            .query_opt(sql.as_str(), &[&value])
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        row.map(|row| DeviceIdentityRow::from(&row).try_into())
            .transpose()
    }
}

#[async_trait]
impl DeviceIdentityRepository for PostgresDeviceIdentityRepository {
    #[instrument(skip(self, input), fields(canonical_id = %input.canonical_id))]
    async fn create_identity(
        &self,
        input: CreateDeviceIdentityRepoInput,
    ) -> DomainResult<DeviceIdentity> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let now = Utc::now();
        conn.execute(
            "INSERT INTO device_identities (canonical_id, vendor_device_id, serial_number, dev_eui, name, model, last_status, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            &[
                &input.canonical_id,
                &input.vendor_device_id,
                &input.serial_number,
                &input.dev_eui,
                &input.name,
                &input.model,
                &DeviceStatus::Offline.as_str(),
                &now,
                &now,
            ],
        )
        .await
        .map_err(|e| map_unique_violation(e, &input.canonical_id))?;

        debug!("provisioned device identity: {}", input.canonical_id);

        Ok(DeviceIdentity {
            canonical_id: input.canonical_id,
            vendor_device_id: input.vendor_device_id,
            serial_number: input.serial_number,
            dev_eui: input.dev_eui,
            name: input.name,
            model: input.model,
            last_status: DeviceStatus::Offline,
            last_seen_at: None,
            created_at: Some(now),
            updated_at: Some(now),
        })
    }

    #[instrument(skip(self))]
    async fn get_identity(&self, canonical_id: &str) -> DomainResult<Option<DeviceIdentity>> {
        self.find_one("canonical_id", canonical_id).await
    }

    #[instrument(skip(self))]
    async fn find_by_serial_number(
        &self,
        serial_number: &str,
    ) -> DomainResult<Option<DeviceIdentity>> {
        self.find_one("serial_number", serial_number).await
    }

    #[instrument(skip(self))]
    async fn find_by_dev_eui(&self, dev_eui: &str) -> DomainResult<Option<DeviceIdentity>> {
        self.find_one("dev_eui", dev_eui).await
    }

    #[instrument(skip(self))]
    async fn find_by_vendor_device_id(
        &self,
        vendor_device_id: &str,
    ) -> DomainResult<Option<DeviceIdentity>> {
        self.find_one("vendor_device_id", vendor_device_id).await
    }

    #[instrument(skip(self, input), fields(winner_id = %input.winner_id, stale_count = input.stale_ids.len()))]
    async fn merge_identities(
        &self,
        input: MergeDeviceIdentitiesInput,
    ) -> DomainResult<MergeReport> {
        let mut conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let tx = conn
            .transaction()
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        let stale_ids: Vec<String> = input
            .stale_ids
            .iter()
            .filter(|id| **id != input.winner_id)
            .cloned()
            .collect();
        let releases: Vec<&KeyRelease> = input
            .key_releases
            .iter()
            .filter(|r| r.holder_id != input.winner_id && !stale_ids.contains(&r.holder_id))
            .collect();

        let mut ids = stale_ids.clone();
        ids.extend(releases.iter().map(|r| r.holder_id.clone()));
        ids.push(input.winner_id.clone());

        // Lock in a stable order so concurrent merges cannot deadlock
        let locked = tx
            .query(
                "SELECT canonical_id, serial_number, dev_eui, vendor_device_id
                 FROM device_identities
                 WHERE canonical_id = ANY($1)
                 ORDER BY canonical_id
                 FOR UPDATE",
                &[&ids],
            )
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        if !locked
            .iter()
            .any(|row| row.get::<_, String>(0) == input.winner_id)
        {
            return Err(DomainError::DeviceNotFound(input.winner_id));
        }

        let mut report = MergeReport::default();

        // Released first so the winner can take the keys over on refresh
        for release in releases {
            report.keys_released += tx
                .execute(
                    "UPDATE device_identities
                     SET dev_eui = CASE WHEN $2 THEN NULL ELSE dev_eui END,
                         vendor_device_id = CASE WHEN $3 THEN NULL ELSE vendor_device_id END,
                         updated_at = NOW()
                     WHERE canonical_id = $1",
                    &[&release.holder_id, &release.dev_eui, &release.vendor_device_id],
                )
                .await
                .map_err(|e| DomainError::RepositoryError(e.into()))?;
        }

        for row in locked
            .iter()
            .filter(|row| stale_ids.contains(&row.get::<_, String>(0)))
        {
            let stale_id: String = row.get(0);
            let serial_number: Option<String> = row.get(1);
            let dev_eui: Option<String> = row.get(2);
            let vendor_device_id: Option<String> = row.get(3);

            report.readings_moved += tx
                .execute(
                    "UPDATE sensor_readings SET canonical_id = $1 WHERE canonical_id = $2",
                    &[&input.winner_id, &stale_id],
                )
                .await
                .map_err(|e| DomainError::RepositoryError(e.into()))?;

            let stale_rules = tx
                .query(
                    "SELECT rule_id, channel, recipients FROM alert_rules WHERE canonical_id = $1 FOR UPDATE",
                    &[&stale_id],
                )
                .await
                .map_err(|e| DomainError::RepositoryError(e.into()))?;

            for rule in stale_rules.iter() {
                let rule_id: String = rule.get(0);
                let channel: Option<String> = rule.get(1);
                let Json(stale_recipients): Json<Vec<AlertRecipient>> = rule.get(2);

                let winner_rule = tx
                    .query_opt(
                        "SELECT rule_id, recipients FROM alert_rules
                         WHERE canonical_id = $1 AND channel IS NOT DISTINCT FROM $2
                         FOR UPDATE",
                        &[&input.winner_id, &channel],
                    )
                    .await
                    .map_err(|e| DomainError::RepositoryError(e.into()))?;

                match winner_rule {
                    Some(existing) => {
                        let existing_id: String = existing.get(0);
                        let Json(mut recipients): Json<Vec<AlertRecipient>> = existing.get(1);
                        merge_recipients(&mut recipients, stale_recipients);

                        tx.execute(
                            "UPDATE alert_rules SET recipients = $2, updated_at = NOW() WHERE rule_id = $1",
                            &[&existing_id, &Json(&recipients)],
                        )
                        .await
                        .map_err(|e| DomainError::RepositoryError(e.into()))?;
                        tx.execute("DELETE FROM alert_rules WHERE rule_id = $1", &[&rule_id])
                            .await
                            .map_err(|e| DomainError::RepositoryError(e.into()))?;
                        report.rules_merged += 1;
                    }
                    None => {
                        tx.execute(
                            "UPDATE alert_rules SET canonical_id = $1, updated_at = NOW() WHERE rule_id = $2",
                            &[&input.winner_id, &rule_id],
                        )
                        .await
                        .map_err(|e| DomainError::RepositoryError(e.into()))?;
                        report.rules_moved += 1;
                    }
                }
            }

            tx.execute(
                "INSERT INTO device_heartbeats (canonical_id, observed_at, source)
                 SELECT $1, observed_at, source FROM device_heartbeats WHERE canonical_id = $2
                 ON CONFLICT (canonical_id) DO UPDATE
                 SET observed_at = EXCLUDED.observed_at, source = EXCLUDED.source
                 WHERE device_heartbeats.observed_at < EXCLUDED.observed_at",
                &[&input.winner_id, &stale_id],
            )
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

            // Heartbeats cascade with the identity
            tx.execute(
                "DELETE FROM device_identities WHERE canonical_id = $1",
                &[&stale_id],
            )
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

            tx.execute(
                "UPDATE device_identities
                 SET serial_number = COALESCE(serial_number, $2),
                     dev_eui = COALESCE(dev_eui, $3),
                     vendor_device_id = COALESCE(vendor_device_id, $4),
                     updated_at = NOW()
                 WHERE canonical_id = $1",
                &[&input.winner_id, &serial_number, &dev_eui, &vendor_device_id],
            )
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

            report.identities_removed += 1;
        }

        tx.commit()
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        debug!(?report, "merged device identities");
        Ok(report)
    }

    #[instrument(skip(self, input), fields(canonical_id = %input.canonical_id))]
    async fn refresh_identity(
        &self,
        input: RefreshDeviceIdentityInput,
    ) -> DomainResult<DeviceIdentity> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let sql = format!(
            "UPDATE device_identities
             SET name = COALESCE($2, name),
                 model = COALESCE($3, model),
                 serial_number = COALESCE($4, serial_number),
                 dev_eui = COALESCE($5, dev_eui),
                 vendor_device_id = COALESCE($6, vendor_device_id),
                 last_status = $7,
                 last_seen_at = $8,
                 updated_at = NOW()
             WHERE canonical_id = $1
             RETURNING {}",
            IDENTITY_COLUMNS
        );
        let row = conn
            .query_opt(
                sql.as_str(),
                &[
                    &input.canonical_id,
                    &input.name,
                    &input.model,
                    &input.serial_number,
                    &input.dev_eui,
                    &input.vendor_device_id,
                    &DeviceStatus::Online.as_str(),
                    &input.seen_at,
                ],
            )
            .await
            .map_err(|e| map_unique_violation(e, &input.canonical_id))?;

        match row {
            Some(row) => DeviceIdentityRow::from(&row).try_into(),
            None => Err(DomainError::DeviceNotFound(input.canonical_id)),
        }
    }

    #[instrument(skip(self, input), fields(canonical_id = %input.canonical_id))]
    async fn mark_offline(&self, input: MarkOfflineInput) -> DomainResult<Option<DeviceIdentity>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let sql = format!(
            "UPDATE device_identities
             SET last_status = $2, updated_at = NOW()
             WHERE canonical_id = $1
               AND last_status = $3
               AND (last_seen_at IS NULL OR last_seen_at < $4)
             RETURNING {}",
            IDENTITY_COLUMNS
        );
        let row = conn
            .query_opt(
                sql.as_str(),
                &[
                    &input.canonical_id,
                    &DeviceStatus::Offline.as_str(),
                    &DeviceStatus::Online.as_str(),
                    &input.silent_since,
                ],
            )
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        row.map(|row| DeviceIdentityRow::from(&row).try_into())
            .transpose()
    }
}
