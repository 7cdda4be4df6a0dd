use crate::domain::{
    AlertChannel, AlertRecipient, AlertRule, AlertRuleRepository, CooldownClaim, DomainError,
    DomainResult, UpsertAlertRuleInput,
};
use crate::postgres::PostgresClient;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::types::Json;
use tokio_postgres::Row;
use tracing::{debug, instrument};

const RULE_COLUMNS: &str = "rule_id, canonical_id, channel, min_threshold, max_threshold, enabled, cooldown_seconds, last_alert_sent_at, total_alerts_sent, recipients";

/// Alert rule row for PostgreSQL storage; recipients live in a JSONB column
#[derive(Debug, Clone)]
pub struct AlertRuleRow {
    pub rule_id: String,
    pub canonical_id: String,
    pub channel: Option<String>,
    pub min_threshold: f64,
    pub max_threshold: f64,
    pub enabled: bool,
    pub cooldown_seconds: i64,
    pub last_alert_sent_at: Option<DateTime<Utc>>,
    pub total_alerts_sent: i64,
    pub recipients: Vec<AlertRecipient>,
}

impl From<&Row> for AlertRuleRow {
    fn from(row: &Row) -> Self {
        let Json(recipients): Json<Vec<AlertRecipient>> = row.get(9);
        AlertRuleRow {
            rule_id: row.get(0),
            canonical_id: row.get(1),
            channel: row.get(2),
            min_threshold: row.get(3),
            max_threshold: row.get(4),
            enabled: row.get(5),
            cooldown_seconds: row.get(6),
            last_alert_sent_at: row.get(7),
            total_alerts_sent: row.get(8),
            recipients,
        }
    }
}

impl TryFrom<AlertRuleRow> for AlertRule {
    type Error = DomainError;

    fn try_from(row: AlertRuleRow) -> Result<Self, Self::Error> {
        Ok(AlertRule {
            channel: row.channel.as_deref().map(str::parse::<AlertChannel>).transpose()?,
            rule_id: row.rule_id,
            canonical_id: row.canonical_id,
            min_threshold: row.min_threshold,
            max_threshold: row.max_threshold,
            enabled: row.enabled,
            cooldown_seconds: row.cooldown_seconds,
            last_alert_sent_at: row.last_alert_sent_at,
            total_alerts_sent: row.total_alerts_sent,
            recipients: row.recipients,
        })
    }
}

/// PostgreSQL implementation of AlertRuleRepository
///
/// The cooldown columns are only ever written through conditional updates keyed
/// on their current value.
#[derive(Clone)]
pub struct PostgresAlertRuleRepository {
    client: PostgresClient,
}

impl PostgresAlertRuleRepository {
    pub fn new(client: PostgresClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AlertRuleRepository for PostgresAlertRuleRepository {
    #[instrument(skip(self, input), fields(canonical_id = %input.canonical_id, channel = ?input.channel))]
    async fn upsert_rule(&self, input: UpsertAlertRuleInput) -> DomainResult<AlertRule> {
        input.validate_input()?;

        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let rule_id = xid::new().to_string();
        let channel = input.channel.map(|c| c.as_str());
        let sql = format!(
            "INSERT INTO alert_rules (rule_id, canonical_id, channel, min_threshold, max_threshold, enabled, cooldown_seconds, recipients)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (canonical_id, (COALESCE(channel, ''))) DO UPDATE
             SET min_threshold = EXCLUDED.min_threshold,
                 max_threshold = EXCLUDED.max_threshold,
                 enabled = EXCLUDED.enabled,
                 cooldown_seconds = EXCLUDED.cooldown_seconds,
                 recipients = EXCLUDED.recipients,
                 updated_at = NOW()
             RETURNING {}",
            RULE_COLUMNS
        );

        let result = conn
            .query_one(
                sql.as_str(),
                &[
                    &rule_id,
                    &input.canonical_id,
                    &channel,
                    &input.min_threshold,
                    &input.max_threshold,
                    &input.enabled,
                    &input.cooldown_seconds,
                    &Json(&input.recipients),
                ],
            )
            .await;

        let row = match result {
            Ok(row) => row,
            Err(e) => {
                if let Some(db_err) = e.as_db_error() {
                    // 23503 is foreign_key_violation: the device does not exist
                    if db_err.code().code() == "23503" {
                        return Err(DomainError::DeviceNotFound(input.canonical_id));
                    }
                }
                return Err(DomainError::RepositoryError(e.into()));
            }
        };

        let rule: AlertRule = AlertRuleRow::from(&row).try_into()?;
        debug!(rule_id = %rule.rule_id, "upserted alert rule");
        Ok(rule)
    }

    #[instrument(skip(self))]
    async fn get_rule(&self, rule_id: &str) -> DomainResult<Option<AlertRule>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let sql = format!("SELECT {} FROM alert_rules WHERE rule_id = $1", RULE_COLUMNS);
        let row = conn
            .query_opt(sql.as_str(), &[&rule_id])
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        row.map(|row| AlertRuleRow::from(&row).try_into())
            .transpose()
    }

    #[instrument(skip(self))]
    async fn list_rules_for_device(&self, canonical_id: &str) -> DomainResult<Vec<AlertRule>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let sql = format!(
            "SELECT {} FROM alert_rules WHERE canonical_id = $1 ORDER BY channel NULLS FIRST",
            RULE_COLUMNS
        );
        let rows = conn
            .query(sql.as_str(), &[&canonical_id])
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        rows.iter()
            .map(|row| AlertRuleRow::from(row).try_into())
            .collect()
    }

    #[instrument(skip(self, claim), fields(rule_id = %claim.rule_id))]
    async fn try_claim_cooldown(&self, claim: CooldownClaim) -> DomainResult<bool> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let updated = conn
            .execute(
                "UPDATE alert_rules
                 SET last_alert_sent_at = $2, updated_at = NOW()
                 WHERE rule_id = $1 AND last_alert_sent_at IS NOT DISTINCT FROM $3",
                &[&claim.rule_id, &claim.claimed_at, &claim.expected],
            )
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        Ok(updated == 1)
    }

    #[instrument(skip(self))]
    async fn confirm_alert_sent(
        &self,
        rule_id: &str,
        claimed_at: DateTime<Utc>,
    ) -> DomainResult<()> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        conn.execute(
            "UPDATE alert_rules
             SET total_alerts_sent = total_alerts_sent + 1, updated_at = NOW()
             WHERE rule_id = $1 AND last_alert_sent_at = $2",
            &[&rule_id, &claimed_at],
        )
        .await
        .map_err(|e| DomainError::RepositoryError(e.into()))?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn release_cooldown_claim(
        &self,
        rule_id: &str,
        claimed_at: DateTime<Utc>,
        restore_to: Option<DateTime<Utc>>,
    ) -> DomainResult<bool> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let updated = conn
            .execute(
                "UPDATE alert_rules
                 SET last_alert_sent_at = $3, updated_at = NOW()
                 WHERE rule_id = $1 AND last_alert_sent_at = $2",
                &[&rule_id, &claimed_at, &restore_to],
            )
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        Ok(updated == 1)
    }
}
