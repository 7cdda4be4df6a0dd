use crate::domain::result::{DomainError, DomainResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Independently alertable probe on a dual-sensor device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertChannel {
    #[serde(rename = "CH1")]
    Ch1,
    #[serde(rename = "CH2")]
    Ch2,
}

impl AlertChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertChannel::Ch1 => "CH1",
            AlertChannel::Ch2 => "CH2",
        }
    }

    /// Payload keys carrying this channel's temperature, highest priority first
    pub fn temperature_fields(&self) -> &'static [&'static str] {
        match self {
            AlertChannel::Ch1 => &["temperature_left", "temperature_chn1", "temperature_1"],
            AlertChannel::Ch2 => &["temperature_right", "temperature_chn2", "temperature_2"],
        }
    }
}

impl fmt::Display for AlertChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertChannel {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CH1" => Ok(AlertChannel::Ch1),
            "CH2" => Ok(AlertChannel::Ch2),
            other => Err(DomainError::ValidationError(format!(
                "unknown alert channel: {}",
                other
            ))),
        }
    }
}

/// Someone who may receive alerts for a rule; can be muted individually
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct AlertRecipient {
    #[garde(email)]
    pub email: String,
    #[garde(skip)]
    pub enabled: bool,
}

/// Threshold rule for one `(device, channel)` pair
///
/// `channel = None` is the rule of a single-sensor device. `last_alert_sent_at`
/// and `total_alerts_sent` are only written by the notification path.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertRule {
    pub rule_id: String,
    pub canonical_id: String,
    pub channel: Option<AlertChannel>,
    pub min_threshold: f64,
    pub max_threshold: f64,
    pub enabled: bool,
    pub cooldown_seconds: i64,
    pub last_alert_sent_at: Option<DateTime<Utc>>,
    pub total_alerts_sent: i64,
    pub recipients: Vec<AlertRecipient>,
}

impl AlertRule {
    pub fn channel_label(&self) -> &'static str {
        self.channel.map(|c| c.as_str()).unwrap_or("SINGLE")
    }
}

/// Create or replace the configuration of the rule for `(canonical_id, channel)`
///
/// Alert bookkeeping (`last_alert_sent_at`, `total_alerts_sent`) of an existing
/// rule is preserved.
#[derive(Debug, Clone, PartialEq, Validate)]
#[garde(allow_unvalidated)]
pub struct UpsertAlertRuleInput {
    #[garde(length(min = 1))]
    pub canonical_id: String,
    pub channel: Option<AlertChannel>,
    #[garde(custom(finite_threshold))]
    pub min_threshold: f64,
    #[garde(custom(finite_threshold))]
    pub max_threshold: f64,
    pub enabled: bool,
    #[garde(range(min = 0))]
    pub cooldown_seconds: i64,
    #[garde(dive)]
    pub recipients: Vec<AlertRecipient>,
}

fn finite_threshold(value: &f64, _ctx: &()) -> garde::Result {
    if value.is_finite() {
        Ok(())
    } else {
        Err(garde::Error::new("threshold must be a finite number"))
    }
}

impl UpsertAlertRuleInput {
    pub fn validate_input(&self) -> DomainResult<()> {
        crate::garde::validate_struct(self)?;
        if self.min_threshold > self.max_threshold {
            return Err(DomainError::ValidationError(format!(
                "min_threshold {} is above max_threshold {}",
                self.min_threshold, self.max_threshold
            )));
        }
        Ok(())
    }
}

/// Conditional write that reserves the cooldown window for one alert
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CooldownClaim {
    pub rule_id: String,
    /// `last_alert_sent_at` as read when the breach was evaluated
    pub expected: Option<DateTime<Utc>>,
    pub claimed_at: DateTime<Utc>,
}

/// Storage collaborator for alert rules
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait AlertRuleRepository: Send + Sync {
    async fn upsert_rule(&self, input: UpsertAlertRuleInput) -> DomainResult<AlertRule>;

    async fn get_rule(&self, rule_id: &str) -> DomainResult<Option<AlertRule>>;

    async fn list_rules_for_device(&self, canonical_id: &str) -> DomainResult<Vec<AlertRule>>;

    /// Set `last_alert_sent_at = claimed_at` only if it still equals `expected`.
    /// Returns false when another writer got there first.
    async fn try_claim_cooldown(&self, claim: CooldownClaim) -> DomainResult<bool>;

    /// Count a delivered alert for a claim that is still in place
    async fn confirm_alert_sent(
        &self,
        rule_id: &str,
        claimed_at: DateTime<Utc>,
    ) -> DomainResult<()>;

    /// Undo a claim after failed delivery, restoring `restore_to` if the claim is
    /// still in place. Returns false if the claim had already been replaced.
    async fn release_cooldown_claim(
        &self,
        rule_id: &str,
        claimed_at: DateTime<Utc>,
        restore_to: Option<DateTime<Utc>>,
    ) -> DomainResult<bool>;
}
