use crate::domain::{AlertTrigger, Breach};
use chrono::{DateTime, SubsecRound, Utc};
use common::domain::{
    AlertRecipient, AlertRuleRepository, CooldownClaim, DomainError, DomainResult,
    NotificationSender,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// What happened to one trigger
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Sent { recipients: usize },
    /// Nobody enabled with a usable address; the cooldown was not consumed
    NoRecipients,
    /// A concurrent delivery claimed the cooldown window first
    ClaimLost,
    /// Delivery failed or timed out; the cooldown claim was released
    Failed { reason: String },
}

/// Enabled recipients with a valid address, de-duplicated case-insensitively
///
/// The first spelling of an address is the one kept.
pub fn resolve_recipients(recipients: &[AlertRecipient]) -> Vec<String> {
    let mut resolved: Vec<String> = Vec::new();
    for recipient in recipients.iter().filter(|r| r.enabled) {
        let candidate = AlertRecipient {
            email: recipient.email.trim().to_string(),
            enabled: true,
        };
        if common::garde::validate_struct(&candidate).is_err() {
            debug!(email = %recipient.email, "skipping recipient with invalid address");
            continue;
        }
        if !resolved
            .iter()
            .any(|known| known.eq_ignore_ascii_case(&candidate.email))
        {
            resolved.push(candidate.email);
        }
    }
    resolved
}

/// Sends alert notifications under the cooldown claim protocol
///
/// 1. Resolve recipients; none means stop without touching the rule.
/// 2. Claim the cooldown window with a conditional write against the value the
///    evaluation read.
/// 3. Send, bounded by `timeout`.
/// 4. Confirm the claim on success, release it on failure so the next
///    qualifying reading retries.
pub struct NotificationDispatcher {
    repository: Arc<dyn AlertRuleRepository>,
    sender: Arc<dyn NotificationSender>,
    timeout: Duration,
}

impl NotificationDispatcher {
    pub fn new(
        repository: Arc<dyn AlertRuleRepository>,
        sender: Arc<dyn NotificationSender>,
        timeout: Duration,
    ) -> Self {
        Self {
            repository,
            sender,
            timeout,
        }
    }

    #[instrument(
        skip(self, trigger, device_name),
        fields(rule_id = %trigger.rule.rule_id, canonical_id = %trigger.rule.canonical_id, channel = trigger.rule.channel_label())
    )]
    pub async fn dispatch(
        &self,
        trigger: &AlertTrigger,
        device_name: &str,
        now: DateTime<Utc>,
    ) -> DomainResult<DispatchOutcome> {
        let recipients = resolve_recipients(&trigger.rule.recipients);
        if recipients.is_empty() {
            info!("alert triggered but no enabled recipients; cooldown left untouched");
            return Ok(DispatchOutcome::NoRecipients);
        }

        // Postgres keeps microseconds; the claim must compare equal after a round trip
        let claimed_at = now.trunc_subsecs(6);
        let previous = trigger.rule.last_alert_sent_at;

        let claimed = self
            .repository
            .try_claim_cooldown(CooldownClaim {
                rule_id: trigger.rule.rule_id.clone(),
                expected: previous,
                claimed_at,
            })
            .await?;
        if !claimed {
            debug!("cooldown already claimed by a concurrent delivery");
            return Ok(DispatchOutcome::ClaimLost);
        }

        let (subject, body) = compose_message(trigger, device_name, now);
        let delivery = tokio::time::timeout(
            self.timeout,
            self.sender.send(&recipients, &subject, &body),
        )
        .await
        .unwrap_or_else(|_| Err(DomainError::NotificationTimeout(self.timeout.as_secs())));

        match delivery {
            Ok(()) => {
                // The mail is out; only the counter update is lost
                if let Err(e) = self
                    .repository
                    .confirm_alert_sent(&trigger.rule.rule_id, claimed_at)
                    .await
                {
                    warn!(error = %e, "alert sent but delivery count not recorded");
                }
                info!(recipients = recipients.len(), "alert notification sent");
                Ok(DispatchOutcome::Sent {
                    recipients: recipients.len(),
                })
            }
            Err(e) => {
                warn!(error = %e, "alert notification failed; releasing cooldown claim");
                let released = self
                    .repository
                    .release_cooldown_claim(&trigger.rule.rule_id, claimed_at, previous)
                    .await?;
                if !released {
                    debug!("cooldown claim was replaced before it could be released");
                }
                Ok(DispatchOutcome::Failed {
                    reason: e.to_string(),
                })
            }
        }
    }
}

fn compose_message(trigger: &AlertTrigger, device_name: &str, now: DateTime<Utc>) -> (String, String) {
    let rule = &trigger.rule;
    let location = match rule.channel {
        Some(channel) => format!("{} {}", device_name, channel),
        None => device_name.to_string(),
    };
    let direction = match trigger.breach {
        Breach::BelowMin => "below minimum",
        Breach::AboveMax => "above maximum",
    };

    let subject = format!(
        "Temperature alert: {} at {:.1}°C",
        location, trigger.value
    );
    let body = format!(
        "Device: {}\nChannel: {}\nTemperature: {:.1}°C ({} threshold)\nAllowed range: {:.1}°C to {:.1}°C\nTime: {}\n",
        device_name,
        rule.channel_label(),
        trigger.value,
        direction,
        rule.min_threshold,
        rule.max_threshold,
        now.to_rfc3339(),
    );
    (subject, body)
}
