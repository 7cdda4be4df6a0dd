use crate::domain::DeviceEvent;
use chrono::{DateTime, Utc};
use common::domain::{AlertRule, AlertRuleRepository, DomainResult};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Which side of the configured band a reading fell on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Breach {
    BelowMin,
    AboveMax,
}

/// A breach whose cooldown has elapsed and may be notified
#[derive(Debug, Clone, PartialEq)]
pub struct AlertTrigger {
    pub rule: AlertRule,
    pub value: f64,
    pub breach: Breach,
}

/// Result of evaluating one rule against one reading
#[derive(Debug, Clone, PartialEq)]
pub enum RuleEvaluation {
    Disabled,
    /// The reading carries no value for the rule's channel
    NoValue,
    InRange,
    CoolingDown { last_alert_sent_at: DateTime<Utc> },
    Triggered(AlertTrigger),
}

/// Decide whether `value` breaches `rule` and whether its cooldown has elapsed
///
/// Pure: the only state consulted is the rule's `last_alert_sent_at`. A breach
/// exactly `cooldown_seconds` after the last alert triggers again.
pub fn evaluate_rule(rule: &AlertRule, value: Option<f64>, now: DateTime<Utc>) -> RuleEvaluation {
    if !rule.enabled {
        return RuleEvaluation::Disabled;
    }
    let Some(value) = value else {
        return RuleEvaluation::NoValue;
    };

    let breach = if value < rule.min_threshold {
        Breach::BelowMin
    } else if value > rule.max_threshold {
        Breach::AboveMax
    } else {
        return RuleEvaluation::InRange;
    };

    if let Some(last_alert_sent_at) = rule.last_alert_sent_at {
        if (now - last_alert_sent_at).num_seconds() < rule.cooldown_seconds {
            return RuleEvaluation::CoolingDown { last_alert_sent_at };
        }
    }

    RuleEvaluation::Triggered(AlertTrigger {
        rule: rule.clone(),
        value,
        breach,
    })
}

/// Evaluates every rule configured for a device against one event
///
/// Channels are independent: each rule reads only its own channel's value.
pub struct AlertEvaluator {
    repository: Arc<dyn AlertRuleRepository>,
}

impl AlertEvaluator {
    pub fn new(repository: Arc<dyn AlertRuleRepository>) -> Self {
        Self { repository }
    }

    #[instrument(skip(self, event))]
    pub async fn evaluate(
        &self,
        canonical_id: &str,
        event: &DeviceEvent,
        now: DateTime<Utc>,
    ) -> DomainResult<Vec<RuleEvaluation>> {
        let rules = self.repository.list_rules_for_device(canonical_id).await?;

        let evaluations = rules
            .iter()
            .map(|rule| {
                let evaluation =
                    evaluate_rule(rule, event.channel_temperature(rule.channel), now);
                debug!(
                    rule_id = %rule.rule_id,
                    channel = rule.channel_label(),
                    ?evaluation,
                    "evaluated alert rule"
                );
                evaluation
            })
            .collect();

        Ok(evaluations)
    }
}
