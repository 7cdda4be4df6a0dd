use crate::domain::{
    AlertRecipient, AlertRule, AlertRuleRepository, CooldownClaim, CreateDeviceIdentityRepoInput,
    DeviceIdentity, DeviceIdentityRepository, DeviceStatus, DomainError, DomainResult, Heartbeat,
    HeartbeatRepository, MarkOfflineInput, MergeDeviceIdentitiesInput, MergeReport,
    RefreshDeviceIdentityInput, SensorReading, SensorReadingRepository, UpsertAlertRuleInput,
    WebhookActivity, WebhookConfig, WebhookConfigRepository,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Clone, Default)]
struct StoreState {
    identities: HashMap<String, DeviceIdentity>,
    readings: Vec<SensorReading>,
    rules: HashMap<String, AlertRule>,
    heartbeats: HashMap<String, Heartbeat>,
    webhook_config: Option<WebhookConfig>,
    last_activity: Option<WebhookActivity>,
}

impl StoreState {
    fn find_identity<F>(&self, predicate: F) -> Option<DeviceIdentity>
    where
        F: Fn(&DeviceIdentity) -> bool,
    {
        self.identities.values().find(|i| predicate(i)).cloned()
    }

    /// Reject a key already held by a different identity
    fn ensure_keys_free(
        &self,
        canonical_id: &str,
        serial_number: Option<&str>,
        dev_eui: Option<&str>,
        vendor_device_id: Option<&str>,
    ) -> DomainResult<()> {
        let clash = self.identities.values().find(|other| {
            other.canonical_id != canonical_id
                && ((serial_number.is_some() && other.serial_number.as_deref() == serial_number)
                    || (dev_eui.is_some() && other.dev_eui.as_deref() == dev_eui)
                    || (vendor_device_id.is_some()
                        && other.vendor_device_id.as_deref() == vendor_device_id))
        });

        match clash {
            Some(other) => Err(DomainError::DeviceIdentityAlreadyExists(format!(
                "lookup key already held by {}",
                other.canonical_id
            ))),
            None => Ok(()),
        }
    }
}

/// Single-process store implementing every storage trait
///
/// One mutex guards the whole state, so each trait call is atomic with respect
/// to every other call. Selected with `storage_backend = memory`.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_webhook_config(config: WebhookConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState {
                webhook_config: Some(config),
                ..StoreState::default()
            })),
        }
    }

    pub async fn identity_count(&self) -> usize {
        self.state.lock().await.identities.len()
    }

    pub async fn reading_count(&self) -> usize {
        self.state.lock().await.readings.len()
    }
}

#[async_trait]
impl DeviceIdentityRepository for InMemoryStore {
    async fn create_identity(
        &self,
        input: CreateDeviceIdentityRepoInput,
    ) -> DomainResult<DeviceIdentity> {
        let mut state = self.state.lock().await;

        if state.identities.contains_key(&input.canonical_id) {
            return Err(DomainError::DeviceIdentityAlreadyExists(input.canonical_id));
        }
        state.ensure_keys_free(
            &input.canonical_id,
            input.serial_number.as_deref(),
            input.dev_eui.as_deref(),
            input.vendor_device_id.as_deref(),
        )?;

        let now = Utc::now();
        let identity = DeviceIdentity {
            canonical_id: input.canonical_id.clone(),
            vendor_device_id: input.vendor_device_id,
            serial_number: input.serial_number,
            dev_eui: input.dev_eui,
            name: input.name,
            model: input.model,
            last_status: DeviceStatus::Offline,
            last_seen_at: None,
            created_at: Some(now),
            updated_at: Some(now),
        };
        state
            .identities
            .insert(input.canonical_id, identity.clone());

        Ok(identity)
    }

    async fn get_identity(&self, canonical_id: &str) -> DomainResult<Option<DeviceIdentity>> {
        Ok(self.state.lock().await.identities.get(canonical_id).cloned())
    }

    async fn find_by_serial_number(
        &self,
        serial_number: &str,
    ) -> DomainResult<Option<DeviceIdentity>> {
        let state = self.state.lock().await;
        Ok(state.find_identity(|i| i.serial_number.as_deref() == Some(serial_number)))
    }

    async fn find_by_dev_eui(&self, dev_eui: &str) -> DomainResult<Option<DeviceIdentity>> {
        let state = self.state.lock().await;
        Ok(state.find_identity(|i| i.dev_eui.as_deref() == Some(dev_eui)))
    }

    async fn find_by_vendor_device_id(
        &self,
        vendor_device_id: &str,
    ) -> DomainResult<Option<DeviceIdentity>> {
        let state = self.state.lock().await;
        Ok(state.find_identity(|i| i.vendor_device_id.as_deref() == Some(vendor_device_id)))
    }

    async fn merge_identities(
        &self,
        input: MergeDeviceIdentitiesInput,
    ) -> DomainResult<MergeReport> {
        let mut state = self.state.lock().await;

        if !state.identities.contains_key(&input.winner_id) {
            return Err(DomainError::DeviceNotFound(input.winner_id));
        }

        // Applied to a copy and committed once every stale id is folded
        let mut next = state.clone();
        let mut report = MergeReport::default();

        for release in input
            .key_releases
            .iter()
            .filter(|r| r.holder_id != input.winner_id && !input.stale_ids.contains(&r.holder_id))
        {
            let Some(holder) = next.identities.get_mut(&release.holder_id) else {
                continue;
            };
            if release.dev_eui {
                holder.dev_eui = None;
            }
            if release.vendor_device_id {
                holder.vendor_device_id = None;
            }
            holder.updated_at = Some(Utc::now());
            report.keys_released += 1;
        }

        for stale_id in input.stale_ids.iter().filter(|id| **id != input.winner_id) {
            let Some(stale) = next.identities.remove(stale_id) else {
                continue;
            };

            for reading in next
                .readings
                .iter_mut()
                .filter(|r| &r.canonical_id == stale_id)
            {
                reading.canonical_id = input.winner_id.clone();
                report.readings_moved += 1;
            }

            let stale_rule_ids: Vec<String> = next
                .rules
                .values()
                .filter(|r| &r.canonical_id == stale_id)
                .map(|r| r.rule_id.clone())
                .collect();
            for rule_id in stale_rule_ids {
                let Some(mut stale_rule) = next.rules.remove(&rule_id) else {
                    continue;
                };
                let winner_rule = next.rules.values_mut().find(|r| {
                    r.canonical_id == input.winner_id && r.channel == stale_rule.channel
                });
                match winner_rule {
                    Some(existing) => {
                        merge_recipients(&mut existing.recipients, stale_rule.recipients);
                        report.rules_merged += 1;
                    }
                    None => {
                        stale_rule.canonical_id = input.winner_id.clone();
                        next.rules.insert(rule_id, stale_rule);
                        report.rules_moved += 1;
                    }
                }
            }

            if let Some(mut heartbeat) = next.heartbeats.remove(stale_id) {
                let newer = next
                    .heartbeats
                    .get(&input.winner_id)
                    .map(|h| heartbeat.observed_at > h.observed_at)
                    .unwrap_or(true);
                if newer {
                    heartbeat.canonical_id = input.winner_id.clone();
                    next.heartbeats.insert(input.winner_id.clone(), heartbeat);
                }
            }

            if let Some(winner) = next.identities.get_mut(&input.winner_id) {
                winner.serial_number = winner.serial_number.take().or(stale.serial_number);
                winner.dev_eui = winner.dev_eui.take().or(stale.dev_eui);
                winner.vendor_device_id = winner.vendor_device_id.take().or(stale.vendor_device_id);
                winner.updated_at = Some(Utc::now());
            }
            report.identities_removed += 1;
        }

        *state = next;
        debug!(winner_id = %input.winner_id, ?report, "merged device identities");
        Ok(report)
    }

    async fn refresh_identity(
        &self,
        input: RefreshDeviceIdentityInput,
    ) -> DomainResult<DeviceIdentity> {
        let mut state = self.state.lock().await;

        state.ensure_keys_free(
            &input.canonical_id,
            input.serial_number.as_deref(),
            input.dev_eui.as_deref(),
            input.vendor_device_id.as_deref(),
        )?;

        let identity = state
            .identities
            .get_mut(&input.canonical_id)
            .ok_or_else(|| DomainError::DeviceNotFound(input.canonical_id.clone()))?;

        if let Some(name) = input.name {
            identity.name = name;
        }
        if input.model.is_some() {
            identity.model = input.model;
        }
        if input.serial_number.is_some() {
            identity.serial_number = input.serial_number;
        }
        if input.dev_eui.is_some() {
            identity.dev_eui = input.dev_eui;
        }
        if input.vendor_device_id.is_some() {
            identity.vendor_device_id = input.vendor_device_id;
        }
        identity.last_status = DeviceStatus::Online;
        identity.last_seen_at = Some(input.seen_at);
        identity.updated_at = Some(Utc::now());

        Ok(identity.clone())
    }

    async fn mark_offline(&self, input: MarkOfflineInput) -> DomainResult<Option<DeviceIdentity>> {
        let mut state = self.state.lock().await;

        let Some(identity) = state.identities.get_mut(&input.canonical_id) else {
            return Ok(None);
        };
        let silent = identity
            .last_seen_at
            .map(|seen| seen < input.silent_since)
            .unwrap_or(true);
        if identity.last_status != DeviceStatus::Online || !silent {
            return Ok(None);
        }

        identity.last_status = DeviceStatus::Offline;
        identity.updated_at = Some(Utc::now());
        Ok(Some(identity.clone()))
    }
}

/// Append recipients whose address (case-insensitive) the target lacks
pub(crate) fn merge_recipients(target: &mut Vec<AlertRecipient>, incoming: Vec<AlertRecipient>) {
    for recipient in incoming {
        let known = target
            .iter()
            .any(|r| r.email.eq_ignore_ascii_case(&recipient.email));
        if !known {
            target.push(recipient);
        }
    }
}

#[async_trait]
impl SensorReadingRepository for InMemoryStore {
    async fn append_reading(&self, reading: &SensorReading) -> DomainResult<()> {
        self.state.lock().await.readings.push(reading.clone());
        Ok(())
    }

    async fn list_readings(&self, canonical_id: &str) -> DomainResult<Vec<SensorReading>> {
        let state = self.state.lock().await;
        let mut readings: Vec<SensorReading> = state
            .readings
            .iter()
            .filter(|r| r.canonical_id == canonical_id)
            .cloned()
            .collect();
        readings.sort_by_key(|r| r.occurred_at);
        Ok(readings)
    }
}

#[async_trait]
impl AlertRuleRepository for InMemoryStore {
    async fn upsert_rule(&self, input: UpsertAlertRuleInput) -> DomainResult<AlertRule> {
        input.validate_input()?;
        let mut state = self.state.lock().await;

        if !state.identities.contains_key(&input.canonical_id) {
            return Err(DomainError::DeviceNotFound(input.canonical_id));
        }

        let existing = state
            .rules
            .values()
            .find(|r| r.canonical_id == input.canonical_id && r.channel == input.channel)
            .cloned();

        let rule = AlertRule {
            rule_id: existing
                .as_ref()
                .map(|r| r.rule_id.clone())
                .unwrap_or_else(|| xid::new().to_string()),
            canonical_id: input.canonical_id,
            channel: input.channel,
            min_threshold: input.min_threshold,
            max_threshold: input.max_threshold,
            enabled: input.enabled,
            cooldown_seconds: input.cooldown_seconds,
            last_alert_sent_at: existing.as_ref().and_then(|r| r.last_alert_sent_at),
            total_alerts_sent: existing.as_ref().map(|r| r.total_alerts_sent).unwrap_or(0),
            recipients: input.recipients,
        };
        state.rules.insert(rule.rule_id.clone(), rule.clone());

        Ok(rule)
    }

    async fn get_rule(&self, rule_id: &str) -> DomainResult<Option<AlertRule>> {
        Ok(self.state.lock().await.rules.get(rule_id).cloned())
    }

    async fn list_rules_for_device(&self, canonical_id: &str) -> DomainResult<Vec<AlertRule>> {
        let state = self.state.lock().await;
        let mut rules: Vec<AlertRule> = state
            .rules
            .values()
            .filter(|r| r.canonical_id == canonical_id)
            .cloned()
            .collect();
        rules.sort_by_key(|r| r.channel.map(|c| c.as_str()));
        Ok(rules)
    }

    async fn try_claim_cooldown(&self, claim: CooldownClaim) -> DomainResult<bool> {
        let mut state = self.state.lock().await;
        let rule = state
            .rules
            .get_mut(&claim.rule_id)
            .ok_or_else(|| DomainError::AlertRuleNotFound(claim.rule_id.clone()))?;

        if rule.last_alert_sent_at != claim.expected {
            return Ok(false);
        }
        rule.last_alert_sent_at = Some(claim.claimed_at);
        Ok(true)
    }

    async fn confirm_alert_sent(
        &self,
        rule_id: &str,
        claimed_at: DateTime<Utc>,
    ) -> DomainResult<()> {
        let mut state = self.state.lock().await;
        let rule = state
            .rules
            .get_mut(rule_id)
            .ok_or_else(|| DomainError::AlertRuleNotFound(rule_id.to_string()))?;

        if rule.last_alert_sent_at == Some(claimed_at) {
            rule.total_alerts_sent += 1;
        }
        Ok(())
    }

    async fn release_cooldown_claim(
        &self,
        rule_id: &str,
        claimed_at: DateTime<Utc>,
        restore_to: Option<DateTime<Utc>>,
    ) -> DomainResult<bool> {
        let mut state = self.state.lock().await;
        let rule = state
            .rules
            .get_mut(rule_id)
            .ok_or_else(|| DomainError::AlertRuleNotFound(rule_id.to_string()))?;

        if rule.last_alert_sent_at != Some(claimed_at) {
            return Ok(false);
        }
        rule.last_alert_sent_at = restore_to;
        Ok(true)
    }
}

#[async_trait]
impl HeartbeatRepository for InMemoryStore {
    async fn record_heartbeat(&self, heartbeat: &Heartbeat) -> DomainResult<()> {
        let mut state = self.state.lock().await;
        let newer = state
            .heartbeats
            .get(&heartbeat.canonical_id)
            .map(|h| heartbeat.observed_at >= h.observed_at)
            .unwrap_or(true);
        if newer {
            state
                .heartbeats
                .insert(heartbeat.canonical_id.clone(), heartbeat.clone());
        }
        Ok(())
    }

    async fn get_heartbeat(&self, canonical_id: &str) -> DomainResult<Option<Heartbeat>> {
        Ok(self.state.lock().await.heartbeats.get(canonical_id).cloned())
    }

    async fn list_silent_devices(&self, silent_since: DateTime<Utc>) -> DomainResult<Vec<String>> {
        let state = self.state.lock().await;
        let mut silent: Vec<String> = state
            .heartbeats
            .values()
            .filter(|h| h.observed_at < silent_since)
            .filter(|h| {
                state
                    .identities
                    .get(&h.canonical_id)
                    .map(|i| i.last_status == DeviceStatus::Online)
                    .unwrap_or(false)
            })
            .map(|h| h.canonical_id.clone())
            .collect();
        silent.sort();
        Ok(silent)
    }
}

#[async_trait]
impl WebhookConfigRepository for InMemoryStore {
    async fn get_webhook_config(&self) -> DomainResult<Option<WebhookConfig>> {
        Ok(self.state.lock().await.webhook_config.clone())
    }

    async fn save_webhook_config(&self, config: WebhookConfig) -> DomainResult<()> {
        self.state.lock().await.webhook_config = Some(config);
        Ok(())
    }

    async fn get_last_activity(&self) -> DomainResult<Option<WebhookActivity>> {
        Ok(self.state.lock().await.last_activity.clone())
    }

    async fn record_webhook_activity(&self, activity: WebhookActivity) -> DomainResult<()> {
        self.state.lock().await.last_activity = Some(activity);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AlertChannel, KeyRelease};
    use chrono::Duration;

    async fn provision(store: &InMemoryStore, id: &str, serial: Option<&str>, vendor: Option<&str>) {
        store
            .create_identity(CreateDeviceIdentityRepoInput {
                canonical_id: id.to_string(),
                name: format!("device {}", id),
                model: None,
                serial_number: serial.map(str::to_string),
                dev_eui: None,
                vendor_device_id: vendor.map(str::to_string),
            })
            .await
            .unwrap();
    }

    fn rule_input(canonical_id: &str, channel: Option<AlertChannel>, email: &str) -> UpsertAlertRuleInput {
        UpsertAlertRuleInput {
            canonical_id: canonical_id.to_string(),
            channel,
            min_threshold: 0.0,
            max_threshold: 30.0,
            enabled: true,
            cooldown_seconds: 300,
            recipients: vec![AlertRecipient {
                email: email.to_string(),
                enabled: true,
            }],
        }
    }

    fn reading(canonical_id: &str) -> SensorReading {
        SensorReading {
            canonical_id: canonical_id.to_string(),
            event_id: None,
            occurred_at: Utc::now(),
            captured_at: Utc::now(),
            raw_payload: serde_json::Map::new(),
            derived_temperature: Some(4.0),
            derived_humidity: None,
            derived_battery: None,
        }
    }

    #[tokio::test]
    async fn test_create_identity_rejects_duplicate_serial() {
        let store = InMemoryStore::new();
        provision(&store, "a", Some("SN-1"), None).await;

        let result = store
            .create_identity(CreateDeviceIdentityRepoInput {
                canonical_id: "b".to_string(),
                name: "dup".to_string(),
                model: None,
                serial_number: Some("SN-1".to_string()),
                dev_eui: None,
                vendor_device_id: None,
            })
            .await;

        assert!(matches!(
            result,
            Err(DomainError::DeviceIdentityAlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_merge_moves_readings_and_rules() {
        let store = InMemoryStore::new();
        provision(&store, "winner", Some("SN-1"), None).await;
        provision(&store, "stale", None, Some("1001")).await;
        store.append_reading(&reading("stale")).await.unwrap();
        store
            .upsert_rule(rule_input("stale", Some(AlertChannel::Ch1), "a@example.com"))
            .await
            .unwrap();

        let report = store
            .merge_identities(MergeDeviceIdentitiesInput {
                winner_id: "winner".to_string(),
                stale_ids: vec!["stale".to_string()],
                key_releases: Vec::new(),
            })
            .await
            .unwrap();

        assert_eq!(report.readings_moved, 1);
        assert_eq!(report.rules_moved, 1);
        assert_eq!(store.identity_count().await, 1);
        assert_eq!(store.list_readings("winner").await.unwrap().len(), 1);
        assert_eq!(store.list_rules_for_device("winner").await.unwrap().len(), 1);
        let winner = store.get_identity("winner").await.unwrap().unwrap();
        assert_eq!(winner.vendor_device_id.as_deref(), Some("1001"));
    }

    #[tokio::test]
    async fn test_merge_folds_conflicting_rule_recipients() {
        let store = InMemoryStore::new();
        provision(&store, "winner", Some("SN-1"), None).await;
        provision(&store, "stale", None, Some("1001")).await;
        store
            .upsert_rule(rule_input("winner", None, "a@example.com"))
            .await
            .unwrap();
        store
            .upsert_rule(rule_input("stale", None, "b@example.com"))
            .await
            .unwrap();

        let report = store
            .merge_identities(MergeDeviceIdentitiesInput {
                winner_id: "winner".to_string(),
                stale_ids: vec!["stale".to_string()],
                key_releases: Vec::new(),
            })
            .await
            .unwrap();

        assert_eq!(report.rules_merged, 1);
        let rules = store.list_rules_for_device("winner").await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].recipients.len(), 2);
    }

    #[tokio::test]
    async fn test_key_release_keeps_holder_and_its_history() {
        let store = InMemoryStore::new();
        provision(&store, "winner", Some("SN-A"), None).await;
        provision(&store, "holder", Some("SN-B"), Some("1001")).await;
        store.append_reading(&reading("holder")).await.unwrap();

        let report = store
            .merge_identities(MergeDeviceIdentitiesInput {
                winner_id: "winner".to_string(),
                stale_ids: Vec::new(),
                key_releases: vec![KeyRelease {
                    holder_id: "holder".to_string(),
                    dev_eui: false,
                    vendor_device_id: true,
                }],
            })
            .await
            .unwrap();

        assert_eq!(report.keys_released, 1);
        assert_eq!(report.identities_removed, 0);
        assert_eq!(store.identity_count().await, 2);
        let holder = store.get_identity("holder").await.unwrap().unwrap();
        assert_eq!(holder.serial_number.as_deref(), Some("SN-B"));
        assert_eq!(holder.vendor_device_id, None);
        assert_eq!(store.list_readings("holder").await.unwrap().len(), 1);
        assert!(store.find_by_vendor_device_id("1001").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cooldown_claim_is_conditional() {
        let store = InMemoryStore::new();
        provision(&store, "dev", Some("SN-1"), None).await;
        let rule = store
            .upsert_rule(rule_input("dev", None, "a@example.com"))
            .await
            .unwrap();
        let now = Utc::now();

        let first = store
            .try_claim_cooldown(CooldownClaim {
                rule_id: rule.rule_id.clone(),
                expected: None,
                claimed_at: now,
            })
            .await
            .unwrap();
        let second = store
            .try_claim_cooldown(CooldownClaim {
                rule_id: rule.rule_id.clone(),
                expected: None,
                claimed_at: now + Duration::seconds(1),
            })
            .await
            .unwrap();

        assert!(first);
        assert!(!second);
    }

    #[tokio::test]
    async fn test_release_restores_previous_value() {
        let store = InMemoryStore::new();
        provision(&store, "dev", Some("SN-1"), None).await;
        let rule = store
            .upsert_rule(rule_input("dev", None, "a@example.com"))
            .await
            .unwrap();
        let now = Utc::now();

        store
            .try_claim_cooldown(CooldownClaim {
                rule_id: rule.rule_id.clone(),
                expected: None,
                claimed_at: now,
            })
            .await
            .unwrap();
        let released = store
            .release_cooldown_claim(&rule.rule_id, now, None)
            .await
            .unwrap();

        assert!(released);
        let rule = store.get_rule(&rule.rule_id).await.unwrap().unwrap();
        assert_eq!(rule.last_alert_sent_at, None);
        assert_eq!(rule.total_alerts_sent, 0);
    }

    #[tokio::test]
    async fn test_mark_offline_only_flips_silent_online_devices() {
        let store = InMemoryStore::new();
        provision(&store, "dev", Some("SN-1"), None).await;
        let seen_at = Utc::now() - Duration::minutes(30);
        store
            .refresh_identity(RefreshDeviceIdentityInput {
                canonical_id: "dev".to_string(),
                name: None,
                model: None,
                serial_number: None,
                dev_eui: None,
                vendor_device_id: None,
                seen_at,
            })
            .await
            .unwrap();

        let not_yet = store
            .mark_offline(MarkOfflineInput {
                canonical_id: "dev".to_string(),
                silent_since: seen_at - Duration::minutes(1),
            })
            .await
            .unwrap();
        let flipped = store
            .mark_offline(MarkOfflineInput {
                canonical_id: "dev".to_string(),
                silent_since: Utc::now(),
            })
            .await
            .unwrap();

        assert!(not_yet.is_none());
        assert_eq!(flipped.unwrap().last_status, DeviceStatus::Offline);
    }
}
