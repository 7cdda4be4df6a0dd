use crate::repositories::Repositories;
use anyhow::Context;
use common::domain::{
    AlertChannel, AlertRecipient, CreateDeviceIdentityRepoInput, DeviceIdentity,
    ProvisionDeviceInput, UpsertAlertRuleInput, WebhookConfig,
};
use serde::Deserialize;
use tracing::info;

/// Startup provisioning document
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedFile {
    #[serde(default)]
    pub webhook: Option<SeedWebhook>,
    #[serde(default)]
    pub devices: Vec<SeedDevice>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedWebhook {
    pub enabled: bool,
    pub verification_token: Option<String>,
    pub webhook_secret: Option<String>,
    pub webhook_uuid: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedDevice {
    pub name: String,
    pub model: Option<String>,
    pub serial_number: Option<String>,
    pub dev_eui: Option<String>,
    pub vendor_device_id: Option<String>,
    #[serde(default)]
    pub rules: Vec<SeedRule>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedRule {
    pub channel: Option<AlertChannel>,
    pub min_threshold: f64,
    pub max_threshold: f64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: i64,
    #[serde(default)]
    pub recipients: Vec<AlertRecipient>,
}

fn default_enabled() -> bool {
    true
}

fn default_cooldown_seconds() -> i64 {
    300
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub devices_created: usize,
    pub devices_existing: usize,
    pub rules_upserted: usize,
}

pub async fn apply_seed_file(path: &str, repositories: &Repositories) -> anyhow::Result<SeedReport> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read seed file {}", path))?;
    let seed: SeedFile =
        serde_json::from_str(&raw).with_context(|| format!("invalid seed file {}", path))?;

    let report = apply_seed(seed, repositories).await?;
    info!(
        path,
        devices_created = report.devices_created,
        devices_existing = report.devices_existing,
        rules_upserted = report.rules_upserted,
        "applied seed file"
    );
    Ok(report)
}

/// Provision devices and rules; devices already reachable by any key are reused
pub async fn apply_seed(seed: SeedFile, repositories: &Repositories) -> anyhow::Result<SeedReport> {
    let mut report = SeedReport::default();

    if let Some(webhook) = seed.webhook {
        repositories
            .webhook
            .save_webhook_config(WebhookConfig {
                enabled: webhook.enabled,
                verification_token: webhook.verification_token,
                webhook_secret: webhook.webhook_secret,
                webhook_uuid: webhook.webhook_uuid,
            })
            .await?;
    }

    for device in seed.devices {
        let identity = match find_existing(&device, repositories).await? {
            Some(identity) => {
                report.devices_existing += 1;
                identity
            }
            None => {
                let input = CreateDeviceIdentityRepoInput::from_provision(ProvisionDeviceInput {
                    name: device.name.clone(),
                    model: device.model.clone(),
                    serial_number: device.serial_number.clone(),
                    dev_eui: device.dev_eui.clone(),
                    vendor_device_id: device.vendor_device_id.clone(),
                })?;
                report.devices_created += 1;
                repositories.identities.create_identity(input).await?
            }
        };

        for rule in device.rules {
            repositories
                .rules
                .upsert_rule(UpsertAlertRuleInput {
                    canonical_id: identity.canonical_id.clone(),
                    channel: rule.channel,
                    min_threshold: rule.min_threshold,
                    max_threshold: rule.max_threshold,
                    enabled: rule.enabled,
                    cooldown_seconds: rule.cooldown_seconds,
                    recipients: rule.recipients,
                })
                .await?;
            report.rules_upserted += 1;
        }
    }

    Ok(report)
}

async fn find_existing(
    device: &SeedDevice,
    repositories: &Repositories,
) -> anyhow::Result<Option<DeviceIdentity>> {
    if let Some(serial_number) = &device.serial_number {
        if let Some(identity) = repositories.identities.find_by_serial_number(serial_number).await? {
            return Ok(Some(identity));
        }
    }
    if let Some(dev_eui) = &device.dev_eui {
        if let Some(identity) = repositories.identities.find_by_dev_eui(dev_eui).await? {
            return Ok(Some(identity));
        }
    }
    if let Some(vendor_device_id) = &device.vendor_device_id {
        if let Some(identity) = repositories
            .identities
            .find_by_vendor_device_id(vendor_device_id)
            .await?
        {
            return Ok(Some(identity));
        }
    }
    Ok(None)
}
