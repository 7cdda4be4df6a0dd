use crate::domain::result::{DomainError, DomainResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Connectivity status last observed for a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceStatus {
    Online,
    Offline,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Online => "ONLINE",
            DeviceStatus::Offline => "OFFLINE",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ONLINE" => Ok(DeviceStatus::Online),
            "OFFLINE" => Ok(DeviceStatus::Offline),
            other => Err(DomainError::ValidationError(format!(
                "unknown device status: {}",
                other
            ))),
        }
    }
}

/// Canonical device record owned by this system
///
/// `canonical_id` is the stable key every reading, rule and heartbeat is filed
/// under. The vendor's `vendor_device_id` can be reassigned upstream, so it is
/// only used as a last-resort lookup key.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceIdentity {
    pub canonical_id: String,
    pub vendor_device_id: Option<String>,
    pub serial_number: Option<String>,
    pub dev_eui: Option<String>,
    pub name: String,
    pub model: Option<String>,
    pub last_status: DeviceStatus,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// External input for provisioning a device (no canonical id yet)
#[derive(Debug, Clone, PartialEq, Validate)]
pub struct ProvisionDeviceInput {
    #[garde(length(min = 1, max = 255))]
    pub name: String,
    #[garde(length(min = 1))]
    pub model: Option<String>,
    #[garde(length(min = 1))]
    pub serial_number: Option<String>,
    #[garde(length(min = 1))]
    pub dev_eui: Option<String>,
    #[garde(length(min = 1))]
    pub vendor_device_id: Option<String>,
}

/// Internal input with generated canonical id
#[derive(Debug, Clone, PartialEq)]
pub struct CreateDeviceIdentityRepoInput {
    pub canonical_id: String,
    pub name: String,
    pub model: Option<String>,
    pub serial_number: Option<String>,
    pub dev_eui: Option<String>,
    pub vendor_device_id: Option<String>,
}

impl CreateDeviceIdentityRepoInput {
    /// Validate a provisioning request and assign it a fresh canonical id
    pub fn from_provision(input: ProvisionDeviceInput) -> DomainResult<Self> {
        crate::garde::validate_struct(&input)?;

        if input.serial_number.is_none()
            && input.dev_eui.is_none()
            && input.vendor_device_id.is_none()
        {
            return Err(DomainError::ValidationError(
                "a device needs at least one of serial_number, dev_eui or vendor_device_id"
                    .to_string(),
            ));
        }

        Ok(Self {
            canonical_id: xid::new().to_string(),
            name: input.name,
            model: input.model,
            serial_number: input.serial_number,
            dev_eui: input.dev_eui,
            vendor_device_id: input.vendor_device_id,
        })
    }
}

/// Fields refreshed from every accepted event
///
/// `None` keeps the stored value; the event only ever adds or replaces keys.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshDeviceIdentityInput {
    pub canonical_id: String,
    pub name: Option<String>,
    pub model: Option<String>,
    pub serial_number: Option<String>,
    pub dev_eui: Option<String>,
    pub vendor_device_id: Option<String>,
    pub seen_at: DateTime<Utc>,
}

/// Fold `stale_ids` into `winner_id` and strip reassigned keys from other devices
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeDeviceIdentitiesInput {
    pub winner_id: String,
    pub stale_ids: Vec<String>,
    pub key_releases: Vec<KeyRelease>,
}

/// Lookup keys a distinct device still holds that now identify the winner
///
/// The holder keeps its identity and history; only the flagged keys are cleared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRelease {
    pub holder_id: String,
    pub dev_eui: bool,
    pub vendor_device_id: bool,
}

/// Row counts moved by an identity merge
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub readings_moved: u64,
    pub rules_moved: u64,
    pub rules_merged: u64,
    pub identities_removed: u64,
    pub keys_released: u64,
}

/// Input for flipping a silent device to offline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkOfflineInput {
    pub canonical_id: String,
    /// Only flip if the device has not been seen since this instant
    pub silent_since: DateTime<Utc>,
}

/// Storage collaborator for canonical device identities
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait DeviceIdentityRepository: Send + Sync {
    /// Provision a new identity; fails if any lookup key is already taken
    async fn create_identity(
        &self,
        input: CreateDeviceIdentityRepoInput,
    ) -> DomainResult<DeviceIdentity>;

    async fn get_identity(&self, canonical_id: &str) -> DomainResult<Option<DeviceIdentity>>;

    async fn find_by_serial_number(
        &self,
        serial_number: &str,
    ) -> DomainResult<Option<DeviceIdentity>>;

    async fn find_by_dev_eui(&self, dev_eui: &str) -> DomainResult<Option<DeviceIdentity>>;

    async fn find_by_vendor_device_id(
        &self,
        vendor_device_id: &str,
    ) -> DomainResult<Option<DeviceIdentity>>;

    /// Re-key every reading, rule and heartbeat of the stale identities onto the
    /// winner, delete the stale identities and clear released keys from their
    /// holders. All-or-nothing.
    async fn merge_identities(&self, input: MergeDeviceIdentitiesInput)
        -> DomainResult<MergeReport>;

    /// Refresh mutable fields and mark the device ONLINE
    async fn refresh_identity(
        &self,
        input: RefreshDeviceIdentityInput,
    ) -> DomainResult<DeviceIdentity>;

    /// Set OFFLINE if still ONLINE and silent; returns the updated identity when it flipped
    async fn mark_offline(&self, input: MarkOfflineInput) -> DomainResult<Option<DeviceIdentity>>;
}
