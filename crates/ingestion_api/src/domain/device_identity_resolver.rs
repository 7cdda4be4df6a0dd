use crate::domain::DeviceProfile;
use chrono::{DateTime, Utc};
use common::domain::{
    DeviceIdentity, DeviceIdentityRepository, DomainError, DomainResult, KeyRelease,
    MergeDeviceIdentitiesInput, RefreshDeviceIdentityInput,
};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Maps an event's device profile onto a provisioned canonical identity
///
/// Lookup order is serial number, then devEUI, then the vendor's deviceId. The
/// first hit wins. Another identity reached through the remaining keys is a
/// stale duplicate of the same physical device only when its own serial number
/// and devEUI agree with the winner's (or are unset); it is then merged into the
/// winner. An identity that disagrees is a different device whose key was
/// reassigned: it keeps its history and only loses the contested keys. Both
/// happen in one atomic storage call. Devices nobody provisioned are never
/// created here.
pub struct DeviceIdentityResolver {
    repository: Arc<dyn DeviceIdentityRepository>,
}

/// An identity found through the profile, with the secondary keys that reached it
struct Candidate {
    identity: DeviceIdentity,
    by_dev_eui: bool,
    by_vendor_device_id: bool,
}

impl Candidate {
    /// Unset keys never disagree
    fn same_device(&self, serial_number: Option<&str>, dev_eui: Option<&str>) -> bool {
        let agrees = |own: Option<&str>, winner: Option<&str>| match (own, winner) {
            (Some(own), Some(winner)) => own == winner,
            _ => true,
        };
        agrees(self.identity.serial_number.as_deref(), serial_number)
            && agrees(self.identity.dev_eui.as_deref(), dev_eui)
    }
}

impl DeviceIdentityResolver {
    pub fn new(repository: Arc<dyn DeviceIdentityRepository>) -> Self {
        Self { repository }
    }

    #[instrument(skip(self, profile), fields(device = %profile.describe()))]
    pub async fn resolve(
        &self,
        profile: &DeviceProfile,
        seen_at: DateTime<Utc>,
    ) -> DomainResult<DeviceIdentity> {
        let mut candidates = self.find_candidates(profile).await?.into_iter();

        let Some(winner) = candidates.next().map(|c| c.identity) else {
            return Err(DomainError::DeviceNotFound(profile.describe()));
        };

        let winner_serial = winner
            .serial_number
            .as_deref()
            .or(profile.serial_number.as_deref());
        let winner_dev_eui = winner.dev_eui.as_deref().or(profile.dev_eui.as_deref());

        let mut stale_ids = Vec::new();
        let mut key_releases = Vec::new();
        for candidate in candidates {
            if candidate.same_device(winner_serial, winner_dev_eui) {
                stale_ids.push(candidate.identity.canonical_id);
            } else {
                warn!(
                    winner_id = %winner.canonical_id,
                    holder_id = %candidate.identity.canonical_id,
                    "lookup key reassigned away from another device"
                );
                key_releases.push(KeyRelease {
                    holder_id: candidate.identity.canonical_id,
                    dev_eui: candidate.by_dev_eui,
                    vendor_device_id: candidate.by_vendor_device_id,
                });
            }
        }

        if !stale_ids.is_empty() || !key_releases.is_empty() {
            let report = self
                .repository
                .merge_identities(MergeDeviceIdentitiesInput {
                    winner_id: winner.canonical_id.clone(),
                    stale_ids: stale_ids.clone(),
                    key_releases,
                })
                .await?;

            info!(
                winner_id = %winner.canonical_id,
                stale_ids = ?stale_ids,
                readings_moved = report.readings_moved,
                rules_moved = report.rules_moved,
                rules_merged = report.rules_merged,
                keys_released = report.keys_released,
                "reconciled device identities"
            );
        }

        let identity = self
            .repository
            .refresh_identity(RefreshDeviceIdentityInput {
                canonical_id: winner.canonical_id.clone(),
                name: profile.name.clone(),
                model: profile.model.clone(),
                serial_number: profile.serial_number.clone(),
                dev_eui: profile.dev_eui.clone(),
                vendor_device_id: profile.vendor_device_id.clone(),
                seen_at,
            })
            .await?;

        debug!(canonical_id = %identity.canonical_id, "resolved device identity");
        Ok(identity)
    }

    /// Distinct identities reachable through the profile's keys, in priority order
    async fn find_candidates(&self, profile: &DeviceProfile) -> DomainResult<Vec<Candidate>> {
        let mut candidates: Vec<Candidate> = Vec::new();

        if let Some(serial_number) = &profile.serial_number {
            if let Some(identity) = self.repository.find_by_serial_number(serial_number).await? {
                push_candidate(&mut candidates, identity, false, false);
            }
        }
        if let Some(dev_eui) = &profile.dev_eui {
            if let Some(identity) = self.repository.find_by_dev_eui(dev_eui).await? {
                push_candidate(&mut candidates, identity, true, false);
            }
        }
        if let Some(vendor_device_id) = &profile.vendor_device_id {
            if let Some(identity) = self
                .repository
                .find_by_vendor_device_id(vendor_device_id)
                .await?
            {
                push_candidate(&mut candidates, identity, false, true);
            }
        }

        Ok(candidates)
    }
}

fn push_candidate(
    candidates: &mut Vec<Candidate>,
    identity: DeviceIdentity,
    by_dev_eui: bool,
    by_vendor_device_id: bool,
) {
    match candidates
        .iter_mut()
        .find(|c| c.identity.canonical_id == identity.canonical_id)
    {
        Some(existing) => {
            existing.by_dev_eui |= by_dev_eui;
            existing.by_vendor_device_id |= by_vendor_device_id;
        }
        None => candidates.push(Candidate {
            identity,
            by_dev_eui,
            by_vendor_device_id,
        }),
    }
}
