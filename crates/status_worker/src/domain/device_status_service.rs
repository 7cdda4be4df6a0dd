use chrono::{DateTime, Duration, Utc};
use common::domain::{
    BroadcastMessage, BroadcastPublisher, DeviceIdentityRepository, DomainResult,
    HeartbeatRepository, MarkOfflineInput,
};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Event type published when a device goes quiet
pub const DEVICE_OFFLINE: &str = "DEVICE_OFFLINE";

/// Outcome of one offline sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Devices whose last heartbeat predates the cutoff
    pub silent: usize,
    pub marked_offline: usize,
}

/// Flips devices to OFFLINE once their heartbeats stop
///
/// A device is silent when its latest heartbeat is older than `offline_after`.
/// The flip is conditional in storage, so a device that reported between the
/// listing and the update stays ONLINE.
pub struct DeviceStatusService {
    identity_repository: Arc<dyn DeviceIdentityRepository>,
    heartbeat_repository: Arc<dyn HeartbeatRepository>,
    broadcaster: Arc<dyn BroadcastPublisher>,
    offline_after: Duration,
}

impl DeviceStatusService {
    pub fn new(
        identity_repository: Arc<dyn DeviceIdentityRepository>,
        heartbeat_repository: Arc<dyn HeartbeatRepository>,
        broadcaster: Arc<dyn BroadcastPublisher>,
        offline_after: Duration,
    ) -> Self {
        Self {
            identity_repository,
            heartbeat_repository,
            broadcaster,
            offline_after,
        }
    }

    #[instrument(skip(self))]
    pub async fn sweep(&self, now: DateTime<Utc>) -> DomainResult<SweepReport> {
        let silent_since = now - self.offline_after;
        let silent = self
            .heartbeat_repository
            .list_silent_devices(silent_since)
            .await?;

        let mut report = SweepReport {
            silent: silent.len(),
            marked_offline: 0,
        };

        for canonical_id in silent {
            let flipped = self
                .identity_repository
                .mark_offline(MarkOfflineInput {
                    canonical_id: canonical_id.clone(),
                    silent_since,
                })
                .await;

            match flipped {
                Ok(Some(identity)) => {
                    info!(canonical_id = %identity.canonical_id, "device marked offline");
                    self.broadcaster.publish(BroadcastMessage {
                        canonical_id: identity.canonical_id,
                        device_name: identity.name,
                        event_type: DEVICE_OFFLINE.to_string(),
                        sensor_payload: serde_json::Map::new(),
                        emitted_at: now,
                    });
                    report.marked_offline += 1;
                }
                Ok(None) => {
                    debug!(canonical_id = %canonical_id, "device reported again before sweep");
                }
                Err(e) => {
                    warn!(canonical_id = %canonical_id, error = %e, "failed to mark device offline");
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::domain::{
        DeviceIdentity, DeviceStatus, DomainError, MockBroadcastPublisher,
        MockDeviceIdentityRepository, MockHeartbeatRepository,
    };

    fn offline_identity(canonical_id: &str) -> DeviceIdentity {
        DeviceIdentity {
            canonical_id: canonical_id.to_string(),
            vendor_device_id: None,
            serial_number: Some("SN-1".to_string()),
            dev_eui: None,
            name: "Freezer".to_string(),
            model: None,
            last_status: DeviceStatus::Offline,
            last_seen_at: None,
            created_at: None,
            updated_at: None,
        }
    }

    #[tokio::test]
    async fn test_sweep_marks_silent_devices_and_broadcasts() {
        let now = Utc::now();
        let expected_cutoff = now - Duration::seconds(900);
        let mut heartbeats = MockHeartbeatRepository::new();
        let mut identities = MockDeviceIdentityRepository::new();
        let mut broadcaster = MockBroadcastPublisher::new();

        heartbeats
            .expect_list_silent_devices()
            .withf(move |cutoff| *cutoff == expected_cutoff)
            .times(1)
            .return_once(|_| Ok(vec!["dev-a".to_string(), "dev-b".to_string()]));
        identities
            .expect_mark_offline()
            .withf(|input: &MarkOfflineInput| input.canonical_id == "dev-a")
            .times(1)
            .return_once(|_| Ok(Some(offline_identity("dev-a"))));
        identities
            .expect_mark_offline()
            .withf(|input: &MarkOfflineInput| input.canonical_id == "dev-b")
            .times(1)
            .return_once(|_| Ok(None));
        broadcaster
            .expect_publish()
            .withf(|message: &BroadcastMessage| {
                message.canonical_id == "dev-a"
                    && message.event_type == DEVICE_OFFLINE
                    && message.sensor_payload.is_empty()
            })
            .times(1)
            .return_const(());

        let service = DeviceStatusService::new(
            Arc::new(identities),
            Arc::new(heartbeats),
            Arc::new(broadcaster),
            Duration::seconds(900),
        );
        let report = service.sweep(now).await.unwrap();

        assert_eq!(
            report,
            SweepReport {
                silent: 2,
                marked_offline: 1
            }
        );
    }

    #[tokio::test]
    async fn test_sweep_continues_past_failed_update() {
        let mut heartbeats = MockHeartbeatRepository::new();
        let mut identities = MockDeviceIdentityRepository::new();
        let mut broadcaster = MockBroadcastPublisher::new();

        heartbeats
            .expect_list_silent_devices()
            .return_once(|_| Ok(vec!["dev-a".to_string(), "dev-b".to_string()]));
        identities
            .expect_mark_offline()
            .withf(|input: &MarkOfflineInput| input.canonical_id == "dev-a")
            .return_once(|_| Err(DomainError::RepositoryError(anyhow::anyhow!("timeout"))));
        identities
            .expect_mark_offline()
            .withf(|input: &MarkOfflineInput| input.canonical_id == "dev-b")
            .return_once(|_| Ok(Some(offline_identity("dev-b"))));
        broadcaster.expect_publish().times(1).return_const(());

        let service = DeviceStatusService::new(
            Arc::new(identities),
            Arc::new(heartbeats),
            Arc::new(broadcaster),
            Duration::seconds(900),
        );
        let report = service.sweep(Utc::now()).await.unwrap();

        assert_eq!(report.marked_offline, 1);
    }

    #[tokio::test]
    async fn test_sweep_propagates_listing_failure() {
        let mut heartbeats = MockHeartbeatRepository::new();
        heartbeats
            .expect_list_silent_devices()
            .return_once(|_| Err(DomainError::RepositoryError(anyhow::anyhow!("pool closed"))));

        let service = DeviceStatusService::new(
            Arc::new(MockDeviceIdentityRepository::new()),
            Arc::new(heartbeats),
            Arc::new(MockBroadcastPublisher::new()),
            Duration::seconds(900),
        );

        assert!(service.sweep(Utc::now()).await.is_err());
    }
}
