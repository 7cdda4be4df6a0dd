use chrono::{DateTime, Utc};
use common::domain::{DomainResult, Heartbeat, HeartbeatRepository, HeartbeatSource};
use std::sync::Arc;
use tracing::instrument;

/// Records a webhook liveness signal for every resolved device
pub struct HeartbeatRecorder {
    repository: Arc<dyn HeartbeatRepository>,
}

impl HeartbeatRecorder {
    pub fn new(repository: Arc<dyn HeartbeatRepository>) -> Self {
        Self { repository }
    }

    #[instrument(skip(self))]
    pub async fn record(&self, canonical_id: &str, observed_at: DateTime<Utc>) -> DomainResult<()> {
        self.repository
            .record_heartbeat(&Heartbeat {
                canonical_id: canonical_id.to_string(),
                observed_at,
                source: HeartbeatSource::Webhook,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::domain::MockHeartbeatRepository;

    #[tokio::test]
    async fn test_record_writes_webhook_heartbeat() {
        let observed_at = Utc::now();
        let mut repo = MockHeartbeatRepository::new();
        repo.expect_record_heartbeat()
            .withf(move |heartbeat: &Heartbeat| {
                heartbeat.canonical_id == "dev-a"
                    && heartbeat.observed_at == observed_at
                    && heartbeat.source == HeartbeatSource::Webhook
            })
            .times(1)
            .return_once(|_| Ok(()));

        let recorder = HeartbeatRecorder::new(Arc::new(repo));
        assert!(recorder.record("dev-a", observed_at).await.is_ok());
    }
}
