use crate::domain::DeviceEvent;
use chrono::{DateTime, Utc};
use common::domain::{DomainResult, SensorReading, SensorReadingRepository};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Appends one immutable reading per accepted event
///
/// Redelivered events are appended again; `event_id` is kept for tracing only.
pub struct TelemetryRecorder {
    repository: Arc<dyn SensorReadingRepository>,
}

impl TelemetryRecorder {
    pub fn new(repository: Arc<dyn SensorReadingRepository>) -> Self {
        Self { repository }
    }

    #[instrument(skip(self, event), fields(canonical_id = %canonical_id, event_id = ?event.event_id))]
    pub async fn record(
        &self,
        canonical_id: &str,
        event: &DeviceEvent,
        captured_at: DateTime<Utc>,
    ) -> DomainResult<SensorReading> {
        let reading = SensorReading {
            canonical_id: canonical_id.to_string(),
            event_id: event.event_id.clone(),
            occurred_at: event.occurred_at,
            captured_at,
            raw_payload: event.sensor_payload.clone(),
            derived_temperature: event.temperature(),
            derived_humidity: event.humidity(),
            derived_battery: event.battery(),
        };

        self.repository.append_reading(&reading).await?;

        debug!(
            temperature = ?reading.derived_temperature,
            humidity = ?reading.derived_humidity,
            battery = ?reading.derived_battery,
            "recorded sensor reading"
        );
        Ok(reading)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DeviceProfile, DEVICE_DATA};
    use chrono::Duration;
    use common::domain::{DomainError, MockSensorReadingRepository};
    use serde_json::json;

    fn event() -> DeviceEvent {
        DeviceEvent {
            event_type: DEVICE_DATA.to_string(),
            event_id: Some("evt-7".to_string()),
            profile: DeviceProfile::default(),
            sensor_payload: json!({"temperature_left": "2.5", "hum": 61, "battery_level": 88})
                .as_object()
                .cloned()
                .unwrap(),
            occurred_at: Utc::now() - Duration::seconds(30),
        }
    }

    #[tokio::test]
    async fn test_record_derives_quantities_and_keeps_both_timestamps() {
        let event = event();
        let occurred_at = event.occurred_at;
        let captured_at = Utc::now();

        let mut repo = MockSensorReadingRepository::new();
        repo.expect_append_reading()
            .withf(move |reading: &SensorReading| {
                reading.canonical_id == "dev-a"
                    && reading.event_id.as_deref() == Some("evt-7")
                    && reading.occurred_at == occurred_at
                    && reading.captured_at == captured_at
                    && reading.derived_temperature == Some(2.5)
                    && reading.derived_humidity == Some(61.0)
                    && reading.derived_battery == Some(88.0)
            })
            .times(1)
            .return_once(|_| Ok(()));

        let recorder = TelemetryRecorder::new(Arc::new(repo));
        let reading = recorder.record("dev-a", &event, captured_at).await.unwrap();

        assert_eq!(reading.raw_payload, event.sensor_payload);
    }

    #[tokio::test]
    async fn test_record_propagates_storage_error() {
        let mut repo = MockSensorReadingRepository::new();
        repo.expect_append_reading()
            .times(1)
            .return_once(|_| Err(DomainError::RepositoryError(anyhow::anyhow!("disk full"))));

        let recorder = TelemetryRecorder::new(Arc::new(repo));
        let result = recorder.record("dev-a", &event(), Utc::now()).await;

        assert!(matches!(result, Err(DomainError::RepositoryError(_))));
    }
}
