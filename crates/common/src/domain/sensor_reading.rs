use crate::domain::result::DomainResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Append-only telemetry fact for one accepted event
///
/// `occurred_at` is the timestamp the vendor embedded in the event and is used
/// for domain ordering; `captured_at` is when this server accepted it.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    pub canonical_id: String,
    pub event_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub captured_at: DateTime<Utc>,
    pub raw_payload: serde_json::Map<String, serde_json::Value>,
    pub derived_temperature: Option<f64>,
    pub derived_humidity: Option<f64>,
    pub derived_battery: Option<f64>,
}

/// Storage collaborator for sensor readings
///
/// No deduplication on `event_id`: redelivered events append again.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait SensorReadingRepository: Send + Sync {
    async fn append_reading(&self, reading: &SensorReading) -> DomainResult<()>;

    /// Readings for a device ordered by `occurred_at` ascending
    async fn list_readings(&self, canonical_id: &str) -> DomainResult<Vec<SensorReading>>;
}
