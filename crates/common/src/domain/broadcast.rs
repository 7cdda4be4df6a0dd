use chrono::{DateTime, Utc};
use serde::Serialize;

/// Live update pushed to dashboard observers; never persisted
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastMessage {
    pub canonical_id: String,
    pub device_name: String,
    pub event_type: String,
    pub sensor_payload: serde_json::Map<String, serde_json::Value>,
    pub emitted_at: DateTime<Utc>,
}

/// Fire-and-forget fan-out to whoever is connected right now
///
/// Implementations swallow every failure: a missing or dead observer is never
/// the publisher's problem.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
pub trait BroadcastPublisher: Send + Sync {
    fn publish(&self, message: BroadcastMessage);
}
