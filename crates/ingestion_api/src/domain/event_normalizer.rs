use crate::domain::{DeviceEvent, DeviceProfile, DEVICE_DATA};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

/// Why an event in a batch did not produce a recorded reading
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SkipReason {
    #[error("non-telemetry event: {event_type}")]
    NonTelemetry { event_type: String },

    #[error("malformed event: {0}")]
    Malformed(String),

    #[error("unknown device: {0}")]
    UnknownDevice(String),

    #[error("persistence failure: {0}")]
    PersistenceFailure(String),
}

impl SkipReason {
    /// Intentional skips count as processed; everything else is a failure
    pub fn counts_as_processed(&self) -> bool {
        matches!(self, SkipReason::NonTelemetry { .. })
    }
}

/// Lazily normalize a webhook body
///
/// A single object is a batch of one; an array yields one result per element.
/// Each element is normalized independently, so one bad element never hides
/// its siblings.
pub fn normalize_batch(
    body: &Value,
    received_at: DateTime<Utc>,
) -> impl Iterator<Item = Result<DeviceEvent, SkipReason>> + '_ {
    let elements = match body {
        Value::Array(items) => items.as_slice(),
        other => std::slice::from_ref(other),
    };
    elements
        .iter()
        .map(move |raw| normalize_event(raw, received_at))
}

/// Normalize one raw element
pub fn normalize_event(raw: &Value, received_at: DateTime<Utc>) -> Result<DeviceEvent, SkipReason> {
    let raw = raw
        .as_object()
        .ok_or_else(|| SkipReason::Malformed("event is not a JSON object".to_string()))?;

    let event_type = raw
        .get("eventType")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();

    let data = match raw.get("data") {
        None | Some(Value::Null) => return Err(SkipReason::NonTelemetry { event_type }),
        Some(Value::Object(data)) => data,
        Some(_) => {
            return Err(SkipReason::Malformed(
                "data is not a JSON object".to_string(),
            ))
        }
    };

    if event_type != DEVICE_DATA {
        return Err(SkipReason::NonTelemetry { event_type });
    }

    let profile = data
        .get("deviceProfile")
        .and_then(Value::as_object)
        .map(parse_profile)
        .ok_or_else(|| SkipReason::Malformed("missing deviceProfile".to_string()))?;
    if !profile.has_lookup_key() {
        return Err(SkipReason::Malformed(
            "deviceProfile carries no serial number, devEUI or deviceId".to_string(),
        ));
    }

    let sensor_payload = data
        .get("payload")
        .and_then(Value::as_object)
        .cloned()
        .ok_or_else(|| SkipReason::Malformed("missing payload".to_string()))?;

    Ok(DeviceEvent {
        event_type,
        event_id: raw.get("eventId").and_then(string_value),
        profile,
        sensor_payload,
        occurred_at: event_timestamp(raw, data).unwrap_or(received_at),
    })
}

fn parse_profile(profile: &Map<String, Value>) -> DeviceProfile {
    DeviceProfile {
        vendor_device_id: first_string(profile, &["deviceId", "device_id"]),
        name: first_string(profile, &["name", "deviceName"]),
        serial_number: first_string(profile, &["sn", "serialNumber", "serial_number"]),
        model: first_string(profile, &["model"]),
        dev_eui: first_string(profile, &["devEUI", "devEui", "dev_eui"]),
    }
}

fn first_string(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| map.get(*key))
        .find_map(string_value)
}

/// Non-empty string, or a number rendered as one (vendor ids are often numeric)
fn string_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// `data.ts` in milliseconds, else `eventCreatedTime` in seconds
fn event_timestamp(raw: &Map<String, Value>, data: &Map<String, Value>) -> Option<DateTime<Utc>> {
    data.get("ts")
        .and_then(Value::as_i64)
        .and_then(DateTime::from_timestamp_millis)
        .or_else(|| {
            raw.get("eventCreatedTime")
                .and_then(Value::as_i64)
                .and_then(|secs| DateTime::from_timestamp(secs, 0))
        })
}
