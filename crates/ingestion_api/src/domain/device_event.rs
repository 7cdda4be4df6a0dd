use chrono::{DateTime, Utc};
use common::domain::AlertChannel;
use serde_json::{Map, Value};

/// Payload keys for the generic temperature, highest priority first
pub const TEMPERATURE_FIELDS: &[&str] = &["temperature", "temperature_left", "temperature_right", "temp"];
pub const HUMIDITY_FIELDS: &[&str] = &["humidity", "hum"];
pub const BATTERY_FIELDS: &[&str] = &["battery", "battery_level", "batteryLevel", "electricity"];

/// Event type carrying sensor telemetry
pub const DEVICE_DATA: &str = "DEVICE_DATA";

/// Device profile as embedded by the vendor platform
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceProfile {
    pub vendor_device_id: Option<String>,
    pub name: Option<String>,
    pub serial_number: Option<String>,
    pub model: Option<String>,
    pub dev_eui: Option<String>,
}

impl DeviceProfile {
    pub fn has_lookup_key(&self) -> bool {
        self.serial_number.is_some() || self.dev_eui.is_some() || self.vendor_device_id.is_some()
    }

    /// Short description for logs and skip reasons
    pub fn describe(&self) -> String {
        let keys: Vec<String> = [
            ("sn", &self.serial_number),
            ("devEUI", &self.dev_eui),
            ("deviceId", &self.vendor_device_id),
        ]
        .into_iter()
        .filter_map(|(label, value)| value.as_ref().map(|v| format!("{}={}", label, v)))
        .collect();
        keys.join(" ")
    }
}

/// One normalized `DEVICE_DATA` event
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceEvent {
    pub event_type: String,
    pub event_id: Option<String>,
    pub profile: DeviceProfile,
    pub sensor_payload: Map<String, Value>,
    /// Timestamp embedded by the vendor, used for domain ordering
    pub occurred_at: DateTime<Utc>,
}

impl DeviceEvent {
    pub fn temperature(&self) -> Option<f64> {
        first_numeric(&self.sensor_payload, TEMPERATURE_FIELDS)
    }

    pub fn humidity(&self) -> Option<f64> {
        first_numeric(&self.sensor_payload, HUMIDITY_FIELDS)
    }

    pub fn battery(&self) -> Option<f64> {
        first_numeric(&self.sensor_payload, BATTERY_FIELDS)
    }

    /// Temperature a rule on `channel` is evaluated against
    ///
    /// `None` is the single-sensor rule and reads the generic temperature.
    pub fn channel_temperature(&self, channel: Option<AlertChannel>) -> Option<f64> {
        match channel {
            Some(channel) => first_numeric(&self.sensor_payload, channel.temperature_fields()),
            None => self.temperature(),
        }
    }
}

/// First key in `fields` whose value is a number or a numeric string
pub fn first_numeric(payload: &Map<String, Value>, fields: &[&str]) -> Option<f64> {
    fields
        .iter()
        .filter_map(|field| payload.get(*field))
        .find_map(numeric_value)
}

fn numeric_value(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    number.is_finite().then_some(number)
}
