use crate::domain::result::DomainResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatSource {
    Webhook,
}

impl HeartbeatSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            HeartbeatSource::Webhook => "webhook",
        }
    }
}

/// Liveness signal recorded whenever telemetry arrives for a device
#[derive(Debug, Clone, PartialEq)]
pub struct Heartbeat {
    pub canonical_id: String,
    pub observed_at: DateTime<Utc>,
    pub source: HeartbeatSource,
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait HeartbeatRepository: Send + Sync {
    /// Keep the latest heartbeat per device; older observations never win
    async fn record_heartbeat(&self, heartbeat: &Heartbeat) -> DomainResult<()>;

    async fn get_heartbeat(&self, canonical_id: &str) -> DomainResult<Option<Heartbeat>>;

    /// Canonical ids of ONLINE devices whose latest heartbeat is older than `silent_since`
    async fn list_silent_devices(&self, silent_since: DateTime<Utc>) -> DomainResult<Vec<String>>;
}
