use crate::domain::{
    authenticate, normalize_batch, AlertEvaluator, DeviceEvent, DeviceIdentityResolver,
    DispatchOutcome, HeartbeatRecorder, NotificationDispatcher, RuleEvaluation, SkipReason,
    TelemetryRecorder, WebhookCredentials,
};
use chrono::{DateTime, Utc};
use common::domain::{
    BroadcastMessage, BroadcastPublisher, DomainError, DomainResult, WebhookActivity,
    WebhookConfigRepository,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// A telemetry event that made it into storage
#[derive(Debug, Clone, PartialEq)]
pub struct EventOutcome {
    pub canonical_id: String,
    pub notifications: Vec<DispatchOutcome>,
}

/// Per-event results of one webhook batch
#[derive(Debug, Default)]
pub struct IngestionSummary {
    pub results: Vec<Result<EventOutcome, SkipReason>>,
}

impl IngestionSummary {
    pub fn events_received(&self) -> usize {
        self.results.len()
    }

    /// Recorded events plus intentional non-telemetry skips
    pub fn events_processed(&self) -> usize {
        self.results
            .iter()
            .filter(|result| match result {
                Ok(_) => true,
                Err(reason) => reason.counts_as_processed(),
            })
            .count()
    }

    pub fn events_failed(&self) -> usize {
        self.events_received() - self.events_processed()
    }

    /// Alert deliveries that did not reach the transport, across all events
    pub fn notifications_failed(&self) -> usize {
        self.results
            .iter()
            .filter_map(|result| result.as_ref().ok())
            .flat_map(|outcome| outcome.notifications.iter())
            .filter(|notification| matches!(notification, DispatchOutcome::Failed { .. }))
            .count()
    }

    /// False only when something failed and nothing got through
    pub fn success(&self) -> bool {
        self.events_failed() == 0 || self.events_processed() > 0
    }
}

/// Read-only view served by the health probe
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookHealth {
    pub enabled: bool,
    pub last_event: Option<WebhookActivity>,
}

/// Storage and delivery collaborators of the ingestion pipeline
pub struct WebhookIngestionDeps {
    pub webhook_config_repository: Arc<dyn WebhookConfigRepository>,
    pub identity_resolver: DeviceIdentityResolver,
    pub telemetry_recorder: TelemetryRecorder,
    pub heartbeat_recorder: HeartbeatRecorder,
    pub alert_evaluator: AlertEvaluator,
    pub notification_dispatcher: NotificationDispatcher,
    pub broadcaster: Arc<dyn BroadcastPublisher>,
}

/// Orchestrates one webhook delivery end to end
///
/// Flow per request:
/// 1. Read the webhook settings once and authenticate the presented credentials
/// 2. Normalize the body into events
/// 3. Per event: resolve identity, record reading and heartbeat, evaluate alert
///    rules, dispatch triggered alerts, broadcast
///
/// Every failure after authentication is scoped to its event; the batch
/// always runs to the end.
pub struct WebhookIngestionService {
    webhook_config_repository: Arc<dyn WebhookConfigRepository>,
    identity_resolver: DeviceIdentityResolver,
    telemetry_recorder: TelemetryRecorder,
    heartbeat_recorder: HeartbeatRecorder,
    alert_evaluator: AlertEvaluator,
    notification_dispatcher: NotificationDispatcher,
    broadcaster: Arc<dyn BroadcastPublisher>,
}

impl WebhookIngestionService {
    pub fn new(deps: WebhookIngestionDeps) -> Self {
        Self {
            webhook_config_repository: deps.webhook_config_repository,
            identity_resolver: deps.identity_resolver,
            telemetry_recorder: deps.telemetry_recorder,
            heartbeat_recorder: deps.heartbeat_recorder,
            alert_evaluator: deps.alert_evaluator,
            notification_dispatcher: deps.notification_dispatcher,
            broadcaster: deps.broadcaster,
        }
    }

    /// Reject the request unless the presented credentials pass
    ///
    /// Errors other than the authentication variants mean the settings could
    /// not be read at all.
    #[instrument(skip(self, credentials), fields(
        token_presented = credentials.token.is_some(),
        secret_presented = credentials.secret.is_some(),
        uuid_presented = credentials.uuid.is_some(),
    ))]
    pub async fn authorize(&self, credentials: &WebhookCredentials) -> DomainResult<()> {
        let config = self.webhook_config_repository.get_webhook_config().await?;

        authenticate(config.as_ref(), credentials).inspect_err(|e| {
            warn!(error = %e, "webhook request rejected");
        })
    }

    /// Process every event in an already-authorized body
    #[instrument(skip(self, body))]
    pub async fn process_batch(&self, body: &Value, received_at: DateTime<Utc>) -> IngestionSummary {
        let mut summary = IngestionSummary::default();

        for normalized in normalize_batch(body, received_at) {
            let result = match normalized {
                Ok(event) => self.process_event(&event, received_at).await,
                Err(reason) => {
                    match &reason {
                        SkipReason::NonTelemetry { event_type } => {
                            debug!(event_type = %event_type, "skipping non-telemetry event")
                        }
                        other => warn!(reason = %other, "skipping malformed event"),
                    }
                    Err(reason)
                }
            };
            summary.results.push(result);
        }

        let events_processed = summary.events_processed();
        info!(
            events_received = summary.events_received(),
            events_processed,
            events_failed = summary.events_failed(),
            notifications_failed = summary.notifications_failed(),
            "processed webhook batch"
        );

        if events_processed > 0 {
            let activity = WebhookActivity {
                received_at,
                events_received: count_u32(summary.events_received()),
                events_processed: count_u32(events_processed),
            };
            if let Err(e) = self
                .webhook_config_repository
                .record_webhook_activity(activity)
                .await
            {
                warn!(error = %e, "failed to record webhook activity");
            }
        }

        summary
    }

    #[instrument(skip(self, event), fields(event_id = ?event.event_id, device = %event.profile.describe()))]
    async fn process_event(
        &self,
        event: &DeviceEvent,
        received_at: DateTime<Utc>,
    ) -> Result<EventOutcome, SkipReason> {
        let identity = self
            .identity_resolver
            .resolve(&event.profile, received_at)
            .await
            .map_err(|e| match e {
                DomainError::DeviceNotFound(device) => {
                    warn!(device = %device, "telemetry for unprovisioned device dropped");
                    SkipReason::UnknownDevice(device)
                }
                other => {
                    error!(error = %other, "failed to resolve device identity");
                    SkipReason::PersistenceFailure(other.to_string())
                }
            })?;
        let canonical_id = identity.canonical_id.clone();

        self.telemetry_recorder
            .record(&canonical_id, event, received_at)
            .await
            .map_err(|e| {
                error!(canonical_id = %canonical_id, error = %e, "failed to record sensor reading");
                SkipReason::PersistenceFailure(e.to_string())
            })?;

        if let Err(e) = self.heartbeat_recorder.record(&canonical_id, received_at).await {
            warn!(canonical_id = %canonical_id, error = %e, "failed to record heartbeat");
        }

        let notifications = self.run_alerts(&canonical_id, &identity.name, event, received_at).await;

        self.broadcaster.publish(BroadcastMessage {
            canonical_id: canonical_id.clone(),
            device_name: identity.name,
            event_type: event.event_type.clone(),
            sensor_payload: event.sensor_payload.clone(),
            emitted_at: received_at,
        });

        Ok(EventOutcome {
            canonical_id,
            notifications,
        })
    }

    async fn run_alerts(
        &self,
        canonical_id: &str,
        device_name: &str,
        event: &DeviceEvent,
        now: DateTime<Utc>,
    ) -> Vec<DispatchOutcome> {
        let evaluations = match self.alert_evaluator.evaluate(canonical_id, event, now).await {
            Ok(evaluations) => evaluations,
            Err(e) => {
                warn!(canonical_id = %canonical_id, error = %e, "failed to evaluate alert rules");
                return Vec::new();
            }
        };

        let mut outcomes = Vec::new();
        for evaluation in evaluations {
            let RuleEvaluation::Triggered(trigger) = evaluation else {
                continue;
            };
            match self
                .notification_dispatcher
                .dispatch(&trigger, device_name, now)
                .await
            {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    warn!(rule_id = %trigger.rule.rule_id, error = %e, "failed to dispatch alert");
                    outcomes.push(DispatchOutcome::Failed {
                        reason: e.to_string(),
                    });
                }
            }
        }
        outcomes
    }

    #[instrument(skip(self))]
    pub async fn health(&self) -> DomainResult<WebhookHealth> {
        let config = self.webhook_config_repository.get_webhook_config().await?;
        let last_event = self.webhook_config_repository.get_last_activity().await?;

        Ok(WebhookHealth {
            enabled: config.map(|c| c.enabled).unwrap_or(false),
            last_event,
        })
    }
}

fn count_u32(count: usize) -> u32 {
    u32::try_from(count).unwrap_or(u32::MAX)
}
