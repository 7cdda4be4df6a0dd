use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{DateTime, Duration, TimeZone, Utc};
use common::domain::{
    AlertChannel, AlertRecipient, AlertRule, AlertRuleRepository, CreateDeviceIdentityRepoInput,
    DeviceIdentity, DeviceIdentityRepository, DeviceStatus, DomainError, DomainResult,
    NotificationSender, ProvisionDeviceInput, SensorReadingRepository, UpsertAlertRuleInput,
    WebhookConfig,
};
use common::memory::InMemoryStore;
use ingestion_api::{
    build_router, AlertEvaluator, AppState, ChannelBroadcaster, DeviceIdentityResolver,
    DeviceProfile, HeartbeatRecorder, NotificationDispatcher, TelemetryRecorder,
    WebhookIngestionDeps, WebhookIngestionService,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tower::ServiceExt;

#[derive(Default)]
struct RecordingSender {
    deliveries: Mutex<Vec<Vec<String>>>,
    unreachable: AtomicBool,
}

impl RecordingSender {
    fn deliveries(&self) -> Vec<Vec<String>> {
        self.deliveries.lock().unwrap().clone()
    }

    fn go_offline(&self) {
        self.unreachable.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl NotificationSender for RecordingSender {
    async fn send(&self, recipients: &[String], _subject: &str, _body: &str) -> DomainResult<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(DomainError::NotificationFailed("relay unreachable".to_string()));
        }
        self.deliveries.lock().unwrap().push(recipients.to_vec());
        Ok(())
    }
}

struct Pipeline {
    store: InMemoryStore,
    sender: Arc<RecordingSender>,
    broadcaster: ChannelBroadcaster,
    service: Arc<WebhookIngestionService>,
}

impl Pipeline {
    fn new(config: WebhookConfig) -> Self {
        let store = InMemoryStore::with_webhook_config(config);
        let sender = Arc::new(RecordingSender::default());
        let broadcaster = ChannelBroadcaster::new(64);
        let rules: Arc<dyn AlertRuleRepository> = Arc::new(store.clone());

        let service = WebhookIngestionService::new(WebhookIngestionDeps {
            webhook_config_repository: Arc::new(store.clone()),
            identity_resolver: DeviceIdentityResolver::new(Arc::new(store.clone())),
            telemetry_recorder: TelemetryRecorder::new(Arc::new(store.clone())),
            heartbeat_recorder: HeartbeatRecorder::new(Arc::new(store.clone())),
            alert_evaluator: AlertEvaluator::new(rules.clone()),
            notification_dispatcher: NotificationDispatcher::new(
                rules,
                sender.clone(),
                std::time::Duration::from_secs(5),
            ),
            broadcaster: Arc::new(broadcaster.clone()),
        });

        Self {
            store,
            sender,
            broadcaster,
            service: Arc::new(service),
        }
    }

    fn enabled() -> Self {
        Self::new(WebhookConfig {
            enabled: true,
            verification_token: Some("tok-123".to_string()),
            webhook_secret: None,
            webhook_uuid: None,
        })
    }

    fn router(&self) -> axum::Router {
        build_router(AppState {
            ingestion: self.service.clone(),
            broadcaster: self.broadcaster.clone(),
            webhook_path: "/webhook".to_string(),
        })
    }

    async fn provision(
        &self,
        name: &str,
        serial_number: Option<&str>,
        vendor_device_id: Option<&str>,
    ) -> DeviceIdentity {
        let input = CreateDeviceIdentityRepoInput::from_provision(ProvisionDeviceInput {
            name: name.to_string(),
            model: Some("TS302".to_string()),
            serial_number: serial_number.map(str::to_string),
            dev_eui: None,
            vendor_device_id: vendor_device_id.map(str::to_string),
        })
        .unwrap();
        self.store.create_identity(input).await.unwrap()
    }

    async fn rule(
        &self,
        canonical_id: &str,
        channel: Option<AlertChannel>,
        recipients: &[(&str, bool)],
    ) -> AlertRule {
        self.store
            .upsert_rule(UpsertAlertRuleInput {
                canonical_id: canonical_id.to_string(),
                channel,
                min_threshold: 0.0,
                max_threshold: 30.0,
                enabled: true,
                cooldown_seconds: 300,
                recipients: recipients
                    .iter()
                    .map(|(email, enabled)| AlertRecipient {
                        email: email.to_string(),
                        enabled: *enabled,
                    })
                    .collect(),
            })
            .await
            .unwrap()
    }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

fn device_data(profile: Value, payload: Value) -> Value {
    json!({
        "eventType": "DEVICE_DATA",
        "data": {"deviceProfile": profile, "payload": payload}
    })
}

fn temperature(sn: &str, value: f64) -> Value {
    device_data(json!({"sn": sn, "name": "Freezer"}), json!({"temperature": value}))
}

#[tokio::test]
async fn test_array_of_known_devices_is_fully_recorded() {
    let pipeline = Pipeline::enabled();
    let a = pipeline.provision("Freezer A", Some("SN-A"), None).await;
    let b = pipeline.provision("Freezer B", Some("SN-B"), None).await;

    let body = json!([temperature("SN-A", 4.0), temperature("SN-B", 5.0), temperature("SN-A", 4.5)]);
    let summary = pipeline.service.process_batch(&body, t0()).await;

    assert_eq!(summary.events_processed(), 3);
    assert_eq!(summary.events_failed(), 0);
    assert_eq!(pipeline.store.reading_count().await, 3);
    assert_eq!(pipeline.store.list_readings(&a.canonical_id).await.unwrap().len(), 2);
    assert_eq!(pipeline.store.list_readings(&b.canonical_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_single_object_is_recorded_and_refreshes_identity() {
    let pipeline = Pipeline::enabled();
    let device = pipeline.provision("Freezer", Some("SN-A"), None).await;

    let summary = pipeline
        .service
        .process_batch(&temperature("SN-A", 4.0), t0())
        .await;

    assert_eq!(summary.events_processed(), 1);
    let refreshed = pipeline
        .store
        .get_identity(&device.canonical_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(refreshed.last_status, DeviceStatus::Online);
    assert_eq!(refreshed.last_seen_at, Some(t0()));
}

#[tokio::test]
async fn test_unknown_device_is_dropped_without_affecting_siblings() {
    let pipeline = Pipeline::enabled();
    pipeline.provision("Freezer", Some("SN-A"), None).await;

    let body = json!([temperature("SN-UNKNOWN", 4.0), temperature("SN-A", 4.0)]);
    let summary = pipeline.service.process_batch(&body, t0()).await;

    assert_eq!(summary.events_processed(), 1);
    assert_eq!(summary.events_failed(), 1);
    assert!(summary.success());
    assert_eq!(pipeline.store.reading_count().await, 1);
    assert_eq!(pipeline.store.identity_count().await, 1);
}

#[tokio::test]
async fn test_serial_identity_absorbs_vendor_identity_history() {
    let pipeline = Pipeline::enabled();
    let legacy = pipeline.provision("Freezer", None, Some("1001")).await;
    pipeline
        .rule(&legacy.canonical_id, None, &[("ops@example.com", true)])
        .await;

    let vendor_only = device_data(json!({"deviceId": 1001}), json!({"temperature": 4.0}));
    pipeline.service.process_batch(&vendor_only, t0()).await;
    assert_eq!(
        pipeline.store.list_readings(&legacy.canonical_id).await.unwrap().len(),
        1
    );

    let canonical = pipeline.provision("Freezer", Some("SN-1"), None).await;
    let both_keys = device_data(
        json!({"deviceId": 1001, "sn": "SN-1"}),
        json!({"temperature": 4.2}),
    );
    let summary = pipeline
        .service
        .process_batch(&both_keys, t0() + Duration::seconds(30))
        .await;

    assert_eq!(summary.events_processed(), 1);
    assert_eq!(pipeline.store.identity_count().await, 1);
    assert!(pipeline
        .store
        .get_identity(&legacy.canonical_id)
        .await
        .unwrap()
        .is_none());
    assert!(pipeline
        .store
        .list_readings(&legacy.canonical_id)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        pipeline.store.list_readings(&canonical.canonical_id).await.unwrap().len(),
        2
    );

    let rules = pipeline
        .store
        .list_rules_for_device(&canonical.canonical_id)
        .await
        .unwrap();
    assert_eq!(rules.len(), 1);

    let survivor = pipeline
        .store
        .find_by_vendor_device_id("1001")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(survivor.canonical_id, canonical.canonical_id);
}

#[tokio::test]
async fn test_reassigned_vendor_id_does_not_swallow_other_device() {
    let pipeline = Pipeline::enabled();
    let freezer_b = pipeline.provision("Freezer B", Some("SN-B"), Some("1001")).await;
    let freezer_a = pipeline.provision("Freezer A", Some("SN-A"), None).await;
    pipeline
        .rule(&freezer_b.canonical_id, None, &[("ops@example.com", true)])
        .await;
    pipeline
        .service
        .process_batch(&temperature("SN-B", 4.0), t0())
        .await;

    // The vendor moved deviceId 1001 onto freezer A
    let reassigned = device_data(
        json!({"sn": "SN-A", "deviceId": 1001}),
        json!({"temperature": 4.1}),
    );
    let summary = pipeline
        .service
        .process_batch(&reassigned, t0() + Duration::seconds(30))
        .await;
    assert_eq!(summary.events_processed(), 1);

    assert_eq!(pipeline.store.identity_count().await, 2);
    let b = pipeline
        .store
        .get_identity(&freezer_b.canonical_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(b.serial_number.as_deref(), Some("SN-B"));
    assert_eq!(b.vendor_device_id, None);
    let holder = pipeline
        .store
        .find_by_vendor_device_id("1001")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(holder.canonical_id, freezer_a.canonical_id);
    assert_eq!(
        pipeline.store.list_readings(&freezer_a.canonical_id).await.unwrap().len(),
        1
    );
    assert_eq!(
        pipeline
            .store
            .list_rules_for_device(&freezer_b.canonical_id)
            .await
            .unwrap()
            .len(),
        1
    );

    let later = device_data(
        json!({"sn": "SN-B", "deviceId": 2002}),
        json!({"temperature": 4.2}),
    );
    let summary = pipeline
        .service
        .process_batch(&later, t0() + Duration::seconds(60))
        .await;

    assert_eq!(summary.events_processed(), 1);
    assert_eq!(
        pipeline.store.list_readings(&freezer_b.canonical_id).await.unwrap().len(),
        2
    );
    let b = pipeline
        .store
        .get_identity(&freezer_b.canonical_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(b.vendor_device_id.as_deref(), Some("2002"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_breaches_deliver_one_alert() {
    let pipeline = Pipeline::enabled();
    let device = pipeline.provision("Freezer", Some("SN-A"), None).await;
    let rule = pipeline
        .rule(&device.canonical_id, None, &[("ops@example.com", true)])
        .await;

    let mut batches = tokio::task::JoinSet::new();
    for i in 0..16 {
        let service = pipeline.service.clone();
        batches.spawn(async move {
            service
                .process_batch(&temperature("SN-A", 35.0 + f64::from(i)), t0())
                .await
        });
    }
    while let Some(summary) = batches.join_next().await {
        assert_eq!(summary.unwrap().events_processed(), 1);
    }

    assert_eq!(pipeline.sender.deliveries().len(), 1);
    assert_eq!(pipeline.store.reading_count().await, 16);
    let stored = pipeline.store.get_rule(&rule.rule_id).await.unwrap().unwrap();
    assert_eq!(stored.total_alerts_sent, 1);
}

#[tokio::test]
async fn test_cooldown_suppresses_then_rearms() {
    let pipeline = Pipeline::enabled();
    let device = pipeline.provision("Freezer", Some("SN-A"), None).await;
    let rule = pipeline
        .rule(&device.canonical_id, None, &[("ops@example.com", true)])
        .await;

    pipeline
        .service
        .process_batch(&temperature("SN-A", 35.0), t0())
        .await;
    assert_eq!(pipeline.sender.deliveries().len(), 1);

    pipeline
        .service
        .process_batch(&temperature("SN-A", 36.0), t0() + Duration::seconds(60))
        .await;
    assert_eq!(pipeline.sender.deliveries().len(), 1);

    pipeline
        .service
        .process_batch(&temperature("SN-A", 37.0), t0() + Duration::seconds(301))
        .await;
    assert_eq!(pipeline.sender.deliveries().len(), 2);

    let stored = pipeline.store.get_rule(&rule.rule_id).await.unwrap().unwrap();
    assert_eq!(stored.total_alerts_sent, 2);
    assert_eq!(stored.last_alert_sent_at, Some(t0() + Duration::seconds(301)));
}

#[tokio::test]
async fn test_disabled_recipient_is_excluded() {
    let pipeline = Pipeline::enabled();
    let device = pipeline.provision("Freezer", Some("SN-A"), None).await;
    pipeline
        .rule(
            &device.canonical_id,
            None,
            &[("ops@example.com", true), ("night@example.com", false)],
        )
        .await;

    pipeline
        .service
        .process_batch(&temperature("SN-A", 35.0), t0())
        .await;

    assert_eq!(
        pipeline.sender.deliveries(),
        vec![vec!["ops@example.com".to_string()]]
    );
}

#[tokio::test]
async fn test_all_recipients_disabled_sends_nothing_and_keeps_cooldown() {
    let pipeline = Pipeline::enabled();
    let device = pipeline.provision("Freezer", Some("SN-A"), None).await;
    let rule = pipeline
        .rule(&device.canonical_id, None, &[("ops@example.com", false)])
        .await;

    let summary = pipeline
        .service
        .process_batch(&temperature("SN-A", 35.0), t0())
        .await;

    assert_eq!(summary.events_processed(), 1);
    assert!(pipeline.sender.deliveries().is_empty());
    let stored = pipeline.store.get_rule(&rule.rule_id).await.unwrap().unwrap();
    assert_eq!(stored.last_alert_sent_at, None);
    assert_eq!(stored.total_alerts_sent, 0);
}

#[tokio::test]
async fn test_disabled_rule_still_records_and_broadcasts() {
    let pipeline = Pipeline::enabled();
    let device = pipeline.provision("Freezer", Some("SN-A"), None).await;
    let rule = pipeline
        .rule(&device.canonical_id, None, &[("ops@example.com", true)])
        .await;
    pipeline
        .store
        .upsert_rule(UpsertAlertRuleInput {
            canonical_id: rule.canonical_id.clone(),
            channel: rule.channel,
            min_threshold: rule.min_threshold,
            max_threshold: rule.max_threshold,
            enabled: false,
            cooldown_seconds: rule.cooldown_seconds,
            recipients: rule.recipients.clone(),
        })
        .await
        .unwrap();
    let mut observer = pipeline.broadcaster.subscribe();

    let summary = pipeline
        .service
        .process_batch(&temperature("SN-A", 80.0), t0())
        .await;

    assert_eq!(summary.events_processed(), 1);
    assert!(pipeline.sender.deliveries().is_empty());
    assert_eq!(pipeline.store.reading_count().await, 1);

    let update = observer.try_recv().unwrap();
    assert_eq!(update.canonical_id, device.canonical_id);
    assert_eq!(update.event_type, "DEVICE_DATA");
    assert_eq!(update.sensor_payload["temperature"], json!(80.0));
}

#[tokio::test]
async fn test_channels_alert_independently() {
    let pipeline = Pipeline::enabled();
    let device = pipeline.provision("Dual probe", Some("SN-D"), None).await;
    let ch1 = pipeline
        .rule(&device.canonical_id, Some(AlertChannel::Ch1), &[("ch1@example.com", true)])
        .await;
    let ch2 = pipeline
        .rule(&device.canonical_id, Some(AlertChannel::Ch2), &[("ch2@example.com", true)])
        .await;

    let ch1_breach = device_data(
        json!({"sn": "SN-D"}),
        json!({"temperature_left": 41.0, "temperature_right": 10.0}),
    );
    pipeline.service.process_batch(&ch1_breach, t0()).await;

    assert_eq!(
        pipeline.sender.deliveries(),
        vec![vec!["ch1@example.com".to_string()]]
    );

    // CH1 is cooling down; CH2 must still fire
    let ch2_breach = device_data(
        json!({"sn": "SN-D"}),
        json!({"temperature_left": 42.0, "temperature_right": 45.0}),
    );
    pipeline
        .service
        .process_batch(&ch2_breach, t0() + Duration::seconds(60))
        .await;

    assert_eq!(pipeline.sender.deliveries().len(), 2);
    assert_eq!(
        pipeline.sender.deliveries()[1],
        vec!["ch2@example.com".to_string()]
    );

    let ch1 = pipeline.store.get_rule(&ch1.rule_id).await.unwrap().unwrap();
    let ch2 = pipeline.store.get_rule(&ch2.rule_id).await.unwrap().unwrap();
    assert_eq!(ch1.total_alerts_sent, 1);
    assert_eq!(ch2.total_alerts_sent, 1);
}

#[tokio::test]
async fn test_malformed_element_does_not_block_siblings() {
    let pipeline = Pipeline::enabled();
    pipeline.provision("Freezer", Some("SN-A"), None).await;

    let body = json!([
        {"eventType": "DEVICE_DATA", "data": "garbage"},
        temperature("SN-A", 4.0),
        {"eventType": "DEVICE_DATA"}
    ]);
    let summary = pipeline.service.process_batch(&body, t0()).await;

    assert_eq!(summary.events_received(), 3);
    assert_eq!(summary.events_processed(), 2);
    assert_eq!(summary.events_failed(), 1);
    assert_eq!(pipeline.store.reading_count().await, 1);
}

#[tokio::test]
async fn test_resolving_same_profile_twice_is_stable() {
    let pipeline = Pipeline::enabled();
    pipeline.provision("Freezer", Some("SN-A"), Some("1001")).await;
    let resolver = DeviceIdentityResolver::new(Arc::new(pipeline.store.clone()));
    let profile = DeviceProfile {
        vendor_device_id: Some("1001".to_string()),
        name: None,
        serial_number: Some("SN-A".to_string()),
        model: None,
        dev_eui: None,
    };

    let first = resolver.resolve(&profile, t0()).await.unwrap();
    let second = resolver
        .resolve(&profile, t0() + Duration::seconds(1))
        .await
        .unwrap();

    assert_eq!(first.canonical_id, second.canonical_id);
    assert_eq!(pipeline.store.identity_count().await, 1);
}

async fn call(router: axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post_webhook(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_http_post_reports_counts_and_health_reflects_it() {
    let pipeline = Pipeline::enabled();
    pipeline.provision("Freezer", Some("SN-A"), None).await;
    let body = json!([temperature("SN-A", 4.0), temperature("SN-UNKNOWN", 4.0)]).to_string();

    let (status, response) = call(
        pipeline.router(),
        post_webhook("/webhook?token=tok-123", &body),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        response,
        json!({
            "success": true,
            "eventsProcessed": 1,
            "eventsFailed": 1,
            "notificationsFailed": 0
        })
    );

    let (status, health) = call(
        pipeline.router(),
        Request::builder()
            .uri("/webhook")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "ok");
    assert_eq!(health["enabled"], true);
    assert_eq!(health["endpoint"], "/webhook");
    assert_eq!(health["lastEvent"]["eventsReceived"], 2);
    assert_eq!(health["lastEvent"]["eventsProcessed"], 1);
}

#[tokio::test]
async fn test_http_health_omits_last_event_before_any_traffic() {
    let pipeline = Pipeline::enabled();

    let (status, health) = call(
        pipeline.router(),
        Request::builder()
            .uri("/webhook")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert!(health.get("lastEvent").is_none());
}

#[tokio::test]
async fn test_http_rejects_wrong_token_before_parsing() {
    let pipeline = Pipeline::enabled();

    let (status, response) = call(
        pipeline.router(),
        post_webhook("/webhook?token=wrong", "not json"),
    )
    .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(response["error"].is_string());
    assert_eq!(pipeline.store.reading_count().await, 0);
}

#[tokio::test]
async fn test_http_rejects_disabled_webhook() {
    let pipeline = Pipeline::new(WebhookConfig {
        enabled: false,
        ..WebhookConfig::default()
    });

    let (status, _) = call(
        pipeline.router(),
        post_webhook("/webhook", &temperature("SN-A", 4.0).to_string()),
    )
    .await;

    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_http_rejects_invalid_json_after_authentication() {
    let pipeline = Pipeline::enabled();

    let (status, response) = call(
        pipeline.router(),
        post_webhook("/webhook?token=tok-123", "{not json"),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(response["message"].is_string());
}

#[tokio::test]
async fn test_http_all_failed_batch_reports_unsuccessful() {
    let pipeline = Pipeline::enabled();

    let (status, response) = call(
        pipeline.router(),
        post_webhook("/webhook", &temperature("SN-UNKNOWN", 4.0).to_string()),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        response,
        json!({
            "success": false,
            "eventsProcessed": 0,
            "eventsFailed": 1,
            "notificationsFailed": 0
        })
    );
}

#[tokio::test]
async fn test_http_reports_failed_notifications() {
    let pipeline = Pipeline::enabled();
    let device = pipeline.provision("Freezer", Some("SN-A"), None).await;
    let rule = pipeline
        .rule(&device.canonical_id, None, &[("ops@example.com", true)])
        .await;
    pipeline.sender.go_offline();

    let (status, response) = call(
        pipeline.router(),
        post_webhook("/webhook?token=tok-123", &temperature("SN-A", 35.0).to_string()),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        response,
        json!({
            "success": true,
            "eventsProcessed": 1,
            "eventsFailed": 0,
            "notificationsFailed": 1
        })
    );
    let stored = pipeline.store.get_rule(&rule.rule_id).await.unwrap().unwrap();
    assert_eq!(stored.last_alert_sent_at, None);
    assert_eq!(stored.total_alerts_sent, 0);
}
