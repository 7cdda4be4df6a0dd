mod config;
mod repositories;
mod seed;

use common::domain::NotificationSender;
use common::telemetry::{init_telemetry, shutdown_telemetry, TelemetryProviders};
use crate::config::ServiceConfig;
use ingestion_api::{
    AlertEvaluator, ChannelBroadcaster, DeviceIdentityResolver, HeartbeatRecorder, HttpMailSender,
    IngestionApi, LogNotificationSender, NotificationDispatcher, TelemetryRecorder,
    WebhookIngestionDeps, WebhookIngestionService,
};
use repositories::{initialize_repositories, Repositories};
use status_worker::{DeviceStatusService, StatusWorker, StatusWorkerConfig};
use std::sync::Arc;
use std::time::Duration;
use thermowatch_runner::Runner;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() {
    let config = match ServiceConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let telemetry_providers: Option<TelemetryProviders> =
        match init_telemetry(&config.telemetry_config()) {
            Ok(providers) => providers,
            Err(e) => {
                eprintln!("Failed to initialize telemetry: {}", e);
                std::process::exit(1);
            }
        };

    info!(
        otel_enabled = config.otel_enabled,
        storage_backend = ?config.storage_backend,
        "Starting thermowatch service"
    );
    debug!("Configuration: {:?}", config);

    let repositories = match initialize_repositories(&config).await {
        Ok(repositories) => repositories,
        Err(e) => {
            error!("Failed to initialize storage: {:#}", e);
            std::process::exit(1);
        }
    };

    if let Some(path) = &config.seed_file {
        if let Err(e) = seed::apply_seed_file(path, &repositories).await {
            error!("Failed to apply seed file: {:#}", e);
            std::process::exit(1);
        }
    }

    let broadcaster = ChannelBroadcaster::new(config.broadcast_capacity);
    let ingestion = Arc::new(build_ingestion_service(
        &config,
        &repositories,
        broadcaster.clone(),
    ));
    let ingestion_api = IngestionApi::new(ingestion, broadcaster.clone(), config.http_config());

    let status_service = Arc::new(DeviceStatusService::new(
        repositories.identities.clone(),
        repositories.heartbeats.clone(),
        Arc::new(broadcaster),
        chrono::Duration::seconds(i64::try_from(config.offline_after_secs).unwrap_or(i64::MAX)),
    ));
    let status_worker = StatusWorker::new(
        status_service,
        StatusWorkerConfig {
            check_interval: Duration::from_secs(config.status_check_interval_secs.max(1)),
        },
    );

    let result = Runner::new()
        .with_named_process("ingestion_api", ingestion_api.into_runner_process())
        .with_named_process("status_worker", status_worker.into_runner_process())
        .with_closer(move || async move {
            info!("Flushing telemetry...");
            shutdown_telemetry(telemetry_providers);
            Ok(())
        })
        .with_closer_timeout(Duration::from_secs(10))
        .run()
        .await;

    if result.is_err() {
        std::process::exit(1);
    }
}

fn build_ingestion_service(
    config: &ServiceConfig,
    repositories: &Repositories,
    broadcaster: ChannelBroadcaster,
) -> WebhookIngestionService {
    let sender: Arc<dyn NotificationSender> = match config.mail_relay() {
        Some(relay_url) => {
            info!(relay_url, "Alerts are delivered through the mail relay");
            Arc::new(HttpMailSender::new(relay_url, config.mail_from.clone()))
        }
        None => {
            warn!("No mail relay configured; alerts are only logged");
            Arc::new(LogNotificationSender)
        }
    };

    WebhookIngestionService::new(WebhookIngestionDeps {
        webhook_config_repository: repositories.webhook.clone(),
        identity_resolver: DeviceIdentityResolver::new(repositories.identities.clone()),
        telemetry_recorder: TelemetryRecorder::new(repositories.readings.clone()),
        heartbeat_recorder: HeartbeatRecorder::new(repositories.heartbeats.clone()),
        alert_evaluator: AlertEvaluator::new(repositories.rules.clone()),
        notification_dispatcher: NotificationDispatcher::new(
            repositories.rules.clone(),
            sender,
            Duration::from_secs(config.notification_timeout_secs),
        ),
        broadcaster: Arc::new(broadcaster),
    })
}
