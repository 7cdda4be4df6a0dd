use crate::config::{ServiceConfig, StorageBackend};
use common::domain::{
    AlertRuleRepository, DeviceIdentityRepository, HeartbeatRepository, SensorReadingRepository,
    WebhookConfigRepository,
};
use common::memory::InMemoryStore;
use common::postgres::{
    PostgresAlertRuleRepository, PostgresClient, PostgresDeviceIdentityRepository,
    PostgresHeartbeatRepository, PostgresSensorReadingRepository, PostgresWebhookConfigRepository,
};
use goose::MigrationRunner;
use std::sync::Arc;
use tracing::{info, warn};

/// Every storage collaborator the pipeline needs, over one backend
#[derive(Clone)]
pub struct Repositories {
    pub identities: Arc<dyn DeviceIdentityRepository>,
    pub readings: Arc<dyn SensorReadingRepository>,
    pub rules: Arc<dyn AlertRuleRepository>,
    pub heartbeats: Arc<dyn HeartbeatRepository>,
    pub webhook: Arc<dyn WebhookConfigRepository>,
}

impl Repositories {
    pub fn postgres(client: PostgresClient) -> Self {
        Self {
            identities: Arc::new(PostgresDeviceIdentityRepository::new(client.clone())),
            readings: Arc::new(PostgresSensorReadingRepository::new(client.clone())),
            rules: Arc::new(PostgresAlertRuleRepository::new(client.clone())),
            heartbeats: Arc::new(PostgresHeartbeatRepository::new(client.clone())),
            webhook: Arc::new(PostgresWebhookConfigRepository::new(client)),
        }
    }

    pub fn memory(store: InMemoryStore) -> Self {
        Self {
            identities: Arc::new(store.clone()),
            readings: Arc::new(store.clone()),
            rules: Arc::new(store.clone()),
            heartbeats: Arc::new(store.clone()),
            webhook: Arc::new(store),
        }
    }
}

pub async fn initialize_repositories(config: &ServiceConfig) -> anyhow::Result<Repositories> {
    match config.storage_backend {
        StorageBackend::Postgres => {
            info!("Initializing PostgreSQL...");
            let postgres = config.postgres_config();
            MigrationRunner::new(
                postgres.goose_binary_path.clone(),
                postgres.migrations_dir.clone(),
                "postgres",
                PostgresClient::dsn(&postgres),
            )
            .run_migrations()
            .await?;

            let client = PostgresClient::from_config(&postgres)?;
            client.ping().await?;
            Ok(Repositories::postgres(client))
        }
        StorageBackend::Memory => {
            warn!("Using in-memory storage; nothing survives a restart");
            Ok(Repositories::memory(InMemoryStore::new()))
        }
    }
}
