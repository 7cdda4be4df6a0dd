use crate::broadcast::ChannelBroadcaster;
use crate::domain::WebhookIngestionService;
use crate::http::{run_http_server, AppState, HttpServerConfig};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct IngestionApi {
    state: AppState,
    config: HttpServerConfig,
}

impl IngestionApi {
    pub fn new(
        ingestion: Arc<WebhookIngestionService>,
        broadcaster: ChannelBroadcaster,
        config: HttpServerConfig,
    ) -> Self {
        debug!("Initializing ingestion API module");
        let state = AppState {
            ingestion,
            broadcaster,
            webhook_path: config.webhook_path.clone(),
        };
        Self { state, config }
    }

    pub fn into_runner_process(
        self,
    ) -> impl FnOnce(
        CancellationToken,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send>,
    > {
        move |ctx| Box::pin(async move { run_http_server(self.config, self.state, ctx).await })
    }
}
