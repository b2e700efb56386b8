//! Service entry point: wire the stores, supervisor, and session hub, then
//! serve the WebSocket endpoint until ctrl-c.

use std::future::IntoFuture;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use onebox::bus::EventBus;
use onebox::classify::{Classifier, KeywordClassifier, RemoteClassifier, RemoteClassifierConfig};
use onebox::config::SyncSettings;
use onebox::credentials::{RefreshEndpoint, TokenStore};
use onebox::index::MemoryIndex;
use onebox::pipeline::IngestionPipeline;
use onebox::supervisor::Supervisor;
use onebox::ws::{SessionHub, StaticTokenVerifier};
use onebox::OneboxError;

#[tokio::main]
async fn main() -> Result<(), OneboxError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("onebox=info")),
        )
        .init();

    let settings = SyncSettings::from_env();
    info!(?settings, "Starting onebox sync core");

    let classifier: Arc<dyn Classifier> = match std::env::var("CLASSIFIER_URL") {
        Ok(url) if !url.is_empty() => {
            let model = std::env::var("CLASSIFIER_MODEL")
                .unwrap_or_else(|_| RemoteClassifierConfig::default().model);
            info!(%url, %model, "Using remote classifier");
            Arc::new(RemoteClassifier::new(RemoteClassifierConfig { url, model }))
        }
        _ => {
            info!("No classifier endpoint configured, using keyword fallback");
            Arc::new(KeywordClassifier)
        }
    };

    let refresh_endpoint = match std::env::var("TOKEN_URL") {
        Ok(token_url) if !token_url.is_empty() => Some(RefreshEndpoint {
            token_url,
            client_id: std::env::var("CLIENT_ID")
                .map_err(|_| OneboxError::Config("TOKEN_URL set but CLIENT_ID missing".into()))?,
            client_secret: std::env::var("CLIENT_SECRET").ok(),
        }),
        _ => None,
    };

    let credentials = Arc::new(TokenStore::new(refresh_endpoint));
    let index = Arc::new(MemoryIndex::new());
    let bus = Arc::new(EventBus::new());
    let pipeline = Arc::new(IngestionPipeline::new(index, classifier, bus.clone()));
    let supervisor = Supervisor::new(settings.clone(), credentials, pipeline, bus.clone());

    let verifier = Arc::new(StaticTokenVerifier::from_env());
    let hub = SessionHub::new(verifier, supervisor.clone(), settings.clone());
    hub.start(&bus);

    let listener = tokio::net::TcpListener::bind(&settings.bind_addr)
        .await
        .map_err(|e| OneboxError::Config(format!("cannot bind {}: {}", settings.bind_addr, e)))?;
    info!(addr = %settings.bind_addr, "WebSocket endpoint listening on /ws");

    let server = axum::serve(listener, hub.router()).into_future();
    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!(error = %e, "Server failed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    // Agents stop first so final status frames reach clients before the
    // sockets close.
    supervisor.shutdown().await;
    hub.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}
