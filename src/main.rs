//! Driftwood binary entry point

use std::sync::Arc;

use driftwood::federation::{ContentEvent, PublicKeyCache};
use driftwood::{AppState, config};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How often expired public keys are dropped from the cache
const KEY_CACHE_PRUNE_INTERVAL_SECS: u64 = 600;

/// Application entry point
///
/// # Setup
/// 1. Initialize tracing/logging
/// 2. Load configuration from file and environment
/// 3. Initialize AppState (fatal on missing key material)
/// 4. Build Axum router
/// 5. Start background tasks (content events, key cache pruning)
/// 6. Start HTTP server
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Initialize tracing/logging
    let log_format =
        std::env::var("DRIFTWOOD__LOGGING__FORMAT").unwrap_or_else(|_| "pretty".to_string());

    if log_format == "json" {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "driftwood=info,tower_http=debug".into()),
            )
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "driftwood=info,tower_http=debug".into()),
            )
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    tracing::info!("Starting Driftwood...");

    // 2. Initialize metrics
    driftwood::metrics::init_metrics();

    // 3. Load configuration
    let config = config::AppConfig::load()?;
    tracing::info!(
        domain = %config.server.domain,
        protocol = %config.server.protocol,
        actor = %config.actor_id(),
        "Configuration loaded"
    );

    // 4. Initialize application state
    let runtime = AppState::new(config.clone()).await.inspect_err(|e| {
        tracing::error!(error = %e, "Startup failed");
    })?;
    let state = runtime.state;

    // 5. Build Axum router
    let app = driftwood::build_router(state.clone());

    // 6. Start background tasks
    spawn_content_event_task(runtime.content_events);
    spawn_key_cache_prune_task(state.key_cache.clone());

    // 7. Start HTTP server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);
    tracing::info!("Public URL: {}", config.server.base_url());

    axum::serve(listener, app).await?;

    Ok(())
}

/// Drain content activities
///
/// Their side effects belong to downstream consumers; here they are logged.
fn spawn_content_event_task(mut events: mpsc::Receiver<ContentEvent>) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            tracing::info!(
                activity_id = %event.activity_id,
                activity_type = %event.kind,
                actor = %event.actor_id,
                object = ?event.object.single_id(),
                recipients = event.recipients.len(),
                "Content activity received"
            );
        }

        tracing::debug!("Content event channel closed");
    });

    tracing::info!("Content event task spawned");
}

/// Spawn background key cache pruning task
fn spawn_key_cache_prune_task(key_cache: Arc<PublicKeyCache>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(
            KEY_CACHE_PRUNE_INTERVAL_SECS,
        ));

        // Consume the immediate first tick
        interval.tick().await;

        loop {
            interval.tick().await;
            key_cache.prune_expired().await;
        }
    });

    tracing::info!("Key cache prune task spawned");
}
