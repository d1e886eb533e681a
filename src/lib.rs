//! Driftwood - an ActivityPub federation inbox
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - POST /inbox, POST /users/:username/inbox                 │
//! │  - GET /users/:username, /health, /metrics                  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ enqueue (202)
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Inbox Queue / Workers                      │
//! │  - partitioned by (source, target) actor pair               │
//! │  - verify HTTP Signature, then dispatch                     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - SQLite (sqlx): follow_relationships                      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers
//! - `federation`: signatures, ActivityStreams, queue, dispatch, delivery
//! - `data`: follow relationship storage
//! - `config`: Configuration management
//! - `error`: Error types
//! - `metrics`: Prometheus instruments

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use federation::{
    ActivityDelivery, ActivityDispatcher, ActorFetcher, ContentEvent, FetchPolicy, InboxProcessor,
    InboxQueue, KeyResolver, PublicKeyCache, SignatureVerifier,
};

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: Arc<data::Database>,

    /// Remote actor keys, shared by the inbox workers
    pub key_cache: Arc<PublicKeyCache>,

    /// Inbox queue handle
    pub queue: InboxQueue,

    /// Relationship state machine and local approve/reject paths
    pub dispatcher: Arc<ActivityDispatcher>,

    /// Public half of the local actor's key, served in the actor document
    pub public_key_pem: Arc<str>,
}

/// State plus the background pieces the binary has to drive
pub struct Runtime {
    pub state: AppState,
    /// One task per inbox partition
    pub workers: Vec<JoinHandle<()>>,
    /// Content activities (Create, Delete, Like, Announce) for downstream consumers
    pub content_events: mpsc::Receiver<ContentEvent>,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Read the local actor's private key
    /// 2. Connect to SQLite database
    /// 3. Build key cache, delivery and dispatcher
    /// 4. Start inbox workers
    ///
    /// # Errors
    /// Returns error if key material is missing or unusable, or the
    /// database cannot be opened
    pub async fn new(config: config::AppConfig) -> Result<Runtime, error::AppError> {
        let private_key_pem = config.load_private_key_pem()?;
        Self::assemble(config, private_key_pem, None).await
    }

    /// Initialize with explicit key material
    ///
    /// `key_resolver` replaces the fetching key cache for inbound
    /// verification when given.
    pub async fn assemble(
        config: config::AppConfig,
        private_key_pem: String,
        key_resolver: Option<Arc<dyn KeyResolver>>,
    ) -> Result<Runtime, error::AppError> {
        use rsa::RsaPublicKey;
        use rsa::pkcs8::{EncodePublicKey, LineEnding};

        tracing::info!("Initializing application state...");
        config.validate()?;

        // 1. Key material
        let private_key = federation::signature::parse_private_key(&private_key_pem)?;
        let public_key_pem = RsaPublicKey::from(&private_key)
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| error::AppError::Config(format!("cannot encode public key: {}", e)))?;

        // 2. Database
        let db = Arc::new(data::Database::connect(&config.database.path).await?);
        tracing::info!("Database connected");

        // 3. Federation services
        let http_client = reqwest::Client::builder()
            .user_agent(config.federation.user_agent.as_str())
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| error::AppError::Internal(e.into()))?;

        let fetcher = ActorFetcher::new(http_client.clone(), FetchPolicy::from(&config.federation));
        let key_cache = Arc::new(PublicKeyCache::new(
            fetcher.clone(),
            config.federation.key_cache_ttl(),
        ));

        let actor_id = config.actor_id();
        let delivery = Arc::new(ActivityDelivery::new(
            http_client,
            fetcher,
            actor_id.clone(),
            private_key_pem,
            config.federation.user_agent.clone(),
        ));

        let (content_tx, content_events) = mpsc::channel(config.queue.capacity);
        let dispatcher = Arc::new(
            ActivityDispatcher::new(db.clone(), content_tx, actor_id.clone())
                .with_delivery(delivery),
        );

        // 4. Inbox workers
        let resolver: Arc<dyn KeyResolver> = match key_resolver {
            Some(resolver) => resolver,
            None => key_cache.clone() as Arc<dyn KeyResolver>,
        };
        let verifier = SignatureVerifier::new(resolver, config.federation.signature_window());
        let processor = Arc::new(InboxProcessor::new(verifier, dispatcher.clone()));
        let (queue, workers) = InboxQueue::start(
            processor,
            db.clone(),
            config.queue.partitions,
            config.queue.capacity,
        );

        tracing::info!(%actor_id, "Application state initialized successfully");

        Ok(Runtime {
            state: Self {
                config: Arc::new(config),
                db,
                key_cache,
                queue,
                dispatcher,
                public_key_pem: Arc::from(public_key_pem),
            },
            workers,
            content_events,
        })
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::trace::TraceLayer;

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::activitypub_router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
        .merge(api::metrics_router())
}

async fn health_check(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> axum::Json<serde_json::Value> {
    let cache = state.key_cache.stats().await;

    axum::Json(serde_json::json!({
        "status": "ok",
        "queue_partitions": state.queue.partitions(),
        "key_cache": {
            "entries": cache.total_entries,
            "expired": cache.expired_entries,
        },
    }))
}
