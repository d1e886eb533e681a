//! Common test utilities for E2E tests

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response};
use driftwood::data::RelationshipState;
use driftwood::federation::signature::{main_key_id, sign_request_at};
use driftwood::federation::{Activity, OutboundRequest, StaticKeyResolver};
use driftwood::{AppState, config};
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use tempfile::TempDir;
use tower::ServiceExt;

pub const LOCAL_ACTOR: &str = "https://local.example/users/alice";
pub const BOB: &str = "https://remote.invalid/users/bob";
pub const CAROL: &str = "https://remote.invalid/users/carol";

/// PEM keypair (private, public)
pub struct TestKeys {
    pub private_key_pem: String,
    pub public_key_pem: String,
}

fn generate_keys() -> TestKeys {
    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, 1024).unwrap();
    let public_key = RsaPublicKey::from(&private_key);

    TestKeys {
        private_key_pem: private_key
            .to_pkcs8_pem(LineEnding::LF)
            .unwrap()
            .to_string(),
        public_key_pem: public_key.to_public_key_pem(LineEnding::LF).unwrap(),
    }
}

/// Keys for the local actor, bob and carol, generated once per test binary
pub fn keys() -> &'static [TestKeys; 3] {
    static KEYS: OnceLock<[TestKeys; 3]> = OnceLock::new();
    KEYS.get_or_init(|| [generate_keys(), generate_keys(), generate_keys()])
}

fn remote_keys(actor_id: &str) -> &'static TestKeys {
    match actor_id {
        BOB => &keys()[1],
        CAROL => &keys()[2],
        other => panic!("no test keys for {other}"),
    }
}

/// Test server instance
pub struct TestServer {
    pub state: AppState,
    pub router: axum::Router,
    pub _temp_dir: TempDir,
}

impl TestServer {
    /// Create a new test server instance
    ///
    /// Inbound keys for bob and carol resolve locally; nothing is fetched.
    pub async fn new() -> Self {
        driftwood::metrics::init_metrics();

        // Create temporary directory for test database
        let temp_dir = TempDir::new().unwrap();

        let config = config::AppConfig {
            server: config::ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
                domain: "local.example".to_string(),
                protocol: "https".to_string(),
            },
            database: config::DatabaseConfig {
                path: temp_dir.path().join("test.db"),
            },
            actor: config::ActorConfig {
                username: "alice".to_string(),
                private_key_path: temp_dir.path().join("unused.pem"),
            },
            federation: config::FederationConfig {
                user_agent: "Driftwood/test".to_string(),
                signature_window_seconds: 300,
                key_cache_ttl_seconds: 3600,
                key_fetch_timeout_seconds: 2,
                key_fetch_attempts: 1,
                allow_private_hosts: false,
            },
            queue: config::QueueConfig {
                partitions: 2,
                capacity: 16,
            },
            logging: config::LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        };

        let resolver = StaticKeyResolver::new()
            .with_key(main_key_id(BOB), BOB, keys()[1].public_key_pem.clone())
            .with_key(main_key_id(CAROL), CAROL, keys()[2].public_key_pem.clone());

        let runtime = AppState::assemble(
            config,
            keys()[0].private_key_pem.clone(),
            Some(Arc::new(resolver)),
        )
        .await
        .unwrap();

        // Content events have no consumer in tests
        let mut content_events = runtime.content_events;
        tokio::spawn(async move { while content_events.recv().await.is_some() {} });

        let router = driftwood::build_router(runtime.state.clone());

        Self {
            state: runtime.state,
            router,
            _temp_dir: temp_dir,
        }
    }

    /// Send a request through the router
    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }

    /// POST an activity signed by its actor's key
    pub async fn post_signed(&self, path: &str, activity: &Activity) -> Response<Body> {
        let actor_id = activity.actor_id().unwrap();
        self.send(signed_request(path, actor_id, &activity.to_bytes()))
            .await
    }

    /// Current state of a pair, polled until it equals `expected` or time runs out
    pub async fn wait_for_state(
        &self,
        source: &str,
        target: &str,
        expected: RelationshipState,
    ) -> RelationshipState {
        let mut state = RelationshipState::Absent;
        for _ in 0..100 {
            let row = self.state.db.get_relationship(source, target).await.unwrap();
            state = RelationshipState::of(row.as_ref());
            if state == expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        state
    }
}

/// Inbox POST signed by `actor_id`, the way a remote server would send it
pub fn signed_request(path: &str, actor_id: &str, body: &[u8]) -> Request<Body> {
    signed_request_at(path, actor_id, body, chrono::Utc::now())
}

pub fn signed_request_at(
    path: &str,
    actor_id: &str,
    body: &[u8],
    now: chrono::DateTime<chrono::Utc>,
) -> Request<Body> {
    let keys = remote_keys(actor_id);
    let headers = sign_request_at(
        &OutboundRequest {
            actor_id,
            private_key_pem: &keys.private_key_pem,
            method: "POST",
            host: "local.example",
            path,
            body: Some(body),
            content_type: Some("application/activity+json"),
            user_agent: "Remote/1.0",
        },
        now,
    )
    .unwrap();

    Request::post(path)
        .header("host", "local.example")
        .header("content-type", "application/activity+json")
        .header("user-agent", "Remote/1.0")
        .header("date", headers.date)
        .header("digest", headers.digest.unwrap())
        .header("signature", headers.signature)
        .body(Body::from(body.to_vec()))
        .unwrap()
}

/// Read a response body as JSON
pub async fn json_body(response: Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
