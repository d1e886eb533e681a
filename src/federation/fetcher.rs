//! Remote actor document fetching
//!
//! Used for key resolution and for finding delivery inboxes.
//! Local and private destinations are refused unless explicitly allowed.

use std::net::IpAddr;
use std::time::Duration;

use super::signature::key_document_url;
use super::streams::{ActorRecord, Resource};
use crate::config::FederationConfig;
use crate::error::AppError;

/// First retry delay; doubles per attempt
const INITIAL_BACKOFF: Duration = Duration::from_millis(250);

const ACTIVITY_JSON: &str = "application/activity+json";

/// How actor documents are fetched
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    pub timeout: Duration,
    pub attempts: u32,
    /// Skip the loopback/private address checks
    pub allow_private_hosts: bool,
}

impl From<&FederationConfig> for FetchPolicy {
    fn from(config: &FederationConfig) -> Self {
        Self {
            timeout: config.key_fetch_timeout(),
            attempts: config.key_fetch_attempts.max(1),
            allow_private_hosts: config.allow_private_hosts,
        }
    }
}

/// Fetches and decodes actor documents
#[derive(Clone)]
pub struct ActorFetcher {
    http_client: reqwest::Client,
    policy: FetchPolicy,
}

enum FetchError {
    Retryable(AppError),
    Fatal(AppError),
}

impl ActorFetcher {
    pub fn new(http_client: reqwest::Client, policy: FetchPolicy) -> Self {
        Self {
            http_client,
            policy,
        }
    }

    /// Fetch the actor document at `actor_id` (any fragment is ignored)
    ///
    /// Transport failures and 5xx responses are retried with doubling
    /// backoff, up to the configured number of attempts.
    pub async fn fetch(&self, actor_id: &str) -> Result<ActorRecord, AppError> {
        let actor_url = validate_actor_url(actor_id, self.policy.allow_private_hosts)?;

        if !self.policy.allow_private_hosts {
            let host = actor_url
                .host_str()
                .ok_or_else(|| AppError::Validation("Missing host in actor URL".to_string()))?;
            let port = actor_url
                .port_or_known_default()
                .ok_or_else(|| AppError::Validation("Missing port in actor URL".to_string()))?;
            validate_resolved_host_ips(host, port).await?;
        }

        let mut backoff = INITIAL_BACKOFF;
        let mut attempt = 1;
        loop {
            match self.fetch_once(&actor_url).await {
                Ok(actor) => return Ok(actor),
                Err(FetchError::Retryable(e)) if attempt < self.policy.attempts => {
                    tracing::debug!(%actor_url, attempt, error = %e, "Actor fetch failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
                Err(FetchError::Retryable(e)) | Err(FetchError::Fatal(e)) => return Err(e),
            }
        }
    }

    async fn fetch_once(&self, actor_url: &url::Url) -> Result<ActorRecord, FetchError> {
        let response = self
            .http_client
            .get(actor_url.as_str())
            .header("Accept", ACTIVITY_JSON)
            .timeout(self.policy.timeout)
            .send()
            .await
            .map_err(|e| FetchError::Retryable(AppError::HttpClient(e)))?;

        let status = response.status();
        if !status.is_success() {
            let error = AppError::Federation(format!("Failed to fetch actor: HTTP {}", status));
            return Err(if status.is_server_error() {
                FetchError::Retryable(error)
            } else {
                FetchError::Fatal(error)
            });
        }

        let document: serde_json::Value = response.json().await.map_err(|e| {
            FetchError::Fatal(AppError::Federation(format!("Failed to parse actor: {}", e)))
        })?;

        ActorRecord::decode(document).map_err(|e| FetchError::Fatal(AppError::Parse(e)))
    }
}

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

fn is_disallowed_host(host: &str) -> bool {
    let normalized = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    normalized
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

/// Actor document URL for an actor id or keyId
///
/// Rejects non-HTTP(S) URLs and, unless allowed, obvious local hosts.
fn validate_actor_url(actor_or_key_id: &str, allow_private_hosts: bool) -> Result<url::Url, AppError> {
    let parsed = url::Url::parse(key_document_url(actor_or_key_id))
        .map_err(|e| AppError::Validation(format!("Invalid actor URL: {}", e)))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::Validation(format!(
                "Unsupported actor URL scheme: {}",
                scheme
            )));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::Validation("Missing host in actor URL".to_string()))?;

    if !allow_private_hosts && is_disallowed_host(host) {
        return Err(AppError::Federation(format!(
            "Refusing to fetch actor from local host {}",
            host
        )));
    }

    Ok(parsed)
}

/// Resolve DNS before fetching and reject local/private destinations
async fn validate_resolved_host_ips(host: &str, port: u16) -> Result<(), AppError> {
    let normalized = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase();

    let mut resolved_any = false;
    let lookup = tokio::net::lookup_host((normalized.as_str(), port))
        .await
        .map_err(|e| AppError::Federation(format!("Failed to resolve actor host: {}", e)))?;

    for addr in lookup {
        resolved_any = true;
        if is_disallowed_ip(addr.ip()) {
            return Err(AppError::Federation(format!(
                "Actor host {} resolves to a private address",
                host
            )));
        }
    }

    if !resolved_any {
        return Err(AppError::Federation(
            "No DNS records for actor host".to_string(),
        ));
    }

    Ok(())
}
