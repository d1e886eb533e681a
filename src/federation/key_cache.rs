//! Public Key Caching
//!
//! Caches remote actor public keys to reduce remote requests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::sync::RwLock;

use super::fetcher::ActorFetcher;
use super::streams::ActorRecord;
use super::verifier::{KeyResolver, ResolvedKey};
use crate::error::{AppError, AuthError};
use crate::metrics::KEY_CACHE_LOOKUPS_TOTAL;

/// Cached public key entry
#[derive(Debug, Clone)]
struct CachedKey {
    /// PEM-encoded public key
    pem: String,
    /// Actor the key belongs to
    owner: String,
    /// When this entry was cached
    cached_at: Instant,
    ttl: Duration,
}

impl CachedKey {
    /// Check if this cache entry is still valid
    fn is_valid(&self) -> bool {
        self.cached_at.elapsed() < self.ttl
    }
}

/// Public key cache
///
/// Thread-safe cache for remote actor public keys, shared by all inbox
/// workers. Entries expire after the TTL and are dropped early when a
/// signature made with them fails to verify.
pub struct PublicKeyCache {
    /// Cache storage: key_id -> cached key
    cache: Arc<RwLock<HashMap<String, CachedKey>>>,
    fetcher: ActorFetcher,
    default_ttl: Duration,
}

impl PublicKeyCache {
    /// Create new public key cache
    ///
    /// # Arguments
    /// * `fetcher` - Fetches actor documents on a miss
    /// * `default_ttl` - TTL for cached keys
    pub fn new(fetcher: ActorFetcher, default_ttl: Duration) -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            fetcher,
            default_ttl,
        }
    }

    /// Get public key for a key ID
    ///
    /// Checks cache first, fetches from remote if not cached or expired.
    pub async fn get(&self, key_id: &str) -> Result<ResolvedKey, AuthError> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(key_id) {
                if cached.is_valid() {
                    tracing::debug!(%key_id, "Public key cache hit");
                    KEY_CACHE_LOOKUPS_TOTAL.with_label_values(&["hit"]).inc();
                    return Ok(ResolvedKey {
                        pem: cached.pem.clone(),
                        owner: cached.owner.clone(),
                        from_cache: true,
                    });
                }
                tracing::debug!(%key_id, "Public key cache entry expired");
            }
        }

        KEY_CACHE_LOOKUPS_TOTAL.with_label_values(&["miss"]).inc();
        let (owner, pem) = self.fetch_public_key(key_id).await.map_err(|e| {
            tracing::warn!(%key_id, error = %e, "Failed to resolve public key");
            KEY_CACHE_LOOKUPS_TOTAL
                .with_label_values(&["fetch_failed"])
                .inc();
            AuthError::UnknownActor(key_id.to_string())
        })?;

        self.insert(key_id, &owner, &pem).await;

        Ok(ResolvedKey {
            pem,
            owner,
            from_cache: false,
        })
    }

    /// Store a key directly
    pub async fn insert(&self, key_id: &str, owner: &str, pem: &str) {
        let mut cache = self.cache.write().await;
        cache.insert(
            key_id.to_string(),
            CachedKey {
                pem: pem.to_string(),
                owner: owner.to_string(),
                cached_at: Instant::now(),
                ttl: self.default_ttl,
            },
        );
    }

    /// Invalidate a cached key
    pub async fn invalidate(&self, key_id: &str) {
        let mut cache = self.cache.write().await;
        if cache.remove(key_id).is_some() {
            tracing::debug!(%key_id, "Invalidated public key cache entry");
        }
    }

    /// Get cache statistics
    pub async fn stats(&self) -> CacheStats {
        let cache = self.cache.read().await;
        let total = cache.len();
        let valid = cache.values().filter(|v| v.is_valid()).count();

        CacheStats {
            total_entries: total,
            expired_entries: total - valid,
        }
    }

    /// Prune expired entries
    ///
    /// Called periodically from a background task.
    pub async fn prune_expired(&self) -> usize {
        let mut cache = self.cache.write().await;
        let before = cache.len();
        cache.retain(|_, v| v.is_valid());
        let removed = before - cache.len();

        if removed > 0 {
            tracing::info!(removed, "Pruned expired public key cache entries");
        }
        removed
    }

    /// (owner, PEM) for a keyId
    async fn fetch_public_key(&self, key_id: &str) -> Result<(String, String), AppError> {
        let actor = self.fetcher.fetch(key_id).await?;
        advertised_key(&actor, key_id)
    }
}

impl KeyResolver for PublicKeyCache {
    fn resolve<'a>(&'a self, key_id: &'a str) -> BoxFuture<'a, Result<ResolvedKey, AuthError>> {
        Box::pin(self.get(key_id))
    }

    fn invalidate<'a>(&'a self, key_id: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(PublicKeyCache::invalidate(self, key_id))
    }
}

/// Cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// Total number of entries
    pub total_entries: usize,
    /// Number of expired entries
    pub expired_entries: usize,
}

/// Read the advertised key and its owner
///
/// The document must advertise the key the keyId names (or the keyId is the
/// actor itself). The owner is taken from `publicKey.owner`, must be the
/// document's actor, and must live on the keyId's origin.
fn advertised_key(actor: &ActorRecord, key_id: &str) -> Result<(String, String), AppError> {
    let public_key = actor
        .public_key
        .as_ref()
        .ok_or_else(|| AppError::Federation("Missing publicKey in actor".to_string()))?;

    if public_key.id != key_id && actor.id != key_id {
        return Err(AppError::Federation(format!(
            "Actor advertises key {} instead of {}",
            public_key.id, key_id
        )));
    }

    let owner = if public_key.owner.is_empty() {
        actor.id.as_str()
    } else {
        public_key.owner.as_str()
    };
    if owner != actor.id {
        return Err(AppError::Federation(format!(
            "Key {} is owned by {}, not by {}",
            key_id, owner, actor.id
        )));
    }
    if !same_origin(owner, key_id) {
        return Err(AppError::Federation(format!(
            "Key {} is served from another origin than its owner {}",
            key_id, owner
        )));
    }

    Ok((owner.to_string(), public_key.public_key_pem.clone()))
}

fn same_origin(a: &str, b: &str) -> bool {
    match (url::Url::parse(a), url::Url::parse(b)) {
        (Ok(a), Ok(b)) => a.origin() == b.origin(),
        _ => false,
    }
}
