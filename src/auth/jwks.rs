//! # Signing Key Cache
//!
//! Public keys are fetched from `{issuer}/oauth2/v2/keys/verificationjwk` and
//! cached per (issuer, key id) for a fixed TTL.
//!
//! ## Concurrency:
//! - Lookups take a read lock on the key map and never wait on the network.
//! - A cache miss takes a per-key async mutex before fetching, so concurrent
//!   validations of tokens signed with the same key trigger exactly one fetch.
//!   Whoever waited re-checks the map after acquiring the mutex.
//!
//! ## Failure handling:
//! When the endpoint answers 429 or cannot be reached, an expired key for the
//! same identity is reused rather than failing the request.

use super::AuthError;
use jsonwebtoken::DecodingKey;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Default key lifetime (60 minutes).
pub const DEFAULT_KEY_TTL: Duration = Duration::from_secs(60 * 60);

type KeyId = (String, String);

#[derive(Debug, Deserialize)]
struct JwkSet {
    #[serde(default)]
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    kid: Option<String>,
    kty: String,
    n: Option<String>,
    e: Option<String>,
}

#[derive(Clone)]
struct CachedKey {
    key: DecodingKey,
    fetched_at: Instant,
}

enum FetchFailure {
    /// 429 or transport error: stale keys may stand in
    Transient(String),
    Permanent(String),
}

/// Lazily populated cache of identity-broker signing keys.
pub struct KeyCache {
    http: reqwest::Client,
    ttl: Duration,
    keys: RwLock<HashMap<KeyId, CachedKey>>,
    in_flight: Mutex<HashMap<KeyId, Arc<Mutex<()>>>>,
}

impl KeyCache {
    pub fn new(http: reqwest::Client, ttl: Duration) -> Self {
        Self {
            http,
            ttl,
            keys: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Return the verification key for `(issuer, kid)`, fetching it if needed.
    pub async fn get(&self, issuer: &str, kid: &str) -> Result<DecodingKey, AuthError> {
        let id: KeyId = (issuer.to_string(), kid.to_string());

        if let Some(key) = self.fresh(&id).await {
            return Ok(key);
        }

        let flight = {
            let mut in_flight = self.in_flight.lock().await;
            in_flight.entry(id.clone()).or_default().clone()
        };
        let _guard = flight.lock().await;

        // Another task may have finished the fetch while we waited
        if let Some(key) = self.fresh(&id).await {
            return Ok(key);
        }

        let result = match self.fetch(issuer).await {
            Ok(set) => {
                self.store(issuer, set).await;
                match self.fresh(&id).await {
                    Some(key) => Ok(key),
                    None => Err(AuthError::UnknownKey {
                        issuer: issuer.to_string(),
                        kid: kid.to_string(),
                    }),
                }
            }
            Err(FetchFailure::Transient(reason)) => match self.keys.read().await.get(&id) {
                Some(stale) => {
                    warn!(issuer, kid, %reason, "Key endpoint unavailable, using expired cached key");
                    Ok(stale.key.clone())
                }
                None => Err(AuthError::KeyFetch(reason)),
            },
            Err(FetchFailure::Permanent(reason)) => Err(AuthError::KeyFetch(reason)),
        };

        self.in_flight.lock().await.remove(&id);
        result
    }

    async fn fresh(&self, id: &KeyId) -> Option<DecodingKey> {
        let keys = self.keys.read().await;
        keys.get(id)
            .filter(|cached| cached.fetched_at.elapsed() < self.ttl)
            .map(|cached| cached.key.clone())
    }

    async fn fetch(&self, issuer: &str) -> Result<JwkSet, FetchFailure> {
        let url = format!("{}/oauth2/v2/keys/verificationjwk", issuer.trim_end_matches('/'));
        debug!(%url, "Fetching signing keys");

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| FetchFailure::Transient(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(FetchFailure::Transient("key endpoint rate limited".to_string()));
        }
        if !status.is_success() {
            return Err(FetchFailure::Permanent(format!("key endpoint returned HTTP {}", status)));
        }

        response
            .json::<JwkSet>()
            .await
            .map_err(|e| FetchFailure::Permanent(format!("invalid key set: {}", e)))
    }

    async fn store(&self, issuer: &str, set: JwkSet) {
        let now = Instant::now();
        let mut keys = self.keys.write().await;
        let mut stored = 0;
        for jwk in set.keys {
            if jwk.kty != "RSA" {
                continue;
            }
            let (Some(kid), Some(n), Some(e)) = (jwk.kid, jwk.n, jwk.e) else {
                continue;
            };
            match DecodingKey::from_rsa_components(&n, &e) {
                Ok(key) => {
                    keys.insert((issuer.to_string(), kid), CachedKey { key, fetched_at: now });
                    stored += 1;
                }
                Err(err) => warn!(issuer, %kid, error = %err, "Skipping unusable signing key"),
            }
        }
        info!(issuer, stored, "Signing keys cached");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::testkit;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const KEY_PATH: &str = "/idb/oauth2/v2/keys/verificationjwk";

    fn cache(ttl: Duration) -> KeyCache {
        KeyCache::new(reqwest::Client::new(), ttl)
    }

    #[tokio::test]
    async fn test_fetches_once_and_caches() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(KEY_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(testkit::jwks_body("k1")))
            .expect(1)
            .mount(&server)
            .await;

        let keys = cache(DEFAULT_KEY_TTL);
        let issuer = format!("{}/idb", server.uri());
        assert!(keys.get(&issuer, "k1").await.is_ok());
        assert!(keys.get(&issuer, "k1").await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(KEY_PATH))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(testkit::jwks_body("k1"))
                    .set_delay(Duration::from_millis(100)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let keys = Arc::new(cache(DEFAULT_KEY_TTL));
        let issuer = format!("{}/idb", server.uri());
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let keys = keys.clone();
                let issuer = issuer.clone();
                tokio::spawn(async move { keys.get(&issuer, "k1").await.is_ok() })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_unknown_kid() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(KEY_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(testkit::jwks_body("k1")))
            .mount(&server)
            .await;

        let issuer = format!("{}/idb", server.uri());
        let err = cache(DEFAULT_KEY_TTL).get(&issuer, "other").await.err().unwrap();
        assert_eq!(err.kind(), "unknown_key");
    }

    #[tokio::test]
    async fn test_rate_limit_falls_back_to_stale_key() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(KEY_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(testkit::jwks_body("k1")))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(KEY_PATH))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        // Zero TTL: every lookup after the first is a refetch
        let keys = cache(Duration::ZERO);
        let issuer = format!("{}/idb", server.uri());
        assert!(keys.get(&issuer, "k1").await.is_ok());
        assert!(keys.get(&issuer, "k1").await.is_ok());
    }

    #[tokio::test]
    async fn test_rate_limit_without_cache_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(KEY_PATH))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let issuer = format!("{}/idb", server.uri());
        let err = cache(DEFAULT_KEY_TTL).get(&issuer, "k1").await.err().unwrap();
        assert_eq!(err.kind(), "key_fetch_failed");
    }

    #[tokio::test]
    async fn test_server_error_does_not_use_stale_key() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(KEY_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(testkit::jwks_body("k1")))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(KEY_PATH))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let keys = cache(Duration::ZERO);
        let issuer = format!("{}/idb", server.uri());
        assert!(keys.get(&issuer, "k1").await.is_ok());
        assert!(keys.get(&issuer, "k1").await.is_err());
    }
}
