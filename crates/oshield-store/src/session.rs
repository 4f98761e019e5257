//! Session token verification with a TTL cache.
//!
//! Token validation itself belongs to the auth collaborator; the pipeline
//! only needs `verify_token` and an ownership comparison on normalized user
//! ids. Verified tokens are cached for five minutes so the event-stream
//! endpoint does not hit the store on every reconnect.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::client::SurrealClient;
use crate::error::StoreResult;

/// How long a verified token stays cached.
const TOKEN_CACHE_TTL: Duration = Duration::from_secs(300);

/// Lazy eviction threshold: expired entries are swept once the cache grows
/// past this size.
const TOKEN_CACHE_MAX_ENTRIES: usize = 100;

/// User resolved from a session token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
}

struct CacheEntry {
    verified_at: Instant,
    user: Option<AuthenticatedUser>,
}

impl CacheEntry {
    fn is_fresh(&self) -> bool {
        self.verified_at.elapsed() < TOKEN_CACHE_TTL
    }
}

/// Verifies bearer tokens against the session table, with caching.
pub struct SessionVerifier {
    client: Arc<SurrealClient>,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl SessionVerifier {
    pub fn new(client: Arc<SurrealClient>) -> Self {
        Self {
            client,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a token to its user, or `None` for an invalid/expired session.
    pub async fn verify_token(&self, token: &str) -> StoreResult<Option<AuthenticatedUser>> {
        {
            let cache = self.cache.lock().await;
            if let Some(entry) = cache.get(token) {
                if entry.is_fresh() {
                    debug!("Token verified from cache");
                    return Ok(entry.user.clone());
                }
            }
        }

        let rows = self
            .client
            .query(
                "SELECT user_id, display_name FROM session \
                 WHERE token = $session_token AND expires_at > time::now();",
                &[("session_token", Value::String(token.to_string()))],
            )
            .await?;

        let user = rows.first().map(|row| AuthenticatedUser {
            id: row
                .get("user_id")
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_default(),
            display_name: row
                .get("display_name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        });

        let mut cache = self.cache.lock().await;
        cache.insert(
            token.to_string(),
            CacheEntry {
                verified_at: Instant::now(),
                user: user.clone(),
            },
        );
        if cache.len() > TOKEN_CACHE_MAX_ENTRIES {
            cache.retain(|_, entry| entry.is_fresh());
        }

        Ok(user)
    }

    /// Drop every cached verification.
    pub async fn clear_cache(&self) {
        self.cache.lock().await.clear();
    }

    /// Number of cached entries (tests and diagnostics).
    pub async fn cache_len(&self) -> usize {
        self.cache.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::SurrealConfig;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client_for(server: &MockServer) -> Arc<SurrealClient> {
        let config = SurrealConfig {
            url: server.uri(),
            user: "root".to_string(),
            pass: "root".to_string(),
            namespace: "test".to_string(),
            database: "occultashield".to_string(),
            timeout: Duration::from_secs(5),
        };
        Arc::new(SurrealClient::connect(config).await.unwrap())
    }

    fn ok_body(result: serde_json::Value) -> serde_json::Value {
        serde_json::json!([{ "time": "1ms", "status": "OK", "result": result }])
    }

    #[tokio::test]
    async fn test_valid_token_cached() {
        let server = MockServer::start().await;
        // Connect liveness + one session lookup; subsequent lookups must hit
        // the cache, so cap the expected calls.
        Mock::given(method("POST"))
            .and(path("/sql"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body(serde_json::json!([
                {"user_id": "user:alice", "display_name": "Alice"}
            ]))))
            .expect(2)
            .mount(&server)
            .await;

        let verifier = SessionVerifier::new(client_for(&server).await);

        let first = verifier.verify_token("tok_1").await.unwrap();
        assert_eq!(first.as_ref().map(|u| u.id.as_str()), Some("user:alice"));

        let second = verifier.verify_token("tok_1").await.unwrap();
        assert_eq!(second, first);
        assert_eq!(verifier.cache_len().await, 1);
    }

    #[tokio::test]
    async fn test_invalid_token_is_none_and_cached() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sql"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(ok_body(serde_json::json!([]))),
            )
            .mount(&server)
            .await;

        let verifier = SessionVerifier::new(client_for(&server).await);
        let user = verifier.verify_token("tok_bad").await.unwrap();
        assert!(user.is_none());
        assert_eq!(verifier.cache_len().await, 1);
    }

    #[tokio::test]
    async fn test_clear_cache() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sql"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(ok_body(serde_json::json!([]))),
            )
            .mount(&server)
            .await;

        let verifier = SessionVerifier::new(client_for(&server).await);
        verifier.verify_token("tok_a").await.unwrap();
        verifier.clear_cache().await;
        assert_eq!(verifier.cache_len().await, 0);
    }
}
