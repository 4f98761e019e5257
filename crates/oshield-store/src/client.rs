//! SurrealDB HTTP client.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};

/// SurrealDB connection configuration.
#[derive(Debug, Clone)]
pub struct SurrealConfig {
    /// Base URL of the SurrealDB HTTP endpoint
    pub url: String,
    pub user: String,
    pub pass: String,
    pub namespace: String,
    pub database: String,
    /// Request timeout
    pub timeout: Duration,
}

impl SurrealConfig {
    /// Create config from environment variables.
    ///
    /// Credentials have no defaults: a missing `SURREALDB_USER`/`SURREALDB_PASS`
    /// is a configuration error, not a silent fallback.
    pub fn from_env() -> StoreResult<Self> {
        let url = std::env::var("SURREALDB_URL").unwrap_or_else(|_| {
            let host =
                std::env::var("SURREALDB_HOST").unwrap_or_else(|_| "localhost".to_string());
            let port = std::env::var("SURREALDB_PORT").unwrap_or_else(|_| "8000".to_string());
            format!("http://{host}:{port}")
        });

        Ok(Self {
            url,
            user: std::env::var("SURREALDB_USER")
                .map_err(|_| StoreError::Config("SURREALDB_USER not set".to_string()))?,
            pass: std::env::var("SURREALDB_PASS")
                .map_err(|_| StoreError::Config("SURREALDB_PASS not set".to_string()))?,
            namespace: std::env::var("SURREALDB_NAMESPACE").unwrap_or_else(|_| "test".to_string()),
            database: std::env::var("SURREALDB_DB")
                .unwrap_or_else(|_| "occultashield".to_string()),
            timeout: Duration::from_secs(30),
        })
    }
}

/// One statement result from the `/sql` endpoint.
#[derive(Debug, Deserialize)]
struct SqlResponse {
    status: String,
    #[serde(default)]
    result: Value,
}

/// SurrealDB client over the stateless HTTP `/sql` endpoint.
///
/// Record ids are `table:id` strings; ids containing hyphens are backtick
/// quoted before being embedded in a statement so the parser does not read
/// them as arithmetic.
pub struct SurrealClient {
    http: Client,
    config: SurrealConfig,
    /// Serializes connect/liveness checks.
    connect_lock: Mutex<bool>,
}

impl SurrealClient {
    /// Create a client and verify the endpoint is reachable.
    pub async fn connect(config: SurrealConfig) -> StoreResult<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(StoreError::Network)?;

        let client = Self {
            http,
            config,
            connect_lock: Mutex::new(false),
        };
        client.ensure_connected().await?;
        Ok(client)
    }

    /// Create from environment variables.
    pub async fn from_env() -> StoreResult<Self> {
        Self::connect(SurrealConfig::from_env()?).await
    }

    /// Liveness check, serialized so concurrent reconnects do not stampede.
    pub async fn ensure_connected(&self) -> StoreResult<()> {
        let mut connected = self.connect_lock.lock().await;
        if *connected {
            // Cheap probe; a failure flips us back to reconnecting.
            match self.raw_query("RETURN 1;").await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    warn!("Store liveness check failed, reconnecting: {e}");
                    *connected = false;
                }
            }
        }

        self.raw_query("RETURN 1;").await.map_err(|e| {
            StoreError::Unavailable(format!("SurrealDB at {} unreachable: {e}", self.config.url))
        })?;
        *connected = true;
        info!(url = %self.config.url, ns = %self.config.namespace, db = %self.config.database, "Connected to SurrealDB");
        Ok(())
    }

    /// Execute raw SurrealQL and return the first statement's rows.
    async fn raw_query(&self, sql: &str) -> StoreResult<Vec<Value>> {
        let url = format!("{}/sql", self.config.url.trim_end_matches('/'));
        debug!(sql = %sql, "Executing store query");

        let response = self
            .http
            .post(&url)
            .basic_auth(&self.config.user, Some(&self.config.pass))
            .header("Accept", "application/json")
            .header("surreal-ns", &self.config.namespace)
            .header("surreal-db", &self.config.database)
            .body(sql.to_string())
            .send()
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(StoreError::query_failed("authentication rejected"));
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::query_failed(format!(
                "store returned {status}: {body}"
            )));
        }

        let results: Vec<SqlResponse> = response.json().await?;
        metrics::counter!("oshield_store_queries_total").increment(1);

        let mut rows = Vec::new();
        for statement in results {
            if statement.status != "OK" {
                return Err(StoreError::query_failed(format!(
                    "statement failed: {}",
                    statement.result
                )));
            }
            match statement.result {
                Value::Array(items) => rows.extend(items),
                Value::Null => {}
                other => rows.push(other),
            }
        }
        Ok(rows)
    }

    /// Execute a query with named variables bound via `LET` statements.
    pub async fn query(&self, sql: &str, vars: &[(&str, Value)]) -> StoreResult<Vec<Value>> {
        let mut statement = String::new();
        for (name, value) in vars {
            statement.push_str(&format!("LET ${name} = {};\n", serde_json::to_string(value)?));
        }
        statement.push_str(sql);
        let rows = self.raw_query(&statement).await?;
        Ok(rows)
    }

    /// Create a record in a table. Returns the created row.
    pub async fn create(&self, table: &str, record: &Value) -> StoreResult<Value> {
        let sql = format!("CREATE {table} CONTENT {};", serde_json::to_string(record)?);
        let rows = self.raw_query(&sql).await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StoreError::query_failed(format!("CREATE {table} returned no record")))
    }

    /// Select a record by `table:id`. Returns `None` when absent.
    pub async fn select(&self, record_id: &str) -> StoreResult<Option<Value>> {
        let sql = format!("SELECT * FROM {};", quote_record_id(record_id));
        let rows = self.raw_query(&sql).await?;
        Ok(rows.into_iter().next())
    }

    /// Merge a patch into an existing record.
    pub async fn merge(&self, record_id: &str, patch: &Value) -> StoreResult<Option<Value>> {
        let sql = format!(
            "UPDATE {} MERGE {};",
            quote_record_id(record_id),
            serde_json::to_string(patch)?
        );
        let rows = self.raw_query(&sql).await?;
        Ok(rows.into_iter().next())
    }

    /// Delete a record.
    pub async fn delete(&self, record_id: &str) -> StoreResult<()> {
        let sql = format!("DELETE {};", quote_record_id(record_id));
        self.raw_query(&sql).await?;
        Ok(())
    }
}

/// Quote the id part of a `table:id` reference when it would otherwise be
/// parsed as arithmetic (hyphens).
pub fn quote_record_id(record_id: &str) -> String {
    match record_id.split_once(':') {
        Some((table, id)) if id.contains('-') && !id.starts_with('`') => {
            format!("{table}:`{id}`")
        }
        _ => record_id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(url: &str) -> SurrealConfig {
        SurrealConfig {
            url: url.to_string(),
            user: "root".to_string(),
            pass: "root".to_string(),
            namespace: "test".to_string(),
            database: "occultashield".to_string(),
            timeout: Duration::from_secs(5),
        }
    }

    fn ok_body(result: serde_json::Value) -> serde_json::Value {
        serde_json::json!([{ "time": "1ms", "status": "OK", "result": result }])
    }

    #[test]
    fn test_quote_record_id() {
        assert_eq!(
            quote_record_id("video:vid-ab-12"),
            "video:`vid-ab-12`"
        );
        assert_eq!(quote_record_id("video:vid_ab12"), "video:vid_ab12");
        assert_eq!(quote_record_id("plain"), "plain");
    }

    #[tokio::test]
    async fn test_connect_runs_liveness_check() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sql"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body(serde_json::json!([1]))))
            .expect(1..)
            .mount(&server)
            .await;

        let client = SurrealClient::connect(test_config(&server.uri())).await;
        assert!(client.is_ok());
    }

    #[tokio::test]
    async fn test_select_missing_record_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sql"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body(serde_json::json!([]))))
            .mount(&server)
            .await;

        let client = SurrealClient::connect(test_config(&server.uri()))
            .await
            .unwrap();
        let row = client.select("video:missing").await.unwrap();
        assert!(row.is_none());
    }

    #[tokio::test]
    async fn test_statement_error_surfaces() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sql"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                { "time": "1ms", "status": "OK", "result": [1] }
            ])))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/sql"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                { "time": "1ms", "status": "ERR", "result": "parse error" }
            ])))
            .mount(&server)
            .await;

        let client = SurrealClient::connect(test_config(&server.uri()))
            .await
            .unwrap();
        let result = client.select("video:x").await;
        assert!(matches!(result, Err(StoreError::QueryFailed { .. })));
    }

    #[tokio::test]
    async fn test_missing_credentials_is_config_error() {
        std::env::remove_var("SURREALDB_USER");
        std::env::remove_var("SURREALDB_PASS");
        let result = SurrealConfig::from_env();
        assert!(matches!(result, Err(StoreError::Config(_))));
    }
}
