//! Neo4j HTTP client with TTL-cached GDPR context retrieval.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{GraphError, GraphResult};
use crate::queries;

/// How long retrieved contexts stay cached.
const CONTEXT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Static triage context used whenever the graph is unreachable or empty.
const FALLBACK_CONTEXT: [&str; 3] = [
    "**GDPR Article 5 - Principles**\nPersonal data shall be processed lawfully, fairly and transparently.",
    "**GDPR Article 6 - Lawfulness**\nProcessing is lawful only with consent or legal basis.",
    "**GDPR Article 9 - Special Categories**\nBiometric data processing is prohibited unless exceptions apply.",
];

/// Keyword expansion per detected object for the keyword search channel.
fn keyword_expansion(object: &str) -> &'static [&'static str] {
    match object {
        "face" => &["biometric", "facial", "special categories", "consent"],
        "person" => &["personal data", "data subject", "processing"],
        "license_plate" => &["vehicle", "identification", "personal data"],
        "text" => &["sensitive", "processing", "personal data"],
        _ => &[],
    }
}

/// Knowledge graph connection configuration.
#[derive(Debug, Clone)]
pub struct GraphConfig {
    pub uri: String,
    pub user: String,
    pub password: String,
    pub database: String,
    pub timeout: Duration,
}

impl GraphConfig {
    /// Create config from environment variables. The graph is an optional
    /// dependency, so everything has a default.
    pub fn from_env() -> Self {
        Self {
            uri: std::env::var("NEO4J_URI")
                .unwrap_or_else(|_| "http://localhost:7474".to_string()),
            user: std::env::var("NEO4J_USER").unwrap_or_else(|_| "neo4j".to_string()),
            password: std::env::var("NEO4J_PASSWORD").unwrap_or_else(|_| "password".to_string()),
            database: std::env::var("NEO4J_DATABASE").unwrap_or_else(|_| "neo4j".to_string()),
            timeout: Duration::from_secs(15),
        }
    }
}

/// One GDPR article as retrieved for a detection type.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GdprArticle {
    #[serde(default)]
    pub article_number: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub fine_tier: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub related_recitals: Vec<String>,
    #[serde(default)]
    pub related_concepts: Vec<String>,
    #[serde(default)]
    pub recommended_actions: Vec<String>,
}

/// Fine tier information for one article.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FineInfo {
    #[serde(default)]
    pub tier: String,
    #[serde(default)]
    pub max_amount: String,
    #[serde(default)]
    pub description: String,
}

enum CacheValue {
    Articles(Vec<GdprArticle>),
    Snippets(Vec<String>),
}

struct CacheEntry {
    stored_at: Instant,
    value: CacheValue,
}

impl CacheEntry {
    fn is_fresh(&self) -> bool {
        self.stored_at.elapsed() < CONTEXT_CACHE_TTL
    }
}

/// GDPR knowledge graph client.
pub struct GraphClient {
    http: Client,
    config: GraphConfig,
    cache: RwLock<HashMap<String, CacheEntry>>,
}

impl GraphClient {
    pub fn new(config: GraphConfig) -> GraphResult<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(GraphError::Network)?;
        Ok(Self {
            http,
            config,
            cache: RwLock::new(HashMap::new()),
        })
    }

    pub fn from_env() -> GraphResult<Self> {
        Self::new(GraphConfig::from_env())
    }

    /// Drop every cached context.
    pub async fn clear_cache(&self) {
        self.cache.write().await.clear();
    }

    /// Run one Cypher statement, returning rows as column-name → value maps.
    async fn run_cypher(
        &self,
        statement: &str,
        parameters: Value,
    ) -> GraphResult<Vec<HashMap<String, Value>>> {
        let url = format!(
            "{}/db/{}/tx/commit",
            self.config.uri.trim_end_matches('/'),
            self.config.database
        );
        let body = json!({
            "statements": [{ "statement": statement, "parameters": parameters }]
        });

        let response = self
            .http
            .post(&url)
            .basic_auth(&self.config.user, Some(&self.config.password))
            .json(&body)
            .send()
            .await?;

        let payload: Value = response.json().await?;
        metrics::counter!("oshield_graph_queries_total").increment(1);

        if let Some(error) = payload
            .get("errors")
            .and_then(Value::as_array)
            .and_then(|e| e.first())
        {
            return Err(GraphError::Cypher {
                code: error
                    .get("code")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            });
        }

        let mut rows = Vec::new();
        if let Some(result) = payload
            .get("results")
            .and_then(Value::as_array)
            .and_then(|r| r.first())
        {
            let columns: Vec<String> = result
                .get("columns")
                .and_then(Value::as_array)
                .map(|cols| {
                    cols.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();

            if let Some(data) = result.get("data").and_then(Value::as_array) {
                for item in data {
                    if let Some(row) = item.get("row").and_then(Value::as_array) {
                        let map = columns
                            .iter()
                            .cloned()
                            .zip(row.iter().cloned())
                            .collect::<HashMap<_, _>>();
                        rows.push(map);
                    }
                }
            }
        }
        Ok(rows)
    }

    /// Articles relevant to a detection type, cached per type.
    ///
    /// Degrades to the static triage context when the graph is unreachable.
    pub async fn context_for(&self, detection_type: &str) -> Vec<GdprArticle> {
        let cache_key = format!("context:{detection_type}");
        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(&cache_key) {
                if entry.is_fresh() {
                    if let CacheValue::Articles(articles) = &entry.value {
                        return articles.clone();
                    }
                }
            }
        }

        let articles = match self
            .run_cypher(
                queries::ARTICLES_FOR_DETECTION,
                json!({ "detection_type": detection_type }),
            )
            .await
        {
            Ok(rows) => rows.into_iter().map(row_to_article).collect::<Vec<_>>(),
            Err(e) => {
                warn!("Knowledge graph unavailable, using fallback context: {e}");
                fallback_articles()
            }
        };

        let articles = if articles.is_empty() {
            fallback_articles()
        } else {
            articles
        };

        self.cache.write().await.insert(
            cache_key,
            CacheEntry {
                stored_at: Instant::now(),
                value: CacheValue::Articles(articles.clone()),
            },
        );
        articles
    }

    /// Hybrid retrieval: full-text relevance plus keyword containment,
    /// deduplicated by title, capped at `k`, with the static fallback when
    /// nothing is reachable.
    pub async fn hybrid_search(
        &self,
        query: &str,
        detected_objects: &[String],
        k: usize,
    ) -> Vec<String> {
        let cache_key = format!("hybrid:{query}:{k}");
        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(&cache_key) {
                if entry.is_fresh() {
                    if let CacheValue::Snippets(snippets) = &entry.value {
                        return snippets.clone();
                    }
                }
            }
        }

        let mut context: Vec<String> = Vec::new();
        let mut seen_titles: HashSet<String> = HashSet::new();

        // Relevance channel over the full-text index.
        match self
            .run_cypher(
                queries::FULLTEXT_SEARCH,
                json!({ "query": query, "limit": k as i64 }),
            )
            .await
        {
            Ok(rows) => {
                for row in rows {
                    let title = string_field(&row, "title");
                    if seen_titles.insert(title.clone()) {
                        let score = row.get("score").and_then(Value::as_f64).unwrap_or(0.0);
                        context.push(format!(
                            "**{title}** [Relevance: {score:.2}]\n{}",
                            string_field(&row, "content")
                        ));
                    }
                }
            }
            Err(e) => debug!("Full-text search unavailable: {e}"),
        }

        // Keyword containment channel.
        let mut terms: HashSet<String> = HashSet::new();
        for object in detected_objects {
            terms.insert(object.to_lowercase());
            for term in keyword_expansion(&object.to_lowercase()) {
                terms.insert((*term).to_string());
            }
        }
        for term in terms {
            match self
                .run_cypher(queries::KEYWORD_SEARCH, json!({ "term": term }))
                .await
            {
                Ok(rows) => {
                    for row in rows {
                        let title = string_field(&row, "title");
                        if seen_titles.insert(title.clone()) {
                            context.push(format!(
                                "**{title}**\n{}",
                                string_field(&row, "content")
                            ));
                        }
                    }
                }
                Err(e) => {
                    debug!("Keyword search failed for term: {e}");
                    break;
                }
            }
        }

        if context.is_empty() {
            context = FALLBACK_CONTEXT.iter().map(|s| s.to_string()).collect();
        }
        context.truncate(k);

        self.cache.write().await.insert(
            cache_key,
            CacheEntry {
                stored_at: Instant::now(),
                value: CacheValue::Snippets(context.clone()),
            },
        );
        context
    }

    /// Vector similarity search with a caller-provided embedding.
    pub async fn semantic_search(
        &self,
        embedding: &[f64],
        threshold: f64,
        limit: usize,
    ) -> GraphResult<Vec<GdprArticle>> {
        let rows = self
            .run_cypher(
                queries::SEMANTIC_SEARCH,
                json!({
                    "query_embedding": embedding,
                    "threshold": threshold,
                    "limit": limit as i64,
                }),
            )
            .await?;
        Ok(rows.into_iter().map(row_to_article).collect())
    }

    /// Fine tier information for an article, if present in the graph.
    pub async fn fine_info(&self, article_number: i64) -> GraphResult<Option<FineInfo>> {
        let rows = self
            .run_cypher(queries::FINE_INFO, json!({ "article_number": article_number }))
            .await?;
        Ok(rows.into_iter().next().map(|row| FineInfo {
            tier: string_field(&row, "tier"),
            max_amount: string_field(&row, "max_amount"),
            description: string_field(&row, "description"),
        }))
    }

    /// Explanation graph for a detection type, as raw rows for the UI.
    pub async fn explanation_graph(&self, detection_type: &str) -> GraphResult<Value> {
        let rows = self
            .run_cypher(
                queries::EXPLANATION_GRAPH,
                json!({ "detection_type": detection_type }),
            )
            .await?;
        Ok(serde_json::to_value(rows)?)
    }
}

fn string_field(row: &HashMap<String, Value>, key: &str) -> String {
    match row.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn string_list(row: &HashMap<String, Value>, key: &str) -> Vec<String> {
    row.get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect()
        })
        .unwrap_or_default()
}

fn row_to_article(row: HashMap<String, Value>) -> GdprArticle {
    GdprArticle {
        article_number: string_field(&row, "article_number"),
        title: string_field(&row, "title"),
        content: string_field(&row, "content"),
        fine_tier: row
            .get("fine_tier")
            .filter(|v| !v.is_null())
            .map(|_| string_field(&row, "fine_tier")),
        severity: row
            .get("severity")
            .filter(|v| !v.is_null())
            .map(|_| string_field(&row, "severity")),
        related_recitals: string_list(&row, "related_recitals"),
        related_concepts: string_list(&row, "related_concepts"),
        recommended_actions: string_list(&row, "recommended_actions"),
    }
}

fn fallback_articles() -> Vec<GdprArticle> {
    vec![
        GdprArticle {
            article_number: "5".to_string(),
            title: "Principles relating to processing of personal data".to_string(),
            content: "Personal data shall be processed lawfully, fairly and transparently."
                .to_string(),
            ..Default::default()
        },
        GdprArticle {
            article_number: "6".to_string(),
            title: "Lawfulness of processing".to_string(),
            content: "Processing is lawful only with consent or another legal basis.".to_string(),
            ..Default::default()
        },
        GdprArticle {
            article_number: "9".to_string(),
            title: "Processing of special categories of personal data".to_string(),
            content: "Biometric data processing is prohibited unless exceptions apply."
                .to_string(),
            ..Default::default()
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(uri: &str) -> GraphConfig {
        GraphConfig {
            uri: uri.to_string(),
            user: "neo4j".to_string(),
            password: "password".to_string(),
            database: "neo4j".to_string(),
            timeout: Duration::from_secs(2),
        }
    }

    fn cypher_body(columns: Vec<&str>, rows: Vec<Vec<Value>>) -> Value {
        json!({
            "results": [{
                "columns": columns,
                "data": rows.into_iter().map(|row| json!({"row": row})).collect::<Vec<_>>(),
            }],
            "errors": [],
        })
    }

    #[tokio::test]
    async fn test_context_for_parses_articles() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/db/neo4j/tx/commit"))
            .respond_with(ResponseTemplate::new(200).set_body_json(cypher_body(
                vec![
                    "article_number",
                    "title",
                    "content",
                    "fine_tier",
                    "severity",
                    "recommended_actions",
                    "related_recitals",
                    "related_concepts",
                ],
                vec![vec![
                    json!("9"),
                    json!("Special categories"),
                    json!("Biometric data…"),
                    json!("upper"),
                    json!("high"),
                    json!(["blur"]),
                    json!(["51"]),
                    json!(["biometric data"]),
                ]],
            )))
            .expect(1)
            .mount(&server)
            .await;

        let client = GraphClient::new(test_config(&server.uri())).unwrap();
        let articles = client.context_for("face").await;
        assert_eq!(articles.len(), 1);
        assert_eq!(articles[0].article_number, "9");
        assert_eq!(articles[0].related_concepts, vec!["biometric data"]);

        // Second call must come from cache (mock expects exactly one call).
        let cached = client.context_for("face").await;
        assert_eq!(cached.len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_graph_falls_back() {
        let client = GraphClient::new(test_config("http://127.0.0.1:1")).unwrap();
        let articles = client.context_for("face").await;
        let numbers: Vec<&str> = articles.iter().map(|a| a.article_number.as_str()).collect();
        assert_eq!(numbers, vec!["5", "6", "9"]);
    }

    #[tokio::test]
    async fn test_hybrid_search_fallback_when_empty() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/db/neo4j/tx/commit"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(cypher_body(vec!["title"], vec![])),
            )
            .mount(&server)
            .await;

        let client = GraphClient::new(test_config(&server.uri())).unwrap();
        let context = client
            .hybrid_search("GDPR violations related to face", &["face".to_string()], 3)
            .await;
        assert_eq!(context.len(), 3);
        assert!(context[0].contains("Article 5"));
    }

    #[tokio::test]
    async fn test_hybrid_search_dedups_by_title() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/db/neo4j/tx/commit"))
            .respond_with(ResponseTemplate::new(200).set_body_json(cypher_body(
                vec!["title", "content", "score"],
                vec![
                    vec![json!("Article 9"), json!("Biometric…"), json!(0.91)],
                    vec![json!("Article 9"), json!("Biometric…"), json!(0.88)],
                ],
            )))
            .mount(&server)
            .await;

        let client = GraphClient::new(test_config(&server.uri())).unwrap();
        let context = client.hybrid_search("biometric", &[], 6).await;
        let article_nine = context.iter().filter(|c| c.contains("Article 9")).count();
        assert_eq!(article_nine, 1);
    }

    #[tokio::test]
    async fn test_clear_cache_forces_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/db/neo4j/tx/commit"))
            .respond_with(ResponseTemplate::new(200).set_body_json(cypher_body(
                vec!["article_number", "title", "content"],
                vec![vec![json!("6"), json!("Lawfulness"), json!("…")]],
            )))
            .expect(2)
            .mount(&server)
            .await;

        let client = GraphClient::new(test_config(&server.uri())).unwrap();
        client.context_for("person").await;
        client.clear_cache().await;
        client.context_for("person").await;
    }
}
