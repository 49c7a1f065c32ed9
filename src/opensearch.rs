//! Minimal OpenSearch REST client.
//!
//! Covers exactly what retrieval and the reindex runner use: search,
//! multi-get, bulk, alias management, counts, refresh, settings, and
//! index create/delete/list.

use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder};
use serde_json::{json, Value};

use shelf_core::reindex::is_retryable_http_status;

#[derive(Debug, thiserror::Error)]
pub enum OpenSearchError {
    #[error("opensearch request timed out")]
    Timeout,
    #[error("opensearch transport error: {0}")]
    Transport(String),
    #[error("opensearch returned {status}: {body}")]
    Http { status: u16, body: String },
    #[error("invalid opensearch response: {0}")]
    Decode(String),
}

impl OpenSearchError {
    pub fn retryable(&self) -> bool {
        match self {
            OpenSearchError::Timeout | OpenSearchError::Transport(_) => true,
            OpenSearchError::Http { status, .. } => is_retryable_http_status(*status),
            OpenSearchError::Decode(_) => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            OpenSearchError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

fn transport(err: reqwest::Error) -> OpenSearchError {
    if err.is_timeout() {
        OpenSearchError::Timeout
    } else {
        OpenSearchError::Transport(err.to_string())
    }
}

/// Outcome of one bulk item.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkItem {
    pub id: String,
    pub status: u16,
    pub error_type: Option<String>,
    pub reason: Option<String>,
}

impl BulkItem {
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// One bulk operation: action line plus optional source line.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkOp {
    pub action: Value,
    pub source: Option<Value>,
}

impl BulkOp {
    pub fn index(index: &str, id: &str, source: Value) -> Self {
        Self {
            action: json!({ "index": { "_index": index, "_id": id } }),
            source: Some(source),
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.action
            .as_object()
            .and_then(|o| o.values().next())
            .and_then(|meta| meta.get("_id"))
            .and_then(Value::as_str)
    }

    /// Action and source as a single JSON value, for error records.
    pub fn to_record(&self) -> Value {
        json!({ "action": self.action, "source": self.source })
    }
}

#[derive(Clone)]
pub struct OpenSearchClient {
    http: Client,
    base_url: String,
    timeout: Duration,
}

impl OpenSearchClient {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}/{}", self.base_url, path.trim_start_matches('/')))
            .timeout(self.timeout)
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Value, OpenSearchError> {
        let response = builder.send().await.map_err(transport)?;
        let status = response.status();
        let text = response.text().await.map_err(transport)?;
        if !status.is_success() {
            return Err(OpenSearchError::Http {
                status: status.as_u16(),
                body: text.chars().take(2000).collect(),
            });
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| OpenSearchError::Decode(e.to_string()))
    }

    pub async fn search(&self, index: &str, body: &Value) -> Result<Value, OpenSearchError> {
        self.send(self.request(Method::POST, &format!("{}/_search", index)).json(body))
            .await
    }

    /// Sources of the found documents, in request order.
    pub async fn mget(&self, index: &str, ids: &[String]) -> Result<Vec<Value>, OpenSearchError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let body = self
            .send(
                self.request(Method::POST, &format!("{}/_mget", index))
                    .json(&json!({ "ids": ids })),
            )
            .await?;
        Ok(body
            .get("docs")
            .and_then(Value::as_array)
            .map(|docs| {
                docs.iter()
                    .filter(|d| d.get("found").and_then(Value::as_bool).unwrap_or(false))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    pub async fn bulk(&self, ops: &[BulkOp]) -> Result<Vec<BulkItem>, OpenSearchError> {
        let mut ndjson = String::new();
        for op in ops {
            ndjson.push_str(&op.action.to_string());
            ndjson.push('\n');
            if let Some(source) = &op.source {
                ndjson.push_str(&source.to_string());
                ndjson.push('\n');
            }
        }
        let body = self
            .send(
                self.request(Method::POST, "_bulk")
                    .header("content-type", "application/x-ndjson")
                    .body(ndjson),
            )
            .await?;
        let items = body
            .get("items")
            .and_then(Value::as_array)
            .ok_or_else(|| OpenSearchError::Decode("bulk response has no items".into()))?;
        Ok(items
            .iter()
            .filter_map(|item| item.as_object().and_then(|o| o.values().next()))
            .map(|result| {
                let error = result.get("error");
                BulkItem {
                    id: result
                        .get("_id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    status: result.get("status").and_then(Value::as_u64).unwrap_or(0) as u16,
                    error_type: error
                        .and_then(|e| e.get("type"))
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    reason: error
                        .and_then(|e| e.get("reason"))
                        .and_then(Value::as_str)
                        .map(str::to_string),
                }
            })
            .collect())
    }

    pub async fn update_aliases(&self, actions: Vec<Value>) -> Result<(), OpenSearchError> {
        self.send(
            self.request(Method::POST, "_aliases")
                .json(&json!({ "actions": actions })),
        )
        .await?;
        Ok(())
    }

    /// Indices the alias points at; empty when the alias does not exist.
    pub async fn get_alias(&self, alias: &str) -> Result<Vec<String>, OpenSearchError> {
        match self
            .send(self.request(Method::GET, &format!("_alias/{}", alias)))
            .await
        {
            Ok(body) => Ok(body
                .as_object()
                .map(|o| o.keys().cloned().collect())
                .unwrap_or_default()),
            Err(OpenSearchError::Http { status: 404, .. }) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    pub async fn count(&self, index: &str) -> Result<u64, OpenSearchError> {
        let body = self
            .send(self.request(Method::GET, &format!("{}/_count", index)))
            .await?;
        body.get("count")
            .and_then(Value::as_u64)
            .ok_or_else(|| OpenSearchError::Decode("count response has no count".into()))
    }

    pub async fn refresh(&self, index: &str) -> Result<(), OpenSearchError> {
        self.send(self.request(Method::POST, &format!("{}/_refresh", index)))
            .await?;
        Ok(())
    }

    pub async fn put_settings(&self, index: &str, settings: &Value) -> Result<(), OpenSearchError> {
        self.send(
            self.request(Method::PUT, &format!("{}/_settings", index))
                .json(settings),
        )
        .await?;
        Ok(())
    }

    /// Index names matching `pattern`.
    pub async fn cat_indices(&self, pattern: &str) -> Result<Vec<String>, OpenSearchError> {
        match self
            .send(self.request(Method::GET, &format!("_cat/indices/{}?format=json&h=index", pattern)))
            .await
        {
            Ok(body) => Ok(body
                .as_array()
                .map(|rows| {
                    rows.iter()
                        .filter_map(|r| r.get("index").and_then(Value::as_str))
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()),
            Err(OpenSearchError::Http { status: 404, .. }) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Create an index. Returns `false` when it already existed.
    pub async fn create_index(&self, index: &str, body: &Value) -> Result<bool, OpenSearchError> {
        match self.send(self.request(Method::PUT, index).json(body)).await {
            Ok(_) => Ok(true),
            Err(OpenSearchError::Http { status: 400, body })
                if body.contains("resource_already_exists_exception") =>
            {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn delete_index(&self, index: &str) -> Result<(), OpenSearchError> {
        match self.send(self.request(Method::DELETE, index)).await {
            Ok(_) | Err(OpenSearchError::Http { status: 404, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// `hits.hits` of a search response.
pub fn search_hits(body: &Value) -> Vec<&Value> {
    body.pointer("/hits/hits")
        .and_then(Value::as_array)
        .map(|hits| hits.iter().collect())
        .unwrap_or_default()
}

/// `hits.total.value` (or the legacy bare number).
pub fn search_total(body: &Value) -> u64 {
    body.pointer("/hits/total/value")
        .or_else(|| body.pointer("/hits/total"))
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> OpenSearchClient {
        OpenSearchClient::new(&server.uri(), Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_bulk_reports_per_item_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/_bulk"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errors": true,
                "items": [
                    {"index": {"_id": "a", "status": 201}},
                    {"index": {"_id": "b", "status": 429, "error": {"type": "es_rejected_execution_exception", "reason": "busy"}}}
                ]
            })))
            .mount(&server)
            .await;

        let ops = vec![
            BulkOp::index("books_1", "a", json!({"title": "A"})),
            BulkOp::index("books_1", "b", json!({"title": "B"})),
        ];
        assert_eq!(ops[1].id(), Some("b"));
        let items = client(&server).bulk(&ops).await.unwrap();
        assert!(items[0].ok());
        assert_eq!(items[1].status, 429);
        assert_eq!(items[1].reason.as_deref(), Some("busy"));
    }

    #[tokio::test]
    async fn test_missing_alias_is_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_alias/books_doc_read"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"error": "alias missing"})))
            .mount(&server)
            .await;

        assert!(client(&server).get_alias("books_doc_read").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_existing_index_is_tolerated() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/books_1"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {"type": "resource_already_exists_exception"}
            })))
            .mount(&server)
            .await;

        assert!(!client(&server).create_index("books_1", &json!({})).await.unwrap());
    }

    #[test]
    fn test_hit_helpers() {
        let body = json!({"hits": {"total": {"value": 3}, "hits": [{"_id": "x"}]}});
        assert_eq!(search_total(&body), 3);
        assert_eq!(search_hits(&body).len(), 1);
    }
}
