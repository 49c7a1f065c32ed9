//! Hybrid retrieval over the docs indices.
//!
//! Lexical `multi_match` on the doc alias and kNN on the vec alias are
//! fused with reciprocal-rank fusion, optionally reranked by the model
//! service, and truncated to `top_k` citation-carrying chunks. Nothing in
//! here fails a turn: errors degrade to fewer (or no) chunks and a reason
//! code on the [`Retrieval`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{json, Value};

use shelf_core::fusion::rrf_fuse;
use shelf_core::metrics::Metrics;
use shelf_core::models::Source;
use shelf_core::reason;

use crate::config::RagConfig;
use crate::model_service::ModelServiceClient;
use crate::opensearch::{search_hits, OpenSearchClient, OpenSearchError};

const SNIPPET_CHARS: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkSource {
    Lexical,
    Vector,
    Fused,
    Rerank,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub doc_id: String,
    pub citation_key: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub isbn: Option<String>,
    pub snippet: String,
    pub score: f64,
    pub source: ChunkSource,
}

impl Chunk {
    pub fn to_source(&self) -> Source {
        Source {
            citation_key: self.citation_key.clone(),
            title: self.title.clone(),
            url: self.url.clone(),
            snippet: Some(self.snippet.clone()),
            doc_id: Some(self.doc_id.clone()),
            chunk_id: Some(self.chunk_id.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RetrieveOptions {
    pub top_n: Option<usize>,
    pub top_k: Option<usize>,
    pub rerank: Option<bool>,
}

/// Stage-by-stage record of one retrieval.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrievalTrace {
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spell_corrected: Option<String>,
    pub lexical_hits: usize,
    pub vector_hits: usize,
    pub fused: usize,
    pub reranked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector_skip_reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_skip_reason: Option<&'static str>,
    pub selected: Vec<String>,
    pub took_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Retrieval {
    pub chunks: Vec<Chunk>,
    /// Set when retrieval itself failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'static str>,
    pub trace: RetrievalTrace,
}

impl Retrieval {
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

#[derive(Clone)]
pub struct Retriever {
    search: OpenSearchClient,
    models: ModelServiceClient,
    metrics: Arc<Metrics>,
    config: RagConfig,
}

fn str_field(source: &Value, key: &str) -> Option<String> {
    source
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Build a chunk from a search hit or `_mget` doc.
fn chunk_from_hit(hit: &Value, source_kind: ChunkSource) -> Option<Chunk> {
    let source = hit.get("_source")?;
    let chunk_id = str_field(source, "chunk_id")
        .or_else(|| hit.get("_id").and_then(Value::as_str).map(str::to_string))?;
    let doc_id = str_field(source, "doc_id").unwrap_or_else(|| chunk_id.clone());
    let highlight = hit
        .pointer("/highlight/content")
        .or_else(|| hit.pointer("/highlight/content_en"))
        .and_then(Value::as_array)
        .and_then(|frags| frags.first())
        .and_then(Value::as_str)
        .map(str::to_string);
    let snippet = highlight
        .or_else(|| str_field(source, "content"))
        .or_else(|| str_field(source, "content_en"))
        .map(|s| truncate_chars(&s, SNIPPET_CHARS))
        .unwrap_or_default();
    Some(Chunk {
        citation_key: str_field(source, "citation_key").unwrap_or_else(|| chunk_id.clone()),
        title: str_field(source, "title").unwrap_or_default(),
        url: str_field(source, "url"),
        isbn: str_field(source, "isbn13").or_else(|| str_field(source, "isbn")),
        doc_id,
        chunk_id,
        snippet,
        score: hit.get("_score").and_then(Value::as_f64).unwrap_or(0.0),
        source: source_kind,
    })
}

fn is_timeout(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<reqwest::Error>()
            .map(|e| e.is_timeout())
            .unwrap_or(false)
    })
}

impl Retriever {
    pub fn new(config: &RagConfig, models: ModelServiceClient, metrics: Arc<Metrics>) -> Self {
        Self {
            search: OpenSearchClient::new(&config.os_url, config.timeout()),
            models,
            metrics,
            config: config.clone(),
        }
    }

    pub fn top_k(&self) -> usize {
        self.config.top_k
    }

    async fn lexical(&self, query: &str, top_n: usize) -> Result<Vec<Chunk>, OpenSearchError> {
        let body = json!({
            "size": top_n,
            "query": {
                "multi_match": {
                    "query": query,
                    "fields": ["title^2", "content", "content_en"],
                }
            },
            "highlight": {
                "fields": { "content": {}, "content_en": {} },
                "fragment_size": 200,
                "number_of_fragments": 1,
            }
        });
        let response = self.search.search(&self.config.docs_doc_alias, &body).await?;
        Ok(search_hits(&response)
            .into_iter()
            .filter_map(|hit| chunk_from_hit(hit, ChunkSource::Lexical))
            .collect())
    }

    /// Chunk ids nearest to the query embedding.
    async fn vector(&self, query: &str, top_n: usize) -> anyhow::Result<Vec<String>> {
        let mut vectors = self.models.embed(&[query.to_string()]).await?;
        let vector = vectors
            .pop()
            .ok_or_else(|| anyhow::anyhow!("model service returned no embedding"))?;
        let body = json!({
            "size": top_n,
            "_source": ["chunk_id"],
            "query": { "knn": { "embedding": { "vector": vector, "k": top_n } } }
        });
        let response = self.search.search(&self.config.docs_vec_alias, &body).await?;
        Ok(search_hits(&response)
            .into_iter()
            .filter_map(|hit| {
                hit.pointer("/_source/chunk_id")
                    .or_else(|| hit.get("_id"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .collect())
    }

    /// Run the full pipeline under the overall retrieval timeout.
    pub async fn retrieve(&self, query: &str, options: RetrieveOptions) -> Retrieval {
        let started = Instant::now();
        let mut retrieval = match tokio::time::timeout(self.config.timeout(), self.run(query, options)).await {
            Ok(r) => r,
            Err(_) => {
                tracing::warn!(timeout_sec = self.config.rag_timeout_sec, "retrieval timed out");
                Retrieval {
                    error: Some(reason::RAG_RETRIEVE_ERROR),
                    trace: RetrievalTrace {
                        query: query.to_string(),
                        ..Default::default()
                    },
                    ..Default::default()
                }
            }
        };
        retrieval.trace.took_ms = started.elapsed().as_millis() as u64;
        if let Some(code) = retrieval.error {
            self.metrics.inc("chat_rag_degraded_total", &[("reason", code)]);
        }
        retrieval
    }

    async fn run(&self, query: &str, options: RetrieveOptions) -> Retrieval {
        let top_n = options.top_n.unwrap_or(self.config.top_n).max(1);
        let top_k = options.top_k.unwrap_or(self.config.top_k).max(1);
        let rerank = options.rerank.unwrap_or(self.config.rerank_enabled);
        let mut trace = RetrievalTrace {
            query: query.to_string(),
            ..Default::default()
        };

        // Subcalls run one after another: lexical, then embed and kNN.
        let mut lexical = match self.lexical(query, top_n).await {
            Ok(hits) => hits,
            Err(err) => {
                tracing::warn!(error = %err, "lexical retrieval failed");
                return Retrieval {
                    error: Some(reason::RAG_RETRIEVE_ERROR),
                    trace,
                    ..Default::default()
                };
            }
        };
        if lexical.is_empty() {
            lexical = self.spell_retry(query, top_n, &mut trace).await;
        }
        trace.lexical_hits = lexical.len();

        let vector_ids = match self.vector(query, top_n).await {
            Ok(ids) => ids,
            Err(err) => {
                tracing::warn!(error = %err, "vector retrieval skipped");
                self.metrics
                    .inc("chat_rag_degraded_total", &[("reason", reason::RAG_VECTOR_SKIPPED)]);
                trace.vector_skip_reason = Some(reason::RAG_VECTOR_SKIPPED);
                Vec::new()
            }
        };
        trace.vector_hits = vector_ids.len();

        let mut by_id: HashMap<String, Chunk> = lexical
            .iter()
            .map(|c| (c.chunk_id.clone(), c.clone()))
            .collect();
        let missing: Vec<String> = vector_ids
            .iter()
            .filter(|id| !by_id.contains_key(*id))
            .cloned()
            .collect();
        if !missing.is_empty() {
            match self.search.mget(&self.config.docs_doc_alias, &missing).await {
                Ok(docs) => {
                    for chunk in docs.iter().filter_map(|d| chunk_from_hit(d, ChunkSource::Vector)) {
                        by_id.insert(chunk.chunk_id.clone(), chunk);
                    }
                }
                Err(err) => tracing::warn!(error = %err, "vector source fetch failed"),
            }
        }

        let lists = if vector_ids.is_empty() {
            vec![lexical.iter().map(|c| c.chunk_id.clone()).collect()]
        } else {
            vec![
                lexical.iter().map(|c| c.chunk_id.clone()).collect(),
                vector_ids,
            ]
        };
        let fused_source = if lists.len() > 1 {
            ChunkSource::Fused
        } else {
            ChunkSource::Lexical
        };
        let mut fused: Vec<Chunk> = rrf_fuse(&lists, self.config.rrf_k)
            .into_iter()
            .filter_map(|item| {
                by_id.remove(&item.id).map(|mut chunk| {
                    chunk.score = item.score;
                    chunk.source = fused_source;
                    chunk
                })
            })
            .collect();
        trace.fused = fused.len();

        if rerank && !fused.is_empty() {
            fused = self.rerank(query, fused, &mut trace).await;
        }

        fused.truncate(top_k);
        trace.selected = fused.iter().map(|c| c.chunk_id.clone()).collect();
        Retrieval {
            chunks: fused,
            error: None,
            trace,
        }
    }

    /// One corrected lexical retry when the original query found nothing.
    async fn spell_retry(&self, query: &str, top_n: usize, trace: &mut RetrievalTrace) -> Vec<Chunk> {
        let corrected = match self.models.spell(query).await {
            Ok(Some(corrected)) => corrected,
            Ok(None) => return Vec::new(),
            Err(err) => {
                tracing::debug!(error = %err, "spell correction unavailable");
                return Vec::new();
            }
        };
        match self.lexical(&corrected, top_n).await {
            Ok(hits) => {
                trace.spell_corrected = Some(corrected);
                hits
            }
            Err(err) => {
                tracing::warn!(error = %err, "corrected lexical retry failed");
                Vec::new()
            }
        }
    }

    async fn rerank(&self, query: &str, fused: Vec<Chunk>, trace: &mut RetrievalTrace) -> Vec<Chunk> {
        let n = self.config.rerank_top_n.min(fused.len());
        let documents: Vec<String> = fused[..n]
            .iter()
            .map(|c| format!("{}\n{}", c.title, c.snippet))
            .collect();
        let timeout = self.config.rerank_timeout();
        let skip = match tokio::time::timeout(timeout, self.models.score(query, &documents, timeout)).await {
            Ok(Ok(scores)) => {
                let mut head: Vec<Chunk> = fused[..n]
                    .iter()
                    .cloned()
                    .zip(scores)
                    .map(|(mut chunk, score)| {
                        chunk.score = score;
                        chunk.source = ChunkSource::Rerank;
                        chunk
                    })
                    .collect();
                head.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
                head.extend(fused[n..].iter().cloned());
                trace.reranked = true;
                return head;
            }
            Ok(Err(err)) if is_timeout(&err) => reason::RAG_RERANK_TIMEOUT,
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "rerank failed");
                reason::RAG_RERANK_ERROR
            }
            Err(_) => reason::RAG_RERANK_TIMEOUT,
        };
        self.metrics.inc("chat_rag_degraded_total", &[("reason", skip)]);
        trace.rerank_skip_reason = Some(skip);
        fused
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelServiceConfig;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn hit(id: &str, title: &str) -> Value {
        json!({
            "_id": id,
            "_score": 1.0,
            "_source": {
                "chunk_id": id,
                "doc_id": id.split('#').next().unwrap(),
                "citation_key": id,
                "title": title,
                "content": format!("{} 본문", title),
            }
        })
    }

    async fn retriever(os: &MockServer, models: &MockServer, rerank: bool) -> Retriever {
        let config = RagConfig {
            os_url: os.uri(),
            rerank_enabled: rerank,
            rerank_timeout_sec: 0.3,
            ..Default::default()
        };
        let models = ModelServiceClient::new(&ModelServiceConfig {
            url: models.uri(),
            ..Default::default()
        });
        Retriever::new(&config, models, Arc::new(Metrics::new()))
    }

    #[tokio::test]
    async fn test_fuses_lexical_and_vector() {
        let os = MockServer::start().await;
        let models = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/docs_doc_read/_search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "hits": {"hits": [hit("a#0", "토지"), hit("b#0", "객주")]}
            })))
            .mount(&os)
            .await;
        Mock::given(method("POST"))
            .and(path("/docs_vec_read/_search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "hits": {"hits": [
                    {"_id": "c#0", "_source": {"chunk_id": "c#0"}},
                    {"_id": "b#0", "_source": {"chunk_id": "b#0"}}
                ]}
            })))
            .mount(&os)
            .await;
        Mock::given(method("POST"))
            .and(path("/docs_doc_read/_mget"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "docs": [{"found": true, "_id": "c#0", "_source": hit("c#0", "장길산")["_source"]}]
            })))
            .mount(&os)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/embed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"vectors": [[0.1, 0.2]]})))
            .mount(&models)
            .await;

        let r = retriever(&os, &models, false).await;
        let out = r.retrieve("대하소설", RetrieveOptions::default()).await;
        assert!(out.error.is_none());
        let ids: Vec<&str> = out.chunks.iter().map(|c| c.chunk_id.as_str()).collect();
        // b#0 appears in both lists
        assert_eq!(ids[0], "b#0");
        assert_eq!(ids.len(), 3);
        assert_eq!(out.chunks[0].source, ChunkSource::Fused);
        assert_eq!(out.trace.vector_hits, 2);
    }

    #[tokio::test]
    async fn test_vector_failure_keeps_lexical_order() {
        let os = MockServer::start().await;
        let models = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/docs_doc_read/_search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "hits": {"hits": [hit("a#0", "토지"), hit("b#0", "객주")]}
            })))
            .mount(&os)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/embed"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&models)
            .await;

        let r = retriever(&os, &models, false).await;
        let out = r.retrieve("토지", RetrieveOptions::default()).await;
        assert_eq!(out.trace.vector_skip_reason, Some(reason::RAG_VECTOR_SKIPPED));
        let ids: Vec<&str> = out.chunks.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["a#0", "b#0"]);
        assert_eq!(out.chunks[0].source, ChunkSource::Lexical);
    }

    #[tokio::test]
    async fn test_rerank_timeout_falls_back_to_fused_order() {
        let os = MockServer::start().await;
        let models = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/docs_doc_read/_search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "hits": {"hits": [hit("a#0", "토지"), hit("b#0", "객주")]}
            })))
            .mount(&os)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/embed"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&models)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/score"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"scores": [0.1, 0.9]}))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&models)
            .await;

        let r = retriever(&os, &models, true).await;
        let out = r.retrieve("토지", RetrieveOptions::default()).await;
        assert_eq!(out.trace.rerank_skip_reason, Some(reason::RAG_RERANK_TIMEOUT));
        assert_eq!(out.chunks[0].chunk_id, "a#0");
    }

    #[tokio::test]
    async fn test_search_error_is_retrieve_error() {
        let os = MockServer::start().await;
        let models = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&os)
            .await;

        Mock::given(method("POST"))
            .and(path("/v1/embed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"vectors": [[0.1]]})))
            .expect(0)
            .mount(&models)
            .await;

        let r = retriever(&os, &models, false).await;
        let out = r.retrieve("토지", RetrieveOptions::default()).await;
        assert!(out.is_empty());
        assert_eq!(out.error, Some(reason::RAG_RETRIEVE_ERROR));
        // The vector branch only starts after lexical retrieval returned.
        models.verify().await;
    }

    #[tokio::test]
    async fn test_spell_retry_on_empty_lexical() {
        let os = MockServer::start().await;
        let models = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/docs_doc_read/_search"))
            .and(wiremock::matchers::body_partial_json(json!({"query": {"multi_match": {"query": "토즤"}}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"hits": {"hits": []}})))
            .mount(&os)
            .await;
        Mock::given(method("POST"))
            .and(path("/docs_doc_read/_search"))
            .and(wiremock::matchers::body_partial_json(json!({"query": {"multi_match": {"query": "토지"}}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"hits": {"hits": [hit("a#0", "토지")]}})))
            .mount(&os)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/spell"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"corrected": "토지"})))
            .mount(&models)
            .await;

        let r = retriever(&os, &models, false).await;
        let out = r.retrieve("토즤", RetrieveOptions::default()).await;
        assert_eq!(out.trace.spell_corrected.as_deref(), Some("토지"));
        assert_eq!(out.chunks.len(), 1);
    }
}
