//! Embedding, rerank and spelling client for the model service.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::ModelServiceConfig;

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    texts: &'a [String],
    normalize: bool,
}

#[derive(Deserialize)]
struct EmbedResponse {
    #[serde(default, alias = "embeddings")]
    vectors: Vec<Vec<f32>>,
}

#[derive(Serialize)]
struct ScoreRequest<'a> {
    task: &'static str,
    pairs: Vec<[&'a str; 2]>,
    options: ScoreOptions<'a>,
}

#[derive(Serialize)]
struct ScoreOptions<'a> {
    model: &'a str,
}

#[derive(Deserialize)]
struct ScoreResponse {
    #[serde(default)]
    scores: Vec<f64>,
}

#[derive(Serialize)]
struct SpellRequest<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct SpellResponse {
    #[serde(default)]
    corrected: Option<String>,
}

#[derive(Clone)]
pub struct ModelServiceClient {
    http: Client,
    base_url: String,
    embed_model: String,
    rerank_model: String,
    timeout: Duration,
}

impl ModelServiceClient {
    pub fn new(config: &ModelServiceConfig) -> Self {
        Self {
            http: Client::new(),
            base_url: config.url.trim_end_matches('/').to_string(),
            embed_model: config.embed_model.clone(),
            rerank_model: config.rerank_model.clone(),
            timeout: config.timeout(),
        }
    }

    async fn post<B: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
        timeout: Duration,
    ) -> Result<R> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .post(&url)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .with_context(|| format!("model service request failed: {}", path))?;
        let status = response.status();
        if !status.is_success() {
            bail!("model service {} returned {}", path, status);
        }
        response
            .json()
            .await
            .with_context(|| format!("model service {} returned an invalid body", path))
    }

    /// One vector per input text, in order.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let response: EmbedResponse = self
            .post(
                "/v1/embed",
                &EmbedRequest {
                    model: &self.embed_model,
                    texts,
                    normalize: true,
                },
                self.timeout,
            )
            .await?;
        if response.vectors.len() != texts.len() {
            bail!(
                "model service returned {} vectors for {} texts",
                response.vectors.len(),
                texts.len()
            );
        }
        Ok(response.vectors)
    }

    /// Relevance score per document, in order.
    pub async fn score(&self, query: &str, documents: &[String], timeout: Duration) -> Result<Vec<f64>> {
        let response: ScoreResponse = self
            .post(
                "/v1/score",
                &ScoreRequest {
                    task: "rerank",
                    pairs: documents.iter().map(|doc| [query, doc.as_str()]).collect(),
                    options: ScoreOptions {
                        model: &self.rerank_model,
                    },
                },
                timeout,
            )
            .await?;
        if response.scores.len() != documents.len() {
            bail!(
                "model service returned {} scores for {} documents",
                response.scores.len(),
                documents.len()
            );
        }
        Ok(response.scores)
    }

    /// Corrected text when it differs from the input.
    pub async fn spell(&self, text: &str) -> Result<Option<String>> {
        let response: SpellResponse = self
            .post("/v1/spell", &SpellRequest { text }, self.timeout)
            .await?;
        Ok(response
            .corrected
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty() && c != text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(base: &str) -> ModelServiceClient {
        ModelServiceClient::new(&ModelServiceConfig {
            url: base.to_string(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_embed_accepts_either_field_name() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embed"))
            .and(body_partial_json(json!({"model": "bge-m3", "normalize": true})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"embeddings": [[0.1, 0.2]]})))
            .mount(&server)
            .await;

        let vectors = client(&server.uri()).embed(&["hi".into()]).await.unwrap();
        assert_eq!(vectors, vec![vec![0.1_f32, 0.2]]);
    }

    #[tokio::test]
    async fn test_score_sends_query_document_pairs() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/score"))
            .and(body_partial_json(json!({
                "task": "rerank",
                "pairs": [["토지", "박경리"], ["토지", "객주"]],
                "options": {"model": "bge-reranker-v2-m3"}
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"scores": [0.9, 0.2], "model": "bge-reranker-v2-m3"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let docs = vec!["박경리".to_string(), "객주".to_string()];
        let scores = client(&server.uri())
            .score("토지", &docs, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(scores, vec![0.9, 0.2]);
    }

    #[tokio::test]
    async fn test_score_length_mismatch_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/score"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"scores": [0.5]})))
            .mount(&server)
            .await;

        let docs = vec!["a".to_string(), "b".to_string()];
        let result = client(&server.uri())
            .score("q", &docs, Duration::from_secs(1))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_spell_ignores_identity_correction() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/spell"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"corrected": "토지"})))
            .mount(&server)
            .await;

        let c = client(&server.uri());
        assert_eq!(c.spell("토지").await.unwrap(), None);
        assert_eq!(c.spell("토즤").await.unwrap().as_deref(), Some("토지"));
    }
}
