//! Multi-provider LLM gateway.
//!
//! Provider order comes from [`shelf_core::routing::select_providers`];
//! this module feeds it rolling per-provider stats kept in the [`Cache`],
//! walks the plan, and fails over on transient errors. Streaming calls
//! fail over only until the first `delta` has been received; after that
//! errors surface to the caller.
//!
//! Upstream contract: `POST {url}/v1/generate` with
//! `{messages, trace_id, request_id, stream}`. JSON mode answers
//! `{content, citations[], model?}`; stream mode answers SSE events
//! `meta`, `delta` (`{delta}`), `done` (the JSON-mode body) and `error`
//! (`{message}`).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_stream::try_stream;
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use shelf_core::cache::Cache;
use shelf_core::metrics::Metrics;
use shelf_core::models::ChatMessage;
use shelf_core::reason;
use shelf_core::routing::{
    health_score, select_providers, Provider, ProviderStats, RouteInput, RouteMode, RoutePlan,
    RoutingConfig,
};

use crate::config::LlmConfig;

pub const FAILOVER_METRIC: &str = "chat_provider_failover_total";

#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("provider timed out")]
    Timeout,
    #[error("provider unreachable: {0}")]
    Network(String),
    #[error("provider returned HTTP {status}")]
    Http { status: u16 },
    #[error("provider stream failed: {0}")]
    Stream(String),
    #[error("invalid provider response: {0}")]
    Decode(String),
    #[error("no provider available")]
    NoProvider,
}

impl LlmError {
    /// Label used in `chat_provider_failover_total{reason}`.
    pub fn failover_reason(&self) -> String {
        match self {
            LlmError::Http { status } => format!("http_{}", status),
            LlmError::Timeout => "timeout".to_string(),
            LlmError::Network(_) | LlmError::NoProvider => "network".to_string(),
            LlmError::Stream(_) | LlmError::Decode(_) => "stream_error".to_string(),
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::Timeout | LlmError::Network(_) | LlmError::Stream(_) => true,
            LlmError::Http { status } => *status == 429 || *status >= 500,
            LlmError::Decode(_) | LlmError::NoProvider => false,
        }
    }

    pub fn reason_code(&self) -> &'static str {
        match self {
            LlmError::Timeout => reason::PROVIDER_TIMEOUT,
            _ => reason::PROVIDER_ERROR,
        }
    }
}

fn transport(err: reqwest::Error) -> LlmError {
    if err.is_timeout() {
        LlmError::Timeout
    } else {
        LlmError::Network(err.to_string())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerateRequest {
    pub messages: Vec<ChatMessage>,
    pub trace_id: String,
    pub request_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerateResponse {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub citations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// A JSON-mode answer and the provider that produced it.
#[derive(Debug, Clone)]
pub struct Generated {
    pub provider: String,
    pub response: GenerateResponse,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LlmEvent {
    Meta(Value),
    Delta(String),
    Done(GenerateResponse),
}

pub type LlmEventStream = BoxStream<'static, Result<LlmEvent, LlmError>>;

pub struct LlmStream {
    pub provider: String,
    pub events: LlmEventStream,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderSnapshot {
    pub name: String,
    pub url: String,
    pub blocked: bool,
    pub forced: bool,
    pub cooling_down: bool,
    pub stats: ProviderStats,
    pub health_score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GatewaySnapshot {
    pub providers: Vec<ProviderSnapshot>,
    pub blocklist: Vec<String>,
    pub force_provider: Option<String>,
    pub health_routing_enabled: bool,
    pub cost_steering_enabled: bool,
}

#[derive(Clone)]
pub struct LlmGateway {
    http: Client,
    providers: Vec<Provider>,
    routing: RoutingConfig,
    cache: Arc<dyn Cache>,
    metrics: Arc<Metrics>,
    timeout: Duration,
    cooldown: Duration,
    stats_window: Duration,
}

fn stat_key(provider: &str, field: &str) -> String {
    format!("llm:stats:{}:{}", provider, field)
}

fn cooldown_key(provider: &str) -> String {
    format!("llm:cooldown:{}", provider)
}

impl LlmGateway {
    pub fn new(config: &LlmConfig, cache: Arc<dyn Cache>, metrics: Arc<Metrics>) -> anyhow::Result<Self> {
        Ok(Self {
            http: Client::new(),
            providers: config.providers(),
            routing: config.routing()?,
            cache,
            metrics,
            timeout: config.timeout(),
            cooldown: Duration::from_secs(config.provider_cooldown_sec),
            stats_window: Duration::from_secs(config.stats_window_sec),
        })
    }

    pub fn providers(&self) -> &[Provider] {
        &self.providers
    }

    // ============ Stats ============

    async fn read_counter(&self, key: &str) -> u64 {
        match self.cache.get(key).await {
            Ok(Some(v)) => v.trim().parse::<u64>().unwrap_or(0),
            Ok(None) => 0,
            Err(err) => {
                tracing::warn!(key, error = %err, "provider stats unreadable");
                0
            }
        }
    }

    pub async fn load_stats(&self) -> HashMap<String, ProviderStats> {
        let mut stats = HashMap::new();
        for provider in &self.providers {
            let name = provider.name.as_str();
            let cooling_down = matches!(self.cache.get(&cooldown_key(name)).await, Ok(Some(_)));
            stats.insert(
                name.to_string(),
                ProviderStats {
                    ok: self.read_counter(&stat_key(name, "ok")).await,
                    fail: self.read_counter(&stat_key(name, "fail")).await,
                    streak_fail: self.read_counter(&stat_key(name, "streak")).await,
                    cooling_down,
                },
            );
        }
        stats
    }

    async fn record_success(&self, provider: &str) {
        let window = Some(self.stats_window);
        if let Err(err) = self.cache.incr(&stat_key(provider, "ok"), window).await {
            tracing::warn!(provider, error = %err, "failed to record provider success");
        }
        let _ = self.cache.delete(&stat_key(provider, "streak")).await;
    }

    async fn record_failure(&self, provider: &str, error: &LlmError) {
        let window = Some(self.stats_window);
        let _ = self.cache.incr(&stat_key(provider, "fail"), window).await;
        let _ = self.cache.incr(&stat_key(provider, "streak"), window).await;
        // A rejected request (4xx other than 429) says nothing about the provider.
        if error.is_transient() && !self.cooldown.is_zero() {
            let _ = self
                .cache
                .set(&cooldown_key(provider), "1", Some(self.cooldown))
                .await;
        }
        tracing::warn!(provider, error = %error, "llm provider call failed");
    }

    // ============ Routing ============

    /// The plan a call would use right now, without touching metrics.
    pub async fn preview(&self, intent: Option<&str>, query: &str) -> RoutePlan {
        let stats = self.load_stats().await;
        select_providers(&self.providers, &self.routing, &stats, &RouteInput { intent, query })
    }

    /// Order providers for one call and record the routing metrics.
    pub async fn plan(&self, intent: Option<&str>, query: &str) -> RoutePlan {
        let stats = self.load_stats().await;
        let input = RouteInput { intent, query };
        let plan = select_providers(&self.providers, &self.routing, &stats, &input);

        for (name, score) in &plan.health_scores {
            self.metrics
                .set_gauge("chat_provider_health_score", &[("provider", name)], *score);
        }
        if let Some(blocked) = self.displaced_by_blocklist(&plan, &stats, &input) {
            self.metrics
                .inc("chat_provider_block_total", &[("provider", &blocked)]);
        }
        if plan.forced_blocked {
            if let Some(forced) = self.routing.force_provider.as_deref() {
                self.metrics.inc(
                    "chat_provider_forced_route_total",
                    &[("provider", forced), ("result", "blocked")],
                );
            }
        }

        if let Some(first) = plan.order.first() {
            let first = first.name.as_str();
            let mode = plan.mode.as_str();
            self.metrics
                .inc("chat_provider_route_total", &[("provider", first), ("mode", mode)]);
            match plan.mode {
                RouteMode::Forced => self.metrics.inc(
                    "chat_provider_forced_route_total",
                    &[("provider", first), ("result", "applied")],
                ),
                RouteMode::CostSteer => self
                    .metrics
                    .inc("chat_provider_cost_steer_total", &[("provider", first)]),
                RouteMode::Intent => self.metrics.inc(
                    "chat_provider_intent_route_total",
                    &[("intent", intent.unwrap_or("NONE")), ("provider", first)],
                ),
                _ => {}
            }
            tracing::debug!(provider = first, mode, high_risk = plan.high_risk, "llm route planned");
        }
        plan
    }

    /// The blocklisted provider the plan would have led with, had the
    /// blocklist been empty.
    fn displaced_by_blocklist(
        &self,
        plan: &RoutePlan,
        stats: &HashMap<String, ProviderStats>,
        input: &RouteInput<'_>,
    ) -> Option<String> {
        if self.routing.blocklist.is_empty() {
            return None;
        }
        let open = RoutingConfig {
            blocklist: Vec::new(),
            ..self.routing.clone()
        };
        let unblocked = select_providers(&self.providers, &open, stats, input);
        let wanted = unblocked.order.first()?;
        let chosen = plan.order.first().map(|p| p.name.as_str());
        (self.routing.blocklist.contains(&wanted.name) && chosen != Some(wanted.name.as_str()))
            .then(|| wanted.name.clone())
    }

    fn record_failover(&self, from: &str, to: &str, error: &LlmError) {
        let reason = error.failover_reason();
        self.metrics
            .inc(FAILOVER_METRIC, &[("from", from), ("to", to), ("reason", &reason)]);
        tracing::info!(from, to, reason = %reason, "llm provider failover");
    }

    /// Decide whether to move on after `error` at position `index`.
    fn next_after(&self, plan: &RoutePlan, index: usize, error: &LlmError) -> bool {
        match plan.order.get(index + 1) {
            Some(next) if error.is_transient() => {
                self.record_failover(&plan.order[index].name, &next.name, error);
                true
            }
            _ => false,
        }
    }

    // ============ JSON mode ============

    async fn call_json(&self, provider: &Provider, request: &GenerateRequest) -> Result<GenerateResponse, LlmError> {
        let url = format!("{}/v1/generate", provider.url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .timeout(self.timeout)
            .header("x-trace-id", &request.trace_id)
            .header("x-request-id", &request.request_id)
            .json(&json!({
                "messages": request.messages,
                "trace_id": request.trace_id,
                "request_id": request.request_id,
                "stream": false,
            }))
            .send()
            .await
            .map_err(transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(LlmError::Http {
                status: status.as_u16(),
            });
        }
        response
            .json::<GenerateResponse>()
            .await
            .map_err(|e| if e.is_timeout() { LlmError::Timeout } else { LlmError::Decode(e.to_string()) })
    }

    pub async fn generate(&self, request: &GenerateRequest, plan: &RoutePlan) -> Result<Generated, LlmError> {
        let mut last = LlmError::NoProvider;
        for (index, provider) in plan.order.iter().enumerate() {
            match self.call_json(provider, request).await {
                Ok(response) => {
                    self.record_success(&provider.name).await;
                    return Ok(Generated {
                        provider: provider.name.clone(),
                        response,
                    });
                }
                Err(err) => {
                    self.record_failure(&provider.name, &err).await;
                    let advance = self.next_after(plan, index, &err);
                    last = err;
                    if !advance {
                        break;
                    }
                }
            }
        }
        Err(last)
    }

    // ============ Stream mode ============

    async fn open_stream(&self, provider: &Provider, request: &GenerateRequest) -> Result<LlmEventStream, LlmError> {
        let url = format!("{}/v1/generate?stream=true", provider.url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .header("accept", "text/event-stream")
            .header("x-trace-id", &request.trace_id)
            .header("x-request-id", &request.request_id)
            .json(&json!({
                "messages": request.messages,
                "trace_id": request.trace_id,
                "request_id": request.request_id,
                "stream": true,
            }))
            .send()
            .await
            .map_err(transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(LlmError::Http {
                status: status.as_u16(),
            });
        }
        Ok(sse_events(response.bytes_stream(), self.timeout))
    }

    /// Open the stream and read up to and including the first content event.
    async fn open_until_first_delta(
        &self,
        provider: &Provider,
        request: &GenerateRequest,
    ) -> Result<LlmEventStream, LlmError> {
        let mut events = self.open_stream(provider, request).await?;
        let mut prelude = Vec::new();
        loop {
            match events.next().await {
                Some(Ok(LlmEvent::Meta(meta))) => prelude.push(Ok(LlmEvent::Meta(meta))),
                Some(Ok(event)) => {
                    prelude.push(Ok(event));
                    break;
                }
                Some(Err(err)) => return Err(err),
                None => return Err(LlmError::Stream("stream closed before first delta".into())),
            }
        }
        Ok(stream::iter(prelude).chain(events).boxed())
    }

    pub async fn generate_stream(&self, request: &GenerateRequest, plan: &RoutePlan) -> Result<LlmStream, LlmError> {
        let mut last = LlmError::NoProvider;
        for (index, provider) in plan.order.iter().enumerate() {
            let opened = tokio::time::timeout(self.timeout, self.open_until_first_delta(provider, request))
                .await
                .unwrap_or(Err(LlmError::Timeout));
            match opened {
                Ok(events) => {
                    self.record_success(&provider.name).await;
                    return Ok(LlmStream {
                        provider: provider.name.clone(),
                        events,
                    });
                }
                Err(err) => {
                    self.record_failure(&provider.name, &err).await;
                    let advance = self.next_after(plan, index, &err);
                    last = err;
                    if !advance {
                        break;
                    }
                }
            }
        }
        Err(last)
    }

    // ============ Introspection ============

    pub async fn snapshot(&self) -> GatewaySnapshot {
        let stats = self.load_stats().await;
        let providers = self
            .providers
            .iter()
            .map(|p| {
                let s = stats.get(&p.name).copied().unwrap_or_default();
                ProviderSnapshot {
                    name: p.name.clone(),
                    url: p.url.clone(),
                    blocked: self.routing.blocklist.iter().any(|b| b == &p.name),
                    forced: self.routing.force_provider.as_deref() == Some(p.name.as_str()),
                    cooling_down: s.cooling_down,
                    stats: s,
                    health_score: health_score(
                        &s,
                        self.routing.health_streak_penalty_step,
                        self.routing.health_streak_penalty_max,
                    ),
                }
            })
            .collect();
        GatewaySnapshot {
            providers,
            blocklist: self.routing.blocklist.clone(),
            force_provider: self.routing.force_provider.clone(),
            health_routing_enabled: self.routing.health_routing_enabled,
            cost_steering_enabled: self.routing.cost_steering_enabled,
        }
    }
}

// ============ SSE parsing ============

/// Decode one dispatched SSE event. `event` is the `event:` field, if any;
/// otherwise the kind is read from the payload's `type`.
fn decode_event(event: Option<&str>, data: &str) -> Result<Option<LlmEvent>, LlmError> {
    let payload: Value = serde_json::from_str(data)
        .map_err(|e| LlmError::Stream(format!("undecodable event payload: {}", e)))?;
    let kind = event
        .map(str::to_string)
        .or_else(|| payload.get("type").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| "delta".to_string());
    match kind.as_str() {
        "meta" => Ok(Some(LlmEvent::Meta(payload))),
        "delta" => {
            let text = ["delta", "text", "content"]
                .iter()
                .find_map(|k| payload.get(*k).and_then(Value::as_str))
                .unwrap_or_default();
            if text.is_empty() {
                Ok(None)
            } else {
                Ok(Some(LlmEvent::Delta(text.to_string())))
            }
        }
        "done" => serde_json::from_value(payload)
            .map(|r| Some(LlmEvent::Done(r)))
            .map_err(|e| LlmError::Stream(format!("invalid done payload: {}", e))),
        "error" => Err(LlmError::Stream(
            payload
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("upstream error")
                .to_string(),
        )),
        _ => Ok(None),
    }
}

/// Parse an SSE body into [`LlmEvent`]s. Bytes are buffered until a full
/// line arrives, so multibyte characters split across reads stay intact.
/// Each read waits at most `idle`; a stalled provider ends the stream with
/// [`LlmError::Timeout`].
fn sse_events<S, B, E>(body: S, idle: Duration) -> LlmEventStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    Box::pin(try_stream! {
        let mut body = Box::pin(body);
        let mut buffer: Vec<u8> = Vec::new();
        let mut event_name: Option<String> = None;
        let mut data_buf = String::new();
        let mut aggregated = String::new();
        let mut finished = false;

        loop {
            let next = tokio::time::timeout(idle, body.next())
                .await
                .map_err(|_| LlmError::Timeout)?;
            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(|e| LlmError::Stream(e.to_string()))?;
            buffer.extend_from_slice(chunk.as_ref());

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = buffer.drain(..=pos).collect();
                let line = String::from_utf8(raw)
                    .map_err(|e| LlmError::Stream(format!("invalid utf-8 in stream: {}", e)))?;
                let line = line.trim_end_matches(|c: char| c == '\n' || c == '\r');

                if let Some(name) = line.strip_prefix("event:") {
                    event_name = Some(name.trim().to_string());
                } else if let Some(data) = line.strip_prefix("data:") {
                    if !data_buf.is_empty() {
                        data_buf.push('\n');
                    }
                    data_buf.push_str(data.trim_start());
                } else if line.is_empty() {
                    if data_buf.is_empty() {
                        event_name = None;
                        continue;
                    }
                    let decoded = decode_event(event_name.take().as_deref(), data_buf.trim_end())?;
                    data_buf.clear();
                    match decoded {
                        Some(LlmEvent::Delta(text)) => {
                            aggregated.push_str(&text);
                            yield LlmEvent::Delta(text);
                        }
                        Some(LlmEvent::Done(mut response)) => {
                            if response.content.is_empty() {
                                response.content = aggregated.clone();
                            }
                            yield LlmEvent::Done(response);
                            finished = true;
                            break;
                        }
                        Some(event) => yield event,
                        None => {}
                    }
                }
            }
            if finished {
                break;
            }
        }
        if !finished {
            Err(LlmError::Stream("stream ended without done".into()))?;
        }
    })
}
