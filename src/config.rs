//! TOML configuration.
//!
//! Every section and field is defaulted, so an empty file is a valid
//! config for local development. After parsing, recognized `SHELF_*`
//! environment variables override URLs, routing and toggles, and
//! [`load_config`] validates the result.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use shelf_core::guard::DEFAULT_FORBIDDEN_CLAIMS;
use shelf_core::routing::{providers_from_urls, Provider, RoutingConfig};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub rag: RagConfig,
    #[serde(default)]
    pub model_service: ModelServiceConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub reindex: ReindexConfig,
}

fn secs(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}

// ============ server / db / cache ============

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/shelf.sqlite")
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    Memory,
    Redis,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub backend: CacheBackend,
    pub redis_url: Option<String>,
    pub key_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::Memory,
            redis_url: None,
            key_prefix: "shelf".to_string(),
        }
    }
}

// ============ session / chat ============

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogMessageMode {
    /// Store the redacted user text.
    MaskedRaw,
    /// Store only `{sha256, length}`.
    HashSummary,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    pub enabled: bool,
    pub tenant_id: String,
    pub log_message_mode: LogMessageMode,
    pub session_days: i64,
    pub turn_event_days: i64,
    pub action_audit_days: i64,
    pub retention_batch_size: usize,
    pub retention_max_batches: usize,
    /// Sessions get `expires_at = now + session_ttl_days` on every write.
    pub session_ttl_days: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tenant_id: "books".to_string(),
            log_message_mode: LogMessageMode::MaskedRaw,
            session_days: 30,
            turn_event_days: 30,
            action_audit_days: 180,
            retention_batch_size: 500,
            retention_max_batches: 20,
            session_ttl_days: 7,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ChatConfig {
    pub max_message_chars: usize,
    pub max_history_turns: usize,
    pub session_id_regex: String,
    pub fallback_escalate_threshold: u32,
    pub min_coverage_ratio: f64,
    pub llm_call_budget_limit: u32,
    pub llm_call_budget_window_sec: u64,
    pub forbidden_claims: Vec<String>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_message_chars: 2000,
            max_history_turns: 30,
            session_id_regex: r"^[A-Za-z0-9][A-Za-z0-9:_\-.]{0,127}$".to_string(),
            fallback_escalate_threshold: 3,
            min_coverage_ratio: 0.15,
            llm_call_budget_limit: 20,
            llm_call_budget_window_sec: 60,
            forbidden_claims: DEFAULT_FORBIDDEN_CLAIMS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

// ============ llm ============

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LlmConfig {
    pub url: String,
    pub fallback_urls: Vec<String>,
    pub force_provider: Option<String>,
    pub blocklist: Vec<String>,
    /// JSON object mapping intent → provider name.
    pub provider_by_intent_json: Option<String>,
    pub cost_steering_enabled: bool,
    pub low_cost_provider: Option<String>,
    /// JSON object mapping provider name → relative cost.
    pub provider_costs_json: Option<String>,
    pub risk_high_keywords: Vec<String>,
    pub health_routing_enabled: bool,
    pub health_min_sample: u64,
    pub health_streak_penalty_step: f64,
    pub health_streak_penalty_max: f64,
    pub provider_cooldown_sec: u64,
    pub stats_window_sec: u64,
    pub timeout_sec: f64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8010".to_string(),
            fallback_urls: Vec::new(),
            force_provider: None,
            blocklist: Vec::new(),
            provider_by_intent_json: None,
            cost_steering_enabled: false,
            low_cost_provider: None,
            provider_costs_json: None,
            risk_high_keywords: [
                "환불", "취소", "결제", "배송", "법", "의료", "refund", "cancel", "payment",
                "legal", "medical",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            health_routing_enabled: true,
            health_min_sample: 5,
            health_streak_penalty_step: 0.1,
            health_streak_penalty_max: 0.5,
            provider_cooldown_sec: 30,
            stats_window_sec: 300,
            timeout_sec: 20.0,
        }
    }
}

fn parse_json_map<T: serde::de::DeserializeOwned>(
    raw: &Option<String>,
    field: &str,
) -> Result<HashMap<String, T>> {
    match raw.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(text) => serde_json::from_str(text)
            .with_context(|| format!("llm.{} must be a JSON object", field)),
        None => Ok(HashMap::new()),
    }
}

impl LlmConfig {
    pub fn providers(&self) -> Vec<Provider> {
        providers_from_urls(&self.url, &self.fallback_urls)
    }

    pub fn timeout(&self) -> Duration {
        secs(self.timeout_sec)
    }

    pub fn routing(&self) -> Result<RoutingConfig> {
        Ok(RoutingConfig {
            force_provider: self.force_provider.clone().filter(|s| !s.is_empty()),
            blocklist: self.blocklist.clone(),
            provider_by_intent: parse_json_map(
                &self.provider_by_intent_json,
                "provider_by_intent_json",
            )?,
            cost_steering_enabled: self.cost_steering_enabled,
            low_cost_provider: self.low_cost_provider.clone().filter(|s| !s.is_empty()),
            provider_costs: parse_json_map(&self.provider_costs_json, "provider_costs_json")?,
            risk_high_keywords: self.risk_high_keywords.clone(),
            health_routing_enabled: self.health_routing_enabled,
            health_min_sample: self.health_min_sample,
            health_streak_penalty_step: self.health_streak_penalty_step,
            health_streak_penalty_max: self.health_streak_penalty_max,
        })
    }
}

// ============ rag / model service ============

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RagConfig {
    pub os_url: String,
    pub docs_doc_alias: String,
    pub docs_vec_alias: String,
    pub top_n: usize,
    pub top_k: usize,
    pub rrf_k: f64,
    pub rerank_enabled: bool,
    pub rerank_top_n: usize,
    pub rerank_timeout_sec: f64,
    pub rag_timeout_sec: f64,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            os_url: "http://127.0.0.1:9200".to_string(),
            docs_doc_alias: "docs_doc_read".to_string(),
            docs_vec_alias: "docs_vec_read".to_string(),
            top_n: 40,
            top_k: 6,
            rrf_k: 60.0,
            rerank_enabled: false,
            rerank_top_n: 20,
            rerank_timeout_sec: 2.0,
            rag_timeout_sec: 5.0,
        }
    }
}

impl RagConfig {
    pub fn timeout(&self) -> Duration {
        secs(self.rag_timeout_sec)
    }

    pub fn rerank_timeout(&self) -> Duration {
        secs(self.rerank_timeout_sec)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ModelServiceConfig {
    pub url: String,
    pub embed_model: String,
    pub rerank_model: String,
    pub timeout_sec: f64,
}

impl Default for ModelServiceConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8010".to_string(),
            embed_model: "bge-m3".to_string(),
            rerank_model: "bge-reranker-v2-m3".to_string(),
            timeout_sec: 5.0,
        }
    }
}

impl ModelServiceConfig {
    pub fn timeout(&self) -> Duration {
        secs(self.timeout_sec)
    }
}

// ============ tools ============

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ToolsConfig {
    pub commerce_base_url: String,
    pub tool_lookup_timeout_sec: f64,
    pub tool_lookup_retry: u32,
    pub tool_circuit_fail_threshold: u32,
    pub tool_circuit_window_sec: u64,
    pub tool_circuit_open_sec: u64,
    pub ticket_create_cooldown_sec: u64,
    pub ticket_dedup_ttl_sec: u64,
    pub last_ticket_ttl_sec: u64,
    pub confirm_ttl_sec: i64,
    pub max_retry: u32,
    pub recommend_top_k: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            commerce_base_url: "http://127.0.0.1:8091/api/v1".to_string(),
            tool_lookup_timeout_sec: 3.0,
            tool_lookup_retry: 1,
            tool_circuit_fail_threshold: 3,
            tool_circuit_window_sec: 60,
            tool_circuit_open_sec: 30,
            ticket_create_cooldown_sec: 30,
            ticket_dedup_ttl_sec: 600,
            last_ticket_ttl_sec: 86_400,
            confirm_ttl_sec: 300,
            max_retry: 2,
            recommend_top_k: 5,
        }
    }
}

impl ToolsConfig {
    pub fn lookup_timeout(&self) -> Duration {
        secs(self.tool_lookup_timeout_sec)
    }
}

// ============ reindex ============

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ReindexConfig {
    pub os_url: String,
    /// Write alias, moved to the new index on swap.
    pub doc_alias: String,
    pub doc_read_alias: String,
    pub logical_name: String,
    pub index_prefix: String,
    pub mapping_path: PathBuf,
    pub batch_size: usize,
    pub bulk_size: usize,
    pub lookup_chunk_size: usize,
    pub retry_max: u32,
    pub retry_backoff_sec: f64,
    pub max_failures: u64,
    pub refresh_interval_bulk: String,
    pub refresh_interval_post: String,
    pub job_poll_interval_sec: u64,
    pub delete_existing: bool,
    pub verify_queries: Vec<String>,
}

impl Default for ReindexConfig {
    fn default() -> Self {
        Self {
            os_url: "http://127.0.0.1:9200".to_string(),
            doc_alias: "books_doc_write".to_string(),
            doc_read_alias: "books_doc_read".to_string(),
            logical_name: "books_doc".to_string(),
            index_prefix: "books_doc".to_string(),
            mapping_path: PathBuf::from("./config/mappings/books_doc.json"),
            batch_size: 1000,
            bulk_size: 500,
            lookup_chunk_size: 200,
            retry_max: 3,
            retry_backoff_sec: 1.0,
            max_failures: 1000,
            refresh_interval_bulk: "-1".to_string(),
            refresh_interval_post: "1s".to_string(),
            job_poll_interval_sec: 5,
            delete_existing: false,
            verify_queries: Vec::new(),
        }
    }
}

impl ReindexConfig {
    pub fn retry_backoff(&self) -> Duration {
        secs(self.retry_backoff_sec)
    }
}

// ============ loading ============

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Apply `SHELF_*` overrides. `lookup` is `std::env::var` outside tests.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    let set_string = |target: &mut String, key: &str| {
        if let Some(v) = lookup(key).filter(|v| !v.trim().is_empty()) {
            *target = v;
        }
    };
    set_string(&mut config.server.bind, "SHELF_SERVER_BIND");
    set_string(&mut config.llm.url, "SHELF_LLM_URL");
    set_string(&mut config.rag.os_url, "SHELF_OS_URL");
    set_string(&mut config.reindex.os_url, "SHELF_OS_URL");
    set_string(&mut config.model_service.url, "SHELF_MODEL_SERVICE_URL");
    set_string(&mut config.tools.commerce_base_url, "SHELF_COMMERCE_BASE_URL");
    set_string(&mut config.session.tenant_id, "SHELF_TENANT_ID");

    if let Some(path) = lookup("SHELF_DB_PATH").filter(|v| !v.is_empty()) {
        config.db.path = PathBuf::from(path);
    }
    if let Some(url) = lookup("SHELF_REDIS_URL").filter(|v| !v.is_empty()) {
        config.cache.redis_url = Some(url);
        config.cache.backend = CacheBackend::Redis;
    }
    if let Some(list) = lookup("SHELF_LLM_FALLBACK_URLS") {
        config.llm.fallback_urls = split_list(&list);
    }
    if let Some(list) = lookup("SHELF_LLM_BLOCKLIST") {
        config.llm.blocklist = split_list(&list);
    }
    if let Some(forced) = lookup("SHELF_LLM_FORCE_PROVIDER") {
        config.llm.force_provider = Some(forced).filter(|s| !s.trim().is_empty());
    }
    if let Some(json) = lookup("SHELF_LLM_PROVIDER_BY_INTENT_JSON") {
        config.llm.provider_by_intent_json = Some(json);
    }
    if let Some(json) = lookup("SHELF_LLM_PROVIDER_COSTS_JSON") {
        config.llm.provider_costs_json = Some(json);
    }
    if let Some(name) = lookup("SHELF_LLM_LOW_COST_PROVIDER") {
        config.llm.low_cost_provider = Some(name).filter(|s| !s.trim().is_empty());
    }
    let toggles: [(&str, &mut bool); 4] = [
        ("SHELF_LLM_COST_STEERING_ENABLED", &mut config.llm.cost_steering_enabled),
        ("SHELF_LLM_HEALTH_ROUTING_ENABLED", &mut config.llm.health_routing_enabled),
        ("SHELF_RAG_RERANK_ENABLED", &mut config.rag.rerank_enabled),
        ("SHELF_SESSION_ENABLED", &mut config.session.enabled),
    ];
    for (key, target) in toggles {
        if let Some(flag) = lookup(key).and_then(|v| parse_bool(&v)) {
            *target = flag;
        }
    }
}

pub fn validate(config: &Config) -> Result<()> {
    if config.chat.max_message_chars == 0 {
        bail!("chat.max_message_chars must be > 0");
    }
    regex::Regex::new(&config.chat.session_id_regex)
        .with_context(|| "chat.session_id_regex is not a valid regex")?;
    if !(0.0..=1.0).contains(&config.chat.min_coverage_ratio) {
        bail!("chat.min_coverage_ratio must be in [0.0, 1.0]");
    }
    if config.chat.llm_call_budget_window_sec == 0 {
        bail!("chat.llm_call_budget_window_sec must be > 0");
    }

    if config.llm.url.trim().is_empty() {
        bail!("llm.url must be set");
    }
    config.llm.routing()?;

    if config.rag.top_k == 0 || config.rag.top_n == 0 {
        bail!("rag.top_n and rag.top_k must be >= 1");
    }
    if config.rag.top_k > config.rag.top_n {
        bail!("rag.top_k must be <= rag.top_n");
    }
    if config.rag.rrf_k <= 0.0 {
        bail!("rag.rrf_k must be > 0");
    }

    if config.tools.confirm_ttl_sec <= 0 {
        bail!("tools.confirm_ttl_sec must be > 0");
    }

    if config.cache.backend == CacheBackend::Redis && config.cache.redis_url.is_none() {
        bail!("cache.redis_url must be set when cache.backend = \"redis\"");
    }

    if config.reindex.batch_size == 0
        || config.reindex.bulk_size == 0
        || config.reindex.lookup_chunk_size == 0
    {
        bail!("reindex.batch_size, bulk_size and lookup_chunk_size must be > 0");
    }

    if config.session.retention_batch_size == 0 {
        bail!("session.retention_batch_size must be > 0");
    }

    Ok(())
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    validate(&config)?;

    Ok(config)
}
