//! Commerce API client.
//!
//! Every call carries the caller's identity and trace headers
//! (`x-user-id`, `x-tenant-id`, `x-trace-id`, `x-request-id`). Lookups
//! retry timeouts and transport failures with a linear backoff of
//! `0.12 × (attempt + 1)` seconds; mutations never retry here and always
//! send an `Idempotency-Key`.

use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde_json::{json, Value};

use shelf_core::reason::{
    AUTH_FORBIDDEN, MISSING_REQUIRED_INFO, RATE_LIMITED, RESOURCE_NOT_FOUND, TOOL_RETRYABLE_FAILURE,
    TOOL_TIMEOUT,
};

use crate::config::ToolsConfig;

#[derive(Debug, thiserror::Error)]
pub enum CommerceError {
    #[error("commerce request timed out")]
    Timeout,
    #[error("commerce transport error: {0}")]
    Transport(String),
    #[error("commerce returned {status}: {code}: {message}")]
    Http {
        status: u16,
        code: String,
        message: String,
    },
    #[error("invalid commerce response: {0}")]
    Decode(String),
}

impl CommerceError {
    pub fn status(&self) -> Option<u16> {
        match self {
            CommerceError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, CommerceError::Timeout)
    }

    /// Worth trying again: timeouts, transport failures, 429 and 5xx.
    pub fn retryable(&self) -> bool {
        match self {
            CommerceError::Timeout | CommerceError::Transport(_) => true,
            CommerceError::Http { status, .. } => *status == 429 || *status >= 500,
            CommerceError::Decode(_) => false,
        }
    }

    pub fn reason_code(&self) -> &'static str {
        match self {
            CommerceError::Timeout => TOOL_TIMEOUT,
            CommerceError::Http { status: 404, .. } => RESOURCE_NOT_FOUND,
            CommerceError::Http {
                status: 401 | 403, ..
            } => AUTH_FORBIDDEN,
            CommerceError::Http { status: 429, .. } => RATE_LIMITED,
            CommerceError::Http { status, .. } if (400..500).contains(status) => {
                MISSING_REQUIRED_INFO
            }
            _ => TOOL_RETRYABLE_FAILURE,
        }
    }
}

/// Identity and correlation ids forwarded on every commerce call.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub user_id: Option<String>,
    pub tenant_id: String,
    pub trace_id: String,
    pub request_id: String,
}

/// Linear backoff before retry `attempt` (0-based).
pub fn lookup_backoff(attempt: u32) -> Duration {
    Duration::from_millis(120 * (attempt as u64 + 1))
}

#[derive(Clone)]
pub struct CommerceClient {
    http: Client,
    base_url: String,
    timeout: Duration,
    lookup_retry: u32,
}

impl CommerceClient {
    pub fn new(config: &ToolsConfig) -> Self {
        Self {
            http: Client::new(),
            base_url: config.commerce_base_url.trim_end_matches('/').to_string(),
            timeout: config.lookup_timeout(),
            lookup_retry: config.tool_lookup_retry,
        }
    }

    fn request(&self, method: Method, path: &str, ctx: &CallContext) -> RequestBuilder {
        let mut builder = self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .timeout(self.timeout)
            .header("x-tenant-id", &ctx.tenant_id)
            .header("x-trace-id", &ctx.trace_id)
            .header("x-request-id", &ctx.request_id);
        if let Some(user) = &ctx.user_id {
            builder = builder.header("x-user-id", user);
        }
        builder
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Value, CommerceError> {
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                CommerceError::Timeout
            } else {
                CommerceError::Transport(e.to_string())
            }
        })?;
        let status = response.status();
        let text = if status == StatusCode::NO_CONTENT {
            String::new()
        } else {
            response.text().await.map_err(|e| {
                if e.is_timeout() {
                    CommerceError::Timeout
                } else {
                    CommerceError::Transport(e.to_string())
                }
            })?
        };
        if status.is_success() {
            if text.trim().is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_str(&text).map_err(|e| CommerceError::Decode(e.to_string()));
        }
        // Error bodies from proxies are often HTML or plain text; the status decides.
        let body: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
        let error = body.get("error");
        Err(CommerceError::Http {
            status: status.as_u16(),
            code: error
                .and_then(|e| e.get("code"))
                .and_then(Value::as_str)
                .unwrap_or("error")
                .to_string(),
            message: error
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }

    /// GET with bounded retries on timeouts and transport errors.
    pub async fn lookup(&self, path: &str, ctx: &CallContext) -> Result<Value, CommerceError> {
        let mut attempt = 0;
        loop {
            match self.send(self.request(Method::GET, path, ctx)).await {
                Err(err @ (CommerceError::Timeout | CommerceError::Transport(_)))
                    if attempt < self.lookup_retry =>
                {
                    tracing::warn!(path, attempt, error = %err, trace_id = %ctx.trace_id, "commerce lookup failed; retrying");
                    tokio::time::sleep(lookup_backoff(attempt)).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn mutate(
        &self,
        path: &str,
        body: &Value,
        ctx: &CallContext,
        idempotency_key: Option<&str>,
    ) -> Result<Value, CommerceError> {
        let mut builder = self.request(Method::POST, path, ctx).json(body);
        if let Some(key) = idempotency_key {
            builder = builder.header("Idempotency-Key", key);
        }
        self.send(builder).await
    }

    // ============ Orders ============

    pub async fn get_order(&self, order_ref: &str, ctx: &CallContext) -> Result<Value, CommerceError> {
        self.lookup(&format!("/orders/{}", order_ref), ctx).await
    }

    pub async fn list_orders(&self, limit: usize, ctx: &CallContext) -> Result<Value, CommerceError> {
        self.lookup(&format!("/orders?limit={}", limit), ctx).await
    }

    pub async fn cancel_order(
        &self,
        order_ref: &str,
        reason: &str,
        ctx: &CallContext,
        idempotency_key: &str,
    ) -> Result<Value, CommerceError> {
        self.mutate(
            &format!("/orders/{}/cancel", order_ref),
            &json!({ "reason": reason }),
            ctx,
            Some(idempotency_key),
        )
        .await
    }

    pub async fn create_refund(
        &self,
        order_ref: &str,
        reason: &str,
        ctx: &CallContext,
        idempotency_key: &str,
    ) -> Result<Value, CommerceError> {
        self.mutate(
            "/refunds",
            &json!({ "order_id": order_ref, "reason": reason }),
            ctx,
            Some(idempotency_key),
        )
        .await
    }

    pub async fn shipment_by_order(
        &self,
        order_ref: &str,
        ctx: &CallContext,
    ) -> Result<Value, CommerceError> {
        self.lookup(&format!("/shipments/by-order/{}", order_ref), ctx)
            .await
    }

    pub async fn refund_by_order(
        &self,
        order_ref: &str,
        ctx: &CallContext,
    ) -> Result<Value, CommerceError> {
        self.lookup(&format!("/refunds/by-order/{}", order_ref), ctx)
            .await
    }

    // ============ Support tickets ============

    pub async fn create_ticket(
        &self,
        issue: &str,
        ctx: &CallContext,
        idempotency_key: &str,
    ) -> Result<Value, CommerceError> {
        self.mutate(
            "/support/tickets",
            &json!({ "summary": issue, "channel": "chat" }),
            ctx,
            Some(idempotency_key),
        )
        .await
    }

    pub async fn list_tickets(&self, limit: usize, ctx: &CallContext) -> Result<Value, CommerceError> {
        self.lookup(&format!("/support/tickets?limit={}", limit), ctx)
            .await
    }

    pub async fn ticket_by_number(
        &self,
        ticket_no: &str,
        ctx: &CallContext,
    ) -> Result<Value, CommerceError> {
        self.lookup(&format!("/support/tickets/by-number/{}", ticket_no), ctx)
            .await
    }

    pub async fn ticket_events(
        &self,
        ticket_id: &str,
        ctx: &CallContext,
    ) -> Result<Value, CommerceError> {
        self.lookup(&format!("/support/tickets/{}/events", ticket_id), ctx)
            .await
    }

    // ============ Cart ============

    pub async fn get_cart(&self, ctx: &CallContext) -> Result<Value, CommerceError> {
        self.lookup("/cart", ctx).await
    }
}

/// Unwrap `{"<key>": {...}}` envelopes; bare objects pass through.
pub fn unwrap_envelope<'a>(body: &'a Value, key: &str) -> &'a Value {
    body.get(key).unwrap_or(body)
}

/// Unwrap list responses shaped `{"items": [...]}`, `{"<key>": [...]}` or `[...]`.
pub fn unwrap_list<'a>(body: &'a Value, key: &str) -> Vec<&'a Value> {
    body.get(key)
        .or_else(|| body.get("items"))
        .unwrap_or(body)
        .as_array()
        .map(|items| items.iter().collect())
        .unwrap_or_default()
}

/// String-or-number field as a string.
pub fn field_str(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
