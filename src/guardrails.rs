//! Cache-backed guardrails.
//!
//! Circuit breakers, ticket dedup and cooldown, the last-ticket cache and
//! the per-session LLM call budget all reduce to `INCR`+TTL and
//! `SET`/`SET NX`+TTL on the shared [`Cache`]. Cache failures fail open:
//! a guard that cannot read its state lets the call through and logs.

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};

use shelf_core::cache::{get_json, set_json, Cache};
use shelf_core::models::LastTicket;
use shelf_core::normalize::normalize_query;

use crate::config::{ChatConfig, ToolsConfig};

#[derive(Clone)]
pub struct Guardrails {
    cache: Arc<dyn Cache>,
    tools: ToolsConfig,
    llm_budget_limit: u32,
    llm_budget_window: Duration,
}

/// Fingerprint of a ticket issue for one user.
pub fn ticket_fingerprint(user_id: &str, issue: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    hasher.update(b"|");
    hasher.update(normalize_query(issue).as_bytes());
    hex::encode(hasher.finalize())[..24].to_string()
}

fn ticket_slot_key(user_id: &str) -> String {
    format!("ticket:cooldown:{}", user_id)
}

impl Guardrails {
    pub fn new(cache: Arc<dyn Cache>, tools: &ToolsConfig, chat: &ChatConfig) -> Self {
        Self {
            cache,
            tools: tools.clone(),
            llm_budget_limit: chat.llm_call_budget_limit,
            llm_budget_window: Duration::from_secs(chat.llm_call_budget_window_sec),
        }
    }

    pub fn cache(&self) -> &Arc<dyn Cache> {
        &self.cache
    }

    async fn remaining_ms(&self, key: &str) -> Option<u64> {
        match self.cache.ttl_ms(key).await {
            Ok(ttl) => ttl,
            Err(err) => {
                tracing::warn!(key, error = %err, "guardrail cache read failed; allowing");
                None
            }
        }
    }

    // ============ Circuit breaker ============

    /// `Some(retry_after_ms)` while the tool's circuit is open.
    pub async fn circuit_open(&self, tool: &str) -> Option<u64> {
        let key = format!("tool:circuit:open:{}", tool);
        match self.cache.get(&key).await {
            Ok(Some(_)) => Some(self.remaining_ms(&key).await.unwrap_or(0)),
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(tool, error = %err, "circuit state unreadable; allowing");
                None
            }
        }
    }

    /// Count a timeout; opens the circuit once the threshold is reached
    /// within the window. Returns `true` when this call opened it.
    pub async fn record_tool_timeout(&self, tool: &str) -> bool {
        let fail_key = format!("tool:circuit:fail:{}", tool);
        let window = Duration::from_secs(self.tools.tool_circuit_window_sec);
        let fails = match self.cache.incr(&fail_key, Some(window)).await {
            Ok(n) => n,
            Err(err) => {
                tracing::warn!(tool, error = %err, "circuit counter unavailable");
                return false;
            }
        };
        if fails < self.tools.tool_circuit_fail_threshold as i64 {
            return false;
        }
        let open_key = format!("tool:circuit:open:{}", tool);
        let open_for = Duration::from_secs(self.tools.tool_circuit_open_sec);
        let _ = self.cache.set(&open_key, "1", Some(open_for)).await;
        let _ = self.cache.delete(&fail_key).await;
        tracing::warn!(tool, fails, open_sec = self.tools.tool_circuit_open_sec, "tool circuit opened");
        true
    }

    pub async fn record_tool_success(&self, tool: &str) {
        let _ = self
            .cache
            .delete(&format!("tool:circuit:fail:{}", tool))
            .await;
    }

    // ============ Tickets ============

    pub async fn ticket_dedup(&self, user_id: &str, issue: &str) -> Option<LastTicket> {
        let key = format!("ticket:dedup:{}", ticket_fingerprint(user_id, issue));
        get_json(self.cache.as_ref(), &key).await.ok().flatten()
    }

    pub async fn remember_ticket_issue(&self, user_id: &str, issue: &str, ticket: &LastTicket) {
        let key = format!("ticket:dedup:{}", ticket_fingerprint(user_id, issue));
        let ttl = Duration::from_secs(self.tools.ticket_dedup_ttl_sec);
        if let Err(err) = set_json(self.cache.as_ref(), &key, ticket, Some(ttl)).await {
            tracing::warn!(error = %err, "failed to store ticket fingerprint");
        }
    }

    /// Claim the user's ticket-create slot with `SET NX`. The slot covers
    /// the in-flight create and then the cooldown. `Err(retry_after_ms)`
    /// when another create holds it.
    pub async fn claim_ticket_slot(&self, user_id: &str) -> Result<(), u64> {
        let key = ticket_slot_key(user_id);
        let cooldown = Duration::from_secs(self.tools.ticket_create_cooldown_sec);
        let hold = cooldown.max(self.ticket_inflight_ttl());
        match self.cache.set_nx(&key, "1", Some(hold)).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(self
                .remaining_ms(&key)
                .await
                .unwrap_or(hold.as_millis() as u64)),
            Err(err) => {
                tracing::warn!(error = %err, "ticket slot unavailable; allowing");
                Ok(())
            }
        }
    }

    /// Give the slot back after a failed create.
    pub async fn release_ticket_slot(&self, user_id: &str) {
        if let Err(err) = self.cache.delete(&ticket_slot_key(user_id)).await {
            tracing::warn!(error = %err, "failed to release ticket slot");
        }
    }

    /// Restart the cooldown from the moment the ticket exists.
    pub async fn start_ticket_cooldown(&self, user_id: &str) {
        let ttl = Duration::from_secs(self.tools.ticket_create_cooldown_sec);
        if ttl.is_zero() {
            self.release_ticket_slot(user_id).await;
            return;
        }
        let _ = self.cache.set(&ticket_slot_key(user_id), "1", Some(ttl)).await;
    }

    /// Upper bound on one create call, including lookup retries.
    fn ticket_inflight_ttl(&self) -> Duration {
        self.tools.lookup_timeout() * (self.tools.tool_lookup_retry + 1) + Duration::from_secs(1)
    }

    pub async fn user_last_ticket(&self, user_id: &str) -> Option<LastTicket> {
        get_json(self.cache.as_ref(), &format!("ticket:last:{}", user_id))
            .await
            .ok()
            .flatten()
    }

    pub async fn remember_user_ticket(&self, user_id: &str, ticket: &LastTicket) {
        let ttl = Duration::from_secs(self.tools.last_ticket_ttl_sec);
        let _ = set_json(
            self.cache.as_ref(),
            &format!("ticket:last:{}", user_id),
            ticket,
            Some(ttl),
        )
        .await;
    }

    // ============ LLM call budget ============

    /// Count one LLM call for the session. `Err(retry_after_ms)` once the
    /// budget for the current window is spent.
    pub async fn consume_llm_budget(&self, session_id: &str) -> Result<(), u64> {
        if self.llm_budget_limit == 0 {
            return Ok(());
        }
        let key = format!("llm:budget:{}", session_id);
        match self.cache.incr(&key, Some(self.llm_budget_window)).await {
            Ok(count) if count > self.llm_budget_limit as i64 => Err(self
                .remaining_ms(&key)
                .await
                .unwrap_or(self.llm_budget_window.as_millis() as u64)),
            Ok(_) => Ok(()),
            Err(err) => {
                tracing::warn!(error = %err, "llm budget counter unavailable; allowing");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use shelf_core::cache::memory::InMemoryCache;

    fn guardrails(tools: ToolsConfig, chat: ChatConfig) -> Guardrails {
        Guardrails::new(Arc::new(InMemoryCache::new()), &tools, &chat)
    }

    #[tokio::test]
    async fn test_circuit_opens_after_threshold() {
        let g = guardrails(
            ToolsConfig {
                tool_circuit_fail_threshold: 2,
                ..Default::default()
            },
            ChatConfig::default(),
        );
        assert!(!g.record_tool_timeout("order_lookup").await);
        assert!(g.circuit_open("order_lookup").await.is_none());
        assert!(g.record_tool_timeout("order_lookup").await);
        let retry_after = g.circuit_open("order_lookup").await.unwrap();
        assert!(retry_after > 0);
        assert!(g.circuit_open("ticket_create").await.is_none());
    }

    #[tokio::test]
    async fn test_success_resets_failures() {
        let g = guardrails(
            ToolsConfig {
                tool_circuit_fail_threshold: 2,
                ..Default::default()
            },
            ChatConfig::default(),
        );
        g.record_tool_timeout("t").await;
        g.record_tool_success("t").await;
        assert!(!g.record_tool_timeout("t").await);
    }

    #[tokio::test]
    async fn test_ticket_dedup_is_per_user_and_normalized() {
        let g = guardrails(ToolsConfig::default(), ChatConfig::default());
        let ticket = LastTicket {
            ticket_no: "STK-0001".into(),
            ticket_id: Some("1".into()),
            owner_user_id: Some("1".into()),
            created_at: Utc::now(),
        };
        g.remember_ticket_issue("1", "결제가  안돼", &ticket).await;
        assert_eq!(g.ticket_dedup("1", "결제가 안돼").await, Some(ticket));
        assert!(g.ticket_dedup("2", "결제가 안돼").await.is_none());
    }

    #[tokio::test]
    async fn test_ticket_slot_is_exclusive_until_released() {
        let g = guardrails(ToolsConfig::default(), ChatConfig::default());
        assert!(g.claim_ticket_slot("1").await.is_ok());
        let retry_after = g.claim_ticket_slot("1").await.unwrap_err();
        assert!(retry_after > 0);
        assert!(g.claim_ticket_slot("2").await.is_ok());

        g.release_ticket_slot("1").await;
        assert!(g.claim_ticket_slot("1").await.is_ok());
    }

    #[tokio::test]
    async fn test_zero_cooldown_frees_slot_after_create() {
        let g = guardrails(
            ToolsConfig {
                ticket_create_cooldown_sec: 0,
                ..Default::default()
            },
            ChatConfig::default(),
        );
        assert!(g.claim_ticket_slot("1").await.is_ok());
        assert!(g.claim_ticket_slot("1").await.is_err());
        g.start_ticket_cooldown("1").await;
        assert!(g.claim_ticket_slot("1").await.is_ok());
    }

    #[tokio::test]
    async fn test_llm_budget() {
        let g = guardrails(
            ToolsConfig::default(),
            ChatConfig {
                llm_call_budget_limit: 2,
                ..Default::default()
            },
        );
        assert!(g.consume_llm_budget("s").await.is_ok());
        assert!(g.consume_llm_budget("s").await.is_ok());
        let retry_after = g.consume_llm_budget("s").await.unwrap_err();
        assert!(retry_after > 0);
        assert!(g.consume_llm_budget("other").await.is_ok());
    }
}
