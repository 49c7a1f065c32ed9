//! PII redaction applied at the persistence and logging edge.
//!
//! Emails, phone numbers, payment-card-like digit runs and Korean-style
//! postal addresses are replaced with `[REDACTED:<KIND>]`. Cards are
//! matched before phones so a 16-digit run is never half-eaten by the
//! phone pattern.

use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde_json::Value;

use crate::metrics::Metrics;
use crate::models::SessionState;

pub const REDACTION_METRIC: &str = "chat_pii_redaction_total";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PiiKind {
    Email,
    Card,
    Phone,
    Address,
}

impl PiiKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PiiKind::Email => "EMAIL",
            PiiKind::Card => "CARD",
            PiiKind::Phone => "PHONE",
            PiiKind::Address => "ADDRESS",
        }
    }
}

fn patterns() -> &'static [(PiiKind, Regex)] {
    static PATTERNS: OnceLock<Vec<(PiiKind, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (
                PiiKind::Email,
                r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}",
            ),
            (PiiKind::Card, r"\b(?:\d[ \-]?){12,18}\d\b"),
            (
                PiiKind::Phone,
                r"(?:\+82[ \-]?|\b0)(?:1[016789]|[2-6]\d?)[ \-.]?\d{3,4}[ \-.]?\d{4}\b",
            ),
            (
                PiiKind::Address,
                r"[가-힣]{1,10}(?:특별시|광역시|시|도)?\s*[가-힣]{1,10}(?:구|군)\s+[가-힣0-9]{1,20}(?:로|길|동)(?:\s*\d{1,5}(?:-\d{1,5})?)?",
            ),
        ]
        .into_iter()
        .map(|(kind, pattern)| (kind, Regex::new(pattern).expect("static PII pattern")))
        .collect()
    })
}

/// Stateless redactor; counts replacements when built with metrics.
#[derive(Clone, Default)]
pub struct Redactor {
    metrics: Option<Arc<Metrics>>,
}

impl Redactor {
    pub fn new() -> Self {
        Self { metrics: None }
    }

    pub fn with_metrics(metrics: Arc<Metrics>) -> Self {
        Self {
            metrics: Some(metrics),
        }
    }

    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for (kind, re) in patterns() {
            let hits = re.find_iter(&out).count();
            if hits == 0 {
                continue;
            }
            let marker = format!("[REDACTED:{}]", kind.as_str());
            out = re.replace_all(&out, marker.as_str()).into_owned();
            if let Some(metrics) = &self.metrics {
                metrics.inc_by(REDACTION_METRIC, &[("kind", kind.as_str())], hits as f64);
            }
        }
        out
    }

    /// Redact every string leaf of a JSON value.
    pub fn redact_json(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.redact(s)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.redact_json(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.redact_json(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Scrub the PII-bearing fields of a session before it is stored.
    pub fn redact_session(&self, state: &mut SessionState) {
        if let Some(ctx) = state.unresolved_context.as_mut() {
            ctx.query_preview = self.redact(&ctx.query_preview);
        }
        if let Some(summary) = state.summary_short.as_mut() {
            *summary = self.redact(summary);
        }
        if let Some(pending) = state.pending_action.as_mut() {
            pending.args = self.redact_json(&pending.args);
        }
    }
}
