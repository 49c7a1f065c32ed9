//! Output guards applied before a response leaves the service.
//!
//! * [`apply_claim_guard`] rewrites completion claims that no tool result
//!   backs up.
//! * [`validate_citations`] checks LLM citations against the retrieval set
//!   and computes coverage.
//! * [`violates_output_guard`] flags certainty claims on high-risk queries.
//! * [`risk_band`] classifies the finished turn.

use std::collections::HashSet;

use crate::models::{Reply, RiskBand};
use crate::reason::{
    DENY_CLAIM_NOT_CONFIRMED, DENY_CLAIM_NO_TOOL_RESULT, LLM_LOW_CITATION_COVERAGE,
    LLM_NO_CITATIONS,
};

pub const SUCCESS_CLAIM_TOKENS: &[&str] = &[
    "완료",
    "completed",
    "처리되었습니다",
    "처리됐습니다",
];

pub const DEFAULT_FORBIDDEN_CLAIMS: &[&str] = &["반드시", "100%", "무조건", "guaranteed"];

pub const SAFE_GENERIC_MESSAGE: &str =
    "정확한 안내를 위해 확인이 더 필요합니다. 고객센터 문의를 남겨 주시면 담당자가 확인해 드리겠습니다.";

const NO_TOOL_RESULT_MESSAGE: &str =
    "요청하신 작업의 처리 결과를 확인하지 못했습니다. 잠시 후 다시 시도해 주세요.";
const NOT_CONFIRMED_MESSAGE: &str =
    "아직 확인되지 않은 작업이 있습니다. 안내된 확인 코드를 입력해 주세요.";

pub fn claims_completion(content: &str) -> bool {
    let lowered = content.to_lowercase();
    SUCCESS_CLAIM_TOKENS.iter().any(|t| lowered.contains(t))
}

/// Tool-side facts the claim guard needs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClaimContext {
    pub tool_succeeded: bool,
    pub awaiting_confirmation: bool,
}

/// Rewrite a reply whose content claims completion without a successful
/// tool result or any citation.
pub fn apply_claim_guard(reply: Reply, ctx: ClaimContext) -> Reply {
    if !claims_completion(&reply.content) || ctx.tool_succeeded || !reply.citations.is_empty() {
        return reply;
    }
    if ctx.awaiting_confirmation {
        Reply::new(DENY_CLAIM_NOT_CONFIRMED, NOT_CONFIRMED_MESSAGE)
    } else {
        Reply::new(DENY_CLAIM_NO_TOOL_RESULT, NO_TOOL_RESULT_MESSAGE)
    }
}

/// One selected retrieval chunk, as far as citation checking cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evidence {
    pub chunk_id: String,
    pub citation_key: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CitationCheck {
    /// Returned citations that matched, deduplicated, in returned order.
    pub valid: Vec<String>,
    /// Indices into the evidence slice that were cited.
    pub cited: Vec<usize>,
    pub coverage: f64,
    /// Failure reason code, `None` when the citations pass.
    pub reason: Option<&'static str>,
}

pub fn validate_citations(
    returned: &[String],
    evidence: &[Evidence],
    min_coverage: f64,
) -> CitationCheck {
    let mut valid = Vec::new();
    let mut seen = HashSet::new();
    let mut cited: Vec<usize> = Vec::new();

    for citation in returned {
        let citation = citation.trim();
        let hit = evidence
            .iter()
            .position(|e| e.chunk_id == citation || e.citation_key == citation);
        if let Some(idx) = hit {
            if seen.insert(citation.to_string()) {
                valid.push(citation.to_string());
            }
            if !cited.contains(&idx) {
                cited.push(idx);
            }
        }
    }

    let coverage = if evidence.is_empty() {
        0.0
    } else {
        cited.len() as f64 / evidence.len() as f64
    };
    let reason = if valid.is_empty() {
        Some(LLM_NO_CITATIONS)
    } else if coverage < min_coverage {
        Some(LLM_LOW_CITATION_COVERAGE)
    } else {
        None
    };

    CitationCheck {
        valid,
        cited,
        coverage,
        reason,
    }
}

pub fn violates_output_guard(content: &str, high_risk: bool, forbidden: &[String]) -> bool {
    if !high_risk {
        return false;
    }
    let lowered = content.to_lowercase();
    forbidden
        .iter()
        .filter(|f| !f.is_empty())
        .any(|f| lowered.contains(&f.to_lowercase()))
}

pub fn risk_band(provider_error: bool, ok: bool, high_risk: bool, has_citations: bool) -> RiskBand {
    if provider_error {
        RiskBand::R3
    } else if ok && high_risk && has_citations {
        RiskBand::R2
    } else {
        RiskBand::R1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Source;
    use crate::reason::OK;

    fn evidence(ids: &[&str]) -> Vec<Evidence> {
        ids.iter()
            .map(|id| Evidence {
                chunk_id: id.to_string(),
                citation_key: format!("{}#key", id),
            })
            .collect()
    }

    #[test]
    fn test_claim_without_citations_is_rewritten() {
        let reply = Reply::ok("주문 취소가 완료되었습니다.");
        let out = apply_claim_guard(reply, ClaimContext::default());
        assert_eq!(out.reason_code, DENY_CLAIM_NO_TOOL_RESULT);
        assert!(!claims_completion(&out.content));
    }

    #[test]
    fn test_claim_while_awaiting_confirmation() {
        let reply = Reply::ok("처리되었습니다");
        let out = apply_claim_guard(
            reply,
            ClaimContext {
                tool_succeeded: false,
                awaiting_confirmation: true,
            },
        );
        assert_eq!(out.reason_code, DENY_CLAIM_NOT_CONFIRMED);
    }

    #[test]
    fn test_claim_with_tool_citation_passes() {
        let reply = Reply::ok("문의 접수가 완료되었습니다.")
            .with_sources(vec![Source::new("COMMERCE / support/tickets/1", "ticket")]);
        let out = apply_claim_guard(reply.clone(), ClaimContext::default());
        assert_eq!(out, reply);
        assert_eq!(out.reason_code, OK);
    }

    #[test]
    fn test_citations_match_chunk_or_key() {
        let ev = evidence(&["chunk-1", "chunk-2"]);
        let check = validate_citations(
            &["chunk-1".into(), "chunk-2#key".into(), "bogus".into()],
            &ev,
            0.5,
        );
        assert_eq!(check.valid, vec!["chunk-1".to_string(), "chunk-2#key".to_string()]);
        assert_eq!(check.cited, vec![0, 1]);
        assert_eq!(check.reason, None);
    }

    #[test]
    fn test_no_valid_citations() {
        let check = validate_citations(&["bogus".into()], &evidence(&["chunk-1"]), 0.1);
        assert_eq!(check.reason, Some(LLM_NO_CITATIONS));
        let check = validate_citations(&[], &evidence(&["chunk-1"]), 0.1);
        assert_eq!(check.reason, Some(LLM_NO_CITATIONS));
    }

    #[test]
    fn test_low_coverage() {
        let ev = evidence(&["a", "b", "c", "d"]);
        let check = validate_citations(&["a".into(), "a".into()], &ev, 0.5);
        assert_eq!(check.cited.len(), 1);
        assert_eq!(check.reason, Some(LLM_LOW_CITATION_COVERAGE));
    }

    #[test]
    fn test_output_guard_only_on_high_risk() {
        let forbidden: Vec<String> = DEFAULT_FORBIDDEN_CLAIMS.iter().map(|s| s.to_string()).collect();
        assert!(violates_output_guard("무조건 환불됩니다", true, &forbidden));
        assert!(!violates_output_guard("무조건 재미있는 책", false, &forbidden));
        assert!(!violates_output_guard("환불은 7일 이내 가능합니다", true, &forbidden));
    }

    #[test]
    fn test_risk_band() {
        assert_eq!(risk_band(true, false, true, false), RiskBand::R3);
        assert_eq!(risk_band(false, true, true, true), RiskBand::R2);
        assert_eq!(risk_band(false, true, false, true), RiskBand::R1);
    }
}
