//! Reason codes, response statuses, and recovery hints.
//!
//! Every chat response carries a machine-readable `reason_code` together
//! with a `status`, a `next_action` the client should offer, and a
//! `recoverable` flag. Local handlers only decide the reason code; the
//! mapping to the rest of the envelope lives in [`recovery_hint`] so that
//! the tool path, the RAG path, and input validation all agree.

use serde::{Deserialize, Serialize};

pub const OK: &str = "OK";

pub const AUTH_REQUIRED: &str = "AUTH_REQUIRED";
pub const AUTH_FORBIDDEN: &str = "AUTH_FORBIDDEN";

pub const MISSING_INPUT: &str = "MISSING_INPUT";
pub const MISSING_REQUIRED_INFO: &str = "MISSING_REQUIRED_INFO";
pub const NEED_SLOT_PREFIX: &str = "NEED_SLOT:";
pub const CHAT_MESSAGE_TOO_LONG: &str = "CHAT_MESSAGE_TOO_LONG";
pub const CHAT_HISTORY_TOO_LONG: &str = "CHAT_HISTORY_TOO_LONG";
pub const CHAT_INVALID_SESSION_ID: &str = "CHAT_INVALID_SESSION_ID";

pub const CONFIRMATION_REQUIRED: &str = "CONFIRMATION_REQUIRED";
pub const CONFIRMATION_EXPIRED: &str = "CONFIRMATION_EXPIRED";
pub const USER_ABORTED: &str = "USER_ABORTED";
pub const DENY_EXECUTE_NOT_CONFIRMED: &str = "DENY_EXECUTE:NOT_CONFIRMED";
pub const DENY_CLAIM_NOT_CONFIRMED: &str = "DENY_CLAIM:NOT_CONFIRMED";
pub const DENY_CLAIM_NO_TOOL_RESULT: &str = "DENY_CLAIM:NO_TOOL_RESULT";

pub const RESOURCE_NOT_FOUND: &str = "RESOURCE_NOT_FOUND";

pub const RATE_LIMITED: &str = "RATE_LIMITED";
pub const LLM_CALL_RATE_LIMITED: &str = "LLM_CALL_RATE_LIMITED";

pub const TOOL_TIMEOUT: &str = "TOOL_TIMEOUT";
pub const TOOL_RETRYABLE_FAILURE: &str = "TOOL_RETRYABLE_FAILURE";
pub const TOOL_CIRCUIT_OPEN: &str = "TOOL_CIRCUIT_OPEN";
pub const PROVIDER_TIMEOUT: &str = "PROVIDER_TIMEOUT";
pub const PROVIDER_ERROR: &str = "PROVIDER_ERROR";

pub const LLM_NO_CITATIONS: &str = "LLM_NO_CITATIONS";
pub const LLM_LOW_CITATION_COVERAGE: &str = "LLM_LOW_CITATION_COVERAGE";
pub const OUTPUT_GUARD_FORBIDDEN_CLAIM: &str = "OUTPUT_GUARD_FORBIDDEN_CLAIM";
pub const RAG_NO_CHUNKS: &str = "RAG_NO_CHUNKS";
pub const RAG_RETRIEVE_ERROR: &str = "RAG_RETRIEVE_ERROR";
pub const RAG_RERANK_TIMEOUT: &str = "RAG_RERANK_TIMEOUT";
pub const RAG_RERANK_ERROR: &str = "RAG_RERANK_ERROR";
pub const RAG_VECTOR_SKIPPED: &str = "RAG_VECTOR_SKIPPED";

/// Build a `NEED_SLOT:<SLOT>` reason code.
pub fn need_slot(slot: &str) -> String {
    format!("{}{}", NEED_SLOT_PREFIX, slot.to_ascii_uppercase())
}

/// Outward status of a chat turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatStatus {
    Ok,
    NeedsInput,
    NeedsAuth,
    NotFound,
    Forbidden,
    ToolFallback,
    PendingConfirmation,
    InsufficientEvidence,
}

impl ChatStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatStatus::Ok => "ok",
            ChatStatus::NeedsInput => "needs_input",
            ChatStatus::NeedsAuth => "needs_auth",
            ChatStatus::NotFound => "not_found",
            ChatStatus::Forbidden => "forbidden",
            ChatStatus::ToolFallback => "tool_fallback",
            ChatStatus::PendingConfirmation => "pending_confirmation",
            ChatStatus::InsufficientEvidence => "insufficient_evidence",
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ChatStatus::Ok)
    }
}

/// What the client should offer the user after this turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NextAction {
    Retry,
    ProvideRequiredInfo,
    ConfirmAction,
    LoginRequired,
    OpenSupportTicket,
    RefineQuery,
    None,
}

impl NextAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            NextAction::Retry => "RETRY",
            NextAction::ProvideRequiredInfo => "PROVIDE_REQUIRED_INFO",
            NextAction::ConfirmAction => "CONFIRM_ACTION",
            NextAction::LoginRequired => "LOGIN_REQUIRED",
            NextAction::OpenSupportTicket => "OPEN_SUPPORT_TICKET",
            NextAction::RefineQuery => "REFINE_QUERY",
            NextAction::None => "NONE",
        }
    }
}

/// The envelope fields derived from a reason code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryHint {
    pub status: ChatStatus,
    pub next_action: NextAction,
    pub recoverable: bool,
}

const fn hint(status: ChatStatus, next_action: NextAction, recoverable: bool) -> RecoveryHint {
    RecoveryHint {
        status,
        next_action,
        recoverable,
    }
}

/// Map a reason code to its status, next action, and recoverability.
///
/// Unknown codes are treated as transient evidence failures.
pub fn recovery_hint(reason_code: &str) -> RecoveryHint {
    use ChatStatus as S;
    use NextAction as N;

    if reason_code.starts_with(NEED_SLOT_PREFIX) {
        return hint(S::NeedsInput, N::ProvideRequiredInfo, true);
    }

    match reason_code {
        OK | USER_ABORTED => hint(S::Ok, N::None, false),
        AUTH_REQUIRED => hint(S::NeedsAuth, N::LoginRequired, true),
        AUTH_FORBIDDEN => hint(S::Forbidden, N::None, false),
        MISSING_INPUT | MISSING_REQUIRED_INFO => hint(S::NeedsInput, N::ProvideRequiredInfo, true),
        CHAT_MESSAGE_TOO_LONG | CHAT_HISTORY_TOO_LONG | CHAT_INVALID_SESSION_ID => {
            hint(S::InsufficientEvidence, N::RefineQuery, true)
        }
        CONFIRMATION_REQUIRED | DENY_EXECUTE_NOT_CONFIRMED => {
            hint(S::PendingConfirmation, N::ConfirmAction, true)
        }
        CONFIRMATION_EXPIRED => hint(S::NeedsInput, N::Retry, true),
        DENY_CLAIM_NOT_CONFIRMED => hint(S::ToolFallback, N::ConfirmAction, true),
        DENY_CLAIM_NO_TOOL_RESULT => hint(S::ToolFallback, N::Retry, true),
        RESOURCE_NOT_FOUND => hint(S::NotFound, N::ProvideRequiredInfo, true),
        RATE_LIMITED | LLM_CALL_RATE_LIMITED => hint(S::NeedsInput, N::Retry, true),
        TOOL_TIMEOUT | TOOL_RETRYABLE_FAILURE | TOOL_CIRCUIT_OPEN => {
            hint(S::ToolFallback, N::Retry, true)
        }
        PROVIDER_TIMEOUT | PROVIDER_ERROR | LLM_NO_CITATIONS | RAG_RETRIEVE_ERROR => {
            hint(S::InsufficientEvidence, N::Retry, true)
        }
        LLM_LOW_CITATION_COVERAGE | RAG_NO_CHUNKS => {
            hint(S::InsufficientEvidence, N::RefineQuery, true)
        }
        OUTPUT_GUARD_FORBIDDEN_CLAIM => hint(S::InsufficientEvidence, N::OpenSupportTicket, true),
        _ => hint(S::InsufficientEvidence, N::Retry, true),
    }
}

/// Whether a reason code is a rate/cooldown/circuit rejection that carries
/// `retry_after_ms`.
pub fn carries_retry_after(reason_code: &str) -> bool {
    matches!(
        reason_code,
        RATE_LIMITED | LLM_CALL_RATE_LIMITED | TOOL_CIRCUIT_OPEN
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn need_slot_is_upper_cased() {
        assert_eq!(need_slot("order_ref"), "NEED_SLOT:ORDER_REF");
    }

    #[test]
    fn slot_codes_ask_for_input() {
        let h = recovery_hint("NEED_SLOT:ORDER_REF");
        assert_eq!(h.status, ChatStatus::NeedsInput);
        assert_eq!(h.next_action, NextAction::ProvideRequiredInfo);
    }

    #[test]
    fn auth_required_needs_login() {
        let h = recovery_hint(AUTH_REQUIRED);
        assert_eq!(h.status, ChatStatus::NeedsAuth);
        assert_eq!(h.next_action, NextAction::LoginRequired);
        assert!(h.recoverable);
    }

    #[test]
    fn forbidden_is_not_recoverable() {
        assert!(!recovery_hint(AUTH_FORBIDDEN).recoverable);
    }

    #[test]
    fn unknown_code_defaults_to_retry() {
        let h = recovery_hint("SOMETHING_NEW");
        assert_eq!(h.status, ChatStatus::InsufficientEvidence);
        assert_eq!(h.next_action, NextAction::Retry);
    }

    #[test]
    fn status_strings_are_snake_case() {
        assert_eq!(
            serde_json::to_string(&ChatStatus::PendingConfirmation).unwrap(),
            "\"pending_confirmation\""
        );
        assert_eq!(ChatStatus::ToolFallback.as_str(), "tool_fallback");
        assert_eq!(
            serde_json::to_string(&NextAction::OpenSupportTicket).unwrap(),
            "\"OPEN_SUPPORT_TICKET\""
        );
    }
}
