//! Turn routing policy.
//!
//! [`decide`] is a pure function of the turn's understanding and a few
//! session flags. Rules are evaluated in order and the first match wins:
//!
//! | # | Condition | Route | Reason |
//! |---|-----------|-------|--------|
//! | 1 | pending action | CONFIRM | `ROUTE:CONFIRM:PENDING_ACTION` |
//! | 2 | list reference, no selection | OPTIONS | `ROUTE:OPTIONS:DISAMBIGUATE:BOOK` |
//! | 3 | write-sensitive intent | ASK / CONFIRM | `NEED_AUTH:USER_LOGIN`, `NEED_SLOT:ORDER_REF`, `ROUTE:CONFIRM:<INTENT>` |
//! | 4 | read intent | ASK / EXECUTE | `NEED_AUTH:USER_LOGIN`, `NEED_SLOT:ORDER_REF`, `ROUTE:EXECUTE:<INTENT>` |
//! | 5 | answer intent | ANSWER | `ROUTE:ANSWER:<INTENT\|NO_INTENT>` |
//! | 6 | anything else | OPTIONS | `ROUTE:OPTIONS:<INTENT\|UNKNOWN>` |

use crate::models::{Intent, IntentClass, PolicyDecision, Route, ToolUnderstanding, SLOT_ORDER_REF};
use crate::reason::need_slot;

pub const NEED_AUTH_USER_LOGIN: &str = "NEED_AUTH:USER_LOGIN";

/// Session facts the policy needs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionFlags {
    pub has_user: bool,
    pub has_pending_action: bool,
    pub has_selection: bool,
}

fn decision(route: Route, reason_code: String, rule: &str, missing: &[&str]) -> PolicyDecision {
    PolicyDecision {
        route,
        reason_code,
        policy_rule_id: rule.to_string(),
        missing_slots: missing.iter().map(|s| s.to_string()).collect(),
    }
}

pub fn decide(understanding: &ToolUnderstanding, flags: &SessionFlags) -> PolicyDecision {
    let intent = understanding.intent;
    let has_order_ref = understanding.slot(SLOT_ORDER_REF).is_some();

    if flags.has_pending_action {
        return decision(
            Route::Confirm,
            "ROUTE:CONFIRM:PENDING_ACTION".into(),
            "policy.pending_action",
            &[],
        );
    }

    if understanding.is_reference && !flags.has_selection {
        return decision(
            Route::Options,
            "ROUTE:OPTIONS:DISAMBIGUATE:BOOK".into(),
            "policy.disambiguate",
            &[],
        );
    }

    match intent.class() {
        IntentClass::WriteSensitive => {
            if !flags.has_user {
                decision(Route::Ask, NEED_AUTH_USER_LOGIN.into(), "policy.write.auth", &["user_id"])
            } else if !has_order_ref {
                decision(
                    Route::Ask,
                    need_slot(SLOT_ORDER_REF),
                    "policy.write.slot",
                    &[SLOT_ORDER_REF],
                )
            } else {
                decision(
                    Route::Confirm,
                    format!("ROUTE:CONFIRM:{}", intent.as_str()),
                    "policy.write.confirm",
                    &[],
                )
            }
        }
        IntentClass::Read => {
            if !flags.has_user {
                decision(Route::Ask, NEED_AUTH_USER_LOGIN.into(), "policy.read.auth", &["user_id"])
            } else if intent.requires_order_ref() && !has_order_ref {
                decision(
                    Route::Ask,
                    need_slot(SLOT_ORDER_REF),
                    "policy.read.slot",
                    &[SLOT_ORDER_REF],
                )
            } else {
                decision(
                    Route::Execute,
                    format!("ROUTE:EXECUTE:{}", intent.as_str()),
                    "policy.read.execute",
                    &[],
                )
            }
        }
        IntentClass::Answer => {
            let label = if intent == Intent::NoIntent {
                "NO_INTENT"
            } else {
                intent.as_str()
            };
            decision(
                Route::Answer,
                format!("ROUTE:ANSWER:{}", label),
                "policy.answer",
                &[],
            )
        }
        IntentClass::Unknown => decision(
            Route::Options,
            format!("ROUTE:OPTIONS:{}", intent.as_str()),
            "policy.fallback",
            &[],
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::understand;

    fn flags(has_user: bool) -> SessionFlags {
        SessionFlags {
            has_user,
            ..Default::default()
        }
    }

    #[test]
    fn test_pending_action_wins() {
        let u = understand("주문 12 상태 알려줘");
        let d = decide(
            &u,
            &SessionFlags {
                has_user: true,
                has_pending_action: true,
                has_selection: false,
            },
        );
        assert_eq!(d.route, Route::Confirm);
        assert_eq!(d.reason_code, "ROUTE:CONFIRM:PENDING_ACTION");
        assert_eq!(d.policy_rule_id, "policy.pending_action");
    }

    #[test]
    fn test_reference_without_selection() {
        let d = decide(&understand("2번째로 할게"), &flags(true));
        assert_eq!(d.route, Route::Options);
        assert_eq!(d.reason_code, "ROUTE:OPTIONS:DISAMBIGUATE:BOOK");
    }

    #[test]
    fn test_reference_with_selection_answers() {
        let d = decide(
            &understand("2번째로 할게"),
            &SessionFlags {
                has_user: true,
                has_pending_action: false,
                has_selection: true,
            },
        );
        assert_eq!(d.route, Route::Answer);
        assert_eq!(d.reason_code, "ROUTE:ANSWER:BOOK_RECOMMEND");
    }

    #[test]
    fn test_write_requires_login_then_slot() {
        let d = decide(&understand("주문 12 취소해줘"), &flags(false));
        assert_eq!(d.route, Route::Ask);
        assert_eq!(d.reason_code, NEED_AUTH_USER_LOGIN);

        let d = decide(&understand("주문 취소해주세요"), &flags(true));
        assert_eq!(d.reason_code, "NEED_SLOT:ORDER_REF");
        assert_eq!(d.missing_slots, vec!["order_ref".to_string()]);

        let d = decide(&understand("주문 12 취소해줘"), &flags(true));
        assert_eq!(d.route, Route::Confirm);
        assert_eq!(d.reason_code, "ROUTE:CONFIRM:ORDER_CANCEL");
    }

    #[test]
    fn test_read_routes() {
        let d = decide(&understand("주문 12 상태 알려줘"), &flags(false));
        assert_eq!(d.route, Route::Ask);
        assert_eq!(d.policy_rule_id, "policy.read.auth");

        let d = decide(&understand("주문 12 상태 알려줘"), &flags(true));
        assert_eq!(d.route, Route::Execute);
        assert_eq!(d.reason_code, "ROUTE:EXECUTE:ORDER_LOOKUP");

        let d = decide(&understand("내 문의 상태 알려줘"), &flags(true));
        assert_eq!(d.route, Route::Execute);
    }

    #[test]
    fn test_answer_and_fallback() {
        let d = decide(&understand("환불 가능한가요?"), &flags(false));
        assert_eq!(d.route, Route::Answer);
        assert_eq!(d.reason_code, "ROUTE:ANSWER:REFUND_POLICY");

        let d = decide(&understand("한국 현대문학의 흐름을 설명해줘"), &flags(false));
        assert_eq!(d.reason_code, "ROUTE:ANSWER:NO_INTENT");

        let d = decide(&understand("결제"), &flags(true));
        assert_eq!(d.route, Route::Options);
        assert_eq!(d.reason_code, "ROUTE:OPTIONS:UNKNOWN");
    }
}
