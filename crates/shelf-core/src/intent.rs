//! Rule-based intent classification.
//!
//! Keyword families are checked over the normalized query in a fixed
//! order: tickets, policy questions, status lookups, sensitive writes,
//! remaining lookups, recommendations. A commerce-flavoured message that
//! matches no family is returned as [`Intent::Unknown`] with low
//! confidence so the caller can offer choices instead of guessing.
//!
//! Only Korean and English phrasing is recognized.

use std::collections::BTreeMap;

use crate::models::{
    Intent, ToolUnderstanding, SLOT_CONFIRM_TOKEN, SLOT_ISBN, SLOT_ORDER_REF,
    SLOT_SELECTION_INDEX, SLOT_TICKET_NO,
};
use crate::normalize::{
    detect_reference, extract_confirm_token, extract_isbn, extract_order_ref, extract_ticket_no,
    normalize_query, q_key,
};

/// Confidence below which a commerce query is not acted on.
pub const MIN_CONFIDENCE: f64 = 0.8;

const TICKET_WORDS: &[&str] = &["문의", "티켓", "상담", "ticket", "support"];
const TICKET_CREATE_WORDS: &[&str] = &["접수", "등록", "남겨", "create", "open", "file"];
const TICKET_LIST_WORDS: &[&str] = &["목록", "내역", "전체", "list"];
const STATUS_WORDS: &[&str] = &[
    "상태", "조회", "알려", "어디", "언제 와", "진행", "status", "where", "track",
];

const QUESTION_WORDS: &[&str] = &[
    "가능", "어떻게", "정책", "기간", "얼마", "규정", "안내", "되나요", "있나요", "?", "policy",
    "how", "can i", "what is",
];

const REFUND_WORDS: &[&str] = &["환불", "반품", "refund", "return"];
const SHIPPING_WORDS: &[&str] = &["배송", "택배", "shipping", "shipment", "delivery"];
const ORDER_WORDS: &[&str] = &["주문", "order"];
const CANCEL_WORDS: &[&str] = &["취소", "cancel"];
const WRITE_VERBS: &[&str] = &[
    "해줘", "해 줘", "해주세요", "해 주세요", "할래", "하고 싶", "하고싶", "신청", "요청", "please",
    "want", "request",
];

const CART_WORDS: &[&str] = &["장바구니", "cart"];
const RECOMMEND_WORDS: &[&str] = &["추천", "비슷한", "recommend", "similar", "suggest"];

const COMMERCE_WORDS: &[&str] = &[
    "주문", "배송", "환불", "반품", "결제", "취소", "문의", "order", "refund", "shipping",
    "payment", "cancel",
];

const ABORT_WORDS: &[&str] = &[
    "그만",
    "취소할게",
    "안 할래",
    "안할래",
    "abort",
    "never mind",
    "nevermind",
];

fn has_any(text: &str, words: &[&str]) -> bool {
    words.iter().any(|w| text.contains(w))
}

/// Whether the user is backing out of a pending action.
pub fn is_abort(text: &str) -> bool {
    has_any(&normalize_query(text), ABORT_WORDS)
}

fn classify(q: &str, has_order_ref: bool, has_ticket_no: bool) -> (Intent, f64) {
    if has_any(q, TICKET_WORDS) || has_ticket_no {
        if has_any(q, TICKET_CREATE_WORDS) {
            return (Intent::TicketCreate, 0.9);
        }
        if has_any(q, TICKET_LIST_WORDS) {
            return (Intent::TicketList, 0.9);
        }
        if has_any(q, STATUS_WORDS) || has_ticket_no {
            return (Intent::TicketStatus, 0.9);
        }
        return (Intent::Unknown, 0.5);
    }

    if !has_order_ref && has_any(q, QUESTION_WORDS) {
        if has_any(q, REFUND_WORDS) {
            return (Intent::RefundPolicy, 0.9);
        }
        if has_any(q, SHIPPING_WORDS) {
            return (Intent::ShippingPolicy, 0.9);
        }
        if has_any(q, ORDER_WORDS) || has_any(q, CANCEL_WORDS) {
            return (Intent::OrderPolicy, 0.85);
        }
    }

    let confidence = if has_order_ref { 0.95 } else { 0.85 };
    let status = has_any(q, STATUS_WORDS);

    if !status && has_any(q, CANCEL_WORDS) && (has_order_ref || has_any(q, WRITE_VERBS)) {
        return (Intent::OrderCancel, confidence);
    }
    if !status && has_any(q, REFUND_WORDS) && has_any(q, WRITE_VERBS) {
        return (Intent::RefundCreate, confidence);
    }

    if has_any(q, SHIPPING_WORDS) && (status || has_order_ref) {
        return (Intent::ShipmentLookup, confidence);
    }
    if has_any(q, REFUND_WORDS) && (status || has_order_ref) {
        return (Intent::RefundLookup, confidence);
    }
    if has_order_ref || (has_any(q, ORDER_WORDS) && status) {
        return (Intent::OrderLookup, confidence);
    }

    if has_any(q, CART_WORDS) && has_any(q, RECOMMEND_WORDS) {
        return (Intent::CartRecommend, 0.9);
    }
    if has_any(q, RECOMMEND_WORDS) {
        return (Intent::BookRecommend, 0.85);
    }

    if has_any(q, COMMERCE_WORDS) {
        return (Intent::Unknown, 0.5);
    }
    (Intent::NoIntent, 0.3)
}

/// Classify a user message and extract its slots.
pub fn understand(message: &str) -> ToolUnderstanding {
    let normalized = normalize_query(message);
    let mut slots = BTreeMap::new();

    let order_ref = extract_order_ref(message);
    let ticket_no = extract_ticket_no(message);
    if let Some(order_ref) = &order_ref {
        slots.insert(SLOT_ORDER_REF.to_string(), order_ref.clone());
    }
    if let Some(ticket_no) = &ticket_no {
        slots.insert(SLOT_TICKET_NO.to_string(), ticket_no.clone());
    }
    if let Some(isbn) = extract_isbn(message) {
        slots.insert(SLOT_ISBN.to_string(), isbn);
    }
    if let Some(token) = extract_confirm_token(message) {
        slots.insert(SLOT_CONFIRM_TOKEN.to_string(), token);
    }

    let reference = detect_reference(message);
    if let Some(index) = reference.and_then(|r| r.index) {
        slots.insert(SLOT_SELECTION_INDEX.to_string(), index.to_string());
    }

    let (mut intent, confidence) = if reference.is_some() && order_ref.is_none() {
        (Intent::BookRecommend, 0.85)
    } else {
        classify(&normalized, order_ref.is_some(), ticket_no.is_some())
    };

    // Commerce-looking but unsure: never act on it.
    if intent != Intent::NoIntent && confidence < MIN_CONFIDENCE {
        intent = Intent::Unknown;
    }

    ToolUnderstanding {
        intent,
        slots,
        risk_level: intent.risk_level(),
        q_key: q_key(&normalized),
        standalone_query: normalized,
        confidence,
        is_reference: reference.is_some(),
    }
}
