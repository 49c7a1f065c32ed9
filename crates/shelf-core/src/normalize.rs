//! Query normalization and slot extraction.
//!
//! Everything the intent classifier looks at goes through
//! [`normalize_query`] first: NFKD accent folding (Hangul syllables are
//! re-composed so Korean text survives), lowercasing and whitespace
//! collapsing. The extractors below run on either raw or normalized text.

use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

fn re(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("static pattern"))
}

pub fn normalize_query(text: &str) -> String {
    let folded: String = text.nfkd().filter(|c| !is_combining_mark(*c)).collect();
    let recomposed: String = folded.nfc().collect();
    recomposed
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// First 16 hex chars of SHA-256 over the normalized text.
pub fn q_key(normalized: &str) -> String {
    let digest = Sha256::digest(normalized.as_bytes());
    hex::encode(digest)[..16].to_string()
}

/// Order reference like `주문 12`, `주문번호: 12`, `order #A-100` or `12번 주문`.
pub fn extract_order_ref(text: &str) -> Option<String> {
    static PREFIXED: OnceLock<Regex> = OnceLock::new();
    static SUFFIXED: OnceLock<Regex> = OnceLock::new();
    let prefixed = re(
        &PREFIXED,
        r"(?i)(?:주문|order)\s*(?:번호|no\.?|number)?\s*[:#]?\s*([A-Za-z]{0,4}-?\d[0-9A-Za-z\-]*)",
    );
    if let Some(caps) = prefixed.captures(text) {
        return caps.get(1).map(|m| m.as_str().trim_end_matches('-').to_string());
    }
    let suffixed = re(&SUFFIXED, r"(\d+)\s*번\s*주문");
    suffixed
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Support ticket number such as `STK-20260101` or `tkt123456`.
pub fn extract_ticket_no(text: &str) -> Option<String> {
    static TICKET: OnceLock<Regex> = OnceLock::new();
    re(&TICKET, r"(?i)\b((?:stk|tkt)-?\d{4,})\b")
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_ascii_uppercase())
}

/// A 6-hex confirmation token echoed back by the user.
pub fn extract_confirm_token(text: &str) -> Option<String> {
    static TOKEN: OnceLock<Regex> = OnceLock::new();
    re(&TOKEN, r"\b([0-9A-Fa-f]{6})\b")
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_ascii_lowercase())
}

// ============ ISBN ============

fn isbn13_check_digit(first12: &[u32]) -> u32 {
    let sum: u32 = first12
        .iter()
        .enumerate()
        .map(|(i, d)| if i % 2 == 0 { *d } else { d * 3 })
        .sum();
    (10 - sum % 10) % 10
}

fn isbn10_is_valid(chars: &[char]) -> bool {
    let mut sum = 0u32;
    for (i, c) in chars.iter().enumerate() {
        let value = match c {
            'X' | 'x' if i == 9 => 10,
            _ => match c.to_digit(10) {
                Some(d) => d,
                None => return false,
            },
        };
        sum += value * (10 - i as u32);
    }
    sum % 11 == 0
}

/// Normalize an ISBN to ISBN-13.
///
/// Separators are stripped. A valid ISBN-10 is converted with a recomputed
/// checksum; a 13-digit value passes through. Anything else is `None`.
pub fn normalize_isbn(raw: &str) -> Option<String> {
    let chars: Vec<char> = raw
        .chars()
        .filter(|c| !matches!(c, '-' | ' ' | '\u{2010}' | '\u{2013}'))
        .collect();
    match chars.len() {
        13 if chars.iter().all(|c| c.is_ascii_digit()) => Some(chars.into_iter().collect()),
        10 if isbn10_is_valid(&chars) => {
            let mut digits: Vec<u32> = vec![9, 7, 8];
            digits.extend(chars[..9].iter().filter_map(|c| c.to_digit(10)));
            let check = isbn13_check_digit(&digits);
            let mut out: String = digits.iter().map(|d| d.to_string()).collect();
            out.push_str(&check.to_string());
            Some(out)
        }
        _ => None,
    }
}

/// Find and normalize the first ISBN-looking token in free text.
pub fn extract_isbn(text: &str) -> Option<String> {
    static ISBN: OnceLock<Regex> = OnceLock::new();
    re(&ISBN, r"\b(97[89][\d\- ]{10,14}\d|\d[\d\-]{8,11}[\dXx])\b")
        .find_iter(text)
        .find_map(|m| normalize_isbn(m.as_str()))
}

// ============ Selection references ============

/// A reference to an item of a previously shown list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionReference {
    /// 1-based position, when the reference names one.
    pub index: Option<usize>,
}

fn ordinal_word(word: &str) -> Option<usize> {
    match word {
        "첫" | "first" => Some(1),
        "두" | "second" => Some(2),
        "세" | "third" => Some(3),
        "네" | "fourth" => Some(4),
        "다섯" | "fifth" => Some(5),
        _ => None,
    }
}

/// Detect "2번째", "첫 번째", "the second one", "that one", "그걸로" and the like.
pub fn detect_reference(text: &str) -> Option<SelectionReference> {
    static NUMERIC: OnceLock<Regex> = OnceLock::new();
    static KO_WORD: OnceLock<Regex> = OnceLock::new();
    static EN_WORD: OnceLock<Regex> = OnceLock::new();
    static DEICTIC: OnceLock<Regex> = OnceLock::new();

    let normalized = normalize_query(text);

    if let Some(caps) = re(&NUMERIC, r"(\d{1,2})\s*(?:번째|st\b|nd\b|rd\b|th\b)").captures(&normalized)
    {
        let index = caps.get(1).and_then(|m| m.as_str().parse::<usize>().ok());
        return Some(SelectionReference { index });
    }
    if let Some(caps) = re(&KO_WORD, r"(첫|두|세|네|다섯)\s*번째").captures(&normalized) {
        let index = caps.get(1).and_then(|m| ordinal_word(m.as_str()));
        return Some(SelectionReference { index });
    }
    if let Some(caps) = re(
        &EN_WORD,
        r"\b(first|second|third|fourth|fifth)\s+(?:one|book|option)\b",
    )
    .captures(&normalized)
    {
        let index = caps.get(1).and_then(|m| ordinal_word(m.as_str()));
        return Some(SelectionReference { index });
    }
    if re(
        &DEICTIC,
        r"\b(?:that|this) one\b|그걸로|그거로|그 책으로|이걸로",
    )
    .is_match(&normalized)
    {
        return Some(SelectionReference { index: None });
    }
    None
}
