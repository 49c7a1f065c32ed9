//! Canonical material → search document projection.
//!
//! The reindex runner loads a [`MaterialBundle`] per canonical row (the
//! row plus its override, merge, identifiers, contributors, concepts and
//! classifications) and hands it to [`to_index_document`].

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::normalize::normalize_isbn;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalMaterial {
    /// Monotonic key used for paging.
    pub material_id: i64,
    /// Stable document id in the search index.
    pub material_key: String,
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub language: Option<String>,
    pub issued: Option<String>,
    pub publisher: Option<String>,
    pub description: Option<String>,
    pub material_type: Option<String>,
}

/// Curated corrections; present fields win over the base row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialOverride {
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub language: Option<String>,
    pub issued: Option<String>,
    pub publisher: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    pub scheme: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contributor {
    pub name: String,
    pub role: Option<String>,
    pub seq: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Concept {
    pub concept_id: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub scheme: String,
    pub code: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaterialBundle {
    pub material: CanonicalMaterial,
    pub override_fields: Option<MaterialOverride>,
    /// Key of the material this one was merged into.
    pub merged_into: Option<String>,
    pub identifiers: Vec<Identifier>,
    pub contributors: Vec<Contributor>,
    pub concepts: Vec<Concept>,
    pub classifications: Vec<Classification>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexDocument {
    pub doc_id: String,
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title_ko: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title_en: Option<String>,
    pub subtitle: Option<String>,
    pub language: Option<String>,
    pub issued_year: Option<i32>,
    pub publisher: Option<String>,
    pub description: Option<String>,
    pub material_type: Option<String>,
    pub isbn13: Vec<String>,
    pub authors_ko: Vec<String>,
    pub authors_en: Vec<String>,
    pub authors_other: Vec<String>,
    pub concept_ids: Vec<String>,
    pub concepts: Vec<String>,
    pub classification_codes: Vec<String>,
    pub hidden: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_to: Option<String>,
}

fn is_hangul(c: char) -> bool {
    matches!(c, '\u{AC00}'..='\u{D7A3}' | '\u{1100}'..='\u{11FF}' | '\u{3130}'..='\u{318F}')
}

fn is_latin_letter(c: char) -> bool {
    c.is_ascii_alphabetic() || matches!(c, '\u{00C0}'..='\u{024F}')
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    Hangul,
    Latin,
    Other,
}

/// Hangul wins if any syllable is present; Latin needs every letter to be Latin.
pub fn detect_script(text: &str) -> Script {
    if text.chars().any(is_hangul) {
        return Script::Hangul;
    }
    let letters: Vec<char> = text.chars().filter(|c| c.is_alphabetic()).collect();
    if !letters.is_empty() && letters.iter().all(|c| is_latin_letter(*c)) {
        Script::Latin
    } else {
        Script::Other
    }
}

/// Map MARC/ISO 639-2 codes and common names to ISO 639-1.
pub fn normalize_language(raw: &str) -> Option<String> {
    let code = raw.trim().to_lowercase();
    if code.is_empty() {
        return None;
    }
    let mapped = match code.as_str() {
        "kor" | "korean" | "한국어" => "ko",
        "eng" | "english" => "en",
        "jpn" | "japanese" => "ja",
        "chi" | "zho" | "chinese" => "zh",
        "fre" | "fra" | "french" => "fr",
        "ger" | "deu" | "german" => "de",
        "spa" | "spanish" => "es",
        "rus" | "russian" => "ru",
        "ita" | "italian" => "it",
        other => other,
    };
    Some(mapped.to_string())
}

/// First four-digit run in a date-ish string.
pub fn issued_year(raw: &str) -> Option<i32> {
    static YEAR: OnceLock<Regex> = OnceLock::new();
    YEAR.get_or_init(|| Regex::new(r"\d{4}").expect("static year pattern"))
        .find(raw)
        .and_then(|m| m.as_str().parse().ok())
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn pick(override_value: Option<&Option<String>>, base: &Option<String>) -> Option<String> {
    override_value.and_then(non_empty).or_else(|| non_empty(base))
}

fn push_unique(target: &mut Vec<String>, seen: &mut HashSet<String>, value: String) {
    if seen.insert(value.clone()) {
        target.push(value);
    }
}

pub fn to_index_document(bundle: &MaterialBundle) -> IndexDocument {
    let base = &bundle.material;
    let ov = bundle.override_fields.as_ref();

    let title = pick(ov.map(|o| &o.title), &base.title);
    let issued = pick(ov.map(|o| &o.issued), &base.issued);
    let language = pick(ov.map(|o| &o.language), &base.language)
        .and_then(|l| normalize_language(&l));

    let (title_ko, title_en) = match title.as_deref().map(|t| (t, detect_script(t))) {
        Some((t, Script::Hangul)) => (Some(t.to_string()), None),
        Some((t, Script::Latin)) => (None, Some(t.to_string())),
        _ => (None, None),
    };

    let mut isbn13 = Vec::new();
    let mut seen = HashSet::new();
    for id in &bundle.identifiers {
        if !id.scheme.to_lowercase().starts_with("isbn") {
            continue;
        }
        if let Some(isbn) = normalize_isbn(&id.value) {
            push_unique(&mut isbn13, &mut seen, isbn);
        }
    }

    let mut contributors = bundle.contributors.clone();
    contributors.sort_by_key(|c| c.seq);
    let mut authors_ko = Vec::new();
    let mut authors_en = Vec::new();
    let mut authors_other = Vec::new();
    let mut seen = HashSet::new();
    for c in contributors {
        let name = c.name.trim().to_string();
        if name.is_empty() {
            continue;
        }
        let target = match detect_script(&name) {
            Script::Hangul => &mut authors_ko,
            Script::Latin => &mut authors_en,
            Script::Other => &mut authors_other,
        };
        push_unique(target, &mut seen, name);
    }

    IndexDocument {
        doc_id: base.material_key.clone(),
        title,
        title_ko,
        title_en,
        subtitle: pick(ov.map(|o| &o.subtitle), &base.subtitle),
        language,
        issued_year: issued.as_deref().and_then(issued_year),
        publisher: pick(ov.map(|o| &o.publisher), &base.publisher),
        description: pick(ov.map(|o| &o.description), &base.description),
        material_type: non_empty(&base.material_type),
        isbn13,
        authors_ko,
        authors_en,
        authors_other,
        concept_ids: bundle.concepts.iter().map(|c| c.concept_id.clone()).collect(),
        concepts: bundle.concepts.iter().map(|c| c.label.clone()).collect(),
        classification_codes: bundle
            .classifications
            .iter()
            .map(|c| format!("{}:{}", c.scheme, c.code))
            .collect(),
        hidden: bundle.merged_into.is_some(),
        redirect_to: bundle.merged_into.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle() -> MaterialBundle {
        MaterialBundle {
            material: CanonicalMaterial {
                material_id: 1,
                material_key: "m-1".into(),
                title: Some("토지".into()),
                language: Some("kor".into()),
                issued: Some("c1994-05".into()),
                publisher: Some("솔".into()),
                ..Default::default()
            },
            identifiers: vec![
                Identifier {
                    scheme: "ISBN10".into(),
                    value: "0-306-40615-2".into(),
                },
                Identifier {
                    scheme: "isbn13".into(),
                    value: "978-0-306-40615-7".into(),
                },
                Identifier {
                    scheme: "kolisnet".into(),
                    value: "KMO1".into(),
                },
            ],
            contributors: vec![
                Contributor {
                    name: "Park Kyong-ni".into(),
                    role: Some("translator".into()),
                    seq: 2,
                },
                Contributor {
                    name: "박경리".into(),
                    role: Some("author".into()),
                    seq: 1,
                },
                Contributor {
                    name: "北村".into(),
                    role: None,
                    seq: 3,
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_basic_projection() {
        let doc = to_index_document(&bundle());
        assert_eq!(doc.doc_id, "m-1");
        assert_eq!(doc.language.as_deref(), Some("ko"));
        assert_eq!(doc.issued_year, Some(1994));
        assert_eq!(doc.title_ko.as_deref(), Some("토지"));
        assert!(doc.title_en.is_none());
        assert_eq!(doc.isbn13, vec!["9780306406157".to_string()]);
        assert_eq!(doc.authors_ko, vec!["박경리".to_string()]);
        assert_eq!(doc.authors_en, vec!["Park Kyong-ni".to_string()]);
        assert_eq!(doc.authors_other, vec!["北村".to_string()]);
        assert!(!doc.hidden);
    }

    #[test]
    fn test_override_wins() {
        let mut b = bundle();
        b.override_fields = Some(MaterialOverride {
            title: Some("Land".into()),
            language: Some("eng".into()),
            issued: Some("  ".into()),
            ..Default::default()
        });
        let doc = to_index_document(&b);
        assert_eq!(doc.title.as_deref(), Some("Land"));
        assert_eq!(doc.title_en.as_deref(), Some("Land"));
        assert_eq!(doc.language.as_deref(), Some("en"));
        // Blank override falls back to the base value.
        assert_eq!(doc.issued_year, Some(1994));
    }

    #[test]
    fn test_merge_source_is_hidden() {
        let mut b = bundle();
        b.merged_into = Some("m-9".into());
        let doc = to_index_document(&b);
        assert!(doc.hidden);
        assert_eq!(doc.redirect_to.as_deref(), Some("m-9"));
    }

    #[test]
    fn test_language_codes() {
        assert_eq!(normalize_language("JPN").as_deref(), Some("ja"));
        assert_eq!(normalize_language("ko").as_deref(), Some("ko"));
        assert_eq!(normalize_language(" "), None);
    }
}
