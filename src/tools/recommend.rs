//! Book and cart recommendations with selection follow-ups.

use std::collections::HashSet;

use shelf_core::models::{
    FieldPatch, Reply, SelectionCandidate, SelectionSnapshot, SessionPatch, Source, SLOT_ISBN,
    SLOT_SELECTION_INDEX,
};
use shelf_core::normalize::normalize_isbn;
use shelf_core::reason;

use crate::commerce::{field_str, unwrap_list};
use crate::rag::{Chunk, RetrieveOptions};

use super::{ToolContext, ToolOutcome, ToolRouter};

pub const KIND_BOOK: &str = "book_recommend";
pub const KIND_CART: &str = "cart_recommend";

/// What a recommendation is seeded from; only these exact entities are
/// removed from the results, sibling editions stay.
#[derive(Debug, Default)]
struct Seeds {
    doc_ids: HashSet<String>,
    isbns: HashSet<String>,
}

impl Seeds {
    fn excludes(&self, chunk: &Chunk) -> bool {
        self.doc_ids.contains(&chunk.doc_id)
    }

    /// Resolve ISBN seeds to the doc ids they were retrieved under.
    fn absorb_isbn_hits(&mut self, chunks: &[Chunk]) {
        for chunk in chunks {
            let isbn = chunk.isbn.as_deref().and_then(normalize_isbn);
            if isbn.map(|i| self.isbns.contains(&i)).unwrap_or(false) {
                self.doc_ids.insert(chunk.doc_id.clone());
            }
        }
    }
}

fn candidates_from(chunks: Vec<Chunk>, seeds: &Seeds, limit: usize) -> Vec<(SelectionCandidate, Chunk)> {
    let mut seen = HashSet::new();
    chunks
        .into_iter()
        .filter(|c| !seeds.excludes(c))
        .filter(|c| seen.insert(c.doc_id.clone()))
        .take(limit)
        .map(|c| {
            (
                SelectionCandidate {
                    doc_id: c.doc_id.clone(),
                    title: c.title.clone(),
                    citation_key: Some(c.citation_key.clone()),
                    url: c.url.clone(),
                    isbn: c.isbn.clone(),
                },
                c,
            )
        })
        .collect()
}

async fn recommend(
    router: &ToolRouter,
    ctx: &ToolContext<'_>,
    query: &str,
    mut seeds: Seeds,
    kind: &str,
    heading: &str,
) -> ToolOutcome {
    let limit = router.config.recommend_top_k.max(1);
    let retrieval = router
        .retriever
        .retrieve(
            query,
            RetrieveOptions {
                top_k: Some(limit + seeds.doc_ids.len() + seeds.isbns.len()),
                ..Default::default()
            },
        )
        .await;
    if let Some(code) = retrieval.error {
        return ToolOutcome::reply(Reply::new(code, "추천 도서를 불러오지 못했습니다. 잠시 후 다시 시도해 주세요."));
    }
    seeds.absorb_isbn_hits(&retrieval.chunks);
    let picked = candidates_from(retrieval.chunks, &seeds, limit);
    if picked.is_empty() {
        return ToolOutcome::reply(Reply::new(
            reason::RAG_NO_CHUNKS,
            "추천할 만한 도서를 찾지 못했습니다. 다른 키워드로 다시 요청해 주세요.",
        ));
    }

    let mut lines = vec![heading.to_string()];
    for (i, (candidate, _)) in picked.iter().enumerate() {
        lines.push(format!("{}. {}", i + 1, candidate.title));
    }
    lines.push("마음에 드는 책이 있으면 'N번째'라고 말씀해 주세요.".to_string());

    let sources = picked.iter().map(|(_, chunk)| chunk.to_source()).collect();
    let snapshot = SelectionSnapshot {
        kind: kind.to_string(),
        candidates: picked.into_iter().map(|(candidate, _)| candidate).collect(),
        selected_index: None,
        selected_entity: None,
    };
    tracing::debug!(kind, count = snapshot.candidates.len(), trace_id = ctx.trace_id, "recommendations shown");
    ToolOutcome::succeeded(Reply::ok(lines.join("\n")).with_sources(sources)).with_patch(SessionPatch {
        selection: FieldPatch::Set(snapshot),
        ..Default::default()
    })
}

/// "N번째로 할게" against the stored snapshot.
fn select(ctx: &ToolContext<'_>, snapshot: &SelectionSnapshot) -> ToolOutcome {
    let index = ctx
        .understanding
        .slot(SLOT_SELECTION_INDEX)
        .and_then(|s| s.parse::<usize>().ok())
        .or_else(|| (snapshot.candidates.len() == 1).then_some(1));
    let Some(index) = index.filter(|i| (1..=snapshot.candidates.len()).contains(i)) else {
        return ToolOutcome::reply(Reply::new(
            reason::MISSING_REQUIRED_INFO,
            format!("1번째부터 {}번째 중에서 골라 주세요.", snapshot.candidates.len()),
        ));
    };
    let chosen = snapshot.candidates[index - 1].clone();
    let mut source = Source::new(
        chosen.citation_key.clone().unwrap_or_else(|| chosen.doc_id.clone()),
        chosen.title.clone(),
    );
    source.url = chosen.url.clone();
    source.doc_id = Some(chosen.doc_id.clone());

    let content = format!("{}번째 도서 '{}'(으)로 선택했습니다.", index, chosen.title);
    let updated = SelectionSnapshot {
        selected_index: Some(index),
        selected_entity: Some(chosen),
        ..snapshot.clone()
    };
    ToolOutcome::succeeded(Reply::ok(content).with_sources(vec![source])).with_patch(SessionPatch {
        selection: FieldPatch::Set(updated),
        ..Default::default()
    })
}

pub async fn book(router: &ToolRouter, ctx: &ToolContext<'_>) -> ToolOutcome {
    if ctx.understanding.is_reference {
        if let Some(snapshot) = &ctx.session.selection {
            return select(ctx, snapshot);
        }
    }
    let mut seeds = Seeds::default();
    if let Some(isbn) = ctx.understanding.slot(SLOT_ISBN) {
        seeds.isbns.insert(isbn.to_string());
    }
    recommend(
        router,
        ctx,
        &ctx.understanding.standalone_query,
        seeds,
        KIND_BOOK,
        "이런 책은 어떠세요?",
    )
    .await
}

pub async fn cart(router: &ToolRouter, ctx: &ToolContext<'_>) -> ToolOutcome {
    let call = ctx.call_context();
    let body = match router.call("cart_lookup", router.commerce.get_cart(&call)).await {
        Ok(body) => body,
        Err(failure) => return router.failure_outcome(ctx, "cart_lookup", &failure),
    };
    let items = unwrap_list(&body, "items");
    if items.is_empty() {
        return ToolOutcome::reply(Reply::ok(
            "장바구니가 비어 있습니다. 관심 있는 책을 담은 뒤 다시 요청해 주세요.",
        ));
    }

    let mut seeds = Seeds::default();
    let mut titles = Vec::new();
    for item in &items {
        if let Some(doc_id) = field_str(item, "doc_id") {
            seeds.doc_ids.insert(doc_id);
        }
        if let Some(isbn) = field_str(item, "isbn").and_then(|i| normalize_isbn(&i)) {
            seeds.isbns.insert(isbn);
        }
        if let Some(title) = field_str(item, "title") {
            titles.push(title);
        }
    }
    if titles.is_empty() {
        return ToolOutcome::reply(Reply::new(
            reason::MISSING_REQUIRED_INFO,
            "장바구니 도서 정보를 확인하지 못했습니다.",
        ));
    }
    recommend(
        router,
        ctx,
        &titles.join(" "),
        seeds,
        KIND_CART,
        "장바구니에 담긴 책과 함께 보기 좋은 책입니다.",
    )
    .await
}
