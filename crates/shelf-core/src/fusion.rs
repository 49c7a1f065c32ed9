//! Reciprocal-rank fusion of ranked id lists.
//!
//! # Algorithm
//!
//! 1. For every input list, record each id's best (lowest) 1-based rank.
//!    Repeated ids within one list count once.
//! 2. `score(id) = Σ over lists 1 / (k + rank)`.
//! 3. Sort by score (desc), best rank across lists (asc), id (asc).
//!
//! The membership of the output is exactly the union of the inputs.

use std::collections::HashMap;

use serde::Serialize;

/// Default RRF constant.
pub const DEFAULT_RRF_K: f64 = 60.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusedItem {
    pub id: String,
    pub score: f64,
    /// Best 1-based rank across all input lists.
    pub best_rank: usize,
    /// Best rank per input list, `None` when absent from that list.
    pub ranks: Vec<Option<usize>>,
}

pub fn rrf_fuse(lists: &[Vec<String>], k: f64) -> Vec<FusedItem> {
    let mut by_id: HashMap<&str, Vec<Option<usize>>> = HashMap::new();

    for (list_idx, list) in lists.iter().enumerate() {
        for (pos, id) in list.iter().enumerate() {
            let rank = pos + 1;
            let ranks = by_id
                .entry(id.as_str())
                .or_insert_with(|| vec![None; lists.len()]);
            let slot = &mut ranks[list_idx];
            if slot.map_or(true, |existing| rank < existing) {
                *slot = Some(rank);
            }
        }
    }

    let mut fused: Vec<FusedItem> = by_id
        .into_iter()
        .map(|(id, ranks)| {
            let score = ranks
                .iter()
                .flatten()
                .map(|rank| 1.0 / (k + *rank as f64))
                .sum();
            let best_rank = ranks.iter().flatten().copied().min().unwrap_or(usize::MAX);
            FusedItem {
                id: id.to_string(),
                score,
                best_rank,
                ranks,
            }
        })
        .collect();

    fused.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.best_rank.cmp(&b.best_rank))
            .then_with(|| a.id.cmp(&b.id))
    });
    fused
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_membership_is_union() {
        let lex = ids(&["a", "b", "c"]);
        let vec = ids(&["c", "d"]);
        let fused = rrf_fuse(&[lex, vec], DEFAULT_RRF_K);
        let got: HashSet<_> = fused.iter().map(|f| f.id.as_str()).collect();
        let want: HashSet<_> = ["a", "b", "c", "d"].into_iter().collect();
        assert_eq!(got, want);
    }

    #[test]
    fn test_item_in_both_lists_wins() {
        let fused = rrf_fuse(&[ids(&["a", "b"]), ids(&["b", "c"])], DEFAULT_RRF_K);
        assert_eq!(fused[0].id, "b");
        let expected = 1.0 / 62.0 + 1.0 / 61.0;
        assert!((fused[0].score - expected).abs() < 1e-12);
    }

    #[test]
    fn test_duplicates_count_once_at_best_rank() {
        let with_dup = rrf_fuse(&[ids(&["a", "b", "a"])], DEFAULT_RRF_K);
        let without = rrf_fuse(&[ids(&["a", "b"])], DEFAULT_RRF_K);
        assert_eq!(with_dup, without);
    }

    #[test]
    fn test_list_order_does_not_matter() {
        let a = rrf_fuse(&[ids(&["a", "b"]), ids(&["c", "a"])], DEFAULT_RRF_K);
        let b = rrf_fuse(&[ids(&["c", "a"]), ids(&["a", "b"])], DEFAULT_RRF_K);
        let a_ids: Vec<_> = a.iter().map(|f| f.id.clone()).collect();
        let b_ids: Vec<_> = b.iter().map(|f| f.id.clone()).collect();
        assert_eq!(a_ids, b_ids);
    }

    #[test]
    fn test_ties_break_by_rank_then_id() {
        let fused = rrf_fuse(&[ids(&["b", "d"]), ids(&["a", "c"])], DEFAULT_RRF_K);
        let order: Vec<_> = fused.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_single_list_keeps_order() {
        let fused = rrf_fuse(&[ids(&["z", "y", "x"])], DEFAULT_RRF_K);
        let order: Vec<_> = fused.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(order, vec!["z", "y", "x"]);
    }

    #[test]
    fn test_empty() {
        assert!(rrf_fuse(&[], DEFAULT_RRF_K).is_empty());
        assert!(rrf_fuse(&[vec![], vec![]], DEFAULT_RRF_K).is_empty());
    }
}
