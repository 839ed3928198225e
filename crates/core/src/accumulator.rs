//! Per-query result accumulation and the one-time ranking applied when a block closes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// One partial result streamed by the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultItem {
    pub score: Option<f64>,
    pub payload: Value,
}

impl ResultItem {
    /// Ranking key. Unscored items (and NaN) sort below every real score.
    fn rank_key(&self) -> f64 {
        match self.score {
            Some(score) if !score.is_nan() => score,
            _ => f64::NEG_INFINITY,
        }
    }
}

/// A result item tagged with its position in the arrival sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedItem {
    pub arrival_index: usize,
    pub item: ResultItem,
}

/// Everything streamed in response to one query.
///
/// Items are kept in arrival order while the block is open so callers can
/// render progressively; [`ResponseBlock::finalize`] re-sorts them exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseBlock {
    pub seq: u64,
    pub started_at: DateTime<Utc>,
    pub originating_query: Option<String>,
    pub items: Vec<RankedItem>,
    /// Arrival index of the highest-scored item seen so far.
    pub best: Option<usize>,
    pub domains_complete: bool,
    /// Set when the peer reported a failure that ended this block early.
    pub failure: Option<String>,
    pub closed: bool,
}

impl ResponseBlock {
    pub fn open(seq: u64, started_at: DateTime<Utc>, originating_query: Option<String>) -> Self {
        Self {
            seq,
            started_at,
            originating_query,
            items: Vec::new(),
            best: None,
            domains_complete: false,
            failure: None,
            closed: false,
        }
    }

    /// Appends an item in arrival order. Returns the stored item and whether it
    /// became the new best-so-far. Ties keep the earlier arrival as best.
    pub fn add_item(&mut self, item: ResultItem) -> (RankedItem, bool) {
        let arrival_index = self.items.len();
        let is_best = match self.best_item() {
            Some(current) => item.rank_key() > current.item.rank_key(),
            None => true,
        };
        if is_best {
            self.best = Some(arrival_index);
        }
        let ranked = RankedItem {
            arrival_index,
            item,
        };
        self.items.push(ranked.clone());
        (ranked, is_best)
    }

    pub fn best_item(&self) -> Option<&RankedItem> {
        let best = self.best?;
        self.items.iter().find(|ranked| ranked.arrival_index == best)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Ranks the accumulated items and marks the block closed. Calling it again
    /// on a closed block is a no-op.
    pub fn finalize(&mut self) -> &[RankedItem] {
        if !self.closed {
            rank(&mut self.items);
            self.closed = true;
        }
        &self.items
    }
}

/// Sorts by score descending. `sort_by` is stable, so equal scores keep arrival order.
pub fn rank(items: &mut [RankedItem]) {
    items.sort_by(|a, b| {
        b.item
            .rank_key()
            .partial_cmp(&a.item.rank_key())
            .unwrap_or(Ordering::Equal)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(score: Option<f64>) -> ResultItem {
        ResultItem {
            score,
            payload: json!({ "score": score }),
        }
    }

    fn block_with(scores: &[Option<f64>]) -> ResponseBlock {
        let mut block = ResponseBlock::open(0, Utc::now(), Some("q".into()));
        for score in scores {
            block.add_item(item(*score));
        }
        block
    }

    fn order(block: &ResponseBlock) -> Vec<usize> {
        block.items.iter().map(|r| r.arrival_index).collect()
    }

    #[test]
    fn finalize_is_stable_on_equal_scores() {
        let mut block = block_with(&[Some(0.5), Some(0.9), Some(0.5), Some(0.9)]);
        block.finalize();
        assert_eq!(order(&block), vec![1, 3, 0, 2]);
        assert!(block.closed);
    }

    #[test]
    fn items_stay_in_arrival_order_until_finalized() {
        let block = block_with(&[Some(0.2), Some(0.8), Some(0.4)]);
        assert_eq!(order(&block), vec![0, 1, 2]);
        assert!(!block.closed);
    }

    #[test]
    fn unscored_items_rank_last_but_are_kept() {
        let mut block = block_with(&[None, Some(0.1), None, Some(-3.0)]);
        block.finalize();
        assert_eq!(order(&block), vec![1, 3, 0, 2]);
    }

    #[test]
    fn nan_scores_are_treated_as_unscored() {
        let mut block = block_with(&[Some(f64::NAN), Some(0.3)]);
        block.finalize();
        assert_eq!(order(&block), vec![1, 0]);
    }

    #[test]
    fn best_so_far_tracks_strict_improvements_only() {
        let mut block = ResponseBlock::open(0, Utc::now(), None);
        assert!(block.add_item(item(Some(0.4))).1);
        assert!(block.add_item(item(Some(0.9))).1);
        assert!(!block.add_item(item(Some(0.9))).1);
        assert!(!block.add_item(item(None)).1);
        assert_eq!(block.best, Some(1));
        assert_eq!(block.best_item().unwrap().item.score, Some(0.9));
    }

    #[test]
    fn finalize_twice_does_not_reorder() {
        let mut block = block_with(&[Some(0.1), Some(0.7)]);
        block.finalize();
        let first = order(&block);
        block.finalize();
        assert_eq!(order(&block), first);
    }

    #[test]
    fn best_survives_finalize_reordering() {
        let mut block = block_with(&[Some(0.1), Some(0.7), Some(0.3)]);
        block.finalize();
        assert_eq!(block.best_item().unwrap().arrival_index, 1);
    }
}
