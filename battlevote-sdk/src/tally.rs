//! Aggregation of raw tallies into totals, percentages and winners.
//!
//! Everything here is pure: the same stats always produce the same
//! [`Aggregate`], regardless of the order votes arrived in.

use crate::event::Notice;
use crate::types::{ItemId, ItemTally, VoteStats};

/// Derived view of a set of tallies.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub vote_stats: VoteStats,
    pub total_votes: u64,
    pub winners: Vec<ItemId>,
}

/// Recompute totals, percentages and winners from raw vote counts.
///
/// Incoming percentages are ignored; only `votes` is trusted.
pub fn aggregate(stats: &VoteStats) -> Aggregate {
    let total_votes: u64 = stats.values().map(|t| t.votes).sum();
    let vote_stats = stats
        .iter()
        .map(|(&id, t)| {
            let percentage = if total_votes > 0 {
                t.votes as f64 / total_votes as f64 * 100.0
            } else {
                0.0
            };
            (id, ItemTally { votes: t.votes, percentage })
        })
        .collect();
    let winners = winners(stats, total_votes);
    Aggregate {
        vote_stats,
        total_votes,
        winners,
    }
}

/// Every item holding the maximum vote count, ascending; empty when nobody
/// has voted.
pub fn winners(stats: &VoteStats, total_votes: u64) -> Vec<ItemId> {
    if total_votes == 0 {
        return Vec::new();
    }
    let Some(max) = stats.values().map(|t| t.votes).max() else {
        return Vec::new();
    };
    stats
        .iter()
        .filter(|(_, t)| t.votes == max)
        .map(|(&id, _)| id)
        .collect()
}

/// Notice to raise when the winners set moves from `before` to `after`.
///
/// Fires when a single leader emerges from "no single leader", or when a tie
/// appears where there was at most one leader. Identical states never fire.
pub fn standing_change(before: &[ItemId], after: &[ItemId]) -> Option<Notice> {
    if after.len() == 1 && before.len() != 1 {
        Some(Notice::Leader { item: after[0] })
    } else if after.len() > 1 && before.len() <= 1 {
        Some(Notice::Tie {
            items: after.to_vec(),
        })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(pairs: &[(ItemId, u64)]) -> VoteStats {
        pairs
            .iter()
            .map(|&(id, votes)| (id, ItemTally { votes, percentage: 0.0 }))
            .collect()
    }

    #[test]
    fn no_votes_no_winners() {
        let agg = aggregate(&stats(&[(1, 0), (25, 0)]));
        assert_eq!(agg.total_votes, 0);
        assert!(agg.winners.is_empty());
        assert!(agg.vote_stats.values().all(|t| t.percentage == 0.0));
        assert!(aggregate(&VoteStats::new()).winners.is_empty());
    }

    #[test]
    fn single_leader() {
        let agg = aggregate(&stats(&[(1, 3), (25, 1)]));
        assert_eq!(agg.total_votes, 4);
        assert_eq!(agg.winners, vec![1]);
        assert_eq!(agg.vote_stats[&1].percentage, 75.0);
        assert_eq!(agg.vote_stats[&25].percentage, 25.0);
    }

    #[test]
    fn tie_includes_all_max_scorers() {
        let agg = aggregate(&stats(&[(44, 2), (1, 2), (25, 1)]));
        assert_eq!(agg.winners, vec![1, 44]);
    }

    #[test]
    fn recompute_is_idempotent() {
        let first = aggregate(&stats(&[(1, 1), (25, 2), (44, 4)]));
        let second = aggregate(&first.vote_stats);
        assert_eq!(first, second);
        for (a, b) in first.vote_stats.values().zip(second.vote_stats.values()) {
            assert_eq!(a.percentage.to_bits(), b.percentage.to_bits());
        }
    }

    #[test]
    fn stale_percentages_are_replaced() {
        let mut input = stats(&[(1, 1), (25, 1)]);
        input.get_mut(&1).unwrap().percentage = 99.0;
        let agg = aggregate(&input);
        assert_eq!(agg.vote_stats[&1].percentage, 50.0);
    }

    #[test]
    fn standing_transitions() {
        assert_eq!(standing_change(&[], &[1]), Some(Notice::Leader { item: 1 }));
        assert_eq!(standing_change(&[1, 25], &[25]), Some(Notice::Leader { item: 25 }));
        assert_eq!(
            standing_change(&[1], &[1, 25]),
            Some(Notice::Tie { items: vec![1, 25] })
        );
        assert_eq!(
            standing_change(&[], &[1, 25]),
            Some(Notice::Tie { items: vec![1, 25] })
        );
        assert_eq!(standing_change(&[1], &[1]), None);
        assert_eq!(standing_change(&[1, 25], &[1, 25]), None);
        assert_eq!(standing_change(&[1, 25], &[1, 25, 44]), None);
        assert_eq!(standing_change(&[1], &[]), None);
    }
}
