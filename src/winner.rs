//! Deterministic winner selection for merge clusters.

use std::cmp::Ordering;

use crate::record::NormalizedRecord;

/// Total order used to rank merge candidates: higher usage first, then the
/// oldest record, then the lowest id.
#[must_use]
pub fn winner_order(a: &NormalizedRecord, b: &NormalizedRecord) -> Ordering {
    b.usage_count
        .cmp(&a.usage_count)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Splits a cluster into its winner and its losers (in rank order).
///
/// Returns `None` for an empty cluster. Input order does not affect the result.
#[must_use]
pub fn select_winner(members: &[NormalizedRecord]) -> Option<(&NormalizedRecord, Vec<&NormalizedRecord>)> {
    let mut ranked: Vec<&NormalizedRecord> = members.iter().collect();
    ranked.sort_by(|a, b| winner_order(a, b));
    let mut iter = ranked.into_iter();
    let winner = iter.next()?;
    Some((winner, iter.collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    use crate::confidence::Confidence;
    use crate::record::{CreatedBy, NewRecord, NormalizedId, NormalizedKind};

    fn record(key: &str, usage: u64, age_secs: i64) -> NormalizedRecord {
        let mut r = NormalizedRecord::from_new(
            NormalizedKind::Entity,
            NewRecord {
                canonical_key: key.to_string(),
                display_name: key.to_string(),
                description: String::new(),
                examples: Vec::new(),
                confidence: Confidence::clamped(0.9),
                created_by: CreatedBy::Ai,
            },
        );
        r.usage_count = usage;
        r.created_at = Utc::now() - Duration::seconds(age_secs);
        r
    }

    #[test]
    fn test_higher_usage_wins() {
        let a = record("a", 5, 0);
        let b = record("b", 2, 100);
        let members = [b, a.clone()];
        let (winner, losers) = select_winner(&members).unwrap();
        assert_eq!(winner.id, a.id);
        assert_eq!(losers.len(), 1);
    }

    #[test]
    fn test_older_wins_on_usage_tie() {
        let old = record("old", 3, 1000);
        let young = record("young", 3, 10);
        let members = [young, old.clone()];
        let (winner, _) = select_winner(&members).unwrap();
        assert_eq!(winner.id, old.id);
    }

    #[test]
    fn test_id_breaks_full_tie() {
        let now = Utc::now();
        let mut a = record("a", 1, 0);
        let mut b = record("b", 1, 0);
        a.created_at = now;
        b.created_at = now;
        a.id = NormalizedId::from_uuid(uuid::Uuid::from_u128(2));
        b.id = NormalizedId::from_uuid(uuid::Uuid::from_u128(1));
        let members = [a.clone(), b.clone()];
        let (winner, losers) = select_winner(&members).unwrap();
        assert_eq!(winner.id, b.id);
        assert_eq!(losers[0].id, a.id);
    }

    #[test]
    fn test_selection_ignores_input_order() {
        let members = vec![record("a", 1, 5), record("b", 7, 1), record("c", 7, 9), record("d", 0, 50)];
        let mut reversed = members.clone();
        reversed.reverse();
        let (w1, l1) = select_winner(&members).unwrap();
        let (w2, l2) = select_winner(&reversed).unwrap();
        assert_eq!(w1.id, w2.id);
        let ids1: Vec<_> = l1.iter().map(|r| r.id).collect();
        let ids2: Vec<_> = l2.iter().map(|r| r.id).collect();
        assert_eq!(ids1, ids2);
        assert_eq!(w1.canonical_key, "c");
    }

    #[test]
    fn test_empty_cluster() {
        assert!(select_winner(&[]).is_none());
    }
}
