//! scheduler.rs — decides the evaluation workload for one pass.
//!
//! Pure planning over the store: eligibility (lookback window), per-item
//! deficit against the target round count, and a breadth-first work list so
//! a budget-limited pass buys coverage across items rather than depth on one.

use chrono::{DateTime, Duration, Utc};

use crate::config::Settings;
use crate::store::{Item, Store};

/// Policy parameters for one pass.
#[derive(Debug, Clone)]
pub struct SchedulePolicy {
    /// Items whose effective date is older than this many days are frozen
    /// out of evaluation; `<= 0` disables the window.
    pub lookback_days: i64,
    /// Desired number of evaluation rounds per eligible item.
    pub target_rounds: u32,
    /// Maximum judge calls this pass may perform; `None` is unbounded.
    pub round_budget: Option<usize>,
    /// Skip items whose verdict is already settled (see `is_settled`).
    pub skip_settled: bool,
}

impl SchedulePolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            lookback_days: settings.lookback_days,
            target_rounds: settings.target_rounds,
            round_budget: None,
            skip_settled: true,
        }
    }
}

/// One judge call to perform: the item plus which round (0-based index into
/// its future eval history) this call represents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkUnit {
    pub dedup_key: String,
    pub round: u32,
}

/// Build the work list for one pass.
///
/// Rounds are distributed breadth-first: every deficient item gets its first
/// scheduled round before any item gets its second, so truncating at the
/// budget improves breadth, not depth. Items at or above `target_rounds` are
/// skipped entirely — repeated runs only pay for the deficit.
pub fn plan(store: &Store, policy: &SchedulePolicy, now: DateTime<Utc>) -> Vec<WorkUnit> {
    if policy.target_rounds == 0 {
        return Vec::new();
    }

    // Store iteration is key-ordered, so planning is deterministic.
    let mut deficient: Vec<(&Item, u32)> = Vec::new();
    for item in store.iter() {
        if !in_lookback(item, policy.lookback_days, now) {
            continue;
        }
        if policy.skip_settled && is_settled(item) {
            tracing::debug!(dedup_key = %item.dedup_key, "skipping settled item");
            continue;
        }
        let num_evals = item.evals.len() as u32;
        let deficit = policy.target_rounds.saturating_sub(num_evals);
        if deficit > 0 {
            deficient.push((item, deficit));
        }
    }

    let max_deficit = deficient.iter().map(|(_, d)| *d).max().unwrap_or(0);
    let mut work = Vec::new();
    'outer: for round_offset in 0..max_deficit {
        for (item, deficit) in &deficient {
            if *deficit <= round_offset {
                continue;
            }
            if let Some(budget) = policy.round_budget {
                if work.len() >= budget {
                    break 'outer;
                }
            }
            work.push(WorkUnit {
                dedup_key: item.dedup_key.clone(),
                round: item.evals.len() as u32 + round_offset,
            });
        }
    }
    work
}

fn in_lookback(item: &Item, lookback_days: i64, now: DateTime<Utc>) -> bool {
    if lookback_days <= 0 {
        return true;
    }
    item.effective_date() >= now - Duration::days(lookback_days)
}

/// An item that has been judged many times with high agreement and an
/// obviously good or bad score gains nothing from further rounds.
pub fn is_settled(item: &Item) -> bool {
    let agg = item.aggregate();
    let evaluated_a_lot = agg.num_evals > 5;
    let high_confidence = agg.median_confidence.is_some_and(|c| c > 80.0);
    let obvious = agg
        .weighted_score
        .is_some_and(|s| !(20.0..=80.0).contains(&s));
    evaluated_a_lot && high_confidence && obvious
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{dedup_key, Evaluation, JudgeResponse};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 10, 12, 0, 0).unwrap()
    }

    fn item(link: &str, age_days: i64, evals: usize) -> Item {
        item_scored(link, age_days, evals, 50.0, 50.0)
    }

    fn item_scored(
        link: &str,
        age_days: i64,
        evals: usize,
        importance: f64,
        confidence: f64,
    ) -> Item {
        let created = now() - Duration::days(age_days);
        Item {
            dedup_key: dedup_key("test", link),
            source: "test".into(),
            title: link.to_string(),
            link: link.to_string(),
            creation_date: Some(created),
            first_collected: created,
            last_collected: created,
            input: serde_json::Value::Null,
            evals: (0..evals)
                .map(|i| Evaluation {
                    eval_date: created + Duration::hours(i as i64),
                    model: "m".into(),
                    response: JudgeResponse {
                        importance_score: importance,
                        confidence_score: confidence,
                        summary: String::new(),
                        evaluation: String::new(),
                        followup: String::new(),
                        scratchpad: None,
                    },
                })
                .collect(),
        }
    }

    fn store_with(items: Vec<Item>) -> Store {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::open(dir.path().join("data.json")).unwrap();
        for it in items {
            store.insert(it);
        }
        store
    }

    fn policy(target: u32, budget: Option<usize>) -> SchedulePolicy {
        SchedulePolicy {
            lookback_days: 7,
            target_rounds: target,
            round_budget: budget,
            skip_settled: true,
        }
    }

    #[test]
    fn deficit_is_bounded_by_budget_and_target() {
        let store = store_with(vec![item("a", 1, 1)]);
        let work = plan(&store, &policy(3, Some(1)), now());
        assert_eq!(work.len(), 1);
        assert_eq!(work[0].round, 1);
    }

    #[test]
    fn rounds_are_distributed_breadth_first() {
        let a = item("a", 1, 0); // deficit 3
        let b = item("b", 1, 2); // deficit 1
        let key_a = a.dedup_key.clone();
        let key_b = b.dedup_key.clone();
        let store = store_with(vec![a, b]);

        let work = plan(&store, &policy(3, None), now());
        assert_eq!(work.len(), 4);
        // First a full breadth sweep, then a's remaining rounds.
        let keys: Vec<&str> = work.iter().map(|w| w.dedup_key.as_str()).collect();
        let first_two: std::collections::BTreeSet<&str> =
            keys[..2].iter().copied().collect();
        assert_eq!(
            first_two,
            [key_a.as_str(), key_b.as_str()].into_iter().collect()
        );
        assert_eq!(keys[2], key_a);
        assert_eq!(keys[3], key_a);
    }

    #[test]
    fn items_outside_lookback_are_never_scheduled() {
        let store = store_with(vec![item("old", 30, 0), item("fresh", 2, 0)]);
        let work = plan(&store, &policy(1, None), now());
        assert_eq!(work.len(), 1);
        assert_eq!(work[0].dedup_key, dedup_key("test", "fresh"));
    }

    #[test]
    fn first_collected_backs_up_missing_creation_date() {
        let mut it = item("undated", 30, 0);
        it.creation_date = None;
        it.first_collected = now() - Duration::days(1);
        let store = store_with(vec![it]);
        assert_eq!(plan(&store, &policy(1, None), now()).len(), 1);
    }

    #[test]
    fn target_rounds_zero_disables_evaluation() {
        let store = store_with(vec![item("a", 1, 0)]);
        assert!(plan(&store, &policy(0, None), now()).is_empty());
    }

    #[test]
    fn satisfied_items_are_skipped() {
        let store = store_with(vec![item("done", 1, 3)]);
        assert!(plan(&store, &policy(3, None), now()).is_empty());
    }

    #[test]
    fn settled_items_are_skipped_even_when_deficient() {
        // 6 confident rounds at score 90: settled despite target 10.
        let settled = item_scored("settled", 1, 6, 90.0, 95.0);
        // 6 confident rounds in the ambiguous middle: still scheduled.
        let ambiguous = item_scored("ambiguous", 1, 6, 50.0, 95.0);
        let key = ambiguous.dedup_key.clone();
        let store = store_with(vec![settled, ambiguous]);

        let work = plan(&store, &policy(10, None), now());
        assert!(work.iter().all(|w| w.dedup_key == key));
        assert_eq!(work.len(), 4);
    }
}
