//! aggregate.rs — pure aggregation over an item's evaluation rounds.
//!
//! Deterministic and side-effect-free: the same `evals` slice always yields
//! the same aggregate. No I/O, suitable for unit tests.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::store::Evaluation;

/// Derived view of an item's evaluation history. `None` score fields mean
/// "not yet judged", which is distinct from a judged score of zero.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Aggregate {
    pub num_evals: usize,
    pub weighted_score: Option<f64>,
    pub median_confidence: Option<f64>,
    pub last_eval: Option<DateTime<Utc>>,
}

/// Compute the aggregate view for one item.
///
/// Weighted score is the confidence-weighted mean of importance: each round
/// contributes proportionally to its own confidence, so low-confidence
/// judgments are down-weighted rather than discarded. When every round has
/// zero confidence the unweighted mean is used instead.
pub fn aggregate(evals: &[Evaluation]) -> Aggregate {
    if evals.is_empty() {
        return Aggregate {
            num_evals: 0,
            weighted_score: None,
            median_confidence: None,
            last_eval: None,
        };
    }

    let n = evals.len() as f64;
    let total_confidence: f64 = evals.iter().map(|e| e.response.confidence_score).sum();
    let weighted = if total_confidence > 0.0 {
        evals
            .iter()
            .map(|e| e.response.importance_score * e.response.confidence_score)
            .sum::<f64>()
            / total_confidence
    } else {
        evals.iter().map(|e| e.response.importance_score).sum::<f64>() / n
    };

    let mut confidences: Vec<f64> = evals.iter().map(|e| e.response.confidence_score).collect();
    confidences.sort_by(|a, b| a.partial_cmp(b).expect("confidence scores are finite"));

    Aggregate {
        num_evals: evals.len(),
        weighted_score: Some(weighted),
        median_confidence: Some(median_of_sorted(&confidences)),
        last_eval: evals.iter().map(|e| e.eval_date).max(),
    }
}

/// Standard median: the middle value, or the mean of the two middle values
/// for even counts. Input must be sorted and non-empty.
fn median_of_sorted(sorted: &[f64]) -> f64 {
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted[mid]
    } else {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    }
}
