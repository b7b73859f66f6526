//! Worker selection scoring.

use crate::registry::CandidateSnapshot;

/// Composite suitability score:
/// specialization dominates, then headroom, then track record.
pub fn score(candidate: &CandidateSnapshot) -> f64 {
    let headroom = if candidate.max_capacity == 0 {
        0.0
    } else {
        1.0 - candidate.capacity_used as f64 / candidate.max_capacity as f64
    };
    0.5 * candidate.specialization + 0.3 * headroom + 0.2 * candidate.success_rate
}

/// Pick the best candidate. Ties break toward the least-loaded instance,
/// then the lexicographically smallest instance id so selection is
/// deterministic.
pub fn select_best(mut candidates: Vec<CandidateSnapshot>) -> Option<CandidateSnapshot> {
    candidates.sort_by(|a, b| {
        score(b)
            .total_cmp(&score(a))
            .then(a.capacity_used.cmp(&b.capacity_used))
            .then(a.instance_id.cmp(&b.instance_id))
    });
    candidates.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, specialization: f64, used: u32, max: u32, rate: f64) -> CandidateSnapshot {
        CandidateSnapshot {
            instance_id: id.to_owned(),
            worker_kind: "clearance".to_owned(),
            capacity_used: used,
            max_capacity: max,
            success_rate: rate,
            specialization,
        }
    }

    #[test]
    fn weights_follow_the_half_third_fifth_split() {
        let c = candidate("w", 0.9, 1, 4, 0.8);
        let expected = 0.5 * 0.9 + 0.3 * 0.75 + 0.2 * 0.8;
        assert!((score(&c) - expected).abs() < 1e-9);
    }

    #[test]
    fn specialization_outweighs_load() {
        let specialist = candidate("spec", 0.95, 2, 3, 0.9);
        let generalist = candidate("gen", 0.5, 0, 3, 0.9);
        let best = select_best(vec![generalist, specialist]).unwrap();
        assert_eq!(best.instance_id, "spec");
    }

    #[test]
    fn ties_break_on_lower_load_then_id() {
        let a = candidate("b-loaded", 0.8, 1, 4, 0.9);
        let b = candidate("a-idle", 0.8, 1, 4, 0.9);
        let best = select_best(vec![a.clone(), b]).unwrap();
        assert_eq!(best.instance_id, "a-idle");

        let c = candidate("less-loaded", 0.8, 0, 4, 0.9);
        // Different load changes headroom, hence score; equalize by
        // compensating success rate so the load tie-break is exercised.
        let mut d = candidate("more-loaded", 0.8, 2, 4, 0.9);
        d.success_rate = 0.9 + (0.3 * 0.5) / 0.2;
        assert!((score(&c) - score(&d)).abs() < 1e-9);
        let best = select_best(vec![d, c]).unwrap();
        assert_eq!(best.instance_id, "less-loaded");
    }

    #[test]
    fn empty_candidate_set_selects_nothing() {
        assert!(select_best(Vec::new()).is_none());
    }
}
