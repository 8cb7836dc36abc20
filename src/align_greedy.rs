//! Closest-value pairing without order preservation. Used as a sanity
//! baseline and wins when the feed was reshuffled between passes.

use crate::align::Mapping;
use crate::tolerance::{percent_diff, tolerance_match};
use crate::ReconcileError;
use fixedbitset::FixedBitSet;

struct Candidate {
    diff: f64,
    distance: usize,
    companion: usize,
    anchor: usize,
}

/// Fails with `AlignmentInfeasible` once more than `max_candidates`
/// tolerance-matching pairs turn up.
pub fn align(
    anchor: &[Option<f64>],
    companion: &[Option<f64>],
    tolerance: f64,
    max_candidates: usize,
) -> Result<Mapping, ReconcileError> {
    let mut candidates = Vec::new();
    for (j, c) in companion.iter().enumerate() {
        for (i, a) in anchor.iter().enumerate() {
            if !tolerance_match(*a, *c, tolerance) {
                continue;
            }
            if candidates.len() == max_candidates {
                return Err(ReconcileError::AlignmentInfeasible(format!(
                    "{}x{} columns at tolerance {} yield more than {} candidate pairs",
                    anchor.len(),
                    companion.len(),
                    tolerance,
                    max_candidates
                )));
            }
            candidates.push(Candidate {
                diff: percent_diff(*a, *c).unwrap_or(0.0),
                distance: i.abs_diff(j),
                companion: j,
                anchor: i,
            });
        }
    }

    candidates.sort_by(|x, y| {
        x.diff
            .total_cmp(&y.diff)
            .then(x.distance.cmp(&y.distance))
            .then(x.companion.cmp(&y.companion))
            .then(x.anchor.cmp(&y.anchor))
    });

    let mut anchor_claimed = FixedBitSet::with_capacity(anchor.len());
    let mut companion_claimed = FixedBitSet::with_capacity(companion.len());
    let mut mapping = Mapping::empty(anchor.len(), companion.len());

    for candidate in candidates {
        if anchor_claimed.contains(candidate.anchor) || companion_claimed.contains(candidate.companion) {
            continue;
        }
        anchor_claimed.insert(candidate.anchor);
        companion_claimed.insert(candidate.companion);
        mapping.link(candidate.companion, candidate.anchor);
    }

    Ok(mapping)
}
