//! Lockstep walk with a bounded skip window. Close to the DP result for
//! nearly-aligned passes at a fraction of the cost.

use crate::align::Mapping;
use crate::tolerance::{percent_diff, tolerance_match};
use smallvec::SmallVec;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Skip {
    /// Companion records ahead of the cursor are orphans (feed gained items).
    Companion(usize),
    /// Anchor records ahead of the cursor are unmatched (feed lost items).
    Anchor(usize),
}

impl Skip {
    fn offset(&self) -> usize {
        match self {
            Skip::Companion(k) | Skip::Anchor(k) => *k,
        }
    }
}

pub fn align(
    anchor: &[Option<f64>],
    companion: &[Option<f64>],
    tolerance: f64,
    window: usize,
) -> Mapping {
    let n = anchor.len();
    let m = companion.len();
    let mut mapping = Mapping::empty(n, m);
    let (mut i, mut j) = (0, 0);

    while i < n && j < m {
        if tolerance_match(anchor[i], companion[j], tolerance) {
            mapping.link(j, i);
            i += 1;
            j += 1;
            continue;
        }

        match find_skip(anchor, companion, i, j, tolerance, window) {
            Some(Skip::Companion(k)) => j += k,
            Some(Skip::Anchor(k)) => i += k,
            None => {
                i += 1;
                j += 1;
            }
        }
    }

    mapping
}

/// Nearest resumption point within the window; on equal offsets the closer value wins.
fn find_skip(
    anchor: &[Option<f64>],
    companion: &[Option<f64>],
    i: usize,
    j: usize,
    tolerance: f64,
    window: usize,
) -> Option<Skip> {
    let mut found: SmallVec<[(Skip, f64); 8]> = SmallVec::new();

    for k in 1..=window {
        if j + k < companion.len() && tolerance_match(anchor[i], companion[j + k], tolerance) {
            let diff = percent_diff(anchor[i], companion[j + k]).unwrap_or(0.0);
            found.push((Skip::Companion(k), diff));
        }
        if i + k < anchor.len() && tolerance_match(anchor[i + k], companion[j], tolerance) {
            let diff = percent_diff(anchor[i + k], companion[j]).unwrap_or(0.0);
            found.push((Skip::Anchor(k), diff));
        }
        if !found.is_empty() {
            break;
        }
    }

    found
        .into_iter()
        .min_by(|(a, da), (b, db)| a.offset().cmp(&b.offset()).then(da.total_cmp(db)))
        .map(|(skip, _)| skip)
}
