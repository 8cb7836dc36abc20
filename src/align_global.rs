//! Order-preserving global alignment over the full anchor x companion grid.

use crate::align::{check_grid, Mapping, MatchGrid};
use crate::ReconcileError;

pub(crate) const MATCH_SCORE: i32 = 2;
pub(crate) const MISMATCH_PENALTY: i32 = -1;
pub(crate) const GAP_PENALTY: i32 = -1;

pub fn align(
    anchor: &[Option<f64>],
    companion: &[Option<f64>],
    tolerance: f64,
    max_cells: usize,
) -> Result<Mapping, ReconcileError> {
    let n = anchor.len();
    let m = companion.len();
    check_grid(n, m, max_cells)?;

    let grid = MatchGrid::new(anchor, companion, tolerance);
    let width = m + 1;
    let mut score = vec![0i32; (n + 1) * width];

    for i in 0..=n {
        score[i * width] = i as i32 * GAP_PENALTY;
    }
    for j in 0..=m {
        score[j] = j as i32 * GAP_PENALTY;
    }

    for i in 1..=n {
        for j in 1..=m {
            let diagonal = score[(i - 1) * width + j - 1] + substitution(&grid, i - 1, j - 1);
            let up = score[(i - 1) * width + j] + GAP_PENALTY;
            let left = score[i * width + j - 1] + GAP_PENALTY;
            score[i * width + j] = diagonal.max(up).max(left);
        }
    }

    let mut mapping = Mapping::empty(n, m);
    let (mut i, mut j) = (n, m);
    while i > 0 || j > 0 {
        let here = score[i * width + j];
        if i > 0 && j > 0 {
            let sub = substitution(&grid, i - 1, j - 1);
            if here == score[(i - 1) * width + j - 1] + sub {
                // A mismatched substitution leaves both records as gaps.
                if sub == MATCH_SCORE {
                    mapping.link(j - 1, i - 1);
                }
                i -= 1;
                j -= 1;
                continue;
            }
        }
        if i > 0 && here == score[(i - 1) * width + j] + GAP_PENALTY {
            i -= 1;
        } else {
            j -= 1;
        }
    }

    Ok(mapping)
}

pub(crate) fn substitution(grid: &MatchGrid, anchor: usize, companion: usize) -> i32 {
    if grid.is_match(anchor, companion) {
        MATCH_SCORE
    } else {
        MISMATCH_PENALTY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(values: &[f64]) -> Vec<Option<f64>> {
        values.iter().map(|v| Some(*v)).collect()
    }

    #[test]
    fn test_identical_sequences_map_diagonally() {
        let a = col(&[10.0, 20.0, 40.0, 80.0]);
        let mapping = align(&a, &a, 0.1, 1_000).unwrap();
        assert_eq!(mapping.anchor_slots(), vec![Some(0), Some(1), Some(2), Some(3)]);
    }

    #[test]
    fn test_deleted_item_leaves_anchor_gap() {
        let anchor = col(&[100.0, 250.0, 600.0, 1500.0, 4000.0]);
        let companion = col(&[101.0, 248.0, 1490.0, 4100.0]);
        let mapping = align(&anchor, &companion, 0.15, 1_000).unwrap();
        assert_eq!(mapping.anchor_slots(), vec![Some(0), Some(1), None, Some(2), Some(3)]);
        assert!(mapping.is_order_preserving());
    }

    #[test]
    fn test_inserted_head_item_becomes_orphan() {
        let anchor = col(&[300.0, 500.0, 900.0]);
        let companion = col(&[12.0, 300.0, 500.0, 900.0]);
        let mapping = align(&anchor, &companion, 0.1, 1_000).unwrap();
        assert_eq!(mapping.anchor_for(0), None);
        assert_eq!(mapping.unmapped_companions(), vec![0]);
        assert_eq!(mapping.len(), 3);
    }

    #[test]
    fn test_mismatch_is_not_mapped() {
        let anchor = col(&[100.0]);
        let companion = col(&[900.0]);
        let mapping = align(&anchor, &companion, 0.1, 1_000).unwrap();
        assert!(mapping.is_empty());
    }
}
