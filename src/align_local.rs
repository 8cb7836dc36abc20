//! Best-scoring contiguous region, for passes that only partially overlap.

use crate::align::{check_grid, Mapping, MatchGrid};
use crate::align_global::{substitution, GAP_PENALTY};
use crate::ReconcileError;

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
    let mut best = 0;
    let mut best_pos = (0, 0);

    for i in 1..=n {
        for j in 1..=m {
            let diagonal = score[(i - 1) * width + j - 1] + substitution(&grid, i - 1, j - 1);
            let up = score[(i - 1) * width + j] + GAP_PENALTY;
            let left = score[i * width + j - 1] + GAP_PENALTY;
            let cell = diagonal.max(up).max(left).max(0);
            score[i * width + j] = cell;

            if cell > best {
                best = cell;
                best_pos = (i, j);
            }
        }
    }

    let mut mapping = Mapping::empty(n, m);
    let (mut i, mut j) = best_pos;
    while i > 0 && j > 0 && score[i * width + j] > 0 {
        let here = score[i * width + j];
        let sub = substitution(&grid, i - 1, j - 1);
        if here == score[(i - 1) * width + j - 1] + sub {
            if sub > 0 {
                mapping.link(j - 1, i - 1);
            }
            i -= 1;
            j -= 1;
        } else if here == score[(i - 1) * width + j] + GAP_PENALTY {
            i -= 1;
        } else {
            j -= 1;
        }
    }

    Ok(mapping)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(values: &[f64]) -> Vec<Option<f64>> {
        values.iter().map(|v| Some(*v)).collect()
    }

    #[test]
    fn test_finds_overlapping_tail() {
        // Companion scrape started three items later than the anchor scrape.
        let anchor = col(&[5.0, 70.0, 900.0, 40.0, 3000.0, 150.0]);
        let companion = col(&[40.0, 3000.0, 150.0, 77777.0]);
        let mapping = align(&anchor, &companion, 0.1, 1_000).unwrap();
        assert_eq!(mapping.anchor_for(0), Some(3));
        assert_eq!(mapping.anchor_for(1), Some(4));
        assert_eq!(mapping.anchor_for(2), Some(5));
        assert_eq!(mapping.anchor_for(3), None);
        assert!(mapping.is_order_preserving());
    }

    #[test]
    fn test_no_overlap_maps_nothing() {
        let anchor = col(&[1.0, 2.0]);
        let companion = col(&[500.0, 900.0]);
        let mapping = align(&anchor, &companion, 0.1, 1_000).unwrap();
        assert!(mapping.is_empty());
        assert_eq!(mapping.unmapped_companions(), vec![0, 1]);
    }
}
