//! Order-preserving DP that maximizes matched companion records while giving
//! every anchor record exactly one output slot.

use crate::align::{check_grid, Mapping, MatchGrid};
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
    // matched[i][j]: most companion records matchable within anchor[..i] x companion[..j]
    let mut matched = vec![0u32; (n + 1) * width];

    for i in 1..=n {
        for j in 1..=m {
            let skip_anchor = matched[(i - 1) * width + j];
            let skip_companion = matched[i * width + j - 1];
            let mut best = skip_anchor.max(skip_companion);
            if grid.is_match(i - 1, j - 1) {
                best = best.max(matched[(i - 1) * width + j - 1] + 1);
            }
            matched[i * width + j] = best;
        }
    }

    // One slot per anchor record; traceback only ever fills slots, never drops them.
    let mut slots: Vec<Option<usize>> = vec![None; n];
    let (mut i, mut j) = (n, m);
    while i > 0 && j > 0 {
        let here = matched[i * width + j];
        if grid.is_match(i - 1, j - 1) && here == matched[(i - 1) * width + j - 1] + 1 {
            slots[i - 1] = Some(j - 1);
            i -= 1;
            j -= 1;
        } else if here == matched[(i - 1) * width + j] {
            i -= 1;
        } else {
            j -= 1;
        }
    }

    Ok(Mapping::from_anchor_slots(&slots, m))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(values: &[f64]) -> Vec<Option<f64>> {
        values.iter().map(|v| Some(*v)).collect()
    }

    #[test]
    fn test_every_anchor_gets_a_slot() {
        let anchor = col(&[10.0, 20.0, 30.0, 40.0]);
        let companion = col(&[20.0, 99.0, 40.0]);
        let mapping = align(&anchor, &companion, 0.05, 1_000).unwrap();
        let slots = mapping.anchor_slots();
        assert_eq!(slots.len(), 4);
        assert_eq!(slots, vec![None, Some(0), None, Some(2)]);
        assert_eq!(mapping.unmapped_companions(), vec![1]);
    }

    #[test]
    fn test_crossed_values_keep_one_match() {
        let anchor = col(&[1.0, 500.0, 600.0, 700.0, 2.0]);
        let companion = col(&[2.0, 1.0]);
        let mapping = align(&anchor, &companion, 0.05, 1_000).unwrap();
        assert_eq!(mapping.len(), 1);
        assert!(mapping.is_order_preserving());
    }
}
