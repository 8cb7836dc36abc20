/// Relative difference `|a-b| / max(a,b)`.
///
/// Returns `Some(0.0)` for two zeros and `None` when either side is absent,
/// non-finite, or the larger value is not positive (the ratio is undefined).
pub fn percent_diff(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    let (a, b) = match (a, b) {
        (Some(a), Some(b)) => (a, b),
        _ => return None,
    };
    if !a.is_finite() || !b.is_finite() {
        return None;
    }
    if a == 0.0 && b == 0.0 {
        return Some(0.0);
    }
    let max = a.max(b);
    if max <= 0.0 {
        return None;
    }
    Some((a - b).abs() / max)
}

/// Whether two observations of the same metric count as the same value.
pub fn tolerance_match(a: Option<f64>, b: Option<f64>, tolerance: f64) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => {
            if !a.is_finite() || !b.is_finite() {
                return false;
            }
            if a == 0.0 && b == 0.0 {
                return true;
            }
            let max = a.max(b);
            if max <= 0.0 {
                // Ratio undefined for non-positive magnitudes; only identical values match.
                return a == b;
            }
            (a - b).abs() / max <= tolerance
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_zero_matches() {
        assert!(tolerance_match(Some(0.0), Some(0.0), 0.1));
        assert_eq!(percent_diff(Some(0.0), Some(0.0)), Some(0.0));
    }

    #[test]
    fn test_absent_never_matches() {
        assert!(!tolerance_match(None, Some(1.0), 0.5));
        assert!(!tolerance_match(Some(1.0), None, 0.5));
        assert!(!tolerance_match(None, None, 0.5));
        assert_eq!(percent_diff(None, None), None);
    }

    #[test]
    fn test_within_and_outside_tolerance() {
        assert!(tolerance_match(Some(200.0), Some(205.0), 0.15));
        assert!(tolerance_match(Some(100.0), Some(115.0), 0.15));
        assert!(!tolerance_match(Some(100.0), Some(130.0), 0.15));
        assert!(!tolerance_match(Some(0.0), Some(3.0), 0.5));
    }

    #[test]
    fn test_non_positive_magnitudes() {
        assert!(tolerance_match(Some(-4.0), Some(-4.0), 0.1));
        assert!(!tolerance_match(Some(-4.0), Some(-5.0), 0.9));
        assert!(!tolerance_match(Some(f64::NAN), Some(f64::NAN), 0.9));
    }

    #[test]
    fn test_symmetry() {
        let values = [None, Some(0.0), Some(1.0), Some(9.0), Some(10.0), Some(100.0), Some(-3.0)];
        for t in [0.05, 0.1, 0.15, 0.3, 0.99] {
            for a in values {
                for b in values {
                    assert_eq!(tolerance_match(a, b, t), tolerance_match(b, a, t));
                    assert_eq!(percent_diff(a, b), percent_diff(b, a));
                }
            }
        }
    }
}
