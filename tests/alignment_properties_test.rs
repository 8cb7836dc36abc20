use feedrecon::record::{Pass, Record, Sequence};
use feedrecon::{align, merge, percent_diff, tolerance_match, Strategy};

/// Small deterministic generator so every run sees the same cases.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    fn below(&mut self, n: u64) -> u64 {
        self.next() % n
    }
}

/// Anchor column plus a companion derived from it by drifting, dropping and
/// inserting values, roughly the way two passes over one feed disagree.
fn case(seed: u64) -> (Vec<Option<f64>>, Vec<Option<f64>>) {
    let mut rng = Lcg(seed);
    let len = 1 + rng.below(30) as usize;
    let anchor: Vec<Option<f64>> = (0..len)
        .map(|_| {
            if rng.below(10) == 0 {
                None
            } else {
                Some((1 + rng.below(5_000)) as f64)
            }
        })
        .collect();

    let mut companion = Vec::new();
    for value in &anchor {
        match rng.below(8) {
            0 => {}
            1 => companion.push(Some((1 + rng.below(5_000)) as f64)),
            _ => companion.push(value.map(|v| (v * (0.9 + rng.below(20) as f64 / 100.0)).round())),
        }
        if rng.below(12) == 0 {
            companion.push(Some((1 + rng.below(5_000)) as f64));
        }
    }
    (anchor, companion)
}

fn sequence(pass: Pass, values: &[Option<f64>]) -> Sequence {
    let records = values
        .iter()
        .enumerate()
        .map(|(i, v)| Record::new(format!("{}{}", pass, i), i).with_metric("likes", *v))
        .collect();
    Sequence::new("acct", pass, records)
}

#[test]
fn test_anchor_completeness_and_orphan_conservation() {
    for seed in 0..200 {
        let (anchor_values, companion_values) = case(seed);
        let anchor = sequence(Pass::Secondary, &anchor_values);
        let companion = sequence(Pass::Primary, &companion_values);
        for strategy in Strategy::ALL {
            for tolerance in [0.1, 0.2, 0.3] {
                let alignment = match align(&anchor_values, &companion_values, tolerance, strategy) {
                    Ok(a) => a,
                    // All-empty anchors are legitimately infeasible.
                    Err(_) => {
                        assert!(anchor_values.iter().all(Option::is_none), "seed {} {}", seed, strategy);
                        continue;
                    }
                };
                assert_eq!(
                    alignment.matches() + alignment.orphans.len(),
                    companion_values.len(),
                    "seed {} {} {}",
                    seed,
                    strategy,
                    tolerance
                );

                let (merged, orphans) = merge(&anchor, &companion, &alignment, "likes", 0.2);
                assert_eq!(merged.len(), anchor_values.len(), "seed {} {}", seed, strategy);
                for (i, m) in merged.iter().enumerate() {
                    assert_eq!(m.anchor_position, i);
                }

                // Each companion index is folded in once or orphaned once.
                let mut seen = vec![0u32; companion_values.len()];
                for m in &merged {
                    if let Some(j) = m.companion_position {
                        seen[j] += 1;
                    }
                }
                for o in &orphans {
                    seen[o.companion_position] += 1;
                }
                assert!(seen.iter().all(|c| *c == 1), "seed {} {} {:?}", seed, strategy, seen);
            }
        }
    }
}

#[test]
fn test_order_preserving_strategies() {
    for seed in 0..200 {
        let (anchor, companion) = case(seed);
        for strategy in Strategy::ALL.into_iter().filter(Strategy::preserves_order) {
            if let Ok(alignment) = align(&anchor, &companion, 0.2, strategy) {
                assert!(alignment.mapping.is_order_preserving(), "seed {} {}", seed, strategy);
            }
        }
    }
}

#[test]
fn test_mapped_pairs_match_within_tolerance() {
    for seed in 0..100 {
        let (anchor, companion) = case(seed);
        for strategy in Strategy::ALL {
            if let Ok(alignment) = align(&anchor, &companion, 0.15, strategy) {
                for (j, i) in alignment.mapping.pairs() {
                    assert!(
                        tolerance_match(anchor[i], companion[j], 0.15),
                        "seed {} {} pair ({}, {})",
                        seed,
                        strategy,
                        i,
                        j
                    );
                }
            }
        }
    }
}

#[test]
fn test_tolerance_symmetry() {
    let mut rng = Lcg(7);
    for _ in 0..1_000 {
        let a = Some(rng.below(10_000) as f64);
        let b = if rng.below(20) == 0 { None } else { Some(rng.below(10_000) as f64) };
        let t = (1 + rng.below(99)) as f64 / 100.0;
        assert_eq!(tolerance_match(a, b, t), tolerance_match(b, a, t));
        assert_eq!(percent_diff(a, b), percent_diff(b, a));
    }
}
