use crate::align::{AlignOptions, Alignment, Strategy};
use crate::ReconcileError;
use bincode::{Decode, Encode};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use tracing::debug;

/// Score summary for one `(strategy, tolerance)` attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct RankedResult {
    pub strategy: Strategy,
    pub tolerance: f64,
    pub matches: usize,
    pub orphans: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct Infeasible {
    pub strategy: Strategy,
    pub tolerance: f64,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct Selection {
    pub best: Alignment,
    /// Every feasible attempt, best first.
    pub ranked: Vec<RankedResult>,
    pub infeasible: Vec<Infeasible>,
}

/// Runs every configured strategy at every configured tolerance and keeps the
/// result with the most matches (fewest orphans on ties).
#[derive(Debug, Clone)]
pub struct StrategySelector {
    strategies: Vec<Strategy>,
    tolerances: Vec<f64>,
    options: AlignOptions,
}

impl StrategySelector {
    pub fn new(strategies: Vec<Strategy>, tolerances: Vec<f64>, options: AlignOptions) -> Self {
        Self {
            strategies,
            tolerances,
            options,
        }
    }

    pub fn select(
        &self,
        anchor: &[Option<f64>],
        companion: &[Option<f64>],
    ) -> Result<Selection, ReconcileError> {
        if self.strategies.is_empty() || self.tolerances.is_empty() {
            return Err(ReconcileError::Config(
                "selector needs at least one strategy and one tolerance".to_string(),
            ));
        }

        let mut attempts: Vec<(usize, Alignment)> = Vec::new();
        let mut infeasible = Vec::new();

        for ((order, strategy), tolerance) in self
            .strategies
            .iter()
            .enumerate()
            .cartesian_product(self.tolerances.iter())
        {
            match strategy.align(anchor, companion, *tolerance, &self.options) {
                Ok(alignment) => {
                    debug!(
                        strategy = %strategy,
                        tolerance = *tolerance,
                        matches = alignment.matches(),
                        orphans = alignment.orphans.len(),
                        "alignment attempt"
                    );
                    attempts.push((order, alignment));
                }
                Err(ReconcileError::AlignmentInfeasible(reason)) => {
                    debug!(strategy = %strategy, tolerance = *tolerance, %reason, "alignment infeasible");
                    infeasible.push(Infeasible {
                        strategy: *strategy,
                        tolerance: *tolerance,
                        reason,
                    });
                }
                Err(e) => return Err(e),
            }
        }

        // Ties: tighter tolerance, then configuration order.
        attempts.sort_by(|(oa, a), (ob, b)| {
            (Reverse(a.matches()), a.orphans.len())
                .cmp(&(Reverse(b.matches()), b.orphans.len()))
                .then(a.tolerance.total_cmp(&b.tolerance))
                .then(oa.cmp(ob))
        });

        let ranked = attempts
            .iter()
            .map(|(_, a)| RankedResult {
                strategy: a.strategy,
                tolerance: a.tolerance,
                matches: a.matches(),
                orphans: a.orphans.len(),
            })
            .collect_vec();

        let best = match attempts.into_iter().next() {
            Some((_, best)) => best,
            None => {
                let reasons = infeasible.iter().map(|i| i.reason.as_str()).unique().join("; ");
                return Err(ReconcileError::AlignmentInfeasible(reasons));
            }
        };

        Ok(Selection {
            best,
            ranked,
            infeasible,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(values: &[f64]) -> Vec<Option<f64>> {
        values.iter().map(|v| Some(*v)).collect()
    }

    fn selector() -> StrategySelector {
        StrategySelector::new(
            Strategy::ALL.to_vec(),
            vec![0.10, 0.15, 0.20, 0.25, 0.30],
            AlignOptions::default(),
        )
    }

    #[test]
    fn test_ranked_list_covers_every_attempt() {
        let a = col(&[10.0, 20.0, 30.0]);
        let selection = selector().select(&a, &a).unwrap();
        assert_eq!(selection.ranked.len(), 25);
        assert!(selection.infeasible.is_empty());
        assert_eq!(selection.best.matches(), 3);
        assert_eq!(selection.best.tolerance, 0.10);
        assert_eq!(selection.best.strategy, Strategy::GlobalDp);
    }

    #[test]
    fn test_wider_tolerance_wins_only_with_more_matches() {
        let anchor = col(&[100.0, 1000.0]);
        let companion = col(&[120.0, 1000.0]);
        let selection = selector().select(&anchor, &companion).unwrap();
        assert_eq!(selection.best.matches(), 2);
        assert_eq!(selection.best.tolerance, 0.20);
    }

    #[test]
    fn test_infeasible_strategies_are_reported_not_fatal() {
        let a = col(&[1.0, 2.0, 4.0]);
        let s = StrategySelector::new(
            vec![Strategy::GlobalDp, Strategy::GreedyBestPair],
            vec![0.1],
            AlignOptions {
                window: 3,
                max_dp_cells: 4,
                max_candidates: 100,
            },
        );
        let selection = s.select(&a, &a).unwrap();
        assert_eq!(selection.best.strategy, Strategy::GreedyBestPair);
        assert_eq!(selection.infeasible.len(), 1);
        assert_eq!(selection.infeasible[0].strategy, Strategy::GlobalDp);
    }

    #[test]
    fn test_all_infeasible_is_an_error() {
        let anchor = vec![None, None];
        let companion = col(&[3.0]);
        assert!(matches!(
            selector().select(&anchor, &companion),
            Err(ReconcileError::AlignmentInfeasible(_))
        ));
    }
}
