use crate::merge::{MergedRecord, Resolution, ResolvedBy};
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Predicted log values are clamped to this magnitude before exponentiation.
const MAX_LN: f64 = 700.0;
const MIN_FIT_PAIRS: usize = 3;

/// What to do with a disputed value when no model can decide.
///
/// The default prefers the higher reading: for engagement counters an
/// undercount (a partially rendered overlay) is more common than an overcount.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Encode, Decode, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    #[default]
    PreferHigher,
    PreferLower,
    PreferAnchor,
    PreferCompanion,
}

impl FallbackPolicy {
    pub fn pick(&self, anchor: f64, companion: f64) -> f64 {
        match self {
            FallbackPolicy::PreferHigher => anchor.max(companion),
            FallbackPolicy::PreferLower => anchor.min(companion),
            FallbackPolicy::PreferAnchor => anchor,
            FallbackPolicy::PreferCompanion => companion,
        }
    }
}

/// OLS fit of `ln(target) = slope * ln(driver) + intercept`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct DriftModel {
    pub slope: f64,
    pub intercept: f64,
    pub samples: usize,
}

impl DriftModel {
    /// Fit from `(driver, target)` pairs. Pairs with a non-positive side are
    /// skipped; fewer than three usable pairs, or no spread in the driver,
    /// yields no model.
    pub fn fit(pairs: &[(f64, f64)]) -> Option<Self> {
        let logs: Vec<(f64, f64)> = pairs
            .iter()
            .filter(|(x, y)| x.is_finite() && y.is_finite() && *x > 0.0 && *y > 0.0)
            .map(|(x, y)| (x.ln(), y.ln()))
            .collect();

        if logs.len() < MIN_FIT_PAIRS {
            return None;
        }

        let n = logs.len() as f64;
        let mean_x = logs.iter().map(|(x, _)| x).sum::<f64>() / n;
        let mean_y = logs.iter().map(|(_, y)| y).sum::<f64>() / n;

        let mut sxx = 0.0;
        let mut sxy = 0.0;
        for (x, y) in &logs {
            sxx += (x - mean_x) * (x - mean_x);
            sxy += (x - mean_x) * (y - mean_y);
        }
        if sxx <= f64::EPSILON {
            return None;
        }

        let slope = sxy / sxx;
        Some(Self {
            slope,
            intercept: mean_y - slope * mean_x,
            samples: logs.len(),
        })
    }

    /// Predicted `ln(target)`, clamped.
    pub fn predict_ln(&self, driver: f64) -> Option<f64> {
        if !driver.is_finite() || driver <= 0.0 {
            return None;
        }
        let ln = self.slope * driver.ln() + self.intercept;
        if ln.is_nan() {
            return None;
        }
        Some(ln.clamp(-MAX_LN, MAX_LN))
    }

    pub fn predict(&self, driver: f64) -> Option<f64> {
        self.predict_ln(driver).map(f64::exp)
    }

    /// Candidate closer to the prediction in log space. `None` if the model
    /// cannot distinguish them.
    pub fn choose(&self, driver: f64, a: f64, b: f64) -> Option<f64> {
        if a <= 0.0 || b <= 0.0 {
            return None;
        }
        let predicted = self.predict_ln(driver)?;
        let da = (a.ln() - predicted).abs();
        let db = (b.ln() - predicted).abs();
        if da < db {
            Some(a)
        } else if db < da {
            Some(b)
        } else {
            None
        }
    }
}

/// Pick between two disputed readings.
pub fn resolve_value(
    model: Option<&DriftModel>,
    driver: Option<f64>,
    anchor: f64,
    companion: f64,
    policy: FallbackPolicy,
) -> (f64, ResolvedBy) {
    if let (Some(model), Some(driver)) = (model, driver) {
        if let Some(chosen) = model.choose(driver, anchor, companion) {
            return (chosen, ResolvedBy::Model);
        }
    }
    (policy.pick(anchor, companion), ResolvedBy::Policy(policy))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct ResolveSummary {
    pub models: BTreeMap<String, DriftModel>,
    pub by_model: usize,
    pub by_policy: usize,
}

/// Fits one drift model per target metric and settles every open dispute.
#[derive(Debug, Clone)]
pub struct OutlierResolver {
    driver_metric: String,
    policy: FallbackPolicy,
}

impl OutlierResolver {
    pub fn new(driver_metric: impl Into<String>, policy: FallbackPolicy) -> Self {
        Self {
            driver_metric: driver_metric.into(),
            policy,
        }
    }

    /// Models keyed by target metric, fitted only from metrics both sources agreed on.
    pub fn fit_models(&self, merged: &[MergedRecord]) -> BTreeMap<String, DriftModel> {
        let mut pairs: BTreeMap<&str, Vec<(f64, f64)>> = BTreeMap::new();
        for record in merged {
            let Some(driver) = record.value(&self.driver_metric) else {
                continue;
            };
            for metric in &record.agreed {
                if *metric == self.driver_metric {
                    continue;
                }
                if let Some(target) = record.value(metric) {
                    pairs.entry(metric.as_str()).or_default().push((driver, target));
                }
            }
        }

        pairs
            .into_iter()
            .filter_map(|(metric, pairs)| {
                let model = DriftModel::fit(&pairs);
                if model.is_none() {
                    debug!(metric, pairs = pairs.len(), "drift model unfittable");
                }
                model.map(|m| (metric.to_string(), m))
            })
            .collect()
    }

    pub fn resolve(&self, merged: &mut [MergedRecord]) -> ResolveSummary {
        let models = self.fit_models(merged);
        let mut summary = ResolveSummary::default();

        for record in merged.iter_mut() {
            if record.disputes.is_empty() {
                continue;
            }
            // Settle the driver first so targets are predicted from a settled value.
            let mut disputes = std::mem::take(&mut record.disputes);
            disputes.sort_by_key(|d| d.metric != self.driver_metric);

            for dispute in disputes {
                let driver = if dispute.metric == self.driver_metric {
                    None
                } else {
                    record.value(&self.driver_metric)
                };
                let (chosen, by) = resolve_value(
                    models.get(&dispute.metric),
                    driver,
                    dispute.anchor_value,
                    dispute.companion_value,
                    self.policy,
                );
                match by {
                    ResolvedBy::Model => summary.by_model += 1,
                    ResolvedBy::Policy(_) => summary.by_policy += 1,
                }
                let rejected = if chosen == dispute.anchor_value {
                    dispute.companion_value
                } else {
                    dispute.anchor_value
                };
                record.metrics.insert(dispute.metric.clone(), Some(chosen));
                record.resolutions.push(Resolution {
                    metric: dispute.metric,
                    chosen,
                    rejected,
                    by,
                });
            }
        }

        summary.models = models;
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fit_recovers_power_law() {
        // target = 0.05 * driver
        let pairs: Vec<(f64, f64)> = [100.0, 1_000.0, 10_000.0, 50_000.0]
            .iter()
            .map(|x| (*x, 0.05 * x))
            .collect();
        let model = DriftModel::fit(&pairs).unwrap();
        assert!((model.slope - 1.0).abs() < 1e-9);
        assert!((model.intercept - 0.05f64.ln()).abs() < 1e-9);
        assert_eq!(model.samples, 4);
    }

    #[test]
    fn test_fit_needs_three_positive_pairs() {
        assert!(DriftModel::fit(&[(10.0, 1.0), (20.0, 2.0)]).is_none());
        assert!(DriftModel::fit(&[(10.0, 1.0), (20.0, 2.0), (0.0, 3.0), (30.0, -1.0)]).is_none());
        assert!(DriftModel::fit(&[(10.0, 1.0), (10.0, 2.0), (10.0, 3.0)]).is_none());
    }

    #[test]
    fn test_outlier_resolution_picks_closer_candidate() {
        let model = DriftModel::fit(&[(1000.0, 50.0), (2000.0, 95.0), (4000.0, 210.0)]).unwrap();
        let (chosen, by) = resolve_value(Some(&model), Some(3000.0), 140.0, 400.0, FallbackPolicy::PreferHigher);
        assert_eq!(chosen, 140.0);
        assert_eq!(by, ResolvedBy::Model);
    }

    #[test]
    fn test_fallback_policy_without_model_or_driver() {
        let (chosen, by) = resolve_value(None, Some(3000.0), 140.0, 400.0, FallbackPolicy::PreferHigher);
        assert_eq!(chosen, 400.0);
        assert_eq!(by, ResolvedBy::Policy(FallbackPolicy::PreferHigher));

        let model = DriftModel::fit(&[(1000.0, 50.0), (2000.0, 95.0), (4000.0, 210.0)]).unwrap();
        let (chosen, _) = resolve_value(Some(&model), None, 140.0, 400.0, FallbackPolicy::PreferLower);
        assert_eq!(chosen, 140.0);

        let (chosen, _) = resolve_value(None, None, 140.0, 400.0, FallbackPolicy::PreferCompanion);
        assert_eq!(chosen, 400.0);
    }

    #[test]
    fn test_extreme_prediction_is_clamped() {
        let model = DriftModel {
            slope: 1e6,
            intercept: 0.0,
            samples: 3,
        };
        let predicted = model.predict(1e9).unwrap();
        assert!(predicted.is_finite());
        assert_eq!(model.choose(1e9, 10.0, 1e300), Some(1e300));
    }
}
