use crate::align::Strategy;
use crate::anomaly::{self, Anomaly};
use crate::config::ReconcileConfig;
use crate::drift::{OutlierResolver, ResolveSummary};
use crate::merge::{self, MergedRecord, Orphan};
use crate::record::{Pass, Sequence};
use crate::selector::{Infeasible, RankedResult, StrategySelector};
use crate::ReconcileError;
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Fully reconciled output for one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct AccountResult {
    pub account: String,
    /// RFC 3339 time the reconciliation finished.
    pub reconciled_at: String,
    pub anchor_pass: Pass,
    pub followers: Option<f64>,
    pub merged: Vec<MergedRecord>,
    pub orphans: Vec<Orphan>,
    pub strategy: Strategy,
    pub tolerance: f64,
    pub ranked: Vec<RankedResult>,
    pub infeasible: Vec<Infeasible>,
    pub resolution: ResolveSummary,
    pub anomalies: Vec<Anomaly>,
}

impl AccountResult {
    pub fn matched(&self) -> usize {
        self.merged.iter().filter(|m| m.is_matched()).count()
    }
}

/// Runs selector, merge, outlier resolution and the anomaly scan for one account.
pub struct Reconciler<'a> {
    config: &'a ReconcileConfig,
    selector: StrategySelector,
    resolver: OutlierResolver,
}

impl<'a> Reconciler<'a> {
    pub fn new(config: &'a ReconcileConfig) -> Self {
        Self {
            config,
            selector: StrategySelector::new(
                config.strategies.clone(),
                config.tolerances.clone(),
                config.align,
            ),
            resolver: OutlierResolver::new(config.driver_metric.clone(), config.fallback_policy),
        }
    }

    /// Reconcile the two passes of one account; which one anchors comes from config.
    pub fn reconcile(&self, primary: &Sequence, secondary: &Sequence) -> Result<AccountResult, ReconcileError> {
        let (anchor, companion) = match self.config.anchor_pass {
            Pass::Primary => (primary, secondary),
            Pass::Secondary => (secondary, primary),
        };
        self.reconcile_anchored(anchor, companion)
    }

    pub fn reconcile_anchored(&self, anchor: &Sequence, companion: &Sequence) -> Result<AccountResult, ReconcileError> {
        let metric = &self.config.align_metric;
        let selection = self.selector.select(&anchor.values(metric), &companion.values(metric))?;

        let (mut merged, orphans) = merge::merge(
            anchor,
            companion,
            &selection.best,
            metric,
            self.config.dispute_threshold,
        );
        let resolution = self.resolver.resolve(&mut merged);
        merge::apply_engagement(&mut merged);
        let anomalies = anomaly::scan(&merged, &self.config.anomalies);

        info!(
            account = %anchor.account,
            strategy = %selection.best.strategy,
            tolerance = selection.best.tolerance,
            matched = selection.best.matches(),
            orphans = orphans.len(),
            resolved_by_model = resolution.by_model,
            resolved_by_policy = resolution.by_policy,
            anomalies = anomalies.len(),
            "account reconciled"
        );

        Ok(AccountResult {
            account: anchor.account.clone(),
            reconciled_at: chrono::Utc::now().to_rfc3339(),
            anchor_pass: anchor.pass,
            followers: anchor.followers.or(companion.followers),
            merged,
            orphans,
            strategy: selection.best.strategy,
            tolerance: selection.best.tolerance,
            ranked: selection.ranked,
            infeasible: selection.infeasible,
            resolution,
            anomalies,
        })
    }
}
