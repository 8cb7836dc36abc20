use crate::align::{AlignOptions, Strategy};
use crate::anomaly::AnomalyThresholds;
use crate::drift::FallbackPolicy;
use crate::record::{metric, Pass};
use crate::ReconcileError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Consecutive-failure handling for extractor calls.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Consecutive rate-limit/unavailable failures before switching context.
    pub failure_threshold: u32,
    pub backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Attempts per pass before the account is given up on.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            backoff_ms: 2_000,
            max_backoff_ms: 60_000,
            max_attempts: 20,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff for the given consecutive-failure count.
    pub fn backoff(&self, consecutive_failures: u32) -> Duration {
        let shift = consecutive_failures.saturating_sub(1).min(16);
        let ms = self.backoff_ms.saturating_mul(1u64 << shift).min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Everything a run needs besides the account list and the extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub tolerances: Vec<f64>,
    pub strategies: Vec<Strategy>,
    pub align: AlignOptions,
    /// Metric the alignment engine matches on.
    pub align_metric: String,
    /// Metric the drift model predicts from.
    pub driver_metric: String,
    pub dispute_threshold: f64,
    pub fallback_policy: FallbackPolicy,
    /// Pass whose records must all appear in the output.
    pub anchor_pass: Pass,
    pub retry: RetryPolicy,
    pub anomalies: AnomalyThresholds,
    /// Items each account is expected to yield; short accounts are noted.
    pub expected_items: Option<usize>,
    pub state_dir: PathBuf,
    pub store_dir: PathBuf,
    /// Alternate location for snapshot and store writes when the primary fails.
    pub fallback_dir: PathBuf,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            tolerances: vec![0.10, 0.15, 0.20, 0.25, 0.30],
            strategies: Strategy::ALL.to_vec(),
            align: AlignOptions::default(),
            align_metric: metric::LIKES.to_string(),
            driver_metric: metric::VIEWS.to_string(),
            dispute_threshold: 0.20,
            fallback_policy: FallbackPolicy::PreferHigher,
            anchor_pass: Pass::Secondary,
            retry: RetryPolicy::default(),
            anomalies: AnomalyThresholds::default(),
            expected_items: None,
            state_dir: PathBuf::from("./feedrecon_state"),
            store_dir: PathBuf::from("./feedrecon_state/store"),
            fallback_dir: std::env::temp_dir().join("feedrecon_fallback"),
        }
    }
}

impl ReconcileConfig {
    /// Configuration rooted at `base_dir` (used by tests and `--state-dir`).
    pub fn with_base_dir(base_dir: &Path) -> Self {
        Self {
            state_dir: base_dir.to_path_buf(),
            store_dir: base_dir.join("store"),
            fallback_dir: base_dir.join("fallback"),
            ..Self::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self, ReconcileError> {
        let text = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ReconcileError> {
        if self.tolerances.is_empty() {
            return Err(ReconcileError::Config("no tolerances configured".to_string()));
        }
        if let Some(t) = self
            .tolerances
            .iter()
            .find(|t| !(t.is_finite() && **t > 0.0 && **t < 1.0))
        {
            return Err(ReconcileError::Config(format!("tolerance {} outside (0, 1)", t)));
        }
        if self.strategies.is_empty() {
            return Err(ReconcileError::Config("no strategies configured".to_string()));
        }
        if self.align_metric.trim().is_empty() || self.driver_metric.trim().is_empty() {
            return Err(ReconcileError::Config(
                "alignment and driver metric names must be non-empty".to_string(),
            ));
        }
        if !(self.dispute_threshold.is_finite() && self.dispute_threshold >= 0.0) {
            return Err(ReconcileError::Config(format!(
                "dispute threshold {} must be a non-negative fraction",
                self.dispute_threshold
            )));
        }
        if self.retry.failure_threshold == 0 || self.retry.max_attempts == 0 {
            return Err(ReconcileError::Config(
                "retry threshold and max attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
