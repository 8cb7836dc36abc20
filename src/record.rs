use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Well-known metric names. Any other name is carried through untouched.
pub mod metric {
    pub const VIEWS: &str = "views";
    pub const LIKES: &str = "likes";
    pub const COMMENTS: &str = "comments";
    /// Publish date as seconds since the Unix epoch.
    pub const DATE: &str = "date";
    pub const ENGAGEMENT: &str = "engagement";
}

/// Which extraction pass produced a sequence.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum Pass {
    Primary,
    Secondary,
}

impl Pass {
    pub fn other(self) -> Pass {
        match self {
            Pass::Primary => Pass::Secondary,
            Pass::Secondary => Pass::Primary,
        }
    }
}

impl fmt::Display for Pass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pass::Primary => write!(f, "primary"),
            Pass::Secondary => write!(f, "secondary"),
        }
    }
}

/// One item's observation in one pass. A metric mapped to `None` was looked
/// for but not observed, which is different from an observed zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct Record {
    pub item_id: String,
    pub position: usize,
    pub metrics: BTreeMap<String, Option<f64>>,
}

impl Record {
    pub fn new(item_id: impl Into<String>, position: usize) -> Self {
        Self {
            item_id: item_id.into(),
            position,
            metrics: BTreeMap::new(),
        }
    }

    pub fn with_metric(mut self, name: &str, value: Option<f64>) -> Self {
        self.metrics.insert(name.to_string(), value);
        self
    }

    /// Observed value of `name`, or `None` if missing or unobserved.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied().flatten()
    }

    pub fn observed(&self) -> impl Iterator<Item = (&str, f64)> {
        self.metrics
            .iter()
            .filter_map(|(k, v)| v.map(|v| (k.as_str(), v)))
    }
}

/// Ordered output of one extraction pass over one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct Sequence {
    pub account: String,
    pub pass: Pass,
    /// RFC 3339 capture time.
    pub captured_at: String,
    /// Account-level aggregate reported alongside the pass (follower count).
    pub followers: Option<f64>,
    pub records: Vec<Record>,
}

impl Sequence {
    /// Build a sequence, renumbering positions so they match list order.
    pub fn new(account: impl Into<String>, pass: Pass, records: Vec<Record>) -> Self {
        let records = records
            .into_iter()
            .enumerate()
            .map(|(i, mut r)| {
                r.position = i;
                r
            })
            .collect();
        Self {
            account: account.into(),
            pass,
            captured_at: chrono::Utc::now().to_rfc3339(),
            followers: None,
            records,
        }
    }

    pub fn with_followers(mut self, followers: Option<f64>) -> Self {
        self.followers = followers;
        self
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Column of `metric` values in sequence order.
    pub fn values(&self, metric: &str) -> Vec<Option<f64>> {
        self.records.iter().map(|r| r.get(metric)).collect()
    }
}

/// Parse a feed-rendered count such as `"1,204"`, `"12.5K"` or `"3M"`.
pub fn parse_count(text: &str) -> Option<f64> {
    let cleaned: String = text
        .trim()
        .chars()
        .filter(|c| *c != ',' && !c.is_whitespace())
        .collect::<String>()
        .to_uppercase();
    if cleaned.is_empty() {
        return None;
    }

    let (number, multiplier) = match cleaned.chars().last() {
        Some('K') => (&cleaned[..cleaned.len() - 1], 1_000.0),
        Some('M') => (&cleaned[..cleaned.len() - 1], 1_000_000.0),
        Some('B') => (&cleaned[..cleaned.len() - 1], 1_000_000_000.0),
        _ => (cleaned.as_str(), 1.0),
    };

    let value: f64 = number.parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some((value * multiplier).trunc())
}
