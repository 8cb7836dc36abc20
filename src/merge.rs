use crate::align::Alignment;
use crate::drift::FallbackPolicy;
use crate::record::{metric, Record, Sequence};
use crate::tolerance::percent_diff;
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const ORPHAN_REASON: &str = "no matching anchor within tolerance";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Encode, Decode)]
#[serde(rename_all = "snake_case")]
pub enum MatchQuality {
    Exact,
    /// Relative difference on the alignment metric.
    Within(f64),
    Unmatched,
}

impl fmt::Display for MatchQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchQuality::Exact => write!(f, "exact"),
            MatchQuality::Within(diff) => write!(f, "{:.1}%", diff * 100.0),
            MatchQuality::Unmatched => write!(f, "-"),
        }
    }
}

/// Two sources disagree on a metric by more than the dispute threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct Dispute {
    pub metric: String,
    pub anchor_value: f64,
    pub companion_value: f64,
    pub diff: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Encode, Decode)]
#[serde(rename_all = "snake_case")]
pub enum ResolvedBy {
    Model,
    Policy(FallbackPolicy),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct Resolution {
    pub metric: String,
    pub chosen: f64,
    pub rejected: f64,
    pub by: ResolvedBy,
}

/// One anchor record with whatever its companion partner contributed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct MergedRecord {
    pub item_id: String,
    pub anchor_position: usize,
    pub companion_position: Option<usize>,
    pub companion_item_id: Option<String>,
    pub metrics: BTreeMap<String, Option<f64>>,
    pub quality: MatchQuality,
    /// Metrics observed by both sources within the dispute threshold.
    pub agreed: Vec<String>,
    /// Open disagreements; emptied by the outlier resolver.
    pub disputes: Vec<Dispute>,
    pub resolutions: Vec<Resolution>,
}

impl MergedRecord {
    pub fn value(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied().flatten()
    }

    pub fn is_matched(&self) -> bool {
        self.companion_position.is_some()
    }

    fn unmatched(anchor: &Record) -> Self {
        Self {
            item_id: anchor.item_id.clone(),
            anchor_position: anchor.position,
            companion_position: None,
            companion_item_id: None,
            metrics: anchor.metrics.clone(),
            quality: MatchQuality::Unmatched,
            agreed: Vec::new(),
            disputes: Vec::new(),
            resolutions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct Orphan {
    pub companion_position: usize,
    pub record: Record,
    pub reason: String,
}

/// Fold the companion into the anchor along `alignment`.
///
/// Every anchor record yields exactly one merged record; every companion
/// record is folded into one merged record or listed once as an orphan.
pub fn merge(
    anchor: &Sequence,
    companion: &Sequence,
    alignment: &Alignment,
    align_metric: &str,
    dispute_threshold: f64,
) -> (Vec<MergedRecord>, Vec<Orphan>) {
    let slots = alignment.mapping.anchor_slots();

    let merged = anchor
        .records
        .iter()
        .zip(slots)
        .map(|(a, slot)| match slot.and_then(|j| companion.records.get(j)) {
            Some(c) => fold_pair(a, c, align_metric, dispute_threshold),
            None => MergedRecord::unmatched(a),
        })
        .collect();

    let orphans = alignment
        .orphans
        .iter()
        .filter_map(|j| companion.records.get(*j))
        .map(|c| Orphan {
            companion_position: c.position,
            record: c.clone(),
            reason: ORPHAN_REASON.to_string(),
        })
        .collect();

    (merged, orphans)
}

fn fold_pair(anchor: &Record, companion: &Record, align_metric: &str, dispute_threshold: f64) -> MergedRecord {
    let mut merged = MergedRecord::unmatched(anchor);
    merged.companion_position = Some(companion.position);
    merged.companion_item_id = Some(companion.item_id.clone());
    merged.quality = match percent_diff(anchor.get(align_metric), companion.get(align_metric)) {
        Some(d) if d > 0.0 => MatchQuality::Within(d),
        // Only identical values match when the ratio is undefined.
        _ => MatchQuality::Exact,
    };

    for (name, companion_value) in &companion.metrics {
        match (anchor.get(name), *companion_value) {
            (None, Some(c)) => {
                merged.metrics.insert(name.clone(), Some(c));
            }
            (None, None) => {
                merged.metrics.entry(name.clone()).or_insert(None);
            }
            (Some(_), None) => {}
            (Some(a), Some(c)) => {
                let diff = percent_diff(Some(a), Some(c));
                let agrees = match diff {
                    Some(d) => d <= dispute_threshold,
                    None => a == c,
                };
                if agrees {
                    merged.agreed.push(name.clone());
                } else {
                    merged.disputes.push(Dispute {
                        metric: name.clone(),
                        anchor_value: a,
                        companion_value: c,
                        diff,
                    });
                }
            }
        }
    }

    merged
}

/// Derived `(likes + comments) / views * 100`, rounded to two decimals.
pub fn engagement(record: &MergedRecord) -> Option<f64> {
    let views = record.value(metric::VIEWS)?;
    let likes = record.value(metric::LIKES)?;
    let comments = record.value(metric::COMMENTS)?;
    if views <= 0.0 {
        return None;
    }
    Some(((likes + comments) / views * 100.0 * 100.0).round() / 100.0)
}

pub fn apply_engagement(merged: &mut [MergedRecord]) {
    for record in merged.iter_mut() {
        if let Some(e) = engagement(record) {
            record.metrics.insert(metric::ENGAGEMENT.to_string(), Some(e));
        }
    }
}
