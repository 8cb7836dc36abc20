use crate::merge::MergedRecord;
use crate::record::metric;
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// Plausibility limits for likes against views.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyThresholds {
    pub min_likes: f64,
    pub min_views_for_ratio_check: f64,
    pub min_likes_ratio: f64,
    pub likes_views_same_threshold: f64,
}

impl Default for AnomalyThresholds {
    fn default() -> Self {
        Self {
            min_likes: 10.0,
            min_views_for_ratio_check: 1_000.0,
            min_likes_ratio: 0.001,
            likes_views_same_threshold: 0.05,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct Anomaly {
    pub item_id: String,
    pub views: f64,
    pub likes: f64,
    pub reasons: Vec<String>,
}

/// Flag merged records whose likes are implausible given their views.
/// Nothing is changed; the caller decides what to do with the list.
pub fn scan(merged: &[MergedRecord], thresholds: &AnomalyThresholds) -> Vec<Anomaly> {
    merged
        .iter()
        .filter_map(|record| {
            let views = record.value(metric::VIEWS)?;
            let likes = record.value(metric::LIKES)?;
            let reasons = check(views, likes, thresholds);
            if reasons.is_empty() {
                None
            } else {
                Some(Anomaly {
                    item_id: record.item_id.clone(),
                    views,
                    likes,
                    reasons,
                })
            }
        })
        .collect()
}

fn check(views: f64, likes: f64, t: &AnomalyThresholds) -> Vec<String> {
    let mut reasons = Vec::new();

    if likes > views {
        reasons.push(format!("likes ({}) > views ({})", likes, views));
    }
    if views > 0.0 && (likes - views).abs() / views < t.likes_views_same_threshold {
        reasons.push(format!("likes ({}) ~ views ({})", likes, views));
    }
    if views >= t.min_views_for_ratio_check {
        if likes < t.min_likes {
            reasons.push(format!("likes ({}) < {} for {} views", likes, t.min_likes, views));
        }
        if likes / views < t.min_likes_ratio {
            reasons.push(format!("likes ratio too low ({:.3}%)", likes / views * 100.0));
        }
    }

    reasons
}
