use crate::record::Sequence;
use crate::tolerance::tolerance_match;
use crate::{align_anchor_first, align_global, align_greedy, align_local, align_sequential};
use crate::ReconcileError;
use bincode::{Decode, Encode};
use fixedbitset::FixedBitSet;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Alignment strategies. Each variant has its own module with a uniform
/// `align(anchor, companion, tolerance, ..) -> Result<Mapping, _>` entry point.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    GlobalDp,
    LocalDp,
    GreedyBestPair,
    SequentialSkip,
    AnchorFirstDp,
}

impl Strategy {
    pub const ALL: [Strategy; 5] = [
        Strategy::GlobalDp,
        Strategy::AnchorFirstDp,
        Strategy::LocalDp,
        Strategy::SequentialSkip,
        Strategy::GreedyBestPair,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Strategy::GlobalDp => "global_dp",
            Strategy::LocalDp => "local_dp",
            Strategy::GreedyBestPair => "greedy_best_pair",
            Strategy::SequentialSkip => "sequential_skip",
            Strategy::AnchorFirstDp => "anchor_first_dp",
        }
    }

    pub fn preserves_order(&self) -> bool {
        !matches!(self, Strategy::GreedyBestPair)
    }

    /// Run this strategy over two value columns.
    pub fn align(
        &self,
        anchor: &[Option<f64>],
        companion: &[Option<f64>],
        tolerance: f64,
        options: &AlignOptions,
    ) -> Result<Alignment, ReconcileError> {
        check_tolerance(tolerance)?;
        check_density(anchor, companion)?;

        let mapping = match self {
            Strategy::GlobalDp => {
                align_global::align(anchor, companion, tolerance, options.max_dp_cells)?
            }
            Strategy::LocalDp => {
                align_local::align(anchor, companion, tolerance, options.max_dp_cells)?
            }
            Strategy::GreedyBestPair => {
                align_greedy::align(anchor, companion, tolerance, options.max_candidates)?
            }
            Strategy::SequentialSkip => {
                align_sequential::align(anchor, companion, tolerance, options.window)
            }
            Strategy::AnchorFirstDp => {
                align_anchor_first::align(anchor, companion, tolerance, options.max_dp_cells)?
            }
        };

        Ok(Alignment::new(*self, tolerance, mapping))
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Limits shared by all strategies.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignOptions {
    /// Lookahead/lookback distance for the sequential strategy.
    pub window: usize,
    /// Largest DP grid (cells) a dynamic-programming strategy will allocate.
    pub max_dp_cells: usize,
    /// Most tolerance-matching pairs the greedy strategy will hold at once.
    pub max_candidates: usize,
}

impl Default for AlignOptions {
    fn default() -> Self {
        Self {
            window: 5,
            max_dp_cells: 25_000_000,
            max_candidates: 4_000_000,
        }
    }
}

/// Partial injective map from companion indices to anchor indices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct Mapping {
    anchor_len: usize,
    companion_to_anchor: Vec<Option<usize>>,
}

impl Mapping {
    pub fn empty(anchor_len: usize, companion_len: usize) -> Self {
        Self {
            anchor_len,
            companion_to_anchor: vec![None; companion_len],
        }
    }

    /// Build from one slot per anchor record holding its companion partner.
    pub fn from_anchor_slots(slots: &[Option<usize>], companion_len: usize) -> Self {
        let mut mapping = Self::empty(slots.len(), companion_len);
        for (anchor, slot) in slots.iter().enumerate() {
            if let Some(companion) = slot {
                mapping.link(*companion, anchor);
            }
        }
        mapping
    }

    pub fn link(&mut self, companion: usize, anchor: usize) {
        debug_assert!(anchor < self.anchor_len);
        debug_assert!(self.companion_to_anchor[companion].is_none());
        self.companion_to_anchor[companion] = Some(anchor);
    }

    pub fn anchor_for(&self, companion: usize) -> Option<usize> {
        self.companion_to_anchor.get(companion).copied().flatten()
    }

    /// Companion partner of each anchor record, in anchor order.
    pub fn anchor_slots(&self) -> Vec<Option<usize>> {
        let mut slots = vec![None; self.anchor_len];
        for (companion, anchor) in self.pairs() {
            slots[anchor] = Some(companion);
        }
        slots
    }

    /// `(companion, anchor)` pairs in companion order.
    pub fn pairs(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.companion_to_anchor
            .iter()
            .enumerate()
            .filter_map(|(c, a)| a.map(|a| (c, a)))
    }

    /// Number of mapped companion records.
    pub fn len(&self) -> usize {
        self.companion_to_anchor.iter().filter(|a| a.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn anchor_len(&self) -> usize {
        self.anchor_len
    }

    pub fn companion_len(&self) -> usize {
        self.companion_to_anchor.len()
    }

    pub fn unmapped_companions(&self) -> Vec<usize> {
        self.companion_to_anchor
            .iter()
            .enumerate()
            .filter(|(_, a)| a.is_none())
            .map(|(c, _)| c)
            .collect()
    }

    /// True if mapped anchor indices strictly increase with companion index.
    pub fn is_order_preserving(&self) -> bool {
        let mut last: Option<usize> = None;
        for (_, anchor) in self.pairs() {
            if let Some(prev) = last {
                if anchor <= prev {
                    return false;
                }
            }
            last = Some(anchor);
        }
        true
    }
}

/// Outcome of one `(strategy, tolerance)` run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct Alignment {
    pub strategy: Strategy,
    pub tolerance: f64,
    pub mapping: Mapping,
    /// Companion indices left without an anchor partner.
    pub orphans: Vec<usize>,
}

impl Alignment {
    pub fn new(strategy: Strategy, tolerance: f64, mapping: Mapping) -> Self {
        let orphans = mapping.unmapped_companions();
        Self {
            strategy,
            tolerance,
            mapping,
            orphans,
        }
    }

    pub fn matches(&self) -> usize {
        self.mapping.len()
    }
}

/// Align two value columns with default limits.
pub fn align(
    anchor: &[Option<f64>],
    companion: &[Option<f64>],
    tolerance: f64,
    strategy: Strategy,
) -> Result<Alignment, ReconcileError> {
    strategy.align(anchor, companion, tolerance, &AlignOptions::default())
}

/// Align two sequences on the values of `metric`.
pub fn align_sequences(
    anchor: &Sequence,
    companion: &Sequence,
    metric: &str,
    tolerance: f64,
    strategy: Strategy,
    options: &AlignOptions,
) -> Result<Alignment, ReconcileError> {
    strategy.align(
        &anchor.values(metric),
        &companion.values(metric),
        tolerance,
        options,
    )
}

fn check_tolerance(tolerance: f64) -> Result<(), ReconcileError> {
    if tolerance.is_finite() && tolerance > 0.0 && tolerance < 1.0 {
        Ok(())
    } else {
        Err(ReconcileError::Config(format!(
            "tolerance must be in (0, 1), got {}",
            tolerance
        )))
    }
}

fn check_density(anchor: &[Option<f64>], companion: &[Option<f64>]) -> Result<(), ReconcileError> {
    if !anchor.is_empty() && !companion.is_empty() && anchor.iter().all(|v| v.is_none()) {
        return Err(ReconcileError::AlignmentInfeasible(format!(
            "anchor carries no values to align on ({} records)",
            anchor.len()
        )));
    }
    Ok(())
}

/// Reject grids a DP strategy should not allocate.
pub(crate) fn check_grid(
    anchor_len: usize,
    companion_len: usize,
    max_cells: usize,
) -> Result<(), ReconcileError> {
    let cells = (anchor_len + 1).saturating_mul(companion_len + 1);
    if cells > max_cells {
        return Err(ReconcileError::AlignmentInfeasible(format!(
            "{}x{} grid ({} cells) exceeds limit of {}",
            anchor_len, companion_len, cells, max_cells
        )));
    }
    Ok(())
}

/// Precomputed tolerance matches, row-major over `anchor x companion`.
pub(crate) struct MatchGrid {
    bits: FixedBitSet,
    companion_len: usize,
}

impl MatchGrid {
    pub(crate) fn new(anchor: &[Option<f64>], companion: &[Option<f64>], tolerance: f64) -> Self {
        let mut bits = FixedBitSet::with_capacity(anchor.len() * companion.len());
        for (i, a) in anchor.iter().enumerate() {
            for (j, c) in companion.iter().enumerate() {
                if tolerance_match(*a, *c, tolerance) {
                    bits.insert(i * companion.len() + j);
                }
            }
        }
        Self {
            bits,
            companion_len: companion.len(),
        }
    }

    pub(crate) fn is_match(&self, anchor: usize, companion: usize) -> bool {
        self.bits.contains(anchor * self.companion_len + companion)
    }
}
