pub mod align;
mod align_anchor_first;
mod align_global;
mod align_greedy;
mod align_local;
mod align_sequential;
pub mod anomaly;
pub mod config;
pub mod drift;
pub mod error;
pub mod extractor;
pub mod merge;
pub mod reconcile;
pub mod record;
pub mod report;
pub mod run_state;
pub mod selector;
pub mod session;
pub mod snapshot;
pub mod store;
pub mod tolerance;

pub use align::{align, align_sequences, AlignOptions, Alignment, Mapping, Strategy};
pub use config::{ReconcileConfig, RetryPolicy};
pub use drift::{DriftModel, FallbackPolicy, OutlierResolver};
pub use error::*;
pub use extractor::{ExtractionFailure, Extractor, ReplayExtractor, SessionContext};
pub use merge::{merge, MergedRecord, Orphan};
pub use reconcile::{AccountResult, Reconciler};
pub use record::{parse_count, Pass, Record, Sequence};
pub use selector::StrategySelector;
pub use session::{InterruptFlag, RunOutcome, RunReport, Session};
pub use snapshot::Snapshot;
pub use store::Store;
pub use tolerance::{percent_diff, tolerance_match};

/// Install the fmt subscriber. `RUST_LOG` overrides the default `info` level.
pub fn init_tracing(service: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
    tracing::debug!(service, "tracing initialised");
}
