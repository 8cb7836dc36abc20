use crate::config::ReconcileConfig;
use crate::extractor::{ExtractionFailure, Extractor};
use crate::reconcile::{AccountResult, Reconciler};
use crate::record::{Pass, Sequence};
use crate::run_state::{disambiguate, EarlyTermination, FailureKind, RunState};
use crate::snapshot::{write_with_fallback, Snapshot, SnapshotFiles, SnapshotWriter};
use crate::store::Store;
use crate::ReconcileError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Where the state machine currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Idle,
    PrimaryPass,
    SecondaryPass,
    Reconcile,
    Persist,
    Done,
    Interrupted,
}

impl Stage {
    fn for_pass(pass: Pass) -> Stage {
        match pass {
            Pass::Primary => Stage::PrimaryPass,
            Pass::Secondary => Stage::SecondaryPass,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Idle => "idle",
            Stage::PrimaryPass => "primary_pass",
            Stage::SecondaryPass => "secondary_pass",
            Stage::Reconcile => "reconcile",
            Stage::Persist => "persist",
            Stage::Done => "done",
            Stage::Interrupted => "interrupted",
        };
        write!(f, "{}", name)
    }
}

/// Shared interrupt signal, raised by a signal handler and polled by the session.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flag raised by Ctrl-C / SIGTERM.
    pub fn install_ctrlc() -> Result<Self, ReconcileError> {
        let flag = Self::new();
        let handle = flag.clone();
        ctrlc::set_handler(move || {
            eprintln!("\n[feedrecon] interrupt received, writing snapshot...");
            handle.raise();
        })
        .map_err(|e| ReconcileError::Other(format!("cannot install signal handler: {}", e)))?;
        Ok(flag)
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every account reconciled and persisted.
    Completed,
    /// Run finished but some accounts failed; see the manifest.
    Partial,
    Interrupted,
    /// The operator declined to supply credentials.
    Aborted,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Completed => 0,
            RunOutcome::Partial => 2,
            RunOutcome::Interrupted | RunOutcome::Aborted => 130,
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunOutcome::Completed => "completed",
            RunOutcome::Partial => "partial",
            RunOutcome::Interrupted => "interrupted",
            RunOutcome::Aborted => "aborted",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AccountOutcome {
    Reconciled {
        items: usize,
        matched: usize,
        orphans: usize,
        strategy: String,
        tolerance: f64,
        resolved: usize,
        anomalies: usize,
    },
    Failed {
        kind: FailureKind,
        reason: String,
    },
    /// Was being worked on when the run stopped.
    InFlight { stage: Stage },
    /// Never reached.
    Pending,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountReport {
    pub account: String,
    pub outcome: AccountOutcome,
    pub extraction_failures: u32,
}

/// End-of-run summary; also written as the `report_<ts>.json` manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub outcome: RunOutcome,
    pub accounts: Vec<AccountReport>,
    pub context_switches: u32,
    pub early_terminations: Vec<EarlyTermination>,
    pub snapshot: Option<PathBuf>,
    pub store_files: Vec<PathBuf>,
    pub manifest: Option<PathBuf>,
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }

    pub fn reconciled(&self) -> usize {
        self.accounts
            .iter()
            .filter(|a| matches!(a.outcome, AccountOutcome::Reconciled { .. }))
            .count()
    }
}

enum PassOutcome {
    Sequence(Sequence),
    GaveUp(String),
    Interrupted,
    Aborted,
}

/// Drives one run: every account through primary pass, secondary pass,
/// reconciliation and staging, then writes the store once at the end.
pub struct Session<'a, E: Extractor> {
    config: &'a ReconcileConfig,
    extractor: E,
    interrupt: InterruptFlag,
    reconciler: Reconciler<'a>,
    state: RunState,
    stage: Stage,
}

impl<'a, E: Extractor> Session<'a, E> {
    pub fn new(config: &'a ReconcileConfig, extractor: E, interrupt: InterruptFlag, accounts: Vec<String>) -> Self {
        Self::with_state(config, extractor, interrupt, RunState::new(accounts))
    }

    /// Continue from a snapshot: completed accounts are skipped and the
    /// in-flight partial buffer is reused.
    pub fn resume(config: &'a ReconcileConfig, extractor: E, interrupt: InterruptFlag, snapshot: Snapshot) -> Self {
        info!(
            taken_at = %snapshot.taken_at,
            reason = %snapshot.reason,
            completed = snapshot.state.completed.len(),
            "resuming from snapshot"
        );
        Self::with_state(config, extractor, interrupt, snapshot.state.resume())
    }

    fn with_state(config: &'a ReconcileConfig, extractor: E, interrupt: InterruptFlag, state: RunState) -> Self {
        Self {
            config,
            extractor,
            interrupt,
            reconciler: Reconciler::new(config),
            state,
            stage: Stage::Idle,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn extractor(&self) -> &E {
        &self.extractor
    }

    pub fn run(&mut self) -> Result<RunReport, ReconcileError> {
        self.config.validate()?;
        info!(
            run_id = %self.state.run_id,
            accounts = self.state.accounts.len(),
            pending = self.state.pending().len(),
            "run starting"
        );

        for account in self.state.pending() {
            if self.interrupt.is_raised() {
                return self.halt(RunOutcome::Interrupted);
            }
            self.state.begin(&account);

            let mut passes = Vec::with_capacity(2);
            for pass in [Pass::Primary, Pass::Secondary] {
                self.stage = Stage::for_pass(pass);
                match self.ensure_pass(&account, pass) {
                    PassOutcome::Sequence(sequence) => passes.push(sequence),
                    PassOutcome::GaveUp(reason) => {
                        warn!(account = %account, %pass, %reason, "giving up on account");
                        self.state.fail_current(FailureKind::Extraction, format!("{} pass: {}", pass, reason));
                        break;
                    }
                    PassOutcome::Interrupted => return self.halt(RunOutcome::Interrupted),
                    PassOutcome::Aborted => return self.halt(RunOutcome::Aborted),
                }
                if self.interrupt.is_raised() {
                    return self.halt(RunOutcome::Interrupted);
                }
            }
            let [primary, secondary] = match <[Sequence; 2]>::try_from(passes) {
                Ok(pair) => pair,
                Err(_) => continue,
            };

            self.stage = Stage::Reconcile;
            match self.reconciler.reconcile(&primary, &secondary) {
                Ok(result) => {
                    self.check_scrape_quality(&result);
                    if let Some(partial) = self.state.current_mut() {
                        partial.result = Some(result);
                    }
                }
                Err(ReconcileError::AlignmentInfeasible(reason)) => {
                    warn!(account = %account, %reason, "alignment infeasible, account incomplete");
                    self.state.fail_current(FailureKind::AlignmentInfeasible, reason);
                    continue;
                }
                Err(e) => {
                    error!(account = %account, error = %e, "reconciliation failed");
                    self.state.fail_current(FailureKind::Other, e.to_string());
                    continue;
                }
            }
            if self.interrupt.is_raised() {
                return self.halt(RunOutcome::Interrupted);
            }

            self.stage = Stage::Persist;
            self.state.complete_current();
        }

        self.finish()
    }

    /// Use the buffered pass when a resumed partial already has it, otherwise extract.
    fn ensure_pass(&mut self, account: &str, pass: Pass) -> PassOutcome {
        if let Some(sequence) = self.state.current.as_ref().and_then(|p| p.pass(pass)) {
            info!(account, %pass, items = sequence.len(), "reusing buffered pass");
            return PassOutcome::Sequence(sequence.clone());
        }
        let outcome = self.extract(account, pass);
        if let PassOutcome::Sequence(sequence) = &outcome {
            if let Some(partial) = self.state.current_mut() {
                partial.set_pass(sequence.clone());
            }
        }
        outcome
    }

    fn extract(&mut self, account: &str, pass: Pass) -> PassOutcome {
        let retry = self.config.retry;
        let mut attempts = 0;
        loop {
            attempts += 1;
            let failure = match self.extractor.pass(account, pass) {
                Ok(sequence) => {
                    self.state.consecutive_failures = 0;
                    return PassOutcome::Sequence(sequence);
                }
                Err(ExtractionFailure::Aborted) => return PassOutcome::Aborted,
                Err(failure) => failure,
            };

            self.state.note_failure(account);
            warn!(account, %pass, attempt = attempts, failure = %failure, "extraction failed");
            if self.interrupt.is_raised() {
                return PassOutcome::Interrupted;
            }
            if !failure.is_transient() {
                return PassOutcome::GaveUp(failure.to_string());
            }

            self.state.consecutive_failures += 1;
            let consecutive = self.state.consecutive_failures;
            if consecutive >= retry.failure_threshold {
                self.state.consecutive_failures = 0;
                if !self.fall_back() {
                    return PassOutcome::Aborted;
                }
            }
            if attempts >= retry.max_attempts {
                return PassOutcome::GaveUp(format!("{} after {} attempts", failure, attempts));
            }

            if !self.pause(retry.backoff(consecutive)) {
                return PassOutcome::Interrupted;
            }
        }
    }

    /// Switch to a fresh context, or ask the operator for credentials when
    /// that fails. Returns false when the operator aborts.
    fn fall_back(&mut self) -> bool {
        match self.extractor.switch_context() {
            Ok(()) => {
                self.state.context_switches += 1;
                info!(switches = self.state.context_switches, "switched extraction context");
                true
            }
            Err(e) => {
                warn!(error = %e, "context switch failed, requesting credentials");
                match self.extractor.request_credentials() {
                    Ok(()) => {
                        info!("credentials refreshed");
                        true
                    }
                    Err(e) => {
                        error!(error = %e, "credentials not supplied, aborting run");
                        false
                    }
                }
            }
        }
    }

    /// Sleep in short slices; false if interrupted meanwhile.
    fn pause(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.interrupt.is_raised() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(Duration::from_millis(50)));
        }
    }

    fn check_scrape_quality(&mut self, result: &AccountResult) {
        let Some(expected) = self.config.expected_items else {
            return;
        };
        let scraped = result.merged.len();
        // Short by at least 10% of the expectation.
        if scraped * 10 <= expected * 9 {
            warn!(account = %result.account, expected, scraped, "pass ended early");
            self.state.early_terminations.push(EarlyTermination {
                account: result.account.clone(),
                expected,
                scraped,
            });
        }
    }

    fn snapshot(&self, reason: &str, stage: Stage) -> Result<SnapshotFiles, ReconcileError> {
        let writer = SnapshotWriter::new(&self.config.state_dir, &self.config.fallback_dir);
        writer.write(&Snapshot::new(reason, self.state.clone()), &stage.to_string())
    }

    fn halt(&mut self, outcome: RunOutcome) -> Result<RunReport, ReconcileError> {
        let stage = self.stage;
        warn!(%outcome, %stage, completed = self.state.completed.len(), "run stopping");
        self.stage = Stage::Interrupted;
        // The descriptor records the stage the run stopped in.
        let files = self.snapshot(&outcome.to_string(), stage)?;
        Ok(self.report(outcome, Some(files.snapshot), Vec::new(), Some(stage)))
    }

    fn finish(&mut self) -> Result<RunReport, ReconcileError> {
        self.stage = Stage::Done;
        let store_files = match self.persist() {
            Ok(files) => files,
            Err(e) => {
                error!(error = %e, "store write failed, snapshotting results");
                if let Err(snapshot_error) = self.snapshot("persistence_failure", Stage::Persist) {
                    error!(error = %snapshot_error, "snapshot after store failure also failed");
                }
                return Err(e);
            }
        };

        let outcome = if self.state.failed.is_empty() {
            RunOutcome::Completed
        } else {
            RunOutcome::Partial
        };
        let mut report = self.report(outcome, None, store_files, None);

        let manifest_name = format!("report_{}.json", self.state.run_id);
        let json = serde_json::to_vec_pretty(&report)?;
        let manifest = write_with_fallback(&self.config.state_dir, &self.config.fallback_dir, &manifest_name, &json)?;
        report.manifest = Some(manifest);

        info!(
            %outcome,
            reconciled = report.reconciled(),
            failed = self.state.failed.len(),
            "run finished"
        );
        Ok(report)
    }

    /// Write one store column per completed account not yet persisted. Every
    /// table is staged before the first write, and each account is marked
    /// persisted as soon as its table lands so a resumed run skips it.
    fn persist(&mut self) -> Result<Vec<PathBuf>, ReconcileError> {
        let store = Store::new(&self.config.store_dir, &self.config.fallback_dir);
        let pending: Vec<&AccountResult> = self.state.unpersisted().collect();

        let manifest_taken = |id: &str| {
            let name = format!("report_{}.json", id);
            self.config.state_dir.join(&name).exists() || self.config.fallback_dir.join(&name).exists()
        };
        let base = disambiguate(&self.state.run_id, manifest_taken);
        let column = store.free_column(&base, pending.iter().map(|r| r.account.as_str()))?;
        let staged = pending
            .iter()
            .map(|r| store.stage(&column, r))
            .collect::<Result<Vec<_>, _>>()?;

        if column != self.state.run_id {
            info!(run_id = %self.state.run_id, %column, "run id already in use, using a suffixed column");
            self.state.run_id = column;
        }

        let mut files = Vec::with_capacity(staged.len());
        for table in &staged {
            files.push(store.commit(table)?);
            self.state.persisted.push(table.account.clone());
        }
        Ok(files)
    }

    fn report(
        &self,
        outcome: RunOutcome,
        snapshot: Option<PathBuf>,
        store_files: Vec<PathBuf>,
        stopped_in: Option<Stage>,
    ) -> RunReport {
        let accounts = self
            .state
            .accounts
            .iter()
            .map(|account| {
                let outcome = if let Some(r) = self.state.completed.iter().find(|r| &r.account == account) {
                    AccountOutcome::Reconciled {
                        items: r.merged.len(),
                        matched: r.matched(),
                        orphans: r.orphans.len(),
                        strategy: r.strategy.to_string(),
                        tolerance: r.tolerance,
                        resolved: r.resolution.by_model + r.resolution.by_policy,
                        anomalies: r.anomalies.len(),
                    }
                } else if let Some(f) = self.state.failed.iter().find(|f| &f.account == account) {
                    AccountOutcome::Failed {
                        kind: f.kind,
                        reason: f.reason.clone(),
                    }
                } else if let (Some(stage), Some(_)) = (
                    stopped_in,
                    self.state.current.as_ref().filter(|p| &p.account == account),
                ) {
                    AccountOutcome::InFlight { stage }
                } else {
                    AccountOutcome::Pending
                };
                AccountReport {
                    account: account.clone(),
                    outcome,
                    extraction_failures: self.state.failure_counts.get(account).copied().unwrap_or(0),
                }
            })
            .collect();

        RunReport {
            run_id: self.state.run_id.clone(),
            outcome,
            accounts,
            context_switches: self.state.context_switches,
            early_terminations: self.state.early_terminations.clone(),
            snapshot,
            store_files,
            manifest: None,
        }
    }
}
