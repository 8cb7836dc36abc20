use crate::record::{Pass, Sequence};
use crate::reconcile::AccountResult;
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Timestamp format used in file names and store columns.
pub const RUN_ID_FORMAT: &str = "%Y%m%d_%H%M%S_%3f";

pub fn new_run_id() -> String {
    chrono::Local::now().format(RUN_ID_FORMAT).to_string()
}

/// `base` itself, or `base_<n>` for the smallest `n >= 2` not `taken`.
pub fn disambiguate(base: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(base) {
        return base.to_string();
    }
    (2..)
        .map(|n| format!("{}_{}", base, n))
        .find(|candidate| !taken(candidate))
        .unwrap_or_else(|| base.to_string())
}

/// Whatever the in-flight account has produced so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct PartialAccount {
    pub account: String,
    pub primary: Option<Sequence>,
    pub secondary: Option<Sequence>,
    pub result: Option<AccountResult>,
}

impl PartialAccount {
    pub fn new(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            primary: None,
            secondary: None,
            result: None,
        }
    }

    pub fn pass(&self, pass: Pass) -> Option<&Sequence> {
        match pass {
            Pass::Primary => self.primary.as_ref(),
            Pass::Secondary => self.secondary.as_ref(),
        }
    }

    pub fn set_pass(&mut self, sequence: Sequence) {
        match sequence.pass {
            Pass::Primary => self.primary = Some(sequence),
            Pass::Secondary => self.secondary = Some(sequence),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// An extraction pass was given up on.
    Extraction,
    /// The two passes could not be aligned; the account is incomplete.
    AlignmentInfeasible,
    Other,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Extraction => write!(f, "extraction"),
            FailureKind::AlignmentInfeasible => write!(f, "alignment_infeasible"),
            FailureKind::Other => write!(f, "other"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct AccountFailure {
    pub account: String,
    pub kind: FailureKind,
    pub reason: String,
}

/// An account whose anchor pass came back noticeably shorter than expected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct EarlyTermination {
    pub account: String,
    pub expected: usize,
    pub scraped: usize,
}

/// Progress of one run. Owned by the session; serialized in full into snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct RunState {
    pub run_id: String,
    /// RFC 3339 time the run (or the run it resumes) started.
    pub started_at: String,
    pub resumed: u32,
    /// Every account the run was asked to process, in order.
    pub accounts: Vec<String>,
    pub completed: Vec<AccountResult>,
    /// Completed accounts whose store column has already been written.
    pub persisted: Vec<String>,
    pub current: Option<PartialAccount>,
    pub failed: Vec<AccountFailure>,
    /// Extraction failures per account over the whole run.
    pub failure_counts: BTreeMap<String, u32>,
    pub consecutive_failures: u32,
    pub context_switches: u32,
    pub early_terminations: Vec<EarlyTermination>,
}

impl RunState {
    pub fn new(accounts: Vec<String>) -> Self {
        Self {
            run_id: new_run_id(),
            started_at: chrono::Utc::now().to_rfc3339(),
            resumed: 0,
            accounts,
            completed: Vec::new(),
            persisted: Vec::new(),
            current: None,
            failed: Vec::new(),
            failure_counts: BTreeMap::new(),
            consecutive_failures: 0,
            context_switches: 0,
            early_terminations: Vec::new(),
        }
    }

    /// Prepare a restored state for another run: new run id, failed accounts retried.
    pub fn resume(mut self) -> Self {
        self.run_id = new_run_id();
        self.resumed += 1;
        self.failed.clear();
        self.consecutive_failures = 0;
        self
    }

    pub fn is_completed(&self, account: &str) -> bool {
        self.completed.iter().any(|r| r.account == account)
    }

    pub fn is_persisted(&self, account: &str) -> bool {
        self.persisted.iter().any(|a| a == account)
    }

    /// Completed results that still need a store column.
    pub fn unpersisted(&self) -> impl Iterator<Item = &AccountResult> {
        self.completed.iter().filter(|r| !self.is_persisted(&r.account))
    }

    pub fn is_failed(&self, account: &str) -> bool {
        self.failed.iter().any(|f| f.account == account)
    }

    /// Accounts neither completed nor failed, in run order.
    pub fn pending(&self) -> Vec<String> {
        self.accounts
            .iter()
            .filter(|a| !self.is_completed(a) && !self.is_failed(a))
            .cloned()
            .collect()
    }

    /// Start work on `account`. A partial buffer left for the same account by
    /// an interrupted run is kept so finished passes are not repeated.
    pub fn begin(&mut self, account: &str) -> &mut PartialAccount {
        self.consecutive_failures = 0;
        let reuse = self.current.as_ref().is_some_and(|p| p.account == account);
        if !reuse {
            self.current = Some(PartialAccount::new(account));
        }
        self.current.get_or_insert_with(|| PartialAccount::new(account))
    }

    pub fn current_mut(&mut self) -> Option<&mut PartialAccount> {
        self.current.as_mut()
    }

    /// Move the in-flight account's result into the completed list.
    pub fn complete_current(&mut self) -> bool {
        match self.current.take() {
            Some(PartialAccount {
                result: Some(result), ..
            }) => {
                self.completed.push(result);
                true
            }
            other => {
                self.current = other;
                false
            }
        }
    }

    pub fn fail_current(&mut self, kind: FailureKind, reason: impl Into<String>) {
        if let Some(partial) = self.current.take() {
            self.failed.push(AccountFailure {
                account: partial.account,
                kind,
                reason: reason.into(),
            });
        }
    }

    pub fn note_failure(&mut self, account: &str) {
        *self.failure_counts.entry(account.to_string()).or_default() += 1;
    }

    pub fn descriptor(&self, outcome: &str, stage: &str, snapshot_file: &str) -> StateDescriptor {
        StateDescriptor {
            timestamp: chrono::Utc::now().to_rfc3339(),
            run_id: self.run_id.clone(),
            started_at: self.started_at.clone(),
            outcome: outcome.to_string(),
            completed_accounts: self.completed.iter().map(|r| r.account.clone()).collect(),
            failed_accounts: self.failed.clone(),
            in_flight: self.current.as_ref().map(|p| InFlight {
                account: p.account.clone(),
                stage: stage.to_string(),
                primary_items: p.primary.as_ref().map(Sequence::len),
                secondary_items: p.secondary.as_ref().map(Sequence::len),
            }),
            pending_accounts: self.pending(),
            failure_counts: self.failure_counts.clone(),
            context_switches: self.context_switches,
            early_terminations: self.early_terminations.clone(),
            snapshot_file: snapshot_file.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InFlight {
    pub account: String,
    pub stage: String,
    pub primary_items: Option<usize>,
    pub secondary_items: Option<usize>,
}

/// Human-readable companion to a snapshot, written as `state_<ts>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDescriptor {
    pub timestamp: String,
    pub run_id: String,
    pub started_at: String,
    pub outcome: String,
    pub completed_accounts: Vec<String>,
    pub failed_accounts: Vec<AccountFailure>,
    pub in_flight: Option<InFlight>,
    pub pending_accounts: Vec<String>,
    pub failure_counts: BTreeMap<String, u32>,
    pub context_switches: u32,
    pub early_terminations: Vec<EarlyTermination>,
    pub snapshot_file: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;

    fn accounts(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_begin_keeps_matching_partial() {
        let mut state = RunState::new(accounts(&["a", "b"]));
        state
            .begin("a")
            .set_pass(Sequence::new("a", Pass::Primary, vec![Record::new("x", 0)]));
        assert!(state.begin("a").primary.is_some());
        assert!(state.begin("b").primary.is_none());
        assert_eq!(state.current.as_ref().map(|p| p.account.as_str()), Some("b"));
    }

    #[test]
    fn test_complete_requires_result() {
        let mut state = RunState::new(accounts(&["a"]));
        state.begin("a");
        assert!(!state.complete_current());
        assert!(state.current.is_some());
        assert!(state.completed.is_empty());
    }

    #[test]
    fn test_failed_accounts_leave_pending_and_return_on_resume() {
        let mut state = RunState::new(accounts(&["a", "b", "c"]));
        state.begin("a");
        state.fail_current(FailureKind::Extraction, "rate limited");
        state.note_failure("a");
        state.note_failure("a");
        assert_eq!(state.pending(), accounts(&["b", "c"]));
        assert_eq!(state.failure_counts["a"], 2);

        let descriptor = state.descriptor("interrupted", "idle", "snapshot_x.bin");
        assert_eq!(descriptor.failed_accounts.len(), 1);
        assert!(descriptor.in_flight.is_none());

        let resumed = state.resume();
        assert_eq!(resumed.pending(), accounts(&["a", "b", "c"]));
        assert_eq!(resumed.resumed, 1);
    }

    #[test]
    fn test_disambiguate_skips_taken_names() {
        assert_eq!(disambiguate("run", |_| false), "run");
        let taken = ["run", "run_2"];
        assert_eq!(disambiguate("run", |c| taken.contains(&c)), "run_3");
    }

    #[test]
    fn test_run_ids_carry_milliseconds() {
        let id = new_run_id();
        // YYYYMMDD_HHMMSS_mmm
        assert_eq!(id.len(), 19);
        assert!(chrono::NaiveDateTime::parse_from_str(&id[..15], "%Y%m%d_%H%M%S").is_ok());
        assert!(id[16..].chars().all(|c| c.is_ascii_digit()));
    }
}
