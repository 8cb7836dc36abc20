use crate::run_state::{disambiguate, new_run_id, RunState, StateDescriptor};
use crate::ReconcileError;
use bincode::{Decode, Encode};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Everything needed to pick a run back up, written on interrupt or fatal failure.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct Snapshot {
    pub taken_at: String,
    /// Why the run stopped (`interrupted`, `aborted`, `persistence_failure`).
    pub reason: String,
    pub state: RunState,
}

impl Snapshot {
    pub fn new(reason: impl Into<String>, state: RunState) -> Self {
        Self {
            taken_at: chrono::Utc::now().to_rfc3339(),
            reason: reason.into(),
            state,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ReconcileError> {
        Ok(bincode::encode_to_vec(self, bincode::config::standard())?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ReconcileError> {
        let (snapshot, _): (Snapshot, usize) = bincode::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(snapshot)
    }

    pub fn load(path: &Path) -> Result<Self, ReconcileError> {
        let bytes = fs::read(path)?;
        let snapshot = Self::decode(&bytes)?;
        info!(
            path = %path.display(),
            completed = snapshot.state.completed.len(),
            in_flight = snapshot.state.current.as_ref().map(|p| p.account.as_str()).unwrap_or("-"),
            "snapshot loaded"
        );
        Ok(snapshot)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotFiles {
    pub snapshot: PathBuf,
    pub descriptor: PathBuf,
}

/// Write `bytes` to `path` through a temporary sibling and a rename, so a
/// reader never sees a half-written file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    if tmp.exists() {
        fs::remove_file(&tmp)?;
    }
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

/// Atomic write to `dir/name`, retried once under `fallback_dir/name`.
pub fn write_with_fallback(dir: &Path, fallback_dir: &Path, name: &str, bytes: &[u8]) -> Result<PathBuf, ReconcileError> {
    let primary = dir.join(name);
    let first = match write_atomic(&primary, bytes) {
        Ok(()) => return Ok(primary),
        Err(e) => e,
    };
    warn!(path = %primary.display(), error = %first, "write failed, retrying at fallback location");

    let fallback = fallback_dir.join(name);
    match write_atomic(&fallback, bytes) {
        Ok(()) => Ok(fallback),
        Err(second) => {
            error!(path = %fallback.display(), error = %second, "fallback write failed");
            Err(ReconcileError::PersistenceFailure(format!(
                "{} ({}); fallback {} ({})",
                primary.display(),
                first,
                fallback.display(),
                second
            )))
        }
    }
}

/// Writes `snapshot_<ts>.bin` and `state_<ts>.json` side by side.
pub struct SnapshotWriter {
    state_dir: PathBuf,
    fallback_dir: PathBuf,
}

impl SnapshotWriter {
    pub fn new(state_dir: impl Into<PathBuf>, fallback_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            fallback_dir: fallback_dir.into(),
        }
    }

    pub fn write(&self, snapshot: &Snapshot, stage: &str) -> Result<SnapshotFiles, ReconcileError> {
        let name = |ts: &str| format!("snapshot_{}.bin", ts);
        let ts = disambiguate(&new_run_id(), |ts| {
            self.state_dir.join(name(ts)).exists() || self.fallback_dir.join(name(ts)).exists()
        });
        let snapshot_name = name(&ts);

        // Encode fully before touching disk.
        let bytes = snapshot.encode()?;
        let snapshot_path = write_with_fallback(&self.state_dir, &self.fallback_dir, &snapshot_name, &bytes)?;

        let descriptor: StateDescriptor = snapshot.state.descriptor(&snapshot.reason, stage, &snapshot_name);
        let json = serde_json::to_vec_pretty(&descriptor)?;
        // Keep the descriptor next to the snapshot it describes.
        let descriptor_dir = snapshot_path.parent().unwrap_or(self.state_dir.as_path()).to_path_buf();
        let descriptor_path = write_with_fallback(&descriptor_dir, &self.fallback_dir, &format!("state_{}.json", ts), &json)?;

        info!(
            snapshot = %snapshot_path.display(),
            completed = snapshot.state.completed.len(),
            bytes = bytes.len(),
            "snapshot written"
        );
        Ok(SnapshotFiles {
            snapshot: snapshot_path,
            descriptor: descriptor_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Pass, Record, Sequence};
    use crate::run_state::RunState;

    #[test]
    fn test_snapshot_load_restores_partial_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = RunState::new(vec!["a".to_string(), "b".to_string()]);
        state
            .begin("a")
            .set_pass(Sequence::new("a", Pass::Primary, vec![Record::new("x", 0).with_metric("likes", Some(4.0))]));
        state.note_failure("a");

        let writer = SnapshotWriter::new(dir.path(), dir.path().join("fallback"));
        let files = writer.write(&Snapshot::new("interrupted", state.clone()), "secondary_pass").unwrap();
        assert!(files.snapshot.starts_with(dir.path()));
        assert!(files.descriptor.exists());

        let loaded = Snapshot::load(&files.snapshot).unwrap();
        assert_eq!(loaded.reason, "interrupted");
        assert_eq!(loaded.state, state);

        let descriptor: StateDescriptor =
            serde_json::from_str(&fs::read_to_string(&files.descriptor).unwrap()).unwrap();
        let in_flight = descriptor.in_flight.unwrap();
        assert_eq!(in_flight.account, "a");
        assert_eq!(in_flight.stage, "secondary_pass");
        assert_eq!(in_flight.primary_items, Some(1));
        assert_eq!(descriptor.failure_counts["a"], 1);
    }

    #[test]
    fn test_back_to_back_snapshots_keep_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SnapshotWriter::new(dir.path(), dir.path().join("fallback"));
        let state = RunState::new(vec!["a".to_string()]);

        let first = writer.write(&Snapshot::new("interrupted", state.clone()), "idle").unwrap();
        let second = writer.write(&Snapshot::new("aborted", state), "idle").unwrap();
        assert_ne!(first.snapshot, second.snapshot);
        assert_ne!(first.descriptor, second.descriptor);
        assert_eq!(Snapshot::load(&first.snapshot).unwrap().reason, "interrupted");
        assert_eq!(Snapshot::load(&second.snapshot).unwrap().reason, "aborted");
    }

    #[test]
    fn test_unwritable_dir_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        // A file where the state directory should be makes the primary write fail.
        let blocked = dir.path().join("blocked");
        fs::write(&blocked, b"not a dir").unwrap();
        let fallback = dir.path().join("fallback");

        let path = write_with_fallback(&blocked, &fallback, "x.bin", b"payload").unwrap();
        assert_eq!(path, fallback.join("x.bin"));
        assert_eq!(fs::read(&path).unwrap(), b"payload");

        let both_blocked = write_with_fallback(&blocked, &blocked, "x.bin", b"payload");
        assert!(matches!(both_blocked, Err(ReconcileError::PersistenceFailure(_))));
    }

    #[test]
    fn test_write_atomic_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.json");
        write_atomic(&path, b"{}").unwrap();
        write_atomic(&path, b"[]").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"[]");
        assert!(!dir.path().join("nested").join("out.json.tmp").exists());
    }
}
