//! BuildPersistenceManager - owns every file under `builds/`
//!
//! All file access goes through one mutex so there is never more than one
//! writer. Snapshot and history writes go to a temp file first and are renamed
//! into place, so a reader never observes a half written file.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::event_log::{BuildEvent, BuildEventLog};
use super::state::{BuildHistoryEntry, PersistentBuildState};
use super::PersistenceError;

/// Default number of history entries retained
pub const DEFAULT_HISTORY_CAP: usize = 100;

const STATE_FILE: &str = "active_build.json";
const HISTORY_FILE: &str = "build_history.json";
const LOGS_DIR: &str = "logs";

#[derive(Debug, Default)]
struct Inner {
    log: Option<BuildEventLog>,
}

/// Snapshot, history and event log storage for builds
#[derive(Debug)]
pub struct BuildPersistenceManager {
    base_dir: PathBuf,
    history_cap: usize,
    inner: Mutex<Inner>,
}

impl BuildPersistenceManager {
    /// Open (creating if needed) the `builds/` directory under `data_dir`
    pub fn new(data_dir: impl AsRef<Path>, history_cap: usize) -> Result<Self, PersistenceError> {
        let base_dir = data_dir.as_ref().join("builds");
        debug!(?base_dir, history_cap, "BuildPersistenceManager::new: called");
        let logs_dir = base_dir.join(LOGS_DIR);
        fs::create_dir_all(&logs_dir).map_err(|e| PersistenceError::io(&logs_dir, e))?;
        Ok(Self {
            base_dir,
            history_cap: history_cap.max(1),
            inner: Mutex::new(Inner::default()),
        })
    }

    /// Open the manager without creating anything, for read-only inspection
    pub fn open_existing(data_dir: impl AsRef<Path>, history_cap: usize) -> Result<Self, PersistenceError> {
        let base_dir = data_dir.as_ref().join("builds");
        if !base_dir.is_dir() {
            return Err(PersistenceError::Unavailable(format!(
                "no build data at {}",
                base_dir.display()
            )));
        }
        Ok(Self {
            base_dir,
            history_cap: history_cap.max(1),
            inner: Mutex::new(Inner::default()),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn state_path(&self) -> PathBuf {
        self.base_dir.join(STATE_FILE)
    }

    pub fn history_path(&self) -> PathBuf {
        self.base_dir.join(HISTORY_FILE)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join(LOGS_DIR)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Poisoned locks are recovered; every write is a whole-file rename
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // === Active snapshot ===

    /// Durably write the snapshot, stamping its last save time
    pub fn save_active_state(
        &self,
        state: &mut PersistentBuildState,
        now: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        let _guard = self.lock();
        state.last_save = Some(now);
        let json = serde_json::to_string_pretty(state)?;
        write_atomic(&self.state_path(), &json)?;
        debug!(build_id = %state.build_id, status = %state.status, "save_active_state: saved");
        Ok(())
    }

    /// Load the snapshot; a missing or unreadable file yields `None`
    pub fn load_active_state(&self) -> Option<PersistentBuildState> {
        let _guard = self.lock();
        let path = self.state_path();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(?path, error = %e, "Failed to read build snapshot");
                return None;
            }
        };
        match serde_json::from_str(&content) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(?path, error = %e, "Failed to parse build snapshot");
                None
            }
        }
    }

    pub fn has_active_state(&self) -> bool {
        self.state_path().exists()
    }

    /// Delete the snapshot; absent is fine
    pub fn clear_active_state(&self) -> Result<(), PersistenceError> {
        let _guard = self.lock();
        let path = self.state_path();
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(?path, "clear_active_state: removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PersistenceError::io(&path, e)),
        }
    }

    // === Event log ===

    /// Open a new log for `build_id`, closing any previous one
    pub fn start_build_log(&self, build_id: &str, now: DateTime<Utc>) -> Result<PathBuf, PersistenceError> {
        let mut inner = self.lock();
        if let Some(previous) = inner.log.take()
            && let Err(e) = previous.close(now)
        {
            warn!(error = %e, "Failed to close previous build log");
        }
        let log = BuildEventLog::open(&self.logs_dir(), build_id, now)?;
        let path = log.path().to_path_buf();
        inner.log = Some(log);
        info!(%build_id, "Build log opened at {}", path.display());
        Ok(path)
    }

    /// Append an event to the open log; without an open log this is a no-op
    ///
    /// Write failures are logged and otherwise ignored.
    pub fn log_event(&self, event: &BuildEvent) {
        let mut inner = self.lock();
        match inner.log.as_mut() {
            Some(log) => {
                if let Err(e) = log.write(event) {
                    warn!(error = %e, event_type = %event.event_type, "Failed to write build event");
                }
            }
            None => debug!(event_type = %event.event_type, "log_event: no open build log"),
        }
    }

    pub fn current_log_path(&self) -> Option<PathBuf> {
        self.lock().log.as_ref().map(|log| log.path().to_path_buf())
    }

    /// Close the open log, if any
    pub fn close_current_log(&self, now: DateTime<Utc>) {
        let mut inner = self.lock();
        if let Some(log) = inner.log.take() {
            let build_id = log.build_id().to_string();
            if let Err(e) = log.close(now) {
                warn!(%build_id, error = %e, "Failed to close build log");
            }
        }
    }

    // === History ===

    /// Append a finished build, evicting the oldest entries beyond the cap
    pub fn add_history_entry(&self, entry: BuildHistoryEntry) -> Result<(), PersistenceError> {
        let _guard = self.lock();
        let mut history = self.read_history();
        debug!(build_id = %entry.build_id, existing = history.len(), "add_history_entry: called");
        history.push(entry);
        if history.len() > self.history_cap {
            let excess = history.len() - self.history_cap;
            history.drain(..excess);
        }
        let json = serde_json::to_string_pretty(&history)?;
        write_atomic(&self.history_path(), &json)
    }

    /// Every stored entry, oldest first
    pub fn load_history(&self) -> Vec<BuildHistoryEntry> {
        let _guard = self.lock();
        self.read_history()
    }

    /// The most recent `n` entries, oldest first
    pub fn get_recent_history(&self, n: usize) -> Vec<BuildHistoryEntry> {
        let mut history = self.load_history();
        let skip = history.len().saturating_sub(n);
        history.drain(..skip);
        history
    }

    fn read_history(&self) -> Vec<BuildHistoryEntry> {
        let path = self.history_path();
        let Ok(content) = fs::read_to_string(&path) else {
            return Vec::new();
        };
        serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!(?path, error = %e, "Failed to parse build history, starting fresh");
            Vec::new()
        })
    }
}

/// Write `content` to a sibling temp file, then rename it over `path`
fn write_atomic(path: &Path, content: &str) -> Result<(), PersistenceError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let temp_path = path.with_file_name(format!(".{file_name}.tmp"));
    fs::write(&temp_path, content).map_err(|e| PersistenceError::io(&temp_path, e))?;
    fs::rename(&temp_path, path).map_err(|e| PersistenceError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Build, BuildStatus, WorkItem};
    use crate::persistence::BuildEventType;
    use chrono::Duration;
    use tempfile::TempDir;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z").unwrap().with_timezone(&Utc)
    }

    fn manager(temp: &TempDir) -> BuildPersistenceManager {
        BuildPersistenceManager::new(temp.path(), DEFAULT_HISTORY_CAP).unwrap()
    }

    fn sample_state() -> PersistentBuildState {
        let build = Build::new(
            "Suit",
            "Collector",
            1,
            vec![WorkItem::new(1, "Alice", "Ring"), WorkItem::new(2, "Bob", "Hat")],
            t0(),
        );
        PersistentBuildState::from_live(&build, None)
    }

    fn entry(n: usize) -> BuildHistoryEntry {
        let mut state = sample_state();
        state.suit_name = format!("Suit{n}");
        BuildHistoryEntry::from_state(&state, BuildStatus::Completed, t0() + Duration::seconds(n as i64), None)
    }

    #[test]
    fn test_layout_created() {
        let temp = TempDir::new().unwrap();
        let mgr = manager(&temp);
        assert!(temp.path().join("builds").join("logs").is_dir());
        assert_eq!(mgr.state_path(), temp.path().join("builds/active_build.json"));
        assert_eq!(mgr.history_path(), temp.path().join("builds/build_history.json"));
    }

    #[test]
    fn test_save_load_clear() {
        let temp = TempDir::new().unwrap();
        let mgr = manager(&temp);
        assert!(mgr.load_active_state().is_none());

        let mut state = sample_state();
        mgr.save_active_state(&mut state, t0()).unwrap();
        assert_eq!(state.last_save, Some(t0()));
        assert!(mgr.has_active_state());
        assert!(!temp.path().join("builds/.active_build.json.tmp").exists());

        let loaded = mgr.load_active_state().unwrap();
        assert_eq!(loaded, state);

        mgr.clear_active_state().unwrap();
        assert!(!mgr.has_active_state());
        mgr.clear_active_state().unwrap();
    }

    #[test]
    fn test_corrupt_snapshot_loads_as_none() {
        let temp = TempDir::new().unwrap();
        let mgr = manager(&temp);
        fs::write(mgr.state_path(), "{ not json").unwrap();
        assert!(mgr.load_active_state().is_none());
    }

    #[test]
    fn test_history_cap_evicts_oldest() {
        let temp = TempDir::new().unwrap();
        let mgr = manager(&temp);
        for n in 0..=DEFAULT_HISTORY_CAP {
            mgr.add_history_entry(entry(n)).unwrap();
        }
        let history = mgr.load_history();
        assert_eq!(history.len(), DEFAULT_HISTORY_CAP);
        assert_eq!(history[0].suit_name, "Suit1");
        assert_eq!(history.last().unwrap().suit_name, format!("Suit{DEFAULT_HISTORY_CAP}"));
    }

    #[test]
    fn test_recent_history_chronological() {
        let temp = TempDir::new().unwrap();
        let mgr = manager(&temp);
        for n in 0..5 {
            mgr.add_history_entry(entry(n)).unwrap();
        }
        let recent: Vec<String> = mgr.get_recent_history(2).into_iter().map(|e| e.suit_name).collect();
        assert_eq!(recent, vec!["Suit3", "Suit4"]);
        assert_eq!(mgr.get_recent_history(50).len(), 5);
        assert!(mgr.get_recent_history(0).is_empty());
    }

    #[test]
    fn test_build_log_lifecycle() {
        let temp = TempDir::new().unwrap();
        let mgr = manager(&temp);
        mgr.log_event(&BuildEvent::new(BuildEventType::Error, "dropped", t0()));
        assert!(mgr.current_log_path().is_none());

        let first = mgr.start_build_log("aaaaaaaa-1111", t0()).unwrap();
        mgr.log_event(&BuildEvent::new(BuildEventType::BuildStarted, "first", t0()));
        let second = mgr
            .start_build_log("bbbbbbbb-2222", t0() + Duration::seconds(1))
            .unwrap();
        assert_ne!(first, second);

        let first_content = fs::read_to_string(&first).unwrap();
        assert!(first_content.contains("first"));
        assert!(first_content.contains("=== Build Log Ended"));

        mgr.close_current_log(t0());
        assert!(mgr.current_log_path().is_none());
        assert!(fs::read_to_string(&second).unwrap().contains("=== Build Log Ended"));
    }
}
