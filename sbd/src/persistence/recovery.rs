//! Crash detection on startup
//!
//! A snapshot still tagged `Active` (or `Resuming`) when the process starts
//! means the previous process died mid-build. It is reclassified as `Crashed`
//! and left for a user to resume or abandon; nothing resumes automatically.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::domain::BuildStatus;

use super::event_log::{BuildEvent, BuildEventType};
use super::manager::BuildPersistenceManager;
use super::state::PersistentBuildState;

/// A resumable build found on startup
#[derive(Debug, Clone)]
pub struct CrashReport {
    pub state: PersistentBuildState,
    /// True when this startup reclassified the snapshot
    pub newly_detected: bool,
}

impl std::fmt::Display for CrashReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let remaining = self.state.remaining_items().count();
        write!(
            f,
            "build '{}' ({}): {}/{} items remaining",
            self.state.suit_name, self.state.build_id, remaining, self.state.total_item_count
        )
    }
}

/// Inspect the snapshot left by the previous process
pub fn check_for_crashed_build(manager: &BuildPersistenceManager, now: DateTime<Utc>) -> Option<CrashReport> {
    let mut state = manager.load_active_state()?;
    debug!(build_id = %state.build_id, status = %state.status, "check_for_crashed_build: snapshot found");

    match state.status {
        BuildStatus::Active | BuildStatus::Resuming => {
            state.status = BuildStatus::Crashed;
            if let Err(e) = manager.save_active_state(&mut state, now) {
                warn!(build_id = %state.build_id, error = %e, "Failed to mark snapshot as crashed");
            }
            let remaining = state.remaining_items().count();
            if manager.start_build_log(&state.build_id, now).is_ok() {
                manager.log_event(
                    &BuildEvent::new(
                        BuildEventType::BuildCrashDetected,
                        format!("Crashed build detected: {}", state.suit_name),
                        now,
                    )
                    .with_details(format!("{remaining}/{} items remaining", state.total_item_count)),
                );
                manager.close_current_log(now);
            }
            let report = CrashReport {
                state,
                newly_detected: true,
            };
            warn!("Crashed build detected: {report}");
            Some(report)
        }
        BuildStatus::Crashed => {
            let report = CrashReport {
                state,
                newly_detected: false,
            };
            info!("Crashed build pending resume: {report}");
            Some(report)
        }
        status => {
            debug!(%status, "check_for_crashed_build: snapshot is not resumable");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Build, WorkItem};
    use crate::persistence::DEFAULT_HISTORY_CAP;
    use tempfile::TempDir;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z").unwrap().with_timezone(&Utc)
    }

    fn save_with_status(mgr: &BuildPersistenceManager, status: BuildStatus) {
        let build = Build::new("Suit", "Collector", 1, vec![WorkItem::new(1, "Alice", "Ring")], t0());
        let mut state = PersistentBuildState::from_live(&build, None);
        state.status = status;
        mgr.save_active_state(&mut state, t0()).unwrap();
    }

    #[test]
    fn test_no_snapshot() {
        let temp = TempDir::new().unwrap();
        let mgr = BuildPersistenceManager::new(temp.path(), DEFAULT_HISTORY_CAP).unwrap();
        assert!(check_for_crashed_build(&mgr, t0()).is_none());
    }

    #[test]
    fn test_active_snapshot_reclassified() {
        let temp = TempDir::new().unwrap();
        let mgr = BuildPersistenceManager::new(temp.path(), DEFAULT_HISTORY_CAP).unwrap();
        save_with_status(&mgr, BuildStatus::Active);

        let report = check_for_crashed_build(&mgr, t0()).unwrap();
        assert!(report.newly_detected);
        assert_eq!(report.state.status, BuildStatus::Crashed);
        assert_eq!(mgr.load_active_state().unwrap().status, BuildStatus::Crashed);

        let logs: Vec<_> = std::fs::read_dir(mgr.logs_dir()).unwrap().collect();
        assert_eq!(logs.len(), 1);
    }

    #[test]
    fn test_interrupted_resume_reclassified() {
        let temp = TempDir::new().unwrap();
        let mgr = BuildPersistenceManager::new(temp.path(), DEFAULT_HISTORY_CAP).unwrap();
        save_with_status(&mgr, BuildStatus::Resuming);

        let report = check_for_crashed_build(&mgr, t0()).unwrap();
        assert!(report.newly_detected);
        assert_eq!(mgr.load_active_state().unwrap().status, BuildStatus::Crashed);
    }

    #[test]
    fn test_crashed_snapshot_reported_unchanged() {
        let temp = TempDir::new().unwrap();
        let mgr = BuildPersistenceManager::new(temp.path(), DEFAULT_HISTORY_CAP).unwrap();
        save_with_status(&mgr, BuildStatus::Crashed);
        let before = std::fs::read_to_string(mgr.state_path()).unwrap();

        let report = check_for_crashed_build(&mgr, t0()).unwrap();
        assert!(!report.newly_detected);
        assert_eq!(std::fs::read_to_string(mgr.state_path()).unwrap(), before);
    }

    #[test]
    fn test_terminal_snapshot_ignored() {
        let temp = TempDir::new().unwrap();
        let mgr = BuildPersistenceManager::new(temp.path(), DEFAULT_HISTORY_CAP).unwrap();
        save_with_status(&mgr, BuildStatus::Completed);
        assert!(check_for_crashed_build(&mgr, t0()).is_none());
    }
}
