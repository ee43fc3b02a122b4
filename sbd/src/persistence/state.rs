//! Durable snapshot, history entry and statistics types

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{Build, BuildStatus, ConnectionId, WorkItem, WorkItemStatus};

/// Snapshot schema version
pub const SCHEMA_VERSION: u32 = 1;

/// Durable mirror of the active build
///
/// Unlike [`Build`], the snapshot keeps every item of the build including the
/// completed ones so that progress survives a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistentBuildState {
    pub version: u32,
    pub build_id: String,
    pub suit_name: String,
    pub drop_character: String,
    pub initiator: ConnectionId,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_save: Option<DateTime<Utc>>,
    pub status: BuildStatus,
    pub work_items: Vec<WorkItem>,
    pub completed_ids: Vec<u32>,
    pub total_item_count: usize,
    pub source_path: Option<String>,
    #[serde(default)]
    pub total_errors: u32,
    #[serde(default)]
    pub resume_count: u32,
}

impl PersistentBuildState {
    /// Snapshot a freshly started build
    ///
    /// Every item is captured as `Pending` with no attempts and the build is
    /// tagged `Active`.
    pub fn from_live(build: &Build, source_path: Option<&Path>) -> Self {
        debug!(build_id = %build.build_id, "PersistentBuildState::from_live: called");
        let work_items: Vec<WorkItem> = build
            .items
            .iter()
            .map(|item| WorkItem {
                status: WorkItemStatus::Pending,
                attempts: 0,
                consecutive_errors: 0,
                last_error: None,
                last_dispatch: None,
                ..item.clone()
            })
            .collect();

        Self {
            version: SCHEMA_VERSION,
            build_id: build.build_id.clone(),
            suit_name: build.suit_name.clone(),
            drop_character: build.drop_character.clone(),
            initiator: build.initiator,
            start_time: build.start_time,
            end_time: None,
            last_save: None,
            status: BuildStatus::Active,
            total_item_count: work_items.len(),
            work_items,
            completed_ids: Vec::new(),
            source_path: source_path.map(|p| p.display().to_string()),
            total_errors: build.total_errors,
            resume_count: 0,
        }
    }

    /// Rebuild the live build from this snapshot
    ///
    /// Completed items are dropped. In-flight items had an unknown outcome, so
    /// they go back to `Pending` with their timestamp cleared and one more
    /// attempt counted. Dispatch timestamps from the previous process are
    /// discarded.
    pub fn to_live(&self) -> Build {
        debug!(build_id = %self.build_id, "PersistentBuildState::to_live: called");
        let items = self
            .work_items
            .iter()
            .filter(|w| w.status != WorkItemStatus::Completed)
            .cloned()
            .map(reset_in_flight)
            .collect();

        Build {
            build_id: self.build_id.clone(),
            suit_name: self.suit_name.clone(),
            drop_character: self.drop_character.clone(),
            initiator: self.initiator,
            start_time: self.start_time,
            end_time: None,
            items,
            total_errors: self.total_errors,
            failure: None,
            drained: Default::default(),
            status: BuildStatus::Active,
        }
    }

    /// Apply the in-flight reset of [`Self::to_live`] to the snapshot itself
    pub fn reset_in_flight(&mut self) {
        let items = std::mem::take(&mut self.work_items);
        self.work_items = items.into_iter().map(reset_in_flight).collect();
    }

    pub fn item_mut(&mut self, id: u32) -> Option<&mut WorkItem> {
        self.work_items.iter_mut().find(|w| w.id == id)
    }

    /// Copy the live state of an item into the snapshot
    pub fn sync_item(&mut self, live: &WorkItem) {
        if let Some(item) = self.item_mut(live.id) {
            *item = live.clone();
        }
    }

    /// Record a delivered item
    pub fn mark_completed(&mut self, id: u32) {
        if let Some(item) = self.item_mut(id) {
            item.mark_completed();
            item.last_dispatch = None;
            if !self.completed_ids.contains(&id) {
                self.completed_ids.push(id);
            }
        }
    }

    /// Items not yet completed
    pub fn remaining_items(&self) -> impl Iterator<Item = &WorkItem> {
        self.work_items.iter().filter(|w| w.status != WorkItemStatus::Completed)
    }

    pub fn count(&self, status: WorkItemStatus) -> usize {
        self.work_items.iter().filter(|w| w.status == status).count()
    }

    /// Progress counts as of `now`
    pub fn statistics(&self, now: DateTime<Utc>) -> BuildStatistics {
        let completed = self.count(WorkItemStatus::Completed);
        let total = self.total_item_count;
        BuildStatistics {
            total_items: total,
            completed_items: completed,
            pending_items: self.count(WorkItemStatus::Pending),
            in_progress_items: self.count(WorkItemStatus::InProgress),
            failed_items: self.count(WorkItemStatus::Failed),
            start_time: self.start_time,
            elapsed_secs: (now - self.start_time).num_seconds().max(0),
            progress_percentage: if total > 0 {
                completed as f64 * 100.0 / total as f64
            } else {
                0.0
            },
        }
    }
}

fn reset_in_flight(mut item: WorkItem) -> WorkItem {
    if item.status == WorkItemStatus::InProgress {
        item.status = WorkItemStatus::Pending;
        item.attempts += 1;
    }
    item.last_dispatch = None;
    item
}

/// Record of a finished build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildHistoryEntry {
    pub build_id: String,
    pub suit_name: String,
    pub drop_character: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub final_status: BuildStatus,
    pub total_items: usize,
    pub completed_items: usize,
    pub failed_items: usize,
    pub was_resumed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
}

impl BuildHistoryEntry {
    /// Summarize a snapshot at the end of its build
    pub fn from_state(
        state: &PersistentBuildState,
        final_status: BuildStatus,
        end_time: DateTime<Utc>,
        failure_reason: Option<String>,
    ) -> Self {
        Self {
            build_id: state.build_id.clone(),
            suit_name: state.suit_name.clone(),
            drop_character: state.drop_character.clone(),
            start_time: state.start_time,
            end_time,
            final_status,
            total_items: state.total_item_count,
            completed_items: state.count(WorkItemStatus::Completed),
            failed_items: state.count(WorkItemStatus::Failed),
            was_resumed: state.resume_count > 0,
            failure_reason,
            log_file: None,
        }
    }

    pub fn with_log_file(mut self, path: Option<&Path>) -> Self {
        self.log_file = path.map(|p| p.display().to_string());
        self
    }

    pub fn duration_secs(&self) -> i64 {
        (self.end_time - self.start_time).num_seconds().max(0)
    }
}

/// Progress summary of a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildStatistics {
    pub total_items: usize,
    pub completed_items: usize,
    pub pending_items: usize,
    pub in_progress_items: usize,
    pub failed_items: usize,
    pub start_time: DateTime<Utc>,
    pub elapsed_secs: i64,
    pub progress_percentage: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z").unwrap().with_timezone(&Utc)
    }

    fn sample_build() -> Build {
        let mut ring = WorkItem::new(1, "Alice", "Ring");
        ring.material_id = 60;
        ring.requirements = vec![2576, 2579];
        let mut hat = WorkItem::new(2, "Bob", "Hat");
        hat.set_id = 49;
        let boots = WorkItem::new(3, "Bob", "Boots");
        Build::new("Suit", "Collector", 7, vec![ring, hat, boots], t0())
    }

    #[test]
    fn test_from_live_captures_pending_items() {
        let mut build = sample_build();
        build.items[0].mark_dispatched(t0());
        let state = PersistentBuildState::from_live(&build, Some(Path::new("/defs/Suit.alb")));

        assert_eq!(state.version, SCHEMA_VERSION);
        assert_eq!(state.status, BuildStatus::Active);
        assert_eq!(state.total_item_count, 3);
        assert!(state.work_items.iter().all(|w| w.status == WorkItemStatus::Pending));
        assert!(state.work_items.iter().all(|w| w.attempts == 0));
        assert_eq!(state.source_path.as_deref(), Some("/defs/Suit.alb"));
    }

    #[test]
    fn test_round_trip_preserves_build_fields() {
        let build = sample_build();
        let restored = PersistentBuildState::from_live(&build, None).to_live();

        assert_eq!(restored.build_id, build.build_id);
        assert_eq!(restored.suit_name, build.suit_name);
        assert_eq!(restored.drop_character, build.drop_character);
        assert_eq!(restored.initiator, build.initiator);
        assert_eq!(restored.start_time, build.start_time);
        assert_eq!(restored.items, build.items);
    }

    #[test]
    fn test_to_live_drops_completed_and_resets_in_flight() {
        let build = sample_build();
        let mut state = PersistentBuildState::from_live(&build, None);
        state.mark_completed(1);
        state.item_mut(2).unwrap().mark_dispatched(t0());

        let live = state.to_live();
        assert_eq!(live.items.iter().map(|w| w.id).collect::<Vec<_>>(), vec![2, 3]);
        let hat = live.item(2).unwrap();
        assert_eq!(hat.status, WorkItemStatus::Pending);
        assert!(hat.last_dispatch.is_none());
        assert_eq!(hat.attempts, 2);
        assert_eq!(live.item(3).unwrap().attempts, 0);
    }

    #[test]
    fn test_reset_in_flight_on_snapshot() {
        let mut state = PersistentBuildState::from_live(&sample_build(), None);
        state.item_mut(3).unwrap().mark_dispatched(t0());
        state.reset_in_flight();
        let boots = state.item_mut(3).unwrap();
        assert_eq!(boots.status, WorkItemStatus::Pending);
        assert_eq!(boots.attempts, 2);
    }

    #[test]
    fn test_mark_completed_is_idempotent() {
        let mut state = PersistentBuildState::from_live(&sample_build(), None);
        state.mark_completed(2);
        state.mark_completed(2);
        state.mark_completed(99);
        assert_eq!(state.completed_ids, vec![2]);
        assert_eq!(state.remaining_items().count(), 2);
    }

    #[test]
    fn test_statistics() {
        let mut state = PersistentBuildState::from_live(&sample_build(), None);
        state.mark_completed(1);
        state.item_mut(2).unwrap().mark_dispatched(t0());

        let stats = state.statistics(t0() + Duration::seconds(90));
        assert_eq!(stats.total_items, 3);
        assert_eq!(stats.completed_items, 1);
        assert_eq!(stats.in_progress_items, 1);
        assert_eq!(stats.pending_items, 1);
        assert_eq!(stats.elapsed_secs, 90);
        assert!((stats.progress_percentage - 33.333).abs() < 0.01);
    }

    #[test]
    fn test_history_entry_from_state() {
        let mut state = PersistentBuildState::from_live(&sample_build(), None);
        state.mark_completed(1);
        state.mark_completed(3);
        state.resume_count = 1;

        let entry = BuildHistoryEntry::from_state(&state, BuildStatus::Completed, t0() + Duration::minutes(5), None);
        assert_eq!(entry.final_status, BuildStatus::Completed);
        assert_eq!(entry.completed_items, 2);
        assert_eq!(entry.total_items, 3);
        assert!(entry.was_resumed);
        assert_eq!(entry.duration_secs(), 300);
    }

    #[test]
    fn test_snapshot_json_round_trip() {
        let state = PersistentBuildState::from_live(&sample_build(), None);
        let json = serde_json::to_string_pretty(&state).unwrap();
        assert!(json.contains("\"status\": \"active\""));
        let back: PersistentBuildState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
