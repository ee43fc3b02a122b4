//! Build domain type
//!
//! The active unit of work: every remaining work item of one definition file,
//! plus the error budget and the set of workers with nothing left to do.

use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::ConnectionId;
use super::id::generate_build_id;
use super::work_item::{WorkItem, WorkItemStatus};

/// Coarse build status, shared by the live build and its snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    /// Dispatching
    #[default]
    Active,
    /// Every item delivered
    Completed,
    /// Terminated or abandoned by a user
    Cancelled,
    /// Error thresholds exceeded
    Failed,
    /// Snapshot found `Active` on startup
    Crashed,
    /// Being brought back from a crashed snapshot
    Resuming,
}

impl BuildStatus {
    /// Completed, Cancelled or Failed
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "Active"),
            Self::Completed => write!(f, "Completed"),
            Self::Cancelled => write!(f, "Cancelled"),
            Self::Failed => write!(f, "Failed"),
            Self::Crashed => write!(f, "Crashed"),
            Self::Resuming => write!(f, "Resuming"),
        }
    }
}

/// The active build
///
/// Owned exclusively by the coordinator while active. `items` holds only the
/// work that remains: delivered items are removed.
#[derive(Debug, Clone)]
pub struct Build {
    /// Stable across crash and resume
    pub build_id: String,

    /// Definition (suit) name as requested
    pub suit_name: String,

    /// Collection character that receives every item
    pub drop_character: String,

    /// Connection that asked for the build; receives completion/failure notices
    pub initiator: ConnectionId,

    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,

    /// Remaining work in definition order
    pub items: Vec<WorkItem>,

    /// Delivery failures across all items, plus errors caught at the tick boundary
    pub total_errors: u32,

    /// Set once the build has failed; the reason is user facing
    pub failure: Option<String>,

    /// Workers with no remaining work in this build
    pub drained: HashSet<ConnectionId>,

    pub status: BuildStatus,
}

impl Build {
    /// Create a new active build with a fresh ID
    pub fn new(
        suit_name: impl Into<String>,
        drop_character: impl Into<String>,
        initiator: ConnectionId,
        items: Vec<WorkItem>,
        start_time: DateTime<Utc>,
    ) -> Self {
        let build = Self {
            build_id: generate_build_id(),
            suit_name: suit_name.into(),
            drop_character: drop_character.into(),
            initiator,
            start_time,
            end_time: None,
            items,
            total_errors: 0,
            failure: None,
            drained: HashSet::new(),
            status: BuildStatus::Active,
        };
        debug!(build_id = %build.build_id, items = build.items.len(), "Build::new: called");
        build
    }

    /// Number of items still to deliver
    pub fn remaining(&self) -> usize {
        self.items.len()
    }

    pub fn has_failed(&self) -> bool {
        self.failure.is_some()
    }

    /// Mark the build failed; the first reason wins
    pub fn fail(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        if self.failure.is_none() {
            self.failure = Some(reason.into());
            self.status = BuildStatus::Failed;
            self.end_time = Some(now);
        }
    }

    pub fn item(&self, id: u32) -> Option<&WorkItem> {
        self.items.iter().find(|w| w.id == id)
    }

    pub fn item_mut(&mut self, id: u32) -> Option<&mut WorkItem> {
        self.items.iter_mut().find(|w| w.id == id)
    }

    /// Remove a delivered item from the remaining work
    pub fn remove_item(&mut self, id: u32) -> Option<WorkItem> {
        let idx = self.items.iter().position(|w| w.id == id)?;
        Some(self.items.remove(idx))
    }

    /// Distinct characters that still hold items
    pub fn required_characters(&self) -> BTreeSet<String> {
        self.items.iter().map(|w| w.character.clone()).collect()
    }

    /// Whether any remaining item is owned by `character`
    pub fn has_items_for(&self, character: &str) -> bool {
        self.items.iter().any(|w| w.character == character)
    }

    /// Make every item of `character` that is waiting (not in flight) eligible now
    pub fn clear_pending_dispatch_for(&mut self, character: &str) -> usize {
        let mut count = 0;
        for item in self.items.iter_mut().filter(|w| w.character == character) {
            if item.status == WorkItemStatus::Pending && item.last_dispatch.is_some() {
                item.clear_dispatch();
                count += 1;
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_with(items: Vec<WorkItem>) -> Build {
        Build::new("Suit", "Collector", 1, items, Utc::now())
    }

    #[test]
    fn test_new_build_is_active() {
        let build = build_with(vec![WorkItem::new(1, "A", "Ring")]);
        assert_eq!(build.status, BuildStatus::Active);
        assert_eq!(build.remaining(), 1);
        assert!(!build.has_failed());
    }

    #[test]
    fn test_fail_keeps_first_reason() {
        let mut build = build_with(vec![]);
        build.fail("first", Utc::now());
        build.fail("second", Utc::now());
        assert_eq!(build.failure.as_deref(), Some("first"));
        assert_eq!(build.status, BuildStatus::Failed);
        assert!(build.end_time.is_some());
    }

    #[test]
    fn test_remove_item() {
        let mut build = build_with(vec![WorkItem::new(1, "A", "Ring"), WorkItem::new(2, "B", "Hat")]);
        assert!(build.remove_item(1).is_some());
        assert!(build.remove_item(1).is_none());
        assert_eq!(build.remaining(), 1);
        assert_eq!(build.items[0].id, 2);
    }

    #[test]
    fn test_required_characters() {
        let build = build_with(vec![
            WorkItem::new(1, "B", "Ring"),
            WorkItem::new(2, "A", "Hat"),
            WorkItem::new(3, "B", "Boots"),
        ]);
        let chars: Vec<_> = build.required_characters().into_iter().collect();
        assert_eq!(chars, vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn test_clear_pending_dispatch_skips_in_flight() {
        let now = Utc::now();
        let mut pending = WorkItem::new(1, "A", "Ring");
        pending.stamp(now);
        let mut in_flight = WorkItem::new(2, "A", "Hat");
        in_flight.mark_dispatched(now);
        let mut build = build_with(vec![pending, in_flight]);

        assert_eq!(build.clear_pending_dispatch_for("A"), 1);
        assert!(build.items[0].last_dispatch.is_none());
        assert_eq!(build.items[1].status, WorkItemStatus::InProgress);
        assert!(build.items[1].last_dispatch.is_some());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(BuildStatus::Completed.is_terminal());
        assert!(BuildStatus::Cancelled.is_terminal());
        assert!(BuildStatus::Failed.is_terminal());
        assert!(!BuildStatus::Active.is_terminal());
        assert!(!BuildStatus::Crashed.is_terminal());
    }
}
