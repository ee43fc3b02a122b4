//! WorkItem domain type
//!
//! One deliverable item owned by a character, produced by the parser chain and
//! dispatched by the coordinator.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Work item status
///
/// Transitions: `Pending -> InProgress -> {Completed | Pending (retry) | Failed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    /// Waiting to be dispatched
    #[default]
    Pending,
    /// Sent to a worker, no result yet
    InProgress,
    /// Delivered
    Completed,
    /// Gave up on this item
    Failed,
}

impl std::fmt::Display for WorkItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A single deliverable item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Unique within a build, assigned at parse time
    pub id: u32,

    /// Character currently holding the item
    pub character: String,

    /// Display name with any material prefix removed
    pub item_name: String,

    /// Material id, 0 = none
    pub material_id: u32,

    /// Armor set id, 0 = none
    pub set_id: u32,

    /// Required trait (spell) ids in definition order
    pub requirements: Vec<u32>,

    pub armor_level: u32,
    pub wield_level: u32,
    pub difficulty: u32,
    pub craft: u32,
    pub value: u32,
    pub burden: u32,

    /// When this item was last sent (or suppressed); None = never
    pub last_dispatch: Option<DateTime<Utc>>,

    /// Failures since the last success
    pub consecutive_errors: u32,

    /// Lifetime dispatch attempts
    pub attempts: u32,

    pub last_error: Option<String>,

    pub status: WorkItemStatus,
}

impl WorkItem {
    /// Create a pending work item with no numeric attributes
    pub fn new(id: u32, character: impl Into<String>, item_name: impl Into<String>) -> Self {
        Self {
            id,
            character: character.into(),
            item_name: item_name.into(),
            material_id: 0,
            set_id: 0,
            requirements: Vec::new(),
            armor_level: 0,
            wield_level: 0,
            difficulty: 0,
            craft: 0,
            value: 0,
            burden: 0,
            last_dispatch: None,
            consecutive_errors: 0,
            attempts: 0,
            last_error: None,
            status: WorkItemStatus::Pending,
        }
    }

    /// Whether the item is eligible for (re)dispatch at `now`
    ///
    /// An item is eligible when it is still outstanding and was not dispatched
    /// within the redelivery window.
    pub fn is_stale(&self, now: DateTime<Utc>, window: Duration) -> bool {
        if !self.is_outstanding() {
            return false;
        }
        match self.last_dispatch {
            None => true,
            Some(at) => at < now - window,
        }
    }

    /// Pending or in progress
    pub fn is_outstanding(&self) -> bool {
        matches!(self.status, WorkItemStatus::Pending | WorkItemStatus::InProgress)
    }

    /// Suppress dispatch of this item until the window elapses
    pub fn stamp(&mut self, now: DateTime<Utc>) {
        self.last_dispatch = Some(now);
    }

    /// Make the item immediately eligible again
    pub fn clear_dispatch(&mut self) {
        self.last_dispatch = None;
    }

    /// Record that the item was handed to a worker
    pub fn mark_dispatched(&mut self, now: DateTime<Utc>) {
        debug!(id = self.id, attempts = self.attempts, "WorkItem::mark_dispatched: called");
        self.status = WorkItemStatus::InProgress;
        self.last_dispatch = Some(now);
        self.attempts += 1;
    }

    /// Record a successful delivery
    pub fn mark_completed(&mut self) {
        debug!(id = self.id, "WorkItem::mark_completed: called");
        self.status = WorkItemStatus::Completed;
        self.consecutive_errors = 0;
        self.last_error = None;
    }

    /// Record a failed delivery and return the item to the pending pool
    ///
    /// Returns the consecutive error count after the failure.
    pub fn mark_failed_attempt(&mut self, error: impl Into<String>) -> u32 {
        self.consecutive_errors += 1;
        self.last_error = Some(error.into());
        self.status = WorkItemStatus::Pending;
        self.last_dispatch = None;
        debug!(
            id = self.id,
            consecutive_errors = self.consecutive_errors,
            "WorkItem::mark_failed_attempt: called"
        );
        self.consecutive_errors
    }

    /// Give up on this item
    pub fn mark_abandoned(&mut self) {
        self.status = WorkItemStatus::Failed;
    }

    /// Requirement ids sorted ascending, used for duplicate detection
    pub fn sorted_requirements(&self) -> Vec<u32> {
        let mut reqs = self.requirements.clone();
        reqs.sort_unstable();
        reqs
    }
}
