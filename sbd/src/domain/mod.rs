//! Domain types for the suit builder
//!
//! - [`WorkItem`]: one deliverable item owned by a character
//! - [`Build`]: the in-memory active unit of work
//! - [`BuildStatus`] / [`WorkItemStatus`]: lifecycle states shared with persistence

mod build;
mod id;
mod work_item;

pub use build::{Build, BuildStatus};
pub use id::{generate_build_id, short_id};
pub use work_item::{WorkItem, WorkItemStatus};

/// Transport-assigned identifier of a worker connection
pub type ConnectionId = u64;
