//! Build persistence and crash recovery
//!
//! Layout under the data directory:
//!
//! ```text
//! builds/
//!   active_build.json     snapshot of the active (or crashed) build
//!   build_history.json    bounded list of finished builds
//!   logs/                 one event log per build lifetime
//! ```

mod event_log;
mod manager;
mod recovery;
mod state;

use std::path::Path;

use thiserror::Error;

pub use event_log::{BuildEvent, BuildEventLog, BuildEventType};
pub use manager::{BuildPersistenceManager, DEFAULT_HISTORY_CAP};
pub use recovery::{CrashReport, check_for_crashed_build};
pub use state::{BuildHistoryEntry, BuildStatistics, PersistentBuildState, SCHEMA_VERSION};

/// Errors from the persistence layer
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Persistence unavailable: {0}")]
    Unavailable(String),
}

impl PersistenceError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}
