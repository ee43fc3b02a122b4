//! Per-build human readable event log
//!
//! One file per build lifetime under `<builds>/logs/`, named
//! `build_<yyyyMMdd>_<HHmmss>_<id8>.log`. Every line is flushed as written.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::short_id;

use super::PersistenceError;

const RULE_WIDTH: usize = 60;
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Kinds of events recorded in a build log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildEventType {
    BuildStarted,
    BuildResumed,
    BuildCompleted,
    BuildCancelled,
    BuildFailed,
    BuildCrashDetected,
    WorkItemAssigned,
    WorkItemCompleted,
    WorkItemFailed,
    WorkItemRetry,
    WorkItemSkippedOnDropoff,
    DuplicateItemDetected,
    ClientConnected,
    ClientDisconnected,
    CharacterSwitch,
    Error,
}

impl std::fmt::Display for BuildEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Padding flags apply to the variant name
        f.pad(&format!("{self:?}"))
    }
}

/// One log line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: BuildEventType,
    pub message: String,
    pub work_item_id: Option<u32>,
    pub character: Option<String>,
    pub details: Option<String>,
}

impl BuildEvent {
    pub fn new(event_type: BuildEventType, message: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            event_type,
            message: message.into(),
            work_item_id: None,
            character: None,
            details: None,
        }
    }

    pub fn with_item(mut self, id: u32) -> Self {
        self.work_item_id = Some(id);
        self
    }

    pub fn with_character(mut self, character: impl Into<String>) -> Self {
        self.character = Some(character.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Format as a log line without the trailing newline
    pub fn to_line(&self) -> String {
        let mut line = format!(
            "[{}] [{:<20}] {}",
            self.timestamp.format(TIMESTAMP_FORMAT),
            self.event_type,
            self.message
        );
        if let Some(id) = self.work_item_id {
            line.push_str(&format!(" | WorkItemId: {id}"));
        }
        if let Some(character) = &self.character {
            line.push_str(&format!(" | Character: {character}"));
        }
        if let Some(details) = &self.details {
            line.push_str(&format!(" | {details}"));
        }
        line
    }
}

/// Open log file for one build
#[derive(Debug)]
pub struct BuildEventLog {
    build_id: String,
    path: PathBuf,
    writer: BufWriter<File>,
}

impl BuildEventLog {
    /// Create the log file and write its header
    pub fn open(logs_dir: &Path, build_id: &str, now: DateTime<Utc>) -> Result<Self, PersistenceError> {
        fs::create_dir_all(logs_dir).map_err(|e| PersistenceError::io(logs_dir, e))?;
        let path = logs_dir.join(format!(
            "build_{}_{}.log",
            now.format("%Y%m%d_%H%M%S"),
            short_id(build_id)
        ));
        debug!(?path, %build_id, "BuildEventLog::open: called");

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| PersistenceError::io(&path, e))?;
        let mut log = Self {
            build_id: build_id.to_string(),
            path,
            writer: BufWriter::new(file),
        };
        log.write_raw(&format!("=== Build Log Started: {} ===", now.format(TIMESTAMP_FORMAT)))?;
        log.write_raw(&format!("Build ID: {build_id}"))?;
        log.write_raw(&"=".repeat(RULE_WIDTH))?;
        Ok(log)
    }

    pub fn build_id(&self) -> &str {
        &self.build_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event line
    pub fn write(&mut self, event: &BuildEvent) -> Result<(), PersistenceError> {
        self.write_raw(&event.to_line())
    }

    /// Write the footer and flush
    pub fn close(mut self, now: DateTime<Utc>) -> Result<(), PersistenceError> {
        debug!(build_id = %self.build_id, "BuildEventLog::close: called");
        self.write_raw(&"=".repeat(RULE_WIDTH))?;
        self.write_raw(&format!("=== Build Log Ended: {} ===", now.format(TIMESTAMP_FORMAT)))
    }

    fn write_raw(&mut self, line: &str) -> Result<(), PersistenceError> {
        writeln!(self.writer, "{line}").map_err(|e| PersistenceError::io(&self.path, e))?;
        self.writer.flush().map_err(|e| PersistenceError::io(&self.path, e))
    }
}
