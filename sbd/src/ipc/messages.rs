//! Wire message types for coordinator/worker communication
//!
//! Simple JSON-over-newline protocol. Each message is a single line of JSON followed by `\n`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::ConnectionId;
use crate::persistence::BuildHistoryEntry;

/// Machine readable reason attached to a rejection or failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    BuildInProgress,
    CrashedBuildPending,
    DefinitionNotFound,
    NoValidItems,
    MissingWorkers,
    NotRegistered,
    PersistenceUnavailable,
    NoBuild,
    NotResumable,
    AlreadyComplete,
    ItemErrorThreshold,
    TotalErrorThreshold,
    Internal,
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        write!(f, "{text}")
    }
}

/// Messages from a worker to the coordinator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Handshake: this connection is logged in as `character`
    ReadyForWork {
        account: String,
        character: String,
        #[serde(default)]
        server: String,
        /// Every character on the account, the active one included
        #[serde(default)]
        all_characters: Vec<String>,
    },

    /// Outcome of a `GiveItem`
    WorkResult {
        work_id: u32,
        success: bool,
        #[serde(default)]
        error: Option<String>,
    },

    InitiateBuild { suit_name: String },

    TerminateBuild,

    ResumeBuild,

    BuildStatus,

    BuildHistory {
        #[serde(default = "default_history_entries")]
        max_entries: usize,
    },

    AbandonBuild,
}

fn default_history_entries() -> usize {
    10
}

/// Messages from the coordinator to a worker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Sent once on connect
    Welcome { connection_id: ConnectionId },

    /// Hand one item to `deliver_to`
    GiveItem {
        work_id: u32,
        item_name: String,
        material_id: u32,
        set_id: u32,
        required_spells: Vec<u32>,
        deliver_to: String,
    },

    /// Log in as another character on the same account
    SwitchCharacter { character: String },

    /// Initiation result, or a failure notice for the initiator
    BuildResponse {
        accepted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<ReasonCode>,
        message: String,
    },

    StatusResponse(StatusReport),

    HistoryResponse { entries: Vec<BuildHistoryEntry> },

    ResumeResponse {
        can_resume: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<ReasonCode>,
        message: String,
        #[serde(default)]
        suit_name: Option<String>,
        #[serde(default)]
        remaining_items: usize,
        #[serde(default)]
        total_items: usize,
    },

    AbandonResponse {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<ReasonCode>,
        message: String,
    },
}

impl ServerMessage {
    pub fn accepted(message: impl Into<String>) -> Self {
        Self::BuildResponse {
            accepted: true,
            reason: None,
            message: message.into(),
        }
    }

    pub fn rejected(reason: ReasonCode, message: impl Into<String>) -> Self {
        Self::BuildResponse {
            accepted: false,
            reason: Some(reason),
            message: message.into(),
        }
    }

    pub fn resume_rejected(reason: ReasonCode, message: impl Into<String>) -> Self {
        Self::ResumeResponse {
            can_resume: false,
            reason: Some(reason),
            message: message.into(),
            suit_name: None,
            remaining_items: 0,
            total_items: 0,
        }
    }

    pub fn abandon_rejected(reason: ReasonCode, message: impl Into<String>) -> Self {
        Self::AbandonResponse {
            success: false,
            reason: Some(reason),
            message: message.into(),
        }
    }
}

/// Build status as reported to workers
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatusReport {
    pub has_active_build: bool,
    pub has_crashed_build: bool,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub suit_name: Option<String>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    pub elapsed_secs: i64,
    pub total_items: usize,
    pub completed_items: usize,
    pub pending_items: usize,
    pub failed_items: usize,
    pub progress_percentage: f64,
    pub message: String,
}
