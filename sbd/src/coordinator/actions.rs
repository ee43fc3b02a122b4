//! Command handlers
//!
//! Registry bookkeeping, delivery results and the build control requests
//! (initiate, terminate, resume, status, history, abandon).

use chrono::{DateTime, Utc};
use eyre::{Context, Result};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::domain::{Build, BuildStatus, ConnectionId, WorkItemStatus};
use crate::ipc::{ReasonCode, ServerMessage, StatusReport};
use crate::parser::definition_path;
use crate::persistence::{BuildEvent, BuildEventType, BuildHistoryEntry, PersistentBuildState};
use crate::registry::WorkerInfo;

use super::core::Coordinator;

const NOT_REGISTERED: &str = "Client not properly connected. Please wait for full initialization.";
const PERSISTENCE_DISABLED: &str = "Persistence is not enabled.";

impl Coordinator {
    // === Registry bookkeeping ===

    pub(super) fn on_connected(
        &mut self,
        connection: ConnectionId,
        outbound: UnboundedSender<ServerMessage>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        info!(connection, "Client connected");
        self.registry.connect(connection, outbound);
        self.reply(connection, ServerMessage::Welcome { connection_id: connection });
        if self.build.is_some() {
            self.log_event(
                BuildEvent::new(BuildEventType::ClientConnected, "Client connected", now)
                    .with_details(format!("Connection {connection}")),
            );
        }
        Ok(())
    }

    pub(super) fn on_disconnected(&mut self, connection: ConnectionId, now: DateTime<Utc>) -> Result<()> {
        let worker = self.registry.disconnect(connection);
        info!(connection, character = ?worker.as_ref().map(|w| &w.character), "Client disconnected");
        if let Some(build) = self.build.as_mut() {
            build.drained.remove(&connection);
            let mut event = BuildEvent::new(BuildEventType::ClientDisconnected, "Client disconnected", now)
                .with_details(format!("Connection {connection}"));
            if let Some(worker) = worker {
                event = event.with_character(worker.character);
            }
            self.log_event(event);
        }
        Ok(())
    }

    pub(super) fn on_ready(
        &mut self,
        connection: ConnectionId,
        account: String,
        character: String,
        server: String,
        all_characters: Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let info = WorkerInfo::new(account, character, server, all_characters);
        let character = info.character.clone();
        let evicted = self.registry.register(connection, info);

        if let Some(build) = self.build.as_mut() {
            // A new identity may have work that the old one did not
            build.drained.remove(&connection);
            for id in &evicted {
                build.drained.remove(id);
            }
            let cleared = build.clear_pending_dispatch_for(&character);
            if cleared > 0 {
                debug!(connection, %character, cleared, "on_ready: made waiting items eligible");
            }
            self.log_event(
                BuildEvent::new(BuildEventType::ClientConnected, format!("{character} ready for work"), now)
                    .with_character(&character)
                    .with_details(format!("Connection {connection}")),
            );
        }
        Ok(())
    }

    // === Delivery results ===

    pub(super) fn on_work_result(
        &mut self,
        connection: ConnectionId,
        work_id: u32,
        success: bool,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(build) = self.build.as_mut() else {
            debug!(connection, work_id, "on_work_result: no active build");
            return Ok(());
        };
        if build.has_failed() {
            debug!(connection, work_id, "on_work_result: build already failed");
            return Ok(());
        }

        if success {
            let Some(mut item) = build.remove_item(work_id) else {
                warn!(connection, work_id, "Result for unknown work item");
                return Ok(());
            };
            item.mark_completed();
            // The character is free again; its next item need not wait out the window
            build.clear_pending_dispatch_for(&item.character);
            let remaining = build.remaining();
            info!(work_id, character = %item.character, remaining, "Delivered {}", item.item_name);

            if let Some(snapshot) = self.snapshot.as_mut() {
                snapshot.mark_completed(work_id);
            }
            self.persist(now);
            self.log_event(
                BuildEvent::new(BuildEventType::WorkItemCompleted, format!("Delivered {}", item.item_name), now)
                    .with_item(work_id)
                    .with_character(&item.character)
                    .with_details(format!("{remaining} remaining")),
            );
            return Ok(());
        }

        let Some(item) = build.item_mut(work_id) else {
            warn!(connection, work_id, "Failure for unknown work item");
            return Ok(());
        };
        let error = error.unwrap_or_else(|| "unknown error".to_string());
        let consecutive = item.mark_failed_attempt(&error);
        let max_item = self.config.max_item_errors;
        if consecutive >= max_item {
            item.mark_abandoned();
        }
        let item = item.clone();
        build.total_errors += 1;
        let total = build.total_errors;
        warn!(work_id, character = %item.character, consecutive, total, %error, "Delivery failed");

        if let Some(snapshot) = self.snapshot.as_mut() {
            snapshot.sync_item(&item);
            snapshot.total_errors = total;
        }
        self.persist(now);
        self.log_event(
            BuildEvent::new(BuildEventType::WorkItemFailed, format!("Failed to deliver {}", item.item_name), now)
                .with_item(work_id)
                .with_character(&item.character)
                .with_details(format!("Consecutive errors: {consecutive}, total: {total}: {error}")),
        );

        let max_total = self.config.max_total_errors;
        if consecutive >= max_item {
            self.fail_build(
                ReasonCode::ItemErrorThreshold,
                format!(
                    "Build failed: item '{}' on {} failed {consecutive} times in a row: {error}",
                    item.item_name, item.character
                ),
                now,
            );
        } else if total >= max_total {
            self.fail_build(
                ReasonCode::TotalErrorThreshold,
                format!("Build failed: {total} errors reached the limit of {max_total}"),
                now,
            );
        }
        Ok(())
    }

    // === Build control ===

    pub(super) fn initiate(&mut self, connection: ConnectionId, suit_name: &str, now: DateTime<Utc>) -> Result<()> {
        info!(connection, %suit_name, "Build requested");
        let response = self.start_build(connection, suit_name, now);
        if let ServerMessage::BuildResponse {
            accepted: false,
            reason,
            message,
        } = &response
        {
            warn!(connection, ?reason, "Build rejected: {message}");
        }
        self.reply(connection, response);
        Ok(())
    }

    fn start_build(&mut self, connection: ConnectionId, suit_name: &str, now: DateTime<Utc>) -> ServerMessage {
        if self.build.is_some() {
            return ServerMessage::rejected(ReasonCode::BuildInProgress, "Build already in progress");
        }
        if let Some(state) = self.pending_snapshot() {
            return ServerMessage::rejected(
                ReasonCode::CrashedBuildPending,
                format!(
                    "Crashed build '{}' is pending. Resume or abandon it before starting another.",
                    state.suit_name
                ),
            );
        }
        let Some(initiator) = self.registry.worker(connection).cloned() else {
            return ServerMessage::rejected(ReasonCode::NotRegistered, NOT_REGISTERED);
        };

        let path = match definition_path(&self.definitions_dir, suit_name) {
            Some(path) if path.is_file() => path,
            Some(path) => {
                return ServerMessage::rejected(
                    ReasonCode::DefinitionNotFound,
                    format!("Suit not found {}", path.display()),
                );
            }
            None => {
                return ServerMessage::rejected(ReasonCode::DefinitionNotFound, format!("Suit not found {suit_name}"));
            }
        };
        let report = match self.parser.parse_file(&path) {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "Failed to read definition");
                return ServerMessage::rejected(
                    ReasonCode::DefinitionNotFound,
                    format!("Suit not found {}", path.display()),
                );
            }
        };
        if report.items.is_empty() {
            return ServerMessage::rejected(
                ReasonCode::NoValidItems,
                "Suit file was found but no valid items were found. Please make sure the format is correct",
            );
        }

        let drop_character = initiator.character.clone();
        let (skipped, items): (Vec<_>, Vec<_>) = report
            .items
            .into_iter()
            .partition(|w| w.character == drop_character);

        let mut missing: Vec<&str> = Vec::new();
        for item in &items {
            if !missing.contains(&item.character.as_str()) && !self.registry.has_character(&item.character) {
                missing.push(&item.character);
            }
        }
        if !missing.is_empty() {
            return ServerMessage::rejected(
                ReasonCode::MissingWorkers,
                format!("No client(s) running for {}", missing.join(",")),
            );
        }

        let mut parts = vec![
            format!("Starting Build [{suit_name}]"),
            format!("Processing {} item(s)", items.len()),
        ];
        if !skipped.is_empty() {
            parts.push(format!("{} already on dropoff char", skipped.len()));
        }
        if !report.duplicates.is_empty() {
            parts.push(format!("{} duplicate(s) removed", report.duplicates.len()));
        }
        if let Some(first) = report.failures.first() {
            parts.push(format!(
                "{} line(s) could not be parsed (first at line {})",
                report.failures.len(),
                first.line
            ));
        }

        let build = Build::new(suit_name, &drop_character, connection, items, now);
        let build_id = build.build_id.clone();
        let item_count = build.remaining();
        self.snapshot = Some(PersistentBuildState::from_live(&build, Some(&path)));
        self.build = Some(build);

        if let Some(manager) = &self.persistence
            && let Err(e) = manager.start_build_log(&build_id, now)
        {
            warn!(%build_id, error = %e, "Failed to open build log");
        }
        self.persist(now);

        self.log_event(
            BuildEvent::new(
                BuildEventType::BuildStarted,
                format!("Build started: {suit_name} with {item_count} items"),
                now,
            )
            .with_character(&drop_character),
        );
        for dup in &report.duplicates {
            self.log_event(
                BuildEvent::new(
                    BuildEventType::DuplicateItemDetected,
                    format!("Duplicate item removed: {}", dup.item_name),
                    now,
                )
                .with_item(dup.id)
                .with_character(&dup.character)
                .with_details(format!("Material: {}, Set: {}", dup.material_id, dup.set_id)),
            );
        }
        for item in &skipped {
            self.log_event(
                BuildEvent::new(
                    BuildEventType::WorkItemSkippedOnDropoff,
                    format!("Item skipped (already on dropoff char): {}", item.item_name),
                    now,
                )
                .with_item(item.id)
                .with_character(&item.character),
            );
        }

        info!(%build_id, %suit_name, items = item_count, drop = %drop_character, "Build started");
        ServerMessage::accepted(parts.join(" | "))
    }

    pub(super) fn terminate(&mut self, connection: ConnectionId, now: DateTime<Utc>) -> Result<()> {
        if self.build.is_none() {
            self.reply(connection, ServerMessage::rejected(ReasonCode::NoBuild, "No active build."));
            return Ok(());
        }
        info!(connection, "Build cancelled by user");
        self.log_event(BuildEvent::new(BuildEventType::BuildCancelled, "Build cancelled by user", now));
        if let Some(build) = self.finish_build(BuildStatus::Cancelled, now) {
            let message = format!("Build cancelled [{}]", build.suit_name);
            if build.initiator != connection {
                self.reply(build.initiator, ServerMessage::accepted(&message));
            }
            self.reply(connection, ServerMessage::accepted(message));
        }
        Ok(())
    }

    pub(super) fn resume(&mut self, connection: ConnectionId, now: DateTime<Utc>) -> Result<()> {
        let response = self.resume_build(connection, now)?;
        self.reply(connection, response);
        Ok(())
    }

    fn resume_build(&mut self, connection: ConnectionId, now: DateTime<Utc>) -> Result<ServerMessage> {
        if self.build.is_some() {
            return Ok(ServerMessage::resume_rejected(
                ReasonCode::BuildInProgress,
                "A build is already in progress. Cancel it first.",
            ));
        }
        let Some(manager) = self.persistence.as_ref() else {
            return Ok(ServerMessage::resume_rejected(
                ReasonCode::PersistenceUnavailable,
                PERSISTENCE_DISABLED,
            ));
        };
        let Some(mut state) = manager.load_active_state() else {
            return Ok(ServerMessage::resume_rejected(ReasonCode::NoBuild, "No build to resume."));
        };
        if !matches!(
            state.status,
            BuildStatus::Crashed | BuildStatus::Active | BuildStatus::Resuming
        ) {
            return Ok(ServerMessage::resume_rejected(
                ReasonCode::NotResumable,
                format!("Build status is {}, cannot resume.", state.status),
            ));
        }
        let Some(requester) = self.registry.worker(connection).cloned() else {
            return Ok(ServerMessage::resume_rejected(ReasonCode::NotRegistered, NOT_REGISTERED));
        };

        let remaining = state.remaining_items().count();
        if remaining == 0 {
            if let Err(e) = manager.clear_active_state() {
                warn!(error = %e, "Failed to clear completed snapshot");
            }
            return Ok(ServerMessage::resume_rejected(
                ReasonCode::AlreadyComplete,
                "Build was already complete. Cleared stale state.",
            ));
        }

        let mut missing: Vec<String> = Vec::new();
        for item in state.remaining_items() {
            let known = missing.iter().any(|m| m.eq_ignore_ascii_case(&item.character));
            if !known && !self.registry.has_character_ignore_case(&item.character) {
                missing.push(item.character.clone());
            }
        }
        if !missing.is_empty() {
            return Ok(ServerMessage::resume_rejected(
                ReasonCode::MissingWorkers,
                format!("Missing clients for characters: {}", missing.join(", ")),
            ));
        }

        // Dispatch matches names exactly, so adopt the connected spelling
        for item in state.work_items.iter_mut() {
            if let Some(name) = self.registry.find_character_ignore_case(&item.character)
                && name != item.character
            {
                debug!(from = %item.character, to = %name, "resume_build: normalized character");
                item.character = name.to_string();
            }
        }

        state.initiator = connection;
        state.drop_character = requester.character.clone();
        state.status = BuildStatus::Resuming;
        manager
            .save_active_state(&mut state, now)
            .context("Failed to mark snapshot as resuming")?;

        let build = state.to_live();
        state.reset_in_flight();
        state.status = BuildStatus::Active;
        state.resume_count += 1;

        let build_id = state.build_id.clone();
        let suit_name = state.suit_name.clone();
        let total = state.total_item_count;
        if let Err(e) = manager.start_build_log(&build_id, now) {
            warn!(%build_id, error = %e, "Failed to reopen build log");
        }
        self.build = Some(build);
        self.snapshot = Some(state);
        self.persist(now);
        self.log_event(
            BuildEvent::new(
                BuildEventType::BuildResumed,
                format!("Build resumed with {remaining} remaining items"),
                now,
            )
            .with_character(&requester.character),
        );

        info!(%build_id, %suit_name, remaining, "Build resumed");
        Ok(ServerMessage::ResumeResponse {
            can_resume: true,
            reason: None,
            message: format!("Resuming build '{suit_name}'"),
            suit_name: Some(suit_name),
            remaining_items: remaining,
            total_items: total,
        })
    }

    pub(super) fn status(&mut self, connection: ConnectionId, now: DateTime<Utc>) -> Result<()> {
        let report = self.status_report(now);
        self.reply(connection, ServerMessage::StatusResponse(report));
        Ok(())
    }

    /// Current status as seen by workers
    pub fn status_report(&self, now: DateTime<Utc>) -> StatusReport {
        if let Some(build) = &self.build {
            let mut report = StatusReport {
                has_active_build: true,
                status: Some(build.status.to_string()),
                suit_name: Some(build.suit_name.clone()),
                start_time: Some(build.start_time),
                elapsed_secs: (now - build.start_time).num_seconds().max(0),
                total_items: build.remaining(),
                pending_items: build.remaining(),
                ..Default::default()
            };
            if let Some(stats) = self.snapshot.as_ref().map(|s| s.statistics(now)) {
                report.total_items = stats.total_items;
                report.completed_items = stats.completed_items;
                report.pending_items = stats.pending_items + stats.in_progress_items;
                report.failed_items = stats.failed_items;
                report.progress_percentage = stats.progress_percentage;
            }
            report.message = format!(
                "Build '{}' in progress: {}/{} items ({:.1}%)",
                build.suit_name, report.completed_items, report.total_items, report.progress_percentage
            );
            return report;
        }

        if let Some(state) = self.pending_snapshot() {
            let until = state.last_save.unwrap_or(now);
            let stats = state.statistics(until);
            return StatusReport {
                has_active_build: false,
                has_crashed_build: true,
                status: Some(BuildStatus::Crashed.to_string()),
                suit_name: Some(state.suit_name.clone()),
                start_time: Some(state.start_time),
                elapsed_secs: stats.elapsed_secs,
                total_items: stats.total_items,
                completed_items: stats.completed_items,
                pending_items: stats.pending_items + stats.in_progress_items,
                failed_items: stats.failed_items,
                progress_percentage: stats.progress_percentage,
                message: format!(
                    "Crashed build '{}' found: {}/{} items completed. Use resume to continue or abandon to discard.",
                    state.suit_name, stats.completed_items, stats.total_items
                ),
            };
        }

        StatusReport {
            message: "No active build.".to_string(),
            ..Default::default()
        }
    }

    pub(super) fn history(&mut self, connection: ConnectionId, max_entries: usize) -> Result<()> {
        let entries = match &self.persistence {
            Some(manager) => manager.get_recent_history(max_entries),
            None => Vec::new(),
        };
        debug!(connection, max_entries, found = entries.len(), "history: called");
        self.reply(connection, ServerMessage::HistoryResponse { entries });
        Ok(())
    }

    pub(super) fn abandon(&mut self, connection: ConnectionId, now: DateTime<Utc>) -> Result<()> {
        let response = self.abandon_build(now);
        self.reply(connection, response);
        Ok(())
    }

    fn abandon_build(&mut self, now: DateTime<Utc>) -> ServerMessage {
        if self.build.is_some() {
            return ServerMessage::abandon_rejected(
                ReasonCode::BuildInProgress,
                "Cannot abandon an active build. Cancel it first.",
            );
        }
        let Some(manager) = self.persistence.as_ref() else {
            return ServerMessage::abandon_rejected(ReasonCode::PersistenceUnavailable, PERSISTENCE_DISABLED);
        };
        let Some(state) = manager.load_active_state() else {
            return ServerMessage::abandon_rejected(ReasonCode::NoBuild, "No crashed build to abandon.");
        };

        if let Err(e) = manager.start_build_log(&state.build_id, now) {
            warn!(build_id = %state.build_id, error = %e, "Failed to reopen build log");
        }
        manager.log_event(&BuildEvent::new(BuildEventType::BuildCancelled, "Build abandoned by user", now));
        let entry = BuildHistoryEntry::from_state(&state, BuildStatus::Cancelled, now, None)
            .with_log_file(manager.current_log_path().as_deref());
        if let Err(e) = manager.add_history_entry(entry) {
            warn!(build_id = %state.build_id, error = %e, "Failed to record build history");
        }
        if let Err(e) = manager.clear_active_state() {
            warn!(build_id = %state.build_id, error = %e, "Failed to clear build snapshot");
        }
        manager.close_current_log(now);

        let completed = state.count(WorkItemStatus::Completed);
        info!(build_id = %state.build_id, "Build abandoned");
        ServerMessage::AbandonResponse {
            success: true,
            reason: None,
            message: format!(
                "Abandoned build '{}' ({completed}/{} items were completed)",
                state.suit_name, state.total_item_count
            ),
        }
    }

    /// A snapshot on disk with no build in memory: crashed, or not yet reclassified
    fn pending_snapshot(&self) -> Option<PersistentBuildState> {
        if self.build.is_some() {
            return None;
        }
        self.persistence
            .as_ref()?
            .load_active_state()
            .filter(|s| matches!(s.status, BuildStatus::Crashed | BuildStatus::Active | BuildStatus::Resuming))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::parser::ParserChain;
    use crate::persistence::BuildPersistenceManager;
    use crate::queue::command_channel;
    use crate::tables::Tables;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z").unwrap().with_timezone(&Utc)
    }

    fn coordinator(data: Option<&TempDir>) -> Coordinator {
        let (_tx, queue) = command_channel();
        let persistence = data.map(|d| BuildPersistenceManager::new(d.path(), 10).unwrap());
        Coordinator::new(
            OrchestratorConfig::default(),
            "/nonexistent",
            ParserChain::new(Tables::builtin()).unwrap(),
            queue,
            persistence,
        )
    }

    #[test]
    fn test_status_without_build() {
        let report = coordinator(None).status_report(t0());
        assert!(!report.has_active_build);
        assert!(!report.has_crashed_build);
        assert_eq!(report.message, "No active build.");
    }

    #[test]
    fn test_crashed_snapshot_reported_with_elapsed_to_last_save() {
        let data = TempDir::new().unwrap();
        let mut c = coordinator(Some(&data));
        let build = Build::new("Suit", "Collector", 1, vec![crate::domain::WorkItem::new(1, "A", "Ring")], t0());
        let mut state = PersistentBuildState::from_live(&build, None);
        state.status = BuildStatus::Crashed;
        let saved_at = t0() + chrono::Duration::seconds(40);
        c.persistence().unwrap().save_active_state(&mut state, saved_at).unwrap();

        let report = c.status_report(t0() + chrono::Duration::hours(3));
        assert!(report.has_crashed_build);
        assert_eq!(report.status.as_deref(), Some("Crashed"));
        assert_eq!(report.elapsed_secs, 40);
        assert_eq!(report.total_items, 1);
        assert!(report.message.starts_with("Crashed build 'Suit' found: 0/1"));

        // Blocks new builds until resolved
        let (tx, mut rx) = mpsc::unbounded_channel();
        c.on_connected(1, tx, t0()).unwrap();
        c.on_ready(1, "acct".into(), "Collector".into(), String::new(), vec![], t0()).unwrap();
        c.initiate(1, "Suit", t0()).unwrap();
        let mut last = None;
        while let Ok(m) = rx.try_recv() {
            last = Some(m);
        }
        assert!(matches!(
            last,
            Some(ServerMessage::BuildResponse {
                accepted: false,
                reason: Some(ReasonCode::CrashedBuildPending),
                ..
            })
        ));
    }

    #[test]
    fn test_result_without_build_is_ignored() {
        let mut c = coordinator(None);
        c.on_work_result(1, 7, true, None, t0()).unwrap();
        c.on_work_result(1, 7, false, Some("x".into()), t0()).unwrap();
        assert!(c.build().is_none());
    }

    #[test]
    fn test_abandon_rejected_without_persistence() {
        let mut c = coordinator(None);
        assert_eq!(
            c.abandon_build(t0()),
            ServerMessage::abandon_rejected(ReasonCode::PersistenceUnavailable, PERSISTENCE_DISABLED)
        );
    }
}
