//! Main coordinator implementation

use std::future::Future;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use eyre::{Context, Result};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::{Config, OrchestratorConfig};
use crate::domain::{Build, BuildStatus, ConnectionId};
use crate::ipc::{ReasonCode, ServerMessage};
use crate::parser::ParserChain;
use crate::persistence::{
    BuildEvent, BuildEventType, BuildHistoryEntry, BuildPersistenceManager, CrashReport, PersistentBuildState,
    check_for_crashed_build,
};
use crate::queue::{Command, CommandQueue, Operation};
use crate::registry::WorkerRegistry;
use crate::tables::Tables;

/// Single owner of all build and worker state
pub struct Coordinator {
    pub(super) config: OrchestratorConfig,
    pub(super) definitions_dir: PathBuf,
    pub(super) parser: ParserChain,
    pub(super) registry: WorkerRegistry,
    pub(super) queue: CommandQueue,
    /// None when persistence is disabled
    pub(super) persistence: Option<BuildPersistenceManager>,
    pub(super) build: Option<Build>,
    /// In-memory mirror of the durable snapshot for the active build
    pub(super) snapshot: Option<PersistentBuildState>,
}

impl Coordinator {
    pub fn new(
        config: OrchestratorConfig,
        definitions_dir: impl Into<PathBuf>,
        parser: ParserChain,
        queue: CommandQueue,
        persistence: Option<BuildPersistenceManager>,
    ) -> Self {
        let definitions_dir = definitions_dir.into();
        debug!(?definitions_dir, persistence = persistence.is_some(), "Coordinator::new: called");
        Self {
            config,
            definitions_dir,
            parser,
            registry: WorkerRegistry::new(),
            queue,
            persistence,
            build: None,
            snapshot: None,
        }
    }

    /// Build a coordinator from the application config
    ///
    /// A persistence directory that cannot be created is logged and the
    /// coordinator runs without crash recovery.
    pub fn from_config(config: &Config, queue: CommandQueue) -> Result<Self> {
        let tables = match &config.tables_path {
            Some(path) => Tables::load(path).context("Failed to load lookup tables")?,
            None => Tables::builtin(),
        };
        let parser = ParserChain::new(tables).context("Failed to compile definition grammars")?;

        let persistence = if config.persistence.enabled {
            match BuildPersistenceManager::new(&config.storage.data_dir, config.persistence.history_cap) {
                Ok(manager) => Some(manager),
                Err(e) => {
                    warn!(error = %e, "Persistence unavailable, running without crash recovery");
                    None
                }
            }
        } else {
            info!("Persistence disabled by config");
            None
        };

        Ok(Self::new(
            config.orchestrator.clone(),
            &config.storage.definitions_dir,
            parser,
            queue,
            persistence,
        ))
    }

    /// Startup crash check; a found build waits for resume or abandon
    pub fn recover(&mut self, now: DateTime<Utc>) -> Option<CrashReport> {
        let manager = self.persistence.as_ref()?;
        check_for_crashed_build(manager, now)
    }

    pub fn build(&self) -> Option<&Build> {
        self.build.as_ref()
    }

    pub fn snapshot(&self) -> Option<&PersistentBuildState> {
        self.snapshot.as_ref()
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn persistence(&self) -> Option<&BuildPersistenceManager> {
        self.persistence.as_ref()
    }

    pub fn definitions_dir(&self) -> &Path {
        &self.definitions_dir
    }

    /// One iteration: execute at most one queued command, then tick
    ///
    /// Returns whether a command was executed.
    pub fn step(&mut self, now: DateTime<Utc>) -> bool {
        let executed = match self.queue.next() {
            Some(command) => {
                self.execute(command, now);
                true
            }
            None => false,
        };
        self.tick(now);
        executed
    }

    /// Step on a fixed interval until `shutdown` resolves
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        info!(
            tick_ms = self.config.tick_interval_ms,
            definitions = %self.definitions_dir.display(),
            "Coordinator running"
        );
        let mut interval = tokio::time::interval(self.config.tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    self.step(Utc::now());
                }
            }
        }

        self.shutdown(Utc::now());
        Ok(())
    }

    /// Flush the event log; an active snapshot stays on disk for the next start
    pub fn shutdown(&mut self, now: DateTime<Utc>) {
        if let Some(build) = &self.build {
            warn!(
                build_id = %build.build_id,
                remaining = build.remaining(),
                "Shutting down with an active build; it will be resumable after restart"
            );
        }
        if let Some(manager) = &self.persistence {
            manager.close_current_log(now);
        }
        info!("Coordinator stopped");
    }

    fn execute(&mut self, command: Command, now: DateTime<Utc>) {
        let Command { connection, op } = command;
        let name = op.name();
        debug!(connection, op = name, "Coordinator::execute: called");

        let result = match op {
            Operation::Connected { outbound } => self.on_connected(connection, outbound, now),
            Operation::Disconnected => self.on_disconnected(connection, now),
            Operation::Ready {
                account,
                character,
                server,
                all_characters,
            } => self.on_ready(connection, account, character, server, all_characters, now),
            Operation::WorkResult { work_id, success, error } => {
                self.on_work_result(connection, work_id, success, error, now)
            }
            Operation::Initiate { suit_name } => self.initiate(connection, &suit_name, now),
            Operation::Terminate => self.terminate(connection, now),
            Operation::Resume => self.resume(connection, now),
            Operation::Status => self.status(connection, now),
            Operation::History { max_entries } => self.history(connection, max_entries),
            Operation::Abandon => self.abandon(connection, now),
        };

        if let Err(e) = result {
            error!(connection, op = name, error = %e, "Command failed");
            self.reply(
                connection,
                ServerMessage::rejected(ReasonCode::Internal, format!("Request '{name}' failed, see server log")),
            );
            self.record_error(format!("{name} command failed: {e}"), now);
        }
    }

    // === Shared helpers for actions and dispatch ===

    /// Send a reply; a closed or unknown connection is only logged
    pub(super) fn reply(&self, connection: ConnectionId, message: ServerMessage) {
        if let Err(e) = self.registry.send(connection, message) {
            warn!(connection, error = %e, "Failed to deliver reply");
        }
    }

    pub(super) fn log_event(&self, event: BuildEvent) {
        if let Some(manager) = &self.persistence {
            manager.log_event(&event);
        }
    }

    /// Write the snapshot through
    ///
    /// A failed write is only logged; the next state change rewrites the
    /// whole snapshot.
    pub(super) fn persist(&mut self, now: DateTime<Utc>) {
        let (Some(manager), Some(snapshot)) = (self.persistence.as_ref(), self.snapshot.as_mut()) else {
            return;
        };
        if let Err(e) = manager.save_active_state(snapshot, now) {
            error!(build_id = %snapshot.build_id, error = %e, "Failed to save build snapshot, retrying on next change");
        }
    }

    /// Count an error against the active build's total budget
    pub(super) fn record_error(&mut self, reason: String, now: DateTime<Utc>) {
        let Some(build) = self.build.as_mut() else {
            return;
        };
        if build.has_failed() {
            return;
        }
        build.total_errors += 1;
        let total = build.total_errors;
        if let Some(snapshot) = self.snapshot.as_mut() {
            snapshot.total_errors = total;
        }
        self.log_event(BuildEvent::new(BuildEventType::Error, &reason, now).with_details(format!("Total errors: {total}")));

        let limit = self.config.max_total_errors;
        if total >= limit {
            self.fail_build(
                ReasonCode::TotalErrorThreshold,
                format!("Build failed: {total} errors reached the limit of {limit}"),
                now,
            );
        } else {
            self.persist(now);
        }
    }

    /// Mark the build failed and notify its initiator
    ///
    /// The build is archived and detached on the next tick.
    pub(super) fn fail_build(&mut self, reason: ReasonCode, message: String, now: DateTime<Utc>) {
        let Some(build) = self.build.as_mut() else {
            return;
        };
        if build.has_failed() {
            return;
        }
        build.fail(&message, now);
        let initiator = build.initiator;
        error!(build_id = %build.build_id, %reason, "{message}");

        if let Some(snapshot) = self.snapshot.as_mut() {
            snapshot.status = BuildStatus::Failed;
            snapshot.end_time = Some(now);
        }
        self.persist(now);
        self.log_event(BuildEvent::new(BuildEventType::BuildFailed, &message, now));
        self.reply(initiator, ServerMessage::rejected(reason, message));
    }

    /// Notify the initiator and archive a build with no remaining items
    pub(super) fn complete_build(&mut self, now: DateTime<Utc>) {
        let Some(build) = self.build.as_ref() else {
            return;
        };
        let initiator = build.initiator;
        let suit_name = build.suit_name.clone();
        info!(build_id = %build.build_id, "Build complete: {suit_name}");

        self.log_event(BuildEvent::new(
            BuildEventType::BuildCompleted,
            format!("Build completed: {suit_name}"),
            now,
        ));
        self.reply(initiator, ServerMessage::accepted("Build completed"));
        self.finish_build(BuildStatus::Completed, now);
    }

    /// Detach the active build, recording history and clearing durable state
    pub(super) fn finish_build(&mut self, final_status: BuildStatus, now: DateTime<Utc>) -> Option<Build> {
        let mut build = self.build.take()?;
        let snapshot = self.snapshot.take();
        build.status = final_status;
        build.end_time.get_or_insert(now);

        if let Some(manager) = &self.persistence {
            if let Some(state) = snapshot {
                let entry = BuildHistoryEntry::from_state(&state, final_status, now, build.failure.clone())
                    .with_log_file(manager.current_log_path().as_deref());
                if let Err(e) = manager.add_history_entry(entry) {
                    warn!(build_id = %build.build_id, error = %e, "Failed to record build history");
                }
            }
            if let Err(e) = manager.clear_active_state() {
                warn!(build_id = %build.build_id, error = %e, "Failed to clear build snapshot");
            }
            manager.close_current_log(now);
        }

        info!(build_id = %build.build_id, status = %final_status, "Build finished");
        Some(build)
    }
}
