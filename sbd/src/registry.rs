//! Worker registry
//!
//! Tracks which connection is which character. A connection exists from
//! accept to disconnect; it becomes a worker once it sends its ready
//! handshake. At most one worker per account is registered at a time.

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

use crate::domain::ConnectionId;
use crate::ipc::ServerMessage;

/// Errors delivering to a connection
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Unknown connection {0}")]
    UnknownConnection(ConnectionId),

    #[error("Connection {0} is closed")]
    Closed(ConnectionId),
}

/// Identity announced by a worker's ready handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub account: String,
    /// Character currently logged in
    pub character: String,
    pub server: String,
    /// Other characters on the account
    pub alternates: Vec<String>,
}

impl WorkerInfo {
    /// `all_characters` may include the primary; it is filtered out of the alternates
    pub fn new(
        account: impl Into<String>,
        character: impl Into<String>,
        server: impl Into<String>,
        all_characters: Vec<String>,
    ) -> Self {
        let character = character.into();
        let mut alternates: Vec<String> = Vec::new();
        for name in all_characters {
            let name = name.trim().to_string();
            if !name.is_empty() && name != character && !alternates.contains(&name) {
                alternates.push(name);
            }
        }
        Self {
            account: account.into(),
            character,
            server: server.into(),
            alternates,
        }
    }

    /// Primary character followed by alternates
    pub fn identities(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.character.as_str()).chain(self.alternates.iter().map(String::as_str))
    }
}

/// Connected workers and their outbound channels
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    connections: HashMap<ConnectionId, UnboundedSender<ServerMessage>>,
    workers: BTreeMap<ConnectionId, WorkerInfo>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new connection's outbound channel
    pub fn connect(&mut self, id: ConnectionId, outbound: UnboundedSender<ServerMessage>) {
        debug!(connection = id, "WorkerRegistry::connect: called");
        self.connections.insert(id, outbound);
    }

    /// Forget a connection and its worker entry
    pub fn disconnect(&mut self, id: ConnectionId) -> Option<WorkerInfo> {
        debug!(connection = id, "WorkerRegistry::disconnect: called");
        self.connections.remove(&id);
        self.workers.remove(&id)
    }

    /// Register the worker identity for a connection
    ///
    /// Any other connection registered under the same account is evicted from
    /// the worker table first. Returns the evicted connection ids.
    pub fn register(&mut self, id: ConnectionId, info: WorkerInfo) -> Vec<ConnectionId> {
        let evicted: Vec<ConnectionId> = self
            .workers
            .iter()
            .filter(|(other, w)| **other != id && w.account == info.account)
            .map(|(other, _)| *other)
            .collect();
        for other in &evicted {
            info!(connection = other, account = %info.account, "Evicting stale worker registration");
            self.workers.remove(other);
        }
        info!(
            connection = id,
            account = %info.account,
            character = %info.character,
            alternates = info.alternates.len(),
            "Worker ready"
        );
        self.workers.insert(id, info);
        evicted
    }

    pub fn is_connected(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn worker(&self, id: ConnectionId) -> Option<&WorkerInfo> {
        self.workers.get(&id)
    }

    /// Registered workers in connection id order
    pub fn workers(&self) -> impl Iterator<Item = (ConnectionId, &WorkerInfo)> {
        self.workers.iter().map(|(id, w)| (*id, w))
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Whether some registered worker owns `character` as primary or alternate
    pub fn has_character(&self, character: &str) -> bool {
        self.workers
            .values()
            .any(|w| w.identities().any(|name| name == character))
    }

    /// Case-insensitive variant of [`Self::has_character`]
    pub fn has_character_ignore_case(&self, character: &str) -> bool {
        self.find_character_ignore_case(character).is_some()
    }

    /// The registered spelling of `character`, ignoring case
    ///
    /// An exact match wins over a case-insensitive one.
    pub fn find_character_ignore_case(&self, character: &str) -> Option<&str> {
        let mut names = self.workers.values().flat_map(|w| w.identities());
        if self.has_character(character) {
            return names.find(|name| *name == character);
        }
        names.find(|name| name.eq_ignore_ascii_case(character))
    }

    /// Queue a message for a connection
    pub fn send(&self, id: ConnectionId, message: ServerMessage) -> Result<(), RegistryError> {
        let outbound = self.connections.get(&id).ok_or(RegistryError::UnknownConnection(id))?;
        outbound.send(message).map_err(|_| RegistryError::Closed(id))
    }
}
