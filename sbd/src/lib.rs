//! Suit builder - coordinated item delivery across character workers
//!
//! A definition file lists items spread over many characters. The coordinator
//! parses it into work items and hands each one to the connected worker that
//! can log in as the owning character, which delivers it to a single
//! collection character.
//!
//! # Modules
//!
//! - [`parser`] - Definition line grammars, trait resolution, duplicate detection
//! - [`coordinator`] - Single-owner build state machine and dispatch tick
//! - [`queue`] - Command queue feeding the coordinator
//! - [`registry`] - Connected workers and their character identities
//! - [`persistence`] - Crash-safe snapshot, build history and event log
//! - [`ipc`] - JSON-over-TCP worker transport
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod cli;
pub mod config;
pub mod coordinator;
pub mod domain;
pub mod ipc;
pub mod parser;
pub mod persistence;
pub mod queue;
pub mod registry;
pub mod tables;

// Re-export commonly used types
pub use config::Config;
pub use coordinator::{Coordinator, DispatchPlan, plan_dispatch};
pub use domain::{Build, BuildStatus, ConnectionId, WorkItem, WorkItemStatus};
pub use ipc::{ClientMessage, ReasonCode, ServerMessage, StatusReport};
pub use parser::{ParseReport, ParserChain};
pub use persistence::{BuildHistoryEntry, BuildPersistenceManager, PersistentBuildState};
pub use queue::{Command, CommandQueue, CommandSender, Operation, command_channel};
pub use registry::{WorkerInfo, WorkerRegistry};
pub use tables::Tables;
