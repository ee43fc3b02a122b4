//! Worker transport
//!
//! Newline-delimited JSON over TCP. Inbound messages become queued commands;
//! outbound messages are written by a per-connection writer task.

pub mod listener;
pub mod messages;

pub use listener::{bind, serve, spawn_connection};
pub use messages::{ClientMessage, ReasonCode, ServerMessage, StatusReport};
