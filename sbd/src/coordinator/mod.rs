//! Build coordinator
//!
//! Owns the single active build, the worker registry and the command queue.
//! Every iteration executes at most one queued command and then runs one
//! dispatch tick:
//! - **Commands:** worker handshakes, delivery results and build control
//! - **Tick:** match remaining work to connected workers, detect completion
//!   and archive failed builds

mod actions;
mod core;
mod dispatch;

pub use self::core::Coordinator;
pub use dispatch::{DispatchPlan, plan_dispatch};
