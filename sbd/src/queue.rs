//! Command queue
//!
//! Many producers (connection reader tasks) enqueue commands; the coordinator
//! is the only consumer and takes one command per iteration. Commands are
//! the only way build and worker state gets mutated.

use std::collections::VecDeque;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, error::TryRecvError};
use tracing::{debug, info};

use crate::domain::ConnectionId;
use crate::ipc::{ClientMessage, ServerMessage};

/// A queued unit of work for the coordinator
#[derive(Debug)]
pub struct Command {
    /// Connection the command came from
    pub connection: ConnectionId,
    pub op: Operation,
}

impl Command {
    pub fn new(connection: ConnectionId, op: Operation) -> Self {
        Self { connection, op }
    }

    /// Whether a cancel-all may drop this command
    pub fn is_clearable(&self) -> bool {
        self.op.is_clearable()
    }
}

/// What a command does
#[derive(Debug)]
pub enum Operation {
    /// Connection accepted; `outbound` feeds its writer task
    Connected { outbound: UnboundedSender<ServerMessage> },
    Disconnected,
    Ready {
        account: String,
        character: String,
        server: String,
        all_characters: Vec<String>,
    },
    WorkResult {
        work_id: u32,
        success: bool,
        error: Option<String>,
    },
    Initiate { suit_name: String },
    Terminate,
    Resume,
    Status,
    History { max_entries: usize },
    Abandon,
}

impl Operation {
    /// Registry bookkeeping and terminate survive a cancel-all
    pub fn is_clearable(&self) -> bool {
        !matches!(
            self,
            Self::Connected { .. } | Self::Disconnected | Self::Ready { .. } | Self::Terminate
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Disconnected => "disconnected",
            Self::Ready { .. } => "ready",
            Self::WorkResult { .. } => "work-result",
            Self::Initiate { .. } => "initiate",
            Self::Terminate => "terminate",
            Self::Resume => "resume",
            Self::Status => "status",
            Self::History { .. } => "history",
            Self::Abandon => "abandon",
        }
    }
}

impl From<ClientMessage> for Operation {
    fn from(message: ClientMessage) -> Self {
        match message {
            ClientMessage::ReadyForWork {
                account,
                character,
                server,
                all_characters,
            } => Self::Ready {
                account,
                character,
                server,
                all_characters,
            },
            ClientMessage::WorkResult { work_id, success, error } => Self::WorkResult { work_id, success, error },
            ClientMessage::InitiateBuild { suit_name } => Self::Initiate { suit_name },
            ClientMessage::TerminateBuild => Self::Terminate,
            ClientMessage::ResumeBuild => Self::Resume,
            ClientMessage::BuildStatus => Self::Status,
            ClientMessage::BuildHistory { max_entries } => Self::History { max_entries },
            ClientMessage::AbandonBuild => Self::Abandon,
        }
    }
}

/// Producer handle, cheap to clone
#[derive(Debug, Clone)]
pub struct CommandSender {
    tx: UnboundedSender<Command>,
}

impl CommandSender {
    /// Enqueue a command; false if the coordinator has gone away
    pub fn send(&self, command: Command) -> bool {
        self.tx.send(command).is_ok()
    }

    pub fn enqueue(&self, connection: ConnectionId, op: Operation) -> bool {
        self.send(Command::new(connection, op))
    }
}

/// Consumer side, owned by the coordinator
#[derive(Debug)]
pub struct CommandQueue {
    rx: UnboundedReceiver<Command>,
    pending: VecDeque<Command>,
}

/// Create a connected sender/queue pair
pub fn command_channel() -> (CommandSender, CommandQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        CommandSender { tx },
        CommandQueue {
            rx,
            pending: VecDeque::new(),
        },
    )
}

impl CommandQueue {
    /// Next command in FIFO order, if any
    ///
    /// A terminate arriving from producers clears every clearable command
    /// queued ahead of it.
    pub fn next(&mut self) -> Option<Command> {
        self.pump();
        self.pending.pop_front()
    }

    /// Number of commands waiting, counting ones not yet pulled from producers
    pub fn len(&mut self) -> usize {
        self.pump();
        self.pending.len()
    }

    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    /// Drop every clearable command, keeping the rest in order
    pub fn cancel_all(&mut self) -> usize {
        let before = self.pending.len();
        self.pending.retain(|c| !c.is_clearable());
        let dropped = before - self.pending.len();
        if dropped > 0 {
            info!(dropped, kept = self.pending.len(), "Cleared command queue");
        }
        dropped
    }

    fn pump(&mut self) {
        loop {
            match self.rx.try_recv() {
                Ok(command) => {
                    if matches!(command.op, Operation::Terminate) {
                        debug!(connection = command.connection, "CommandQueue::pump: terminate received");
                        self.cancel_all();
                    }
                    self.pending.push_back(command);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }
}
