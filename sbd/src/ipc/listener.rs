//! TCP listener for worker connections
//!
//! Each accepted connection gets its own id and two tasks: a reader that
//! turns inbound lines into queued commands, and a writer that drains the
//! connection's outbound channel. Neither task touches build state.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use eyre::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, info, warn};

use crate::domain::ConnectionId;
use crate::queue::{CommandSender, Operation};

use super::messages::{ClientMessage, ServerMessage};

/// Inbound lines longer than this are dropped without being buffered
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Bind the worker listener
pub async fn bind(addr: &str) -> Result<TcpListener> {
    debug!(%addr, "bind: called");
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind listener on {addr}"))?;
    info!(addr = %listener.local_addr().context("Failed to read local address")?, "Listening for workers");
    Ok(listener)
}

/// Accept connections forever, feeding `commands`
///
/// Returns only when accepting fails.
pub async fn serve(listener: TcpListener, commands: CommandSender) -> Result<()> {
    let next_id = Arc::new(AtomicU64::new(1));
    loop {
        let (stream, peer) = listener.accept().await.context("Failed to accept connection")?;
        let id = next_id.fetch_add(1, Ordering::Relaxed);
        info!(connection = id, %peer, "Accepted connection");
        spawn_connection(id, stream, commands.clone());
    }
}

/// Wire one connection into the command queue
pub fn spawn_connection(id: ConnectionId, stream: TcpStream, commands: CommandSender) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(connection = id, error = %e, "spawn_connection: set_nodelay failed");
    }
    let (read_half, write_half) = stream.into_split();
    let (outbound, rx) = mpsc::unbounded_channel();

    if !commands.enqueue(id, Operation::Connected { outbound }) {
        warn!(connection = id, "Coordinator gone, dropping connection");
        return;
    }
    tokio::spawn(write_loop(id, write_half, rx));
    tokio::spawn(read_loop(id, read_half, commands));
}

async fn read_loop(id: ConnectionId, read_half: OwnedReadHalf, commands: CommandSender) {
    let mut reader = BufReader::new(read_half);
    let mut line = Vec::new();

    loop {
        line.clear();
        let limit = MAX_MESSAGE_SIZE as u64 + 1;
        match (&mut reader).take(limit).read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(n) if n > MAX_MESSAGE_SIZE => {
                warn!(connection = id, bytes = n, "Dropping oversized message");
                if line.last() != Some(&b'\n') {
                    match skip_line(&mut reader).await {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) => {
                            warn!(connection = id, error = %e, "Read failed");
                            break;
                        }
                    }
                }
            }
            Ok(_) => {
                let Ok(text) = std::str::from_utf8(&line) else {
                    warn!(connection = id, "Skipping message that is not UTF-8");
                    continue;
                };
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }
                match serde_json::from_str::<ClientMessage>(text) {
                    Ok(message) => {
                        debug!(connection = id, ?message, "read_loop: received");
                        if !commands.enqueue(id, Operation::from(message)) {
                            break;
                        }
                    }
                    Err(e) => warn!(connection = id, error = %e, "Skipping malformed message"),
                }
            }
            Err(e) => {
                warn!(connection = id, error = %e, "Read failed");
                break;
            }
        }
    }

    info!(connection = id, "Connection closed");
    commands.enqueue(id, Operation::Disconnected);
}

/// Discard buffered input through the next newline
///
/// Returns false when the peer closed before sending one.
async fn skip_line(reader: &mut BufReader<OwnedReadHalf>) -> std::io::Result<bool> {
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(false);
        }
        match available.iter().position(|&b| b == b'\n') {
            Some(i) => {
                reader.consume(i + 1);
                return Ok(true);
            }
            None => {
                let len = available.len();
                reader.consume(len);
            }
        }
    }
}

async fn write_loop(id: ConnectionId, mut write_half: OwnedWriteHalf, mut rx: UnboundedReceiver<ServerMessage>) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = write_message(&mut write_half, &message).await {
            warn!(connection = id, error = %e, "Write failed, closing writer");
            break;
        }
    }
    debug!(connection = id, "write_loop: finished");
}

async fn write_message(write_half: &mut OwnedWriteHalf, message: &ServerMessage) -> Result<()> {
    let mut json = serde_json::to_string(message).context("Failed to serialize message")?;
    json.push('\n');
    write_half
        .write_all(json.as_bytes())
        .await
        .context("Failed to write message")?;
    write_half.flush().await.context("Failed to flush message")?;
    Ok(())
}
