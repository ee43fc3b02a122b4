//! End to end over TCP: listener, command queue and coordinator loop

use std::net::SocketAddr;
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::oneshot;

use suitbuilder::config::OrchestratorConfig;
use suitbuilder::coordinator::Coordinator;
use suitbuilder::ipc::{self, ClientMessage, ServerMessage};
use suitbuilder::parser::ParserChain;
use suitbuilder::persistence::BuildPersistenceManager;
use suitbuilder::queue::command_channel;
use suitbuilder::tables::Tables;

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer,
        }
    }

    async fn send(&mut self, message: &ClientMessage) {
        let mut json = serde_json::to_string(message).unwrap();
        json.push('\n');
        self.writer.write_all(json.as_bytes()).await.unwrap();
    }

    async fn recv(&mut self) -> ServerMessage {
        let mut line = String::new();
        tokio::time::timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for message")
            .unwrap();
        serde_json::from_str(line.trim()).unwrap()
    }

    async fn ready(&mut self, account: &str, character: &str) {
        self.send(&ClientMessage::ReadyForWork {
            account: account.to_string(),
            character: character.to_string(),
            server: "Coldeve".to_string(),
            all_characters: vec![character.to_string()],
        })
        .await;
    }
}

#[tokio::test]
async fn test_worker_session_over_tcp() {
    let defs = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    std::fs::write(
        defs.path().join("Suit.alb"),
        "Alice, Golden Ring, AL 12, Epic Willpower, Wield Lvl 0, Diff 10, BU 5\n",
    )
    .unwrap();

    let (commands, queue) = command_channel();
    let config = OrchestratorConfig {
        tick_interval_ms: 10,
        ..OrchestratorConfig::default()
    };
    let coordinator = Coordinator::new(
        config,
        defs.path(),
        ParserChain::new(Tables::builtin()).unwrap(),
        queue,
        Some(BuildPersistenceManager::new(data.path(), 100).unwrap()),
    );

    let listener = ipc::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(ipc::serve(listener, commands));
    let (stop, stopped) = oneshot::channel::<()>();
    let running = tokio::spawn(coordinator.run(async move {
        let _ = stopped.await;
    }));

    let mut collector = Client::connect(addr).await;
    assert!(matches!(collector.recv().await, ServerMessage::Welcome { .. }));
    collector.ready("acct-collector", "Collector").await;

    let mut alice = Client::connect(addr).await;
    assert!(matches!(alice.recv().await, ServerMessage::Welcome { .. }));
    alice.ready("acct-alice", "Alice").await;

    // A status round trip on each connection proves its handshake was executed
    for client in [&mut collector, &mut alice] {
        client.send(&ClientMessage::BuildStatus).await;
        match client.recv().await {
            ServerMessage::StatusResponse(report) => assert_eq!(report.message, "No active build."),
            other => panic!("expected StatusResponse, got {other:?}"),
        }
    }

    collector
        .send(&ClientMessage::InitiateBuild {
            suit_name: "Suit".to_string(),
        })
        .await;
    match collector.recv().await {
        ServerMessage::BuildResponse { accepted, message, .. } => {
            assert!(accepted, "{message}");
            assert_eq!(message, "Starting Build [Suit] | Processing 1 item(s)");
        }
        other => panic!("expected BuildResponse, got {other:?}"),
    }

    let work_id = match alice.recv().await {
        ServerMessage::GiveItem {
            work_id,
            item_name,
            deliver_to,
            ..
        } => {
            assert_eq!(item_name, "Golden Ring");
            assert_eq!(deliver_to, "Collector");
            work_id
        }
        other => panic!("expected GiveItem, got {other:?}"),
    };

    // Garbage on the wire is skipped without closing the connection
    alice.writer.write_all(b"{not json}\n").await.unwrap();
    alice
        .send(&ClientMessage::WorkResult {
            work_id,
            success: true,
            error: None,
        })
        .await;

    match collector.recv().await {
        ServerMessage::BuildResponse { accepted, message, .. } => {
            assert!(accepted);
            assert_eq!(message, "Build completed");
        }
        other => panic!("expected BuildResponse, got {other:?}"),
    }

    stop.send(()).unwrap();
    running.await.unwrap().unwrap();

    let manager = BuildPersistenceManager::open_existing(data.path(), 100).unwrap();
    let history = manager.load_history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].completed_items, 1);
}
