mod common;

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::watch;

use chatwatch::broadcast::PeerRegistry;
use chatwatch::client::MessagingClient;
use chatwatch::listener::SocketServer;
use chatwatch_protocol::{Call, SocketEvent};

use common::{FakeClient, Sent, eventually, wait_for_peers};

fn call_event(n: i64) -> SocketEvent {
    SocketEvent::Call(Call {
        id: Some(n),
        timestamp: 1_700_000_000 + n,
        call_id: format!("C{n}"),
        caller_jid: "4477@s.whatsapp.net".to_string(),
        caller_name: "Kim".to_string(),
        is_group: false,
        group_jid: None,
        group_name: None,
    })
}

struct Harness {
    _dir: tempfile::TempDir,
    path: std::path::PathBuf,
    registry: PeerRegistry,
    client: Arc<FakeClient>,
    stop: watch::Sender<bool>,
    server: tokio::task::JoinHandle<()>,
}

async fn start(client: FakeClient) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run").join("chatwatch.sock");
    let registry = PeerRegistry::default();
    let client = Arc::new(client);
    let dyn_client: Arc<dyn MessagingClient> = client.clone();

    let server = SocketServer::bind(&path, registry.clone(), dyn_client).unwrap();
    let (stop, stop_rx) = watch::channel(false);
    let server = tokio::spawn(server.run(stop_rx));

    Harness {
        _dir: dir,
        path,
        registry,
        client,
        stop,
        server,
    }
}

#[tokio::test]
async fn connected_clients_receive_published_events() {
    let h = start(FakeClient::new()).await;

    let mut peers = Vec::new();
    for _ in 0..2 {
        let stream = UnixStream::connect(&h.path).await.unwrap();
        peers.push(BufReader::new(stream).lines());
    }
    wait_for_peers(&h.registry, 2).await;

    assert_eq!(h.registry.publish(&call_event(1)).await, 2);
    assert_eq!(h.registry.publish(&call_event(2)).await, 2);

    for lines in peers.iter_mut() {
        for expected in [call_event(1), call_event(2)] {
            let line = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            let event: SocketEvent = serde_json::from_str(&line).unwrap();
            assert_eq!(event, expected);
        }
    }
}

#[tokio::test]
async fn socket_is_private_and_removed_at_shutdown() {
    let h = start(FakeClient::new()).await;
    let mode = std::fs::metadata(&h.path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);

    h.stop.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), h.server)
        .await
        .unwrap()
        .unwrap();
    assert!(!h.path.exists());
}

#[tokio::test]
async fn stale_socket_file_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chatwatch.sock");
    std::fs::write(&path, b"stale").unwrap();

    let client: Arc<dyn MessagingClient> = Arc::new(FakeClient::new());
    let server = SocketServer::bind(&path, PeerRegistry::default(), client).unwrap();
    assert_eq!(server.path(), path.as_path());
    UnixStream::connect(&path).await.unwrap();
}

#[tokio::test]
async fn commands_are_forwarded_and_bad_lines_skipped() {
    let h = start(FakeClient::new()).await;
    let mut stream = UnixStream::connect(&h.path).await.unwrap();

    let lines = concat!(
        "\n",
        "this is not json\n",
        r#"{"action":"reply","chat_jid":"a@b@c","message_id":"X","sender_jid":"1@s.whatsapp.net","text":"lost"}"#,
        "\n",
        r#"{"action":"forward","chat_jid":"4477@s.whatsapp.net"}"#,
        "\n",
        r#"{"action":"send","chat_jid":"4477@s.whatsapp.net","text":"hi"}"#,
        "\n",
        r#"{"action":"reply","chat_jid":"99@g.us","message_id":"ABC","sender_jid":"4477@s.whatsapp.net","text":"ok"}"#,
        "\n",
    );
    stream.write_all(lines.as_bytes()).await.unwrap();

    let client = Arc::clone(&h.client);
    assert!(eventually(|| client.sent().len() == 2).await);
    assert_eq!(
        h.client.sent(),
        vec![
            Sent::Text {
                chat: "4477@s.whatsapp.net".to_string(),
                text: "hi".to_string(),
            },
            Sent::Reply {
                chat: "99@g.us".to_string(),
                quoted_id: "ABC".to_string(),
                quoted_sender: "4477@s.whatsapp.net".to_string(),
                text: "ok".to_string(),
            },
        ]
    );
    // The connection survived every bad line.
    assert_eq!(h.registry.len().await, 1);
}

#[tokio::test]
async fn send_failure_keeps_connection_open() {
    let h = start(FakeClient::new().failing_sends()).await;
    let mut stream = UnixStream::connect(&h.path).await.unwrap();
    wait_for_peers(&h.registry, 1).await;

    stream
        .write_all(b"{\"action\":\"send\",\"chat_jid\":\"4477@s.whatsapp.net\",\"text\":\"hi\"}\n")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(h.client.sent().is_empty());
    assert_eq!(h.registry.publish(&call_event(1)).await, 1);
}

#[tokio::test]
async fn disconnecting_client_is_unregistered() {
    let h = start(FakeClient::new()).await;
    let stream = UnixStream::connect(&h.path).await.unwrap();
    wait_for_peers(&h.registry, 1).await;

    drop(stream);
    wait_for_peers(&h.registry, 0).await;
}

#[tokio::test]
async fn non_utf8_line_is_skipped_without_dropping_the_peer() {
    let h = start(FakeClient::new()).await;
    let mut stream = UnixStream::connect(&h.path).await.unwrap();
    wait_for_peers(&h.registry, 1).await;

    stream.write_all(b"\xff\xfe garbage\n").await.unwrap();
    stream
        .write_all(b"{\"action\":\"send\",\"chat_jid\":\"4477@s.whatsapp.net\",\"text\":\"after\"}\n")
        .await
        .unwrap();

    let client = Arc::clone(&h.client);
    assert!(eventually(|| client.sent().len() == 1).await);
    assert_eq!(
        h.client.sent(),
        vec![Sent::Text {
            chat: "4477@s.whatsapp.net".to_string(),
            text: "after".to_string(),
        }]
    );
    assert_eq!(h.registry.len().await, 1);
}
