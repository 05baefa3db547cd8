//! Messaging client backed by an external bridge process.
//!
//! The bridge is spawned with piped stdio. One task writes [`BridgeRequest`]
//! lines to its stdin; another reads its stdout, routing `response` lines to
//! the pending request and queueing everything else as [`ClientEvent`]s for a
//! forwarder that feeds the session channel.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};

use chatwatch_protocol::Jid;
use chatwatch_protocol::bridge::{
    BridgeCall, BridgeEvent, BridgeRequest, BridgeResponse, ContactResult, GroupInfoResult,
    MuteState, OwnIdentitiesResult, StatusResult,
};

use super::{ClientError, ClientEvent, ClientResult, ContactInfo, MessagingClient, OwnIdentities};

/// Capacity of the event channel handed to the session controller. Events
/// beyond it wait in an unbounded backlog behind the stdout reader.
const EVENT_BUFFER_SIZE: usize = 256;

/// Capacity of the outbound request queue.
const REQUEST_BUFFER_SIZE: usize = 64;

/// Upper bound on the `disconnect` request during shutdown.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// How long `disconnect` waits for the bridge to exit before killing it.
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// Bridge process settings (`[bridge]` config section).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Executable implementing the bridge protocol.
    pub command: String,
    /// Extra arguments.
    pub args: Vec<String>,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            command: "chatwatch-bridge".to_string(),
            args: Vec::new(),
            request_timeout_secs: 30,
        }
    }
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<BridgeResponse>>>>;

/// [`MessagingClient`] speaking the bridge protocol.
pub struct BridgeClient {
    requests: mpsc::Sender<BridgeRequest>,
    pending: PendingMap,
    next_id: AtomicU64,
    request_timeout: Duration,
    identities: Arc<RwLock<Option<OwnIdentities>>>,
    child: Mutex<Option<Child>>,
}

impl BridgeClient {
    /// Spawn the bridge process and attach to its stdio.
    pub fn spawn(config: &BridgeConfig) -> std::io::Result<(Arc<Self>, mpsc::Receiver<ClientEvent>)> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("bridge stdin is not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("bridge stdout is not piped"))?;

        info!(
            "Spawned bridge {} (pid {:?})",
            config.command,
            child.id()
        );

        Ok(Self::build(
            stdout,
            stdin,
            Duration::from_secs(config.request_timeout_secs),
            Some(child),
        ))
    }

    /// Attach to a bridge reachable through an arbitrary reader/writer pair.
    pub fn attach<R, W>(
        reader: R,
        writer: W,
        request_timeout: Duration,
    ) -> (Arc<Self>, mpsc::Receiver<ClientEvent>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::build(reader, writer, request_timeout, None)
    }

    fn build<R, W>(
        reader: R,
        writer: W,
        request_timeout: Duration,
        child: Option<Child>,
    ) -> (Arc<Self>, mpsc::Receiver<ClientEvent>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (req_tx, req_rx) = mpsc::channel(REQUEST_BUFFER_SIZE);
        let (evt_tx, evt_rx) = mpsc::channel(EVENT_BUFFER_SIZE);
        let (backlog_tx, backlog_rx) = mpsc::unbounded_channel();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let identities = Arc::new(RwLock::new(None));

        tokio::spawn(write_requests(writer, req_rx));
        tokio::spawn(forward_events(backlog_rx, evt_tx));
        tokio::spawn(read_events(
            reader,
            backlog_tx,
            Arc::clone(&pending),
            Arc::clone(&identities),
        ));

        let client = Arc::new(Self {
            requests: req_tx,
            pending,
            next_id: AtomicU64::new(1),
            request_timeout,
            identities,
            child: Mutex::new(child),
        });
        (client, evt_rx)
    }

    async fn call(&self, call: BridgeCall) -> ClientResult<serde_json::Value> {
        self.call_within(call, self.request_timeout).await
    }

    async fn call_within(
        &self,
        call: BridgeCall,
        timeout: Duration,
    ) -> ClientResult<serde_json::Value> {
        let method = call.method();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if self.requests.send(BridgeRequest { id, call }).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(ClientError::Closed);
        }

        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(ClientError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                return Err(ClientError::Timeout {
                    method,
                    secs: timeout.as_secs(),
                });
            }
        };

        match response.error {
            Some(message) => Err(ClientError::Rejected { method, message }),
            None => Ok(response.result),
        }
    }

    async fn call_as<T: DeserializeOwned>(&self, call: BridgeCall) -> ClientResult<T> {
        let method = call.method();
        let value = self.call(call).await?;
        serde_json::from_value(value).map_err(|source| ClientError::Decode { method, source })
    }
}

async fn write_requests<W>(mut writer: W, mut requests: mpsc::Receiver<BridgeRequest>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(request) = requests.recv().await {
        let mut line = match serde_json::to_vec(&request) {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to encode bridge request {}: {}", request.call.method(), e);
                continue;
            }
        };
        line.push(b'\n');
        if let Err(e) = writer.write_all(&line).await {
            error!("Failed to write to bridge: {}", e);
            break;
        }
        if let Err(e) = writer.flush().await {
            error!("Failed to flush bridge stdin: {}", e);
            break;
        }
    }
    debug!("Bridge request writer stopped");
}

async fn read_events<R>(
    reader: R,
    events: mpsc::UnboundedSender<ClientEvent>,
    pending: PendingMap,
    identities: Arc<RwLock<Option<OwnIdentities>>>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => {
                info!("Bridge closed its output");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!("Error reading from bridge: {}", e);
                break;
            }
        }
        if buf.trim_ascii().is_empty() {
            continue;
        }

        let event = match serde_json::from_slice::<BridgeEvent>(&buf) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    "Failed to parse bridge event: {} (line: {})",
                    e,
                    String::from_utf8_lossy(buf.trim_ascii())
                );
                continue;
            }
        };

        match event {
            BridgeEvent::Response(response) => {
                let id = response.id;
                match pending.lock().await.remove(&id) {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => debug!("Dropping response for unknown request {}", id),
                }
            }
            other => {
                if matches!(
                    other,
                    BridgeEvent::LoggedOut { .. } | BridgeEvent::PairSuccess { .. }
                ) {
                    *identities.write().await = None;
                }
                let Some(event) = ClientEvent::from_bridge(other) else {
                    continue;
                };
                // Never waits, so responses queued behind an event backlog
                // still reach their callers.
                if events.send(event).is_err() {
                    debug!("Event forwarder stopped, stopping bridge reader");
                    break;
                }
            }
        }
    }

    // Wake every caller still waiting on a response.
    pending.lock().await.clear();
}

/// Move events from the reader's backlog into the bounded session channel.
async fn forward_events(
    mut backlog: mpsc::UnboundedReceiver<ClientEvent>,
    events: mpsc::Sender<ClientEvent>,
) {
    while let Some(event) = backlog.recv().await {
        if events.send(event).await.is_err() {
            debug!("Event receiver dropped, stopping event forwarder");
            break;
        }
    }
}

#[async_trait]
impl MessagingClient for BridgeClient {
    async fn is_paired(&self) -> ClientResult<bool> {
        let status: StatusResult = self.call_as(BridgeCall::Status).await?;
        Ok(status.paired)
    }

    async fn connect(&self) -> ClientResult<()> {
        self.call(BridgeCall::Connect).await.map(|_| ())
    }

    async fn disconnect(&self) {
        let timeout = self.request_timeout.min(DISCONNECT_TIMEOUT);
        if let Err(e) = self.call_within(BridgeCall::Disconnect, timeout).await {
            debug!("Bridge disconnect request failed: {}", e);
        }

        let mut slot = self.child.lock().await;
        if let Some(mut child) = slot.take() {
            match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
                Ok(Ok(status)) => debug!("Bridge exited with {}", status),
                Ok(Err(e)) => warn!("Failed to wait for bridge: {}", e),
                Err(_) => {
                    warn!("Bridge did not exit in time, killing it");
                    let _ = child.kill().await;
                }
            }
        }
    }

    async fn send_text(&self, chat: &Jid, text: &str) -> ClientResult<()> {
        self.call(BridgeCall::SendText {
            chat_jid: chat.clone(),
            text: text.to_string(),
        })
        .await
        .map(|_| ())
    }

    async fn send_reply(
        &self,
        chat: &Jid,
        quoted_id: &str,
        quoted_participant: &Jid,
        text: &str,
    ) -> ClientResult<()> {
        self.call(BridgeCall::SendReply {
            chat_jid: chat.clone(),
            quoted_id: quoted_id.to_string(),
            quoted_participant: quoted_participant.clone(),
            text: text.to_string(),
        })
        .await
        .map(|_| ())
    }

    async fn group_name(&self, group: &Jid) -> ClientResult<String> {
        let info: GroupInfoResult = self
            .call_as(BridgeCall::GroupInfo { jid: group.clone() })
            .await?;
        Ok(info.name)
    }

    async fn contact(&self, jid: &Jid) -> ClientResult<Option<ContactInfo>> {
        let contact: ContactResult = self
            .call_as(BridgeCall::Contact { jid: jid.clone() })
            .await?;
        Ok(contact.found.then(|| ContactInfo {
            push_name: contact.push_name,
            full_name: contact.full_name,
        }))
    }

    async fn mute_state(&self, chat: &Jid) -> ClientResult<MuteState> {
        self.call_as(BridgeCall::ChatSettings { jid: chat.clone() })
            .await
    }

    async fn own_identities(&self) -> ClientResult<Option<OwnIdentities>> {
        if let Some(cached) = self.identities.read().await.clone() {
            return Ok(Some(cached));
        }

        let result: OwnIdentitiesResult = self.call_as(BridgeCall::OwnIdentities).await?;
        let Some(primary) = result.primary else {
            return Ok(None);
        };
        let own = OwnIdentities {
            primary,
            alternate: result.alternate,
        };
        *self.identities.write().await = Some(own.clone());
        Ok(Some(own))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, duplex};

    /// Wire a client to an in-memory fake bridge. Returns the client, its
    /// event stream, and the bridge's ends (requests in, events out).
    fn fake_bridge() -> (
        Arc<BridgeClient>,
        mpsc::Receiver<ClientEvent>,
        tokio::io::Lines<BufReader<tokio::io::DuplexStream>>,
        tokio::io::DuplexStream,
    ) {
        fake_bridge_with_timeout(Duration::from_secs(2))
    }

    fn fake_bridge_with_timeout(
        request_timeout: Duration,
    ) -> (
        Arc<BridgeClient>,
        mpsc::Receiver<ClientEvent>,
        tokio::io::Lines<BufReader<tokio::io::DuplexStream>>,
        tokio::io::DuplexStream,
    ) {
        let (client_out, bridge_in) = duplex(4096);
        let (bridge_out, client_in) = duplex(4096);
        let (client, events) = BridgeClient::attach(client_in, client_out, request_timeout);
        (client, events, BufReader::new(bridge_in).lines(), bridge_out)
    }

    fn message_line(n: usize) -> String {
        format!(
            "{{\"type\":\"message\",\"id\":\"M{n}\",\"timestamp\":{},\"chat\":\"4477@s.whatsapp.net\",\"sender\":\"4477@s.whatsapp.net\",\"content\":{{\"conversation\":\"tick\"}}}}\n",
            1_700_000_000 + n
        )
    }

    #[tokio::test]
    async fn test_request_response_roundtrip() {
        let (client, _events, mut requests, mut bridge_out) = fake_bridge();

        let responder = tokio::spawn(async move {
            let line = requests.next_line().await.unwrap().unwrap();
            let req: serde_json::Value = serde_json::from_str(&line).unwrap();
            assert_eq!(req["method"], "status");
            let resp = format!(
                "{{\"type\":\"response\",\"id\":{},\"result\":{{\"paired\":true}}}}\n",
                req["id"]
            );
            bridge_out.write_all(resp.as_bytes()).await.unwrap();
            bridge_out
        });

        assert!(client.is_paired().await.unwrap());
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_request() {
        let (client, _events, mut requests, mut bridge_out) = fake_bridge();

        let responder = tokio::spawn(async move {
            let line = requests.next_line().await.unwrap().unwrap();
            let req: serde_json::Value = serde_json::from_str(&line).unwrap();
            assert_eq!(req["method"], "send_text");
            assert_eq!(req["params"]["text"], "hello");
            let resp = format!(
                "{{\"type\":\"response\",\"id\":{},\"error\":\"no such chat\"}}\n",
                req["id"]
            );
            bridge_out.write_all(resp.as_bytes()).await.unwrap();
            bridge_out
        });

        let chat: Jid = "1@s.whatsapp.net".parse().unwrap();
        let err = client.send_text(&chat, "hello").await.unwrap_err();
        assert!(matches!(err, ClientError::Rejected { method: "send_text", .. }));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_events_forwarded_and_bad_lines_skipped() {
        let (_client, mut events, _requests, mut bridge_out) = fake_bridge();

        bridge_out
            .write_all(b"not json\n{\"type\":\"qr_code\",\"code\":\"2@xyz\"}\n{\"type\":\"connected\"}\n")
            .await
            .unwrap();

        assert_eq!(events.recv().await, Some(ClientEvent::QrCode("2@xyz".to_string())));
        assert_eq!(events.recv().await, Some(ClientEvent::Connected));

        drop(bridge_out);
        assert_eq!(events.recv().await, None);
    }

    #[tokio::test]
    async fn test_closed_bridge_fails_requests() {
        let (client, _events, requests, bridge_out) = fake_bridge();
        drop(bridge_out);
        drop(requests);

        let chat: Jid = "1@s.whatsapp.net".parse().unwrap();
        let err = client.mute_state(&chat).await.unwrap_err();
        assert!(matches!(err, ClientError::Closed | ClientError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_lookup_answered_behind_event_backlog() {
        let (client, mut events, mut requests, mut bridge_out) = fake_bridge();
        let backlog = EVENT_BUFFER_SIZE + 44;

        let bridge = tokio::spawn(async move {
            for n in 0..backlog {
                bridge_out.write_all(message_line(n).as_bytes()).await.unwrap();
            }
            let line = requests.next_line().await.unwrap().unwrap();
            let req: serde_json::Value = serde_json::from_str(&line).unwrap();
            assert_eq!(req["method"], "chat_settings");
            let resp = format!(
                "{{\"type\":\"response\",\"id\":{},\"result\":{{\"state\":\"forever\"}}}}\n",
                req["id"]
            );
            bridge_out.write_all(resp.as_bytes()).await.unwrap();
            bridge_out
        });

        let Some(ClientEvent::Message(first)) = events.recv().await else {
            panic!("expected the first backlog message");
        };
        assert_eq!(first.id, "M0");

        let state = tokio::time::timeout(Duration::from_millis(500), client.mute_state(&first.chat))
            .await
            .expect("lookup answered while events are queued")
            .unwrap();
        assert_eq!(state, MuteState::Forever);

        let _bridge_out = bridge.await.unwrap();
        for n in 1..backlog {
            match events.recv().await {
                Some(ClientEvent::Message(msg)) => assert_eq!(msg.id, format!("M{n}")),
                other => panic!("expected message M{n}, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_non_utf8_line_skipped() {
        let (_client, mut events, _requests, mut bridge_out) = fake_bridge();

        bridge_out
            .write_all(b"\xff\xfe garbage\n{\"type\":\"connected\"}\n")
            .await
            .unwrap();

        assert_eq!(events.recv().await, Some(ClientEvent::Connected));
    }

    #[tokio::test]
    async fn test_disconnect_bounded_against_silent_bridge() {
        let (client, _events, _requests, _bridge_out) =
            fake_bridge_with_timeout(Duration::from_secs(30));

        let started = std::time::Instant::now();
        tokio::time::timeout(Duration::from_secs(5), client.disconnect())
            .await
            .expect("disconnect returns without waiting the request timeout");
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
