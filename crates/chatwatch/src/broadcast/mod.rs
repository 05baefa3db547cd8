//! Live peer registry and event fan-out.
//!
//! Every connected display client is a peer with its own bounded frame queue
//! drained by a dedicated writer task. Publishing serializes the event once
//! and pushes the same bytes into each queue without awaiting the peer, so a
//! slow client is dropped instead of stalling the pipeline.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, error, info, warn};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{RwLock, mpsc};

use chatwatch_protocol::SocketEvent;

pub type PeerId = u64;

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Sending side of a peer's frame queue.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    id: PeerId,
    frames: mpsc::Sender<Bytes>,
}

impl PeerHandle {
    pub fn id(&self) -> PeerId {
        self.id
    }
}

#[derive(Debug)]
struct Inner {
    peers: RwLock<HashMap<PeerId, PeerHandle>>,
    next_id: AtomicU64,
    queue_capacity: usize,
    write_timeout: Duration,
}

/// Shared set of live peers. Clones share the same set.
#[derive(Debug, Clone)]
pub struct PeerRegistry {
    inner: Arc<Inner>,
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY, DEFAULT_WRITE_TIMEOUT)
    }
}

impl PeerRegistry {
    pub fn new(queue_capacity: usize, write_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                peers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                queue_capacity: queue_capacity.max(1),
                write_timeout,
            }),
        }
    }

    /// Allocate a peer id and frame queue without registering it.
    pub fn handle(&self) -> (PeerHandle, mpsc::Receiver<Bytes>) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (frames, rx) = mpsc::channel(self.inner.queue_capacity);
        (PeerHandle { id, frames }, rx)
    }

    /// Add a peer. Returns `false` if its id is already present.
    pub async fn register(&self, handle: PeerHandle) -> bool {
        let mut peers = self.inner.peers.write().await;
        if peers.contains_key(&handle.id) {
            return false;
        }
        peers.insert(handle.id, handle);
        true
    }

    /// Remove a peer. Returns `false` if it was already gone.
    pub async fn unregister(&self, id: PeerId) -> bool {
        let removed = self.inner.peers.write().await.remove(&id).is_some();
        if removed {
            debug!("Peer {} unregistered", id);
        }
        removed
    }

    /// Register `writer` as a new peer and spawn its writer task.
    pub async fn attach<W>(&self, writer: W) -> PeerId
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (handle, frames) = self.handle();
        let id = handle.id;
        self.register(handle).await;
        tokio::spawn(write_frames(
            self.clone(),
            id,
            frames,
            writer,
            self.inner.write_timeout,
        ));
        info!("Peer {} connected", id);
        id
    }

    /// Queue `event` for every registered peer. Returns the number of peers
    /// it was queued for. Peers whose queue is full or closed are removed.
    pub async fn publish(&self, event: &SocketEvent) -> usize {
        let frame = match event.to_line() {
            Ok(line) => Bytes::from(line),
            Err(e) => {
                error!("Failed to encode {} event: {}", event.kind(), e);
                return 0;
            }
        };

        let mut delivered = 0;
        let mut failed = Vec::new();
        {
            let peers = self.inner.peers.read().await;
            for (id, peer) in peers.iter() {
                match peer.frames.try_send(frame.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!("Peer {} is not keeping up, dropping it", id);
                        failed.push(*id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => failed.push(*id),
                }
            }
        }

        if !failed.is_empty() {
            let registry = self.clone();
            tokio::spawn(async move {
                for id in failed {
                    registry.unregister(id).await;
                }
            });
        }
        delivered
    }

    pub async fn len(&self) -> usize {
        self.inner.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.peers.read().await.is_empty()
    }

    /// Drop every peer. Writer tasks finish their queued frames and exit.
    pub async fn clear(&self) {
        self.inner.peers.write().await.clear();
    }
}

async fn write_frames<W>(
    registry: PeerRegistry,
    id: PeerId,
    mut frames: mpsc::Receiver<Bytes>,
    mut writer: W,
    write_timeout: Duration,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    while let Some(frame) = frames.recv().await {
        let write = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        };
        match tokio::time::timeout(write_timeout, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("Peer {} write failed: {}", id, e);
                break;
            }
            Err(_) => {
                warn!(
                    "Peer {} write timed out after {:?}, dropping it",
                    id, write_timeout
                );
                break;
            }
        }
    }
    registry.unregister(id).await;
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatwatch_protocol::Call;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};

    fn event(n: i64) -> SocketEvent {
        SocketEvent::Call(Call {
            id: Some(n),
            timestamp: 1_700_000_000 + n,
            call_id: format!("CALL{n}"),
            caller_jid: "4477@s.whatsapp.net".to_string(),
            caller_name: "Kim".to_string(),
            is_group: false,
            group_jid: None,
            group_name: None,
        })
    }

    async fn read_event(lines: &mut tokio::io::Lines<BufReader<DuplexStream>>) -> SocketEvent {
        let line = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
            .await
            .expect("frame within timeout")
            .unwrap()
            .expect("stream open");
        serde_json::from_str(&line).unwrap()
    }

    async fn wait_for_len(registry: &PeerRegistry, expected: usize) {
        for _ in 0..200 {
            if registry.len().await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("registry never reached {expected} peers");
    }

    #[tokio::test]
    async fn test_fan_out_in_publish_order() {
        let registry = PeerRegistry::default();
        let mut readers = Vec::new();
        for _ in 0..3 {
            let (client, server) = tokio::io::duplex(64 * 1024);
            registry.attach(server).await;
            readers.push(BufReader::new(client).lines());
        }

        assert_eq!(registry.publish(&event(1)).await, 3);
        assert_eq!(registry.publish(&event(2)).await, 3);

        for lines in readers.iter_mut() {
            assert_eq!(read_event(lines).await, event(1));
            assert_eq!(read_event(lines).await, event(2));
        }
    }

    #[tokio::test]
    async fn test_late_peer_sees_only_later_events() {
        let registry = PeerRegistry::default();
        let (early, server) = tokio::io::duplex(64 * 1024);
        registry.attach(server).await;
        let mut early = BufReader::new(early).lines();

        registry.publish(&event(1)).await;

        let (late, server) = tokio::io::duplex(64 * 1024);
        registry.attach(server).await;
        let mut late = BufReader::new(late).lines();

        registry.publish(&event(2)).await;

        assert_eq!(read_event(&mut early).await, event(1));
        assert_eq!(read_event(&mut early).await, event(2));
        assert_eq!(read_event(&mut late).await, event(2));
    }

    #[tokio::test]
    async fn test_frame_is_one_json_line() {
        let registry = PeerRegistry::default();
        let (client, server) = tokio::io::duplex(64 * 1024);
        registry.attach(server).await;
        registry.publish(&event(9)).await;

        let mut lines = BufReader::new(client).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "call");
        assert_eq!(value["data"]["call_id"], "CALL9");
    }

    #[tokio::test]
    async fn test_register_and_unregister_idempotent() {
        let registry = PeerRegistry::default();
        let (handle, _rx) = registry.handle();
        let id = handle.id();

        assert!(registry.register(handle.clone()).await);
        assert!(!registry.register(handle).await);
        assert_eq!(registry.len().await, 1);

        assert!(registry.unregister(id).await);
        assert!(!registry.unregister(id).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_full_queue_drops_peer() {
        let registry = PeerRegistry::new(1, DEFAULT_WRITE_TIMEOUT);
        let (handle, _frames) = registry.handle();
        registry.register(handle).await;

        assert_eq!(registry.publish(&event(1)).await, 1);
        assert_eq!(registry.publish(&event(2)).await, 0);
        wait_for_len(&registry, 0).await;
    }

    #[tokio::test]
    async fn test_disconnected_peer_removed() {
        let registry = PeerRegistry::default();
        let (client, server) = tokio::io::duplex(1024);
        registry.attach(server).await;
        drop(client);

        registry.publish(&event(1)).await;
        wait_for_len(&registry, 0).await;
    }

    #[tokio::test]
    async fn test_stalled_peer_times_out() {
        let registry = PeerRegistry::new(8, Duration::from_millis(50));
        // Tiny buffer that is never read: the second write blocks.
        let (_client, server) = tokio::io::duplex(16);
        registry.attach(server).await;

        registry.publish(&event(1)).await;
        registry.publish(&event(2)).await;
        wait_for_len(&registry, 0).await;
    }
}
