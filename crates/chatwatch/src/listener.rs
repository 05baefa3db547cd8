//! Unix socket server for display clients.
//!
//! Each accepted connection is split: the write half becomes a broadcast
//! peer, the read half feeds the command channel. When the command loop ends
//! the peer is unregistered.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::BufReader;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;

use crate::broadcast::PeerRegistry;
use crate::client::MessagingClient;
use crate::command::run_command_loop;

const SOCKET_MODE: u32 = 0o600;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct SocketServer {
    listener: UnixListener,
    path: PathBuf,
    registry: PeerRegistry,
    client: Arc<dyn MessagingClient>,
}

impl SocketServer {
    /// Bind `path`, creating its directory and replacing a stale socket file.
    pub fn bind(
        path: &Path,
        registry: PeerRegistry,
        client: Arc<dyn MessagingClient>,
    ) -> io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::remove_file(path) {
            Ok(()) => debug!("Removed stale socket {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let listener = UnixListener::bind(path)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(SOCKET_MODE))?;
        info!("Socket server listening on {}", path.display());

        Ok(Self {
            listener,
            path: path.to_path_buf(),
            registry,
            client,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept peers until `shutdown` turns true or its sender is dropped.
    /// Removes the socket file on return.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => self.serve_peer(stream).await,
                    Err(e) => {
                        warn!("Socket accept failed: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.registry.clear().await;
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!("Removing socket {}: {}", self.path.display(), e);
        }
        info!("Socket server stopped");
    }

    async fn serve_peer(&self, stream: UnixStream) {
        let (read_half, write_half) = stream.into_split();
        let id = self.registry.attach(write_half).await;

        let registry = self.registry.clone();
        let client = Arc::clone(&self.client);
        tokio::spawn(async move {
            let sent = run_command_loop(BufReader::new(read_half), id, client.as_ref()).await;
            registry.unregister(id).await;
            info!("Peer {} disconnected ({} commands sent)", id, sent);
        });
    }
}
