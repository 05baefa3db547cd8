//! Session controller.
//!
//! Drives a messaging client through its lifecycle:
//!
//! ```text
//! Starting -> Authenticating (no device session yet) -> Connected
//!          \_________________________________________/    |
//!                                                          v
//!                                         Disconnected / Shutdown
//! ```
//!
//! Inbound events are consumed by a single worker that runs the
//! [`Pipeline`]. The loop ends on a termination signal, when the account is
//! logged out, or when the client's event stream closes.

mod pipeline;

pub use pipeline::{Outcome, Pipeline};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use log::{debug, info, warn};
use qrcode::render::unicode::Dense1x2;
use qrcode::{EcLevel, QrCode};
use tokio::sync::{mpsc, watch};

use crate::attention::AttentionNotifier;
use crate::broadcast::PeerRegistry;
use crate::classifier::Classifier;
use crate::client::{BridgeClient, ClientEvent, MessagingClient};
use crate::config::AppConfig;
use crate::listener::SocketServer;
use crate::store::Store;

/// How long shutdown waits for the socket server to clean up.
const LISTENER_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Authenticating,
    Connected,
    Disconnected,
    Shutdown,
}

/// Why a session ended cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Signal,
    LoggedOut,
}

pub struct Session {
    client: Arc<dyn MessagingClient>,
    events: mpsc::Receiver<ClientEvent>,
    pipeline: Pipeline,
    state: watch::Sender<SessionState>,
}

impl Session {
    pub fn new(
        client: Arc<dyn MessagingClient>,
        events: mpsc::Receiver<ClientEvent>,
        pipeline: Pipeline,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Starting);
        Self {
            client,
            events,
            pipeline,
            state,
        }
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!("Session state {:?} -> {:?}", previous, next);
        }
    }

    /// Start the client and process events until `shutdown` resolves, the
    /// account is logged out, or the event stream ends (an error).
    pub async fn run<F>(mut self, shutdown: F) -> Result<ExitReason>
    where
        F: Future<Output = ()>,
    {
        let result = self.drive(shutdown).await;
        self.set_state(SessionState::Shutdown);
        self.client.disconnect().await;
        result
    }

    async fn drive<F>(&mut self, shutdown: F) -> Result<ExitReason>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    return Ok(ExitReason::Signal);
                }
                event = self.events.recv() => match event {
                    Some(event) => {
                        if let Some(reason) = self.handle_event(event).await {
                            return Ok(reason);
                        }
                    }
                    None => return Err(anyhow!("messaging client event stream closed")),
                },
            }
        }
    }

    async fn start(&mut self) -> Result<()> {
        let paired = self
            .client
            .is_paired()
            .await
            .context("querying device session")?;
        if !paired {
            info!("No device session, waiting for pairing");
            self.set_state(SessionState::Authenticating);
        }
        self.client
            .connect()
            .await
            .context("connecting messaging client")?;
        Ok(())
    }

    async fn handle_event(&mut self, event: ClientEvent) -> Option<ExitReason> {
        match event {
            ClientEvent::Message(raw) => {
                self.pipeline.handle_message(&raw).await;
            }
            ClientEvent::CallOffer(raw) | ClientEvent::CallOfferNotice(raw) => {
                self.pipeline.handle_call(&raw).await;
            }
            ClientEvent::QrCode(code) => {
                self.set_state(SessionState::Authenticating);
                match render_qr(&code) {
                    Ok(rendered) => println!("Scan this QR code to log in:\n{rendered}"),
                    Err(e) => warn!("Failed to render pairing code: {}", e),
                }
            }
            ClientEvent::PairSuccess => info!("Pairing succeeded"),
            ClientEvent::Connected => {
                self.set_state(SessionState::Connected);
                info!("Connected. Watching for messages...");
            }
            ClientEvent::Disconnected => {
                self.set_state(SessionState::Disconnected);
                warn!("Disconnected from messaging service");
            }
            ClientEvent::LoggedOut { reason } => {
                info!(
                    "Logged out{}",
                    reason.map(|r| format!(": {r}")).unwrap_or_default()
                );
                return Some(ExitReason::LoggedOut);
            }
        }
        None
    }
}

/// Render a pairing payload as half-block unicode for a dark terminal.
pub fn render_qr(code: &str) -> Result<String, qrcode::types::QrError> {
    let qr = QrCode::with_error_correction_level(code, EcLevel::L)?;
    Ok(qr
        .render::<Dense1x2>()
        .dark_color(Dense1x2::Light)
        .light_color(Dense1x2::Dark)
        .build())
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Run the daemon until it is signalled or logged out.
///
/// Startup failures (store, bridge, socket bind, session query) are returned
/// as errors; the socket is bound before the session starts so a bind
/// failure never leaves a half-started client behind.
pub async fn serve(config: &AppConfig) -> Result<ExitReason> {
    let limits = config.store.limits().context("invalid store limits")?;
    let store = Store::open(&config.store.path, limits)
        .await
        .with_context(|| format!("opening history database {}", config.store.path.display()))?;

    let (bridge, events) = BridgeClient::spawn(&config.bridge)
        .with_context(|| format!("starting bridge {}", config.bridge.command))?;
    let client: Arc<dyn MessagingClient> = bridge;

    let registry = PeerRegistry::new(config.socket.queue_capacity, config.socket.write_timeout());
    let server = SocketServer::bind(&config.socket.path, registry.clone(), Arc::clone(&client))
        .with_context(|| format!("binding socket {}", config.socket.path.display()))?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let server = tokio::spawn(server.run(stop_rx));

    let pipeline = Pipeline::new(
        Classifier::new(config.filters),
        store.clone(),
        registry,
        Arc::clone(&client),
    )
    .with_attention(AttentionNotifier::from_config(&config.attention));

    let result = Session::new(client, events, pipeline)
        .run(shutdown_signal())
        .await;

    let _ = stop_tx.send(true);
    if tokio::time::timeout(LISTENER_GRACE, server).await.is_err() {
        warn!("Socket server did not stop within {:?}", LISTENER_GRACE);
    }
    store.close().await;
    result
}
