//! Desktop attention hook.
//!
//! After a message is broadcast, a workspace manager listening on a unix
//! socket can be asked to raise the display client's window:
//! `add_attention_by_cmd {"id":"chatwatch","command":["chatwatch-tui"]}`.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;

const ATTENTION_VERB: &str = "add_attention_by_cmd";
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttentionConfig {
    pub enabled: bool,
    /// Workspace manager socket.
    pub socket: PathBuf,
    /// Attention id, one window per id.
    pub id: String,
    /// Command whose window should be raised.
    pub command: Vec<String>,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            socket: PathBuf::from("/tmp/rlocal/rworkspaces/sock"),
            id: "chatwatch".to_string(),
            command: vec!["chatwatch-tui".to_string()],
        }
    }
}

#[derive(Serialize)]
struct AttentionRequest<'a> {
    id: &'a str,
    command: &'a [String],
}

#[derive(Debug, Clone)]
pub struct AttentionNotifier {
    config: AttentionConfig,
}

impl AttentionNotifier {
    /// `None` when the hook is disabled.
    pub fn from_config(config: &AttentionConfig) -> Option<Self> {
        config.enabled.then(|| Self {
            config: config.clone(),
        })
    }

    pub fn payload(&self) -> serde_json::Result<String> {
        let body = serde_json::to_string(&AttentionRequest {
            id: &self.config.id,
            command: &self.config.command,
        })?;
        Ok(format!("{ATTENTION_VERB} {body}"))
    }

    /// One connection per request; the manager reads until EOF.
    pub async fn notify(&self) -> io::Result<()> {
        let payload = self.payload().map_err(io::Error::other)?;
        let send = async {
            let mut stream = UnixStream::connect(&self.config.socket).await?;
            stream.write_all(payload.as_bytes()).await?;
            stream.shutdown().await
        };
        tokio::time::timeout(NOTIFY_TIMEOUT, send)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "attention request timed out"))?
    }
}
