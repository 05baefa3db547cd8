//! Outbound commands received from display clients.
//!
//! Each peer's read half carries newline-delimited [`CommandRecord`]s. Lines
//! are handled one at a time; anything unusable is logged and skipped so a
//! bad client line never closes the connection.

use log::{debug, info, warn};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use chatwatch_protocol::socket::{ACTION_REPLY, ACTION_SEND};
use chatwatch_protocol::{CommandRecord, Jid, JidError};

use crate::client::MessagingClient;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("malformed command: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unknown action: {0:?}")]
    UnknownAction(String),

    #[error("{action} requires {field}")]
    MissingField {
        action: &'static str,
        field: &'static str,
    },

    #[error("invalid {field}: {source}")]
    InvalidJid {
        field: &'static str,
        #[source]
        source: JidError,
    },
}

/// A validated outbound command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send {
        chat: Jid,
        text: String,
    },
    Reply {
        chat: Jid,
        quoted_id: String,
        quoted_sender: Jid,
        text: String,
    },
}

impl Command {
    /// Decode one line of the command channel.
    pub fn parse_line(line: &str) -> Result<Self, CommandError> {
        Self::parse_bytes(line.as_bytes())
    }

    /// Decode one raw line. Invalid UTF-8 is reported as [`CommandError::Malformed`].
    pub fn parse_bytes(line: &[u8]) -> Result<Self, CommandError> {
        let record: CommandRecord = serde_json::from_slice(line)?;
        Self::try_from(record)
    }

    pub fn action(&self) -> &'static str {
        match self {
            Command::Send { .. } => ACTION_SEND,
            Command::Reply { .. } => ACTION_REPLY,
        }
    }

    pub fn chat(&self) -> &Jid {
        match self {
            Command::Send { chat, .. } | Command::Reply { chat, .. } => chat,
        }
    }
}

impl TryFrom<CommandRecord> for Command {
    type Error = CommandError;

    fn try_from(record: CommandRecord) -> Result<Self, Self::Error> {
        match record.action.as_str() {
            ACTION_SEND => Ok(Command::Send {
                chat: parse_jid(ACTION_SEND, "chat_jid", &record.chat_jid)?,
                text: record.text,
            }),
            ACTION_REPLY => {
                let chat = parse_jid(ACTION_REPLY, "chat_jid", &record.chat_jid)?;
                if record.message_id.is_empty() {
                    return Err(CommandError::MissingField {
                        action: ACTION_REPLY,
                        field: "message_id",
                    });
                }
                let quoted_sender = parse_jid(ACTION_REPLY, "sender_jid", &record.sender_jid)?;
                Ok(Command::Reply {
                    chat,
                    quoted_id: record.message_id,
                    quoted_sender,
                    text: record.text,
                })
            }
            _ => Err(CommandError::UnknownAction(record.action)),
        }
    }
}

fn parse_jid(action: &'static str, field: &'static str, raw: &str) -> Result<Jid, CommandError> {
    if raw.is_empty() {
        return Err(CommandError::MissingField { action, field });
    }
    raw.parse()
        .map_err(|source| CommandError::InvalidJid { field, source })
}

/// Forward a command to the messaging client.
pub async fn dispatch(command: &Command, client: &dyn MessagingClient) -> crate::client::ClientResult<()> {
    match command {
        Command::Send { chat, text } => client.send_text(chat, text).await,
        Command::Reply {
            chat,
            quoted_id,
            quoted_sender,
            text,
        } => client.send_reply(chat, quoted_id, quoted_sender, text).await,
    }
}

/// Read and execute commands until EOF or a read error. Returns the number
/// of commands the client accepted.
pub async fn run_command_loop<R>(mut reader: R, peer: u64, client: &dyn MessagingClient) -> usize
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let mut sent = 0;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Peer {} read failed: {}", peer, e);
                break;
            }
        }
        let line = buf.trim_ascii();
        if line.is_empty() {
            continue;
        }

        let command = match Command::parse_bytes(line) {
            Ok(command) => command,
            Err(e) => {
                warn!("Peer {}: ignoring command: {}", peer, e);
                continue;
            }
        };

        match dispatch(&command, client).await {
            Ok(()) => {
                info!("Peer {}: {} to {}", peer, command.action(), command.chat());
                sent += 1;
            }
            Err(e) => warn!(
                "Peer {}: {} to {} failed: {}",
                peer,
                command.action(),
                command.chat(),
                e
            ),
        }
    }
    sent
}
