//! Wire types for chatwatch.
//!
//! - [`socket`]: newline-delimited JSON exchanged with local display clients.
//! - [`bridge`]: newline-delimited JSON exchanged with the messaging bridge.
//! - [`jid`]: account/chat identifiers used by both.

pub mod bridge;
pub mod jid;
pub mod socket;

pub use jid::{Jid, JidError};
pub use socket::{Call, CommandRecord, Message, SocketEvent};
