//! Static column mapping for persisted event kinds.

use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteRow};
use sqlx::Row;

use chatwatch_protocol::{Call, Message};

pub type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

/// A row type stored in its own bounded table.
///
/// `INSERT` must end in `RETURNING id` and bind its parameters in the order
/// [`Record::bind`] pushes them. `COLUMNS` is the select list read back by
/// [`Record::from_row`].
pub trait Record: Sized + Send + Sync + Unpin + 'static {
    const TABLE: &'static str;
    const COLUMNS: &'static str;
    const INSERT: &'static str;

    fn bind<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q>;

    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error>;
}

impl Record for Message {
    const TABLE: &'static str = "messages";
    const COLUMNS: &'static str = "id, message_id, timestamp, chat_jid, chat_name, sender_jid, \
         sender_name, is_group, group_jid, group_name, is_muted, is_reply_to_me, text";
    const INSERT: &'static str = r#"
        INSERT INTO messages (message_id, timestamp, chat_jid, chat_name, sender_jid,
            sender_name, is_group, group_jid, group_name, is_muted, is_reply_to_me, text)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING id
    "#;

    fn bind<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query
            .bind(&self.message_id)
            .bind(self.timestamp)
            .bind(&self.chat_jid)
            .bind(&self.chat_name)
            .bind(&self.sender_jid)
            .bind(&self.sender_name)
            .bind(self.is_group)
            .bind(self.group_jid.as_deref())
            .bind(self.group_name.as_deref())
            .bind(self.is_muted)
            .bind(self.is_reply_to_me)
            .bind(&self.text)
    }

    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Message {
            id: Some(row.try_get("id")?),
            message_id: row.try_get("message_id")?,
            timestamp: row.try_get("timestamp")?,
            chat_jid: row.try_get("chat_jid")?,
            chat_name: row.try_get("chat_name")?,
            sender_jid: row.try_get("sender_jid")?,
            sender_name: row.try_get("sender_name")?,
            is_group: row.try_get("is_group")?,
            group_jid: row.try_get("group_jid")?,
            group_name: row.try_get("group_name")?,
            is_muted: row.try_get("is_muted")?,
            is_reply_to_me: row.try_get("is_reply_to_me")?,
            text: row.try_get("text")?,
        })
    }
}

impl Record for Call {
    const TABLE: &'static str = "calls";
    const COLUMNS: &'static str =
        "id, timestamp, call_id, caller_jid, caller_name, is_group, group_jid, group_name";
    const INSERT: &'static str = r#"
        INSERT INTO calls (timestamp, call_id, caller_jid, caller_name, is_group,
            group_jid, group_name)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        RETURNING id
    "#;

    fn bind<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query
            .bind(self.timestamp)
            .bind(&self.call_id)
            .bind(&self.caller_jid)
            .bind(&self.caller_name)
            .bind(self.is_group)
            .bind(self.group_jid.as_deref())
            .bind(self.group_name.as_deref())
    }

    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Call {
            id: Some(row.try_get("id")?),
            timestamp: row.try_get("timestamp")?,
            call_id: row.try_get("call_id")?,
            caller_jid: row.try_get("caller_jid")?,
            caller_name: row.try_get("caller_name")?,
            is_group: row.try_get("is_group")?,
            group_jid: row.try_get("group_jid")?,
            group_name: row.try_get("group_name")?,
        })
    }
}
