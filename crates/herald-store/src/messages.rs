//! Message persistence.
//!
//! Writes go through a single idempotent upsert keyed on
//! `(chat_address, message_id)`. Text, timestamps and the denormalised names
//! follow the most recent observation; media metadata only ever gets richer.
//! An incoming empty field never overwrites a stored non-empty one, so a
//! history-sync replay cannot erase what a live event already supplied (or
//! the other way round).

use chrono::{DateTime, Utc};
use rusqlite::params;

use herald_shared::{Addr, MediaInfo, MediaKind, Message};

use crate::database::{clamp_limit, Store};
use crate::error::{Result, StoreError};

pub(crate) const MESSAGE_COLUMNS: &str = "chat_address, message_id, sender, chat_name, sender_name, \
     ts, from_me, text, media_kind, media_caption, filename, mime_type, direct_path, \
     media_key, plaintext_sha256, encrypted_sha256, byte_length, local_path, downloaded_at";

impl Store {
    pub fn upsert_message(&self, msg: &Message) -> Result<()> {
        let media = msg.media.clone().unwrap_or_default();
        let media_kind = media.kind.map(|k| k.as_str()).unwrap_or("");

        self.conn().execute(
            "INSERT INTO messages (chat_address, message_id, sender, chat_name, sender_name,
                                   ts, from_me, text, media_kind, media_caption, filename,
                                   mime_type, direct_path, media_key, plaintext_sha256,
                                   encrypted_sha256, byte_length, local_path, downloaded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
             ON CONFLICT (chat_address, message_id) DO UPDATE SET
                 sender      = excluded.sender,
                 chat_name   = excluded.chat_name,
                 sender_name = excluded.sender_name,
                 ts          = excluded.ts,
                 from_me     = excluded.from_me,
                 text        = excluded.text,
                 media_kind       = CASE WHEN excluded.media_kind = ''
                                         THEN messages.media_kind ELSE excluded.media_kind END,
                 media_caption    = CASE WHEN excluded.media_caption = ''
                                         THEN messages.media_caption ELSE excluded.media_caption END,
                 filename         = CASE WHEN excluded.filename = ''
                                         THEN messages.filename ELSE excluded.filename END,
                 mime_type        = CASE WHEN excluded.mime_type = ''
                                         THEN messages.mime_type ELSE excluded.mime_type END,
                 direct_path      = CASE WHEN excluded.direct_path = ''
                                         THEN messages.direct_path ELSE excluded.direct_path END,
                 media_key        = CASE WHEN length(excluded.media_key) = 0
                                         THEN messages.media_key ELSE excluded.media_key END,
                 plaintext_sha256 = CASE WHEN length(excluded.plaintext_sha256) = 0
                                         THEN messages.plaintext_sha256 ELSE excluded.plaintext_sha256 END,
                 encrypted_sha256 = CASE WHEN length(excluded.encrypted_sha256) = 0
                                         THEN messages.encrypted_sha256 ELSE excluded.encrypted_sha256 END,
                 byte_length      = CASE WHEN excluded.byte_length = 0
                                         THEN messages.byte_length ELSE excluded.byte_length END,
                 local_path       = CASE WHEN excluded.local_path = ''
                                         THEN messages.local_path ELSE excluded.local_path END,
                 downloaded_at    = CASE WHEN excluded.downloaded_at IS NULL
                                         THEN messages.downloaded_at ELSE excluded.downloaded_at END",
            params![
                msg.chat.to_string(),
                msg.id,
                msg.sender,
                msg.chat_name,
                msg.sender_name,
                msg.ts.timestamp(),
                msg.from_me,
                msg.text,
                media_kind,
                media.caption,
                media.filename,
                media.mime_type,
                media.direct_path,
                media.media_key,
                media.plaintext_sha256,
                media.encrypted_sha256,
                media.byte_length as i64,
                media.local_path,
                media.downloaded_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    /// Most recent messages for a chat, newest first.
    pub fn list_messages(&self, chat: &str, limit: i64) -> Result<Vec<Message>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE chat_address = ?1
             ORDER BY ts DESC, id DESC
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![chat, clamp_limit(limit)], row_to_message)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    pub fn get_message(&self, chat: &str, msg_id: &str) -> Result<Message> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE chat_address = ?1 AND message_id = ?2"
                ),
                params![chat, msg_id],
                row_to_message,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// The earliest stored message of a chat, used as the backfill anchor.
    pub fn oldest_message(&self, chat: &str) -> Result<Option<Message>> {
        let result = self.conn().query_row(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE chat_address = ?1
                 ORDER BY ts ASC, id ASC
                 LIMIT 1"
            ),
            params![chat],
            row_to_message,
        );
        match result {
            Ok(msg) => Ok(Some(msg)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(other) => Err(other.into()),
        }
    }

    pub fn count_messages(&self) -> Result<i64> {
        let n = self
            .conn()
            .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        Ok(n)
    }

    pub fn count_messages_in_chat(&self, chat: &str) -> Result<i64> {
        let n = self.conn().query_row(
            "SELECT COUNT(*) FROM messages WHERE chat_address = ?1",
            params![chat],
            |row| row.get(0),
        )?;
        Ok(n)
    }
}

pub(crate) fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let chat_str: String = row.get(0)?;
    let chat = Addr::parse(&chat_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let ts_secs: i64 = row.get(5)?;
    let ts = DateTime::from_timestamp(ts_secs, 0).ok_or_else(|| {
        rusqlite::Error::IntegralValueOutOfRange(5, ts_secs)
    })?;

    let media_kind_str: String = row.get(8)?;
    let media = MediaInfo {
        kind: MediaKind::parse(&media_kind_str),
        caption: row.get(9)?,
        filename: row.get(10)?,
        mime_type: row.get(11)?,
        direct_path: row.get(12)?,
        media_key: row.get(13)?,
        plaintext_sha256: row.get(14)?,
        encrypted_sha256: row.get(15)?,
        byte_length: row.get::<_, i64>(16)? as u64,
        local_path: row.get(17)?,
        downloaded_at: parse_rfc3339_opt(row, 18)?,
    };

    let has_media = media.kind.is_some()
        || !media.media_key.is_empty()
        || !media.direct_path.is_empty()
        || !media.caption.is_empty()
        || !media.filename.is_empty();

    Ok(Message {
        chat,
        id: row.get(1)?,
        sender: row.get(2)?,
        chat_name: row.get(3)?,
        sender_name: row.get(4)?,
        ts,
        from_me: row.get(6)?,
        text: row.get(7)?,
        media: has_media.then_some(media),
    })
}

pub(crate) fn parse_rfc3339_opt(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    idx,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })
    })
    .transpose()
}
