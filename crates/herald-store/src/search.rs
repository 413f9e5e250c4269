//! Message search.
//!
//! When the SQLite build carries FTS5 the query runs against the external-
//! content index, ranked by bm25, with a snippet taken from the best-matching
//! column. Otherwise (or when the FTS query itself is malformed) the search
//! degrades to a case-insensitive substring scan over the same five columns,
//! newest first. Callers only notice the difference through ranking and the
//! absence of snippets.

use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::database::{clamp_limit, Store};
use crate::error::{Result, StoreError};
use crate::messages::row_to_message;
use crate::models::SearchHit;

const MESSAGE_COLUMNS_M: &str = "m.chat_address, m.message_id, m.sender, m.chat_name, m.sender_name, \
     m.ts, m.from_me, m.text, m.media_kind, m.media_caption, m.filename, m.mime_type, m.direct_path, \
     m.media_key, m.plaintext_sha256, m.encrypted_sha256, m.byte_length, m.local_path, m.downloaded_at";

impl Store {
    /// Search messages. `chat` restricts to one conversation; `since` drops
    /// anything older than the given instant.
    pub fn search(
        &self,
        query: &str,
        limit: i64,
        chat: Option<&str>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<SearchHit>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let limit = clamp_limit(limit);
        let since_secs = since.map(|t| t.timestamp());

        if self.fts_enabled() {
            match self.fts_search(query, limit, chat, since_secs) {
                Ok(hits) => return Ok(hits),
                // Malformed MATCH expressions (unbalanced quotes and the
                // like) are user input, not storage failures.
                Err(StoreError::Sqlite(err)) => {
                    tracing::debug!(error = %err, "FTS query failed, using substring fallback");
                }
                Err(other) => return Err(other),
            }
        }
        self.like_search(query, limit, chat, since_secs)
    }

    fn fts_search(
        &self,
        query: &str,
        limit: i64,
        chat: Option<&str>,
        since_secs: Option<i64>,
    ) -> Result<Vec<SearchHit>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS_M}, snippet(messages_fts, -1, '[', ']', '…', 12)
             FROM messages_fts
             JOIN messages m ON m.id = messages_fts.rowid
             WHERE messages_fts MATCH ?1
               AND (?2 IS NULL OR m.chat_address = ?2)
               AND (?3 IS NULL OR m.ts >= ?3)
             ORDER BY bm25(messages_fts)
             LIMIT ?4"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![query, chat, since_secs, limit], |row| {
            Ok(SearchHit {
                message: row_to_message(row)?,
                snippet: row.get(19)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    pub(crate) fn like_search(
        &self,
        query: &str,
        limit: i64,
        chat: Option<&str>,
        since_secs: Option<i64>,
    ) -> Result<Vec<SearchHit>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS_M}, ''
             FROM messages m
             WHERE (m.text LIKE '%' || ?1 || '%'
                 OR m.media_caption LIKE '%' || ?1 || '%'
                 OR m.filename LIKE '%' || ?1 || '%'
                 OR m.chat_name LIKE '%' || ?1 || '%'
                 OR m.sender_name LIKE '%' || ?1 || '%')
               AND (?2 IS NULL OR m.chat_address = ?2)
               AND (?3 IS NULL OR m.ts >= ?3)
             ORDER BY m.ts DESC
             LIMIT ?4"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![query, chat, since_secs, limit], |row| {
            Ok(SearchHit {
                message: row_to_message(row)?,
                snippet: row.get(19)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{media_message, open_store, text_message, ts};

    fn seed(store: &Store) {
        let hello = text_message("1@s.whatsapp.net", "m1", "hello world", 1000);
        store.upsert_chat_for(&hello).unwrap();
        store.upsert_message(&hello).unwrap();

        let photo = media_message("2@s.whatsapp.net", "m2", 2000);
        store.upsert_chat_for(&photo).unwrap();
        store.upsert_message(&photo).unwrap();
    }

    #[test]
    fn finds_text_with_snippet_markers() {
        let (store, _dir) = open_store();
        seed(&store);

        let hits = store.search("hello", 10, None, None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].message.id, "m1");
        assert!(hits[0].snippet.contains("[hello]"));
    }

    #[test]
    fn finds_caption_matches() {
        let (store, _dir) = open_store();
        seed(&store);

        // media_message carries the caption "image cap".
        let hits = store.search("image", 10, None, None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].message.id, "m2");
        assert!(hits[0].snippet.contains("[image]"));
    }

    #[test]
    fn replaced_text_is_no_longer_findable() {
        let (store, _dir) = open_store();
        let msg = text_message("1@s.whatsapp.net", "m1", "hello", 1000);
        store.upsert_chat_for(&msg).unwrap();
        store.upsert_message(&msg).unwrap();

        let mut cleared = msg.clone();
        cleared.text = String::new();
        store.upsert_message(&cleared).unwrap();

        assert!(store.search("hello", 10, None, None).unwrap().is_empty());

        // And restoring the text makes it findable again.
        store.upsert_message(&msg).unwrap();
        assert_eq!(store.search("hello", 10, None, None).unwrap().len(), 1);
    }

    #[test]
    fn chat_and_time_filters_apply() {
        let (store, _dir) = open_store();
        for (chat, id, t) in [
            ("1@s.whatsapp.net", "m1", 1000),
            ("2@s.whatsapp.net", "m2", 2000),
        ] {
            let msg = text_message(chat, id, "meeting notes", t);
            store.upsert_chat_for(&msg).unwrap();
            store.upsert_message(&msg).unwrap();
        }

        let all = store.search("meeting", 10, None, None).unwrap();
        assert_eq!(all.len(), 2);

        let one_chat = store
            .search("meeting", 10, Some("1@s.whatsapp.net"), None)
            .unwrap();
        assert_eq!(one_chat.len(), 1);
        assert_eq!(one_chat[0].message.id, "m1");

        let recent = store.search("meeting", 10, None, Some(ts(1500))).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].message.id, "m2");
    }

    #[test]
    fn malformed_fts_query_degrades_to_substring() {
        let (store, _dir) = open_store();
        seed(&store);

        // An unbalanced quote is an FTS5 syntax error; the fallback treats
        // it as a literal substring and simply finds nothing.
        let hits = store.search("\"hello", 10, None, None).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn substring_fallback_matches_all_columns() {
        let (store, _dir) = open_store();
        seed(&store);

        let by_text = store.like_search("HELLO", 10, None, None).unwrap();
        assert_eq!(by_text.len(), 1);
        assert_eq!(by_text[0].snippet, "");

        let by_filename = store.like_search("photo", 10, None, None).unwrap();
        assert_eq!(by_filename.len(), 1);
        assert_eq!(by_filename[0].message.id, "m2");
    }

    #[test]
    fn empty_query_returns_nothing() {
        let (store, _dir) = open_store();
        seed(&store);
        assert!(store.search("  ", 10, None, None).unwrap().is_empty());
    }

    #[test]
    fn hostile_query_strings_stay_inert() {
        let (store, _dir) = open_store();
        seed(&store);

        let hostile = "'; DROP TABLE messages; --";
        let hits = store.search(hostile, 10, None, None).unwrap();
        assert!(hits.is_empty());

        // The table is still there and still searchable.
        assert_eq!(store.count_messages().unwrap(), 2);
        assert_eq!(store.search("hello", 10, None, None).unwrap().len(), 1);

        // Same through the chat filter, which is also bound, not spliced.
        let hits = store
            .search("hello", 10, Some("x' OR '1'='1"), None)
            .unwrap();
        assert!(hits.is_empty());
    }
}
