use chrono::{DateTime, Utc};
use rusqlite::params;

use herald_shared::ChatKind;

use crate::database::{clamp_limit, Store};
use crate::error::{Result, StoreError};
use crate::models::Chat;

impl Store {
    /// Create or refresh a chat. `last_activity` is monotone: an older
    /// observation never moves it backwards. An empty incoming name keeps
    /// whatever label we already had.
    pub fn upsert_chat(
        &self,
        address: &str,
        kind: ChatKind,
        name: &str,
        activity: DateTime<Utc>,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT INTO chats (address, kind, name, last_activity)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (address) DO UPDATE SET
                 kind = excluded.kind,
                 name = CASE WHEN excluded.name = '' THEN chats.name ELSE excluded.name END,
                 last_activity = MAX(chats.last_activity, excluded.last_activity)",
            params![address, kind.as_str(), name, activity.timestamp()],
        )?;
        Ok(())
    }

    pub fn get_chat(&self, address: &str) -> Result<Chat> {
        self.conn()
            .query_row(
                "SELECT address, kind, name, last_activity FROM chats WHERE address = ?1",
                params![address],
                row_to_chat,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Chats ordered by recency. `filter` is a case-insensitive substring
    /// match on the chat name or address.
    pub fn list_chats(&self, filter: Option<&str>, limit: i64) -> Result<Vec<Chat>> {
        let conn = self.conn();
        let limit = clamp_limit(limit);

        let mut out = Vec::new();
        match filter {
            Some(q) if !q.is_empty() => {
                let mut stmt = conn.prepare(
                    "SELECT address, kind, name, last_activity FROM chats
                     WHERE name LIKE '%' || ?1 || '%' OR address LIKE '%' || ?1 || '%'
                     ORDER BY last_activity DESC
                     LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![q, limit], row_to_chat)?;
                for row in rows {
                    out.push(row?);
                }
            }
            _ => {
                let mut stmt = conn.prepare(
                    "SELECT address, kind, name, last_activity FROM chats
                     ORDER BY last_activity DESC
                     LIMIT ?1",
                )?;
                let rows = stmt.query_map(params![limit], row_to_chat)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    /// Delete a chat. Its messages (and their full-text rows) go with it.
    pub fn delete_chat(&self, address: &str) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM chats WHERE address = ?1", params![address])?;
        Ok(affected > 0)
    }

    pub fn count_chats(&self) -> Result<i64> {
        let n = self
            .conn()
            .query_row("SELECT COUNT(*) FROM chats", [], |row| row.get(0))?;
        Ok(n)
    }
}

fn row_to_chat(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chat> {
    let kind_str: String = row.get(1)?;
    let activity_secs: i64 = row.get(3)?;
    let last_activity = DateTime::from_timestamp(activity_secs, 0)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(3, activity_secs))?;

    Ok(Chat {
        address: row.get(0)?,
        kind: ChatKind::parse(&kind_str),
        name: row.get(2)?,
        last_activity,
    })
}
