//! Store connection management.
//!
//! The [`Store`] owns a single [`rusqlite::Connection`] behind a mutex and
//! guarantees that pragmas and migrations are applied before any other
//! operation. `app.db` runs in WAL mode with `synchronous=NORMAL`: message
//! ingest is replayable from upstream, so losing the last commit on power
//! failure is an accepted trade for write throughput.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;

use crate::error::Result;
use crate::migrations;

/// Name of the application database inside the data directory. The protocol
/// client keeps its own `session.db` next to it; we never touch that file.
pub const APP_DB_FILE: &str = "app.db";

pub struct Store {
    conn: Mutex<Connection>,
    data_dir: PathBuf,
    fts: bool,
}

impl Store {
    /// Open (or create) the store inside `data_dir`.
    ///
    /// The directory is created with owner-only permissions; database files
    /// are chmodded to 0600 once they exist.
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        restrict_dir_permissions(data_dir)?;

        let db_path = data_dir.join(APP_DB_FILE);
        tracing::info!(path = %db_path.display(), "opening store");

        let conn = Connection::open(&db_path)?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;

        migrations::run_migrations(&conn)?;
        let fts = ensure_fts(&conn);

        restrict_file_permissions(&db_path)?;

        Ok(Self {
            conn: Mutex::new(conn),
            data_dir: data_dir.to_path_buf(),
            fts,
        })
    }

    /// Whether the SQLite build carries FTS5. Probed once at open.
    pub fn fts_enabled(&self) -> bool {
        self.fts
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Directory where downloaded media for `chat` is placed.
    pub fn media_dir(&self, chat: &str) -> PathBuf {
        self.data_dir.join("media").join(chat)
    }

    /// Flush the WAL and release the connection.
    pub fn close(self) -> Result<()> {
        let conn = self.conn.into_inner().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        // Connection closes on drop; surface close errors explicitly instead.
        if let Err((_conn, err)) = conn.close() {
            return Err(err.into());
        }
        Ok(())
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn stats(&self) -> Result<crate::models::StoreStats> {
        Ok(crate::models::StoreStats {
            messages: self.count_messages()?,
            chats: self.count_chats()?,
            contacts: self.count_contacts()?,
            groups: self.count_groups()?,
            fts_enabled: self.fts,
        })
    }

    /// Number of rows in the full-text index. Only meaningful when FTS is
    /// enabled; used to assert index coherence.
    #[cfg(test)]
    pub(crate) fn count_fts_rows(&self) -> Result<i64> {
        let n = self
            .conn()
            .query_row("SELECT COUNT(*) FROM messages_fts", [], |row| row.get(0))?;
        Ok(n)
    }
}

/// Try to create the full-text index and its coherence triggers.
///
/// Returns false when the SQLite build has no FTS5; callers then use the
/// substring fallback in search.
fn ensure_fts(conn: &Connection) -> bool {
    const FTS_SQL: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
    text, media_caption, filename, chat_name, sender_name,
    content='messages',
    content_rowid='id'
);

CREATE TRIGGER IF NOT EXISTS messages_ai AFTER INSERT ON messages BEGIN
    INSERT INTO messages_fts(rowid, text, media_caption, filename, chat_name, sender_name)
    VALUES (new.id, COALESCE(new.text, ''), COALESCE(new.media_caption, ''),
            COALESCE(new.filename, ''), COALESCE(new.chat_name, ''), COALESCE(new.sender_name, ''));
END;

CREATE TRIGGER IF NOT EXISTS messages_ad AFTER DELETE ON messages BEGIN
    INSERT INTO messages_fts(messages_fts, rowid, text, media_caption, filename, chat_name, sender_name)
    VALUES ('delete', old.id, COALESCE(old.text, ''), COALESCE(old.media_caption, ''),
            COALESCE(old.filename, ''), COALESCE(old.chat_name, ''), COALESCE(old.sender_name, ''));
END;

CREATE TRIGGER IF NOT EXISTS messages_au AFTER UPDATE ON messages BEGIN
    INSERT INTO messages_fts(messages_fts, rowid, text, media_caption, filename, chat_name, sender_name)
    VALUES ('delete', old.id, COALESCE(old.text, ''), COALESCE(old.media_caption, ''),
            COALESCE(old.filename, ''), COALESCE(old.chat_name, ''), COALESCE(old.sender_name, ''));
    INSERT INTO messages_fts(rowid, text, media_caption, filename, chat_name, sender_name)
    VALUES (new.id, COALESCE(new.text, ''), COALESCE(new.media_caption, ''),
            COALESCE(new.filename, ''), COALESCE(new.chat_name, ''), COALESCE(new.sender_name, ''));
END;
"#;

    match conn.execute_batch(FTS_SQL) {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!(error = %err, "FTS5 unavailable, search will use substring fallback");
            false
        }
    }
}

/// Clamp a caller-supplied limit: non-positive becomes 50, anything over 200
/// becomes 200.
pub(crate) fn clamp_limit(limit: i64) -> i64 {
    if limit <= 0 {
        50
    } else {
        limit.min(200)
    }
}

#[cfg(unix)]
fn restrict_dir_permissions(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn restrict_dir_permissions(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn restrict_file_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_file_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
