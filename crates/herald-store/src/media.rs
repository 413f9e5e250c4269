//! Media download tracking.

use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::database::Store;
use crate::error::{Result, StoreError};
use crate::models::MediaDownloadInfo;

impl Store {
    /// Media metadata for a message. `NotFound` covers both a missing row
    /// and a message with no media attached.
    pub fn get_media_info(&self, chat: &str, msg_id: &str) -> Result<MediaDownloadInfo> {
        let msg = self.get_message(chat, msg_id)?;
        let media = msg.media.ok_or(StoreError::NotFound)?;
        Ok(MediaDownloadInfo {
            chat: chat.to_string(),
            msg_id: msg_id.to_string(),
            media,
        })
    }

    /// Record a completed download: the local path and the completion
    /// instant, set together under the unique key.
    pub fn mark_downloaded(
        &self,
        chat: &str,
        msg_id: &str,
        local_path: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE messages SET local_path = ?3, downloaded_at = ?4
             WHERE chat_address = ?1 AND message_id = ?2",
            params![chat, msg_id, local_path, at.to_rfc3339()],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{media_message, open_store, ts};

    #[test]
    fn media_info_and_completion() {
        let (store, _dir) = open_store();
        let msg = media_message("1@s.whatsapp.net", "m1", 1000);
        store.upsert_chat_for(&msg).unwrap();
        store.upsert_message(&msg).unwrap();

        let info = store.get_media_info("1@s.whatsapp.net", "m1").unwrap();
        assert!(info.media.downloadable());
        assert!(info.media.local_path.is_empty());

        store
            .mark_downloaded("1@s.whatsapp.net", "m1", "/data/media/1/m1.jpg", ts(5000))
            .unwrap();

        let info = store.get_media_info("1@s.whatsapp.net", "m1").unwrap();
        assert_eq!(info.media.local_path, "/data/media/1/m1.jpg");
        assert_eq!(info.media.downloaded_at, Some(ts(5000)));
    }

    #[test]
    fn text_only_message_has_no_media_info() {
        let (store, _dir) = open_store();
        let msg = crate::test_util::text_message("1@s.whatsapp.net", "m1", "hi", 1000);
        store.upsert_chat_for(&msg).unwrap();
        store.upsert_message(&msg).unwrap();

        assert!(matches!(
            store.get_media_info("1@s.whatsapp.net", "m1"),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn mark_downloaded_requires_existing_row() {
        let (store, _dir) = open_store();
        assert!(matches!(
            store.mark_downloaded("1@s.whatsapp.net", "nope", "/x", ts(1)),
            Err(StoreError::NotFound)
        ));
    }
}
