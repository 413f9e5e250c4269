//! Contacts, local aliases, and tags.
//!
//! Contact rows are refresh-driven: the upstream contact list overwrites the
//! name candidates wholesale. Aliases and tags live in their own overlay
//! tables precisely so a refresh can never clobber them.

use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::database::{clamp_limit, Store};
use crate::error::{Result, StoreError};
use crate::models::Contact;

/// Display-name resolution: local alias, full name, push name, business
/// name, first name, then the address. NULLIF folds empty strings into
/// "absent" at each step.
const DISPLAY_NAME_EXPR: &str = "COALESCE(NULLIF(a.alias, ''), NULLIF(c.full_name, ''), \
     NULLIF(c.push_name, ''), NULLIF(c.business_name, ''), NULLIF(c.first_name, ''), c.address)";

const CONTACT_SELECT: &str = "SELECT c.address, c.phone, c.push_name, c.full_name, c.first_name, c.business_name, \
     COALESCE(a.alias, ''), ";

impl Store {
    pub fn upsert_contact(
        &self,
        address: &str,
        phone: &str,
        push_name: &str,
        full_name: &str,
        first_name: &str,
        business_name: &str,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT INTO contacts (address, phone, push_name, full_name, first_name, business_name, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (address) DO UPDATE SET
                 phone = excluded.phone,
                 push_name = excluded.push_name,
                 full_name = excluded.full_name,
                 first_name = excluded.first_name,
                 business_name = excluded.business_name,
                 updated_at = excluded.updated_at",
            params![
                address,
                phone,
                push_name,
                full_name,
                first_name,
                business_name,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_contact(&self, address: &str) -> Result<Contact> {
        let sql = format!(
            "{CONTACT_SELECT}{DISPLAY_NAME_EXPR}, c.updated_at
             FROM contacts c
             LEFT JOIN contact_aliases a ON a.address = c.address
             WHERE c.address = ?1"
        );
        self.conn()
            .query_row(&sql, params![address], row_to_contact)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Contacts matching a case-insensitive substring across every name
    /// candidate, the alias, the phone, and the address. No filter lists
    /// everything up to the limit.
    pub fn list_contacts(&self, filter: Option<&str>, limit: i64) -> Result<Vec<Contact>> {
        let conn = self.conn();
        let limit = clamp_limit(limit);
        let base = format!(
            "{CONTACT_SELECT}{DISPLAY_NAME_EXPR}, c.updated_at
             FROM contacts c
             LEFT JOIN contact_aliases a ON a.address = c.address"
        );

        let mut out = Vec::new();
        match filter {
            Some(q) if !q.is_empty() => {
                let sql = format!(
                    "{base}
                     WHERE c.push_name LIKE '%' || ?1 || '%'
                        OR c.full_name LIKE '%' || ?1 || '%'
                        OR c.first_name LIKE '%' || ?1 || '%'
                        OR c.business_name LIKE '%' || ?1 || '%'
                        OR a.alias LIKE '%' || ?1 || '%'
                        OR c.phone LIKE '%' || ?1 || '%'
                        OR c.address LIKE '%' || ?1 || '%'
                     ORDER BY c.address
                     LIMIT ?2"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params![q, limit], row_to_contact)?;
                for row in rows {
                    out.push(row?);
                }
            }
            _ => {
                let sql = format!("{base} ORDER BY c.address LIMIT ?1");
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params![limit], row_to_contact)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    pub fn set_alias(&self, address: &str, alias: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO contact_aliases (address, alias, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (address) DO UPDATE SET
                 alias = excluded.alias,
                 updated_at = excluded.updated_at",
            params![address, alias, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn clear_alias(&self, address: &str) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM contact_aliases WHERE address = ?1",
            params![address],
        )?;
        Ok(affected > 0)
    }

    pub fn add_tag(&self, address: &str, tag: &str) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO contact_tags (address, tag, updated_at)
             VALUES (?1, ?2, ?3)",
            params![address, tag, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn remove_tag(&self, address: &str, tag: &str) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM contact_tags WHERE address = ?1 AND tag = ?2",
            params![address, tag],
        )?;
        Ok(affected > 0)
    }

    pub fn get_tags(&self, address: &str) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT tag FROM contact_tags WHERE address = ?1 ORDER BY tag")?;
        let rows = stmt.query_map(params![address], |row| row.get(0))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    pub fn count_contacts(&self) -> Result<i64> {
        let n = self
            .conn()
            .query_row("SELECT COUNT(*) FROM contacts", [], |row| row.get(0))?;
        Ok(n)
    }
}

fn row_to_contact(row: &rusqlite::Row<'_>) -> rusqlite::Result<Contact> {
    let updated_str: String = row.get(8)?;
    let updated_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&updated_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(Contact {
        address: row.get(0)?,
        phone: row.get(1)?,
        push_name: row.get(2)?,
        full_name: row.get(3)?,
        first_name: row.get(4)?,
        business_name: row.get(5)?,
        alias: row.get(6)?,
        display_name: row.get(7)?,
        updated_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::open_store;

    #[test]
    fn display_name_resolution_order() {
        let (store, _dir) = open_store();
        let addr = "1@s.whatsapp.net";

        store.upsert_contact(addr, "1", "", "", "", "").unwrap();
        assert_eq!(store.get_contact(addr).unwrap().display_name, addr);

        store.upsert_contact(addr, "1", "", "", "Al", "").unwrap();
        assert_eq!(store.get_contact(addr).unwrap().display_name, "Al");

        store.upsert_contact(addr, "1", "", "", "Al", "Alice Inc").unwrap();
        assert_eq!(store.get_contact(addr).unwrap().display_name, "Alice Inc");

        store.upsert_contact(addr, "1", "ali", "", "Al", "Alice Inc").unwrap();
        assert_eq!(store.get_contact(addr).unwrap().display_name, "ali");

        store
            .upsert_contact(addr, "1", "ali", "Alice Doe", "Al", "Alice Inc")
            .unwrap();
        assert_eq!(store.get_contact(addr).unwrap().display_name, "Alice Doe");

        store.set_alias(addr, "bestie").unwrap();
        assert_eq!(store.get_contact(addr).unwrap().display_name, "bestie");

        // An empty alias counts as absent, not as a name.
        store.set_alias(addr, "").unwrap();
        assert_eq!(store.get_contact(addr).unwrap().display_name, "Alice Doe");
    }

    #[test]
    fn refresh_preserves_alias_and_tags() {
        let (store, _dir) = open_store();
        let addr = "1@s.whatsapp.net";

        store.upsert_contact(addr, "1", "ali", "", "", "").unwrap();
        store.set_alias(addr, "bestie").unwrap();
        store.add_tag(addr, "work").unwrap();
        store.add_tag(addr, "vip").unwrap();

        // Simulated refresh from upstream with new candidate names.
        store
            .upsert_contact(addr, "1", "alinew", "Alice Doe", "Alice", "")
            .unwrap();

        let contact = store.get_contact(addr).unwrap();
        assert_eq!(contact.alias, "bestie");
        assert_eq!(contact.display_name, "bestie");
        assert_eq!(store.get_tags(addr).unwrap(), vec!["vip", "work"]);
    }

    #[test]
    fn tags_are_a_set() {
        let (store, _dir) = open_store();
        let addr = "1@s.whatsapp.net";
        store.upsert_contact(addr, "1", "", "", "", "").unwrap();

        store.add_tag(addr, "work").unwrap();
        store.add_tag(addr, "work").unwrap();
        assert_eq!(store.get_tags(addr).unwrap(), vec!["work"]);

        assert!(store.remove_tag(addr, "work").unwrap());
        assert!(!store.remove_tag(addr, "work").unwrap());
        assert!(store.get_tags(addr).unwrap().is_empty());
    }

    #[test]
    fn search_matches_alias_and_phone() {
        let (store, _dir) = open_store();
        store
            .upsert_contact("1@s.whatsapp.net", "12025550123", "", "Alice Doe", "", "")
            .unwrap();
        store
            .upsert_contact("2@s.whatsapp.net", "12025550199", "", "Bob Roe", "", "")
            .unwrap();
        store.set_alias("2@s.whatsapp.net", "plumber").unwrap();

        assert_eq!(store.list_contacts(Some("plumb"), 10).unwrap().len(), 1);
        assert_eq!(store.list_contacts(Some("0123"), 10).unwrap().len(), 1);
        assert_eq!(store.list_contacts(None, 10).unwrap().len(), 2);
    }
}
