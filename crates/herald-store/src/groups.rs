use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::database::{clamp_limit, Store};
use crate::error::{Result, StoreError};
use crate::models::{Group, GroupMember, MemberRole};

impl Store {
    pub fn upsert_group(
        &self,
        address: &str,
        name: &str,
        owner: &str,
        created_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT INTO groups (address, name, owner, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (address) DO UPDATE SET
                 name = CASE WHEN excluded.name = '' THEN groups.name ELSE excluded.name END,
                 owner = CASE WHEN excluded.owner = '' THEN groups.owner ELSE excluded.owner END,
                 created_at = COALESCE(excluded.created_at, groups.created_at),
                 updated_at = excluded.updated_at",
            params![
                address,
                name,
                owner,
                created_at.map(|t| t.to_rfc3339()),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Replace the member list of a group with the given snapshot.
    pub fn replace_group_members(
        &self,
        group: &str,
        members: &[(String, MemberRole)],
    ) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM group_members WHERE group_address = ?1",
            params![group],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO group_members (group_address, user_address, role, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            let now = Utc::now().to_rfc3339();
            for (user, role) in members {
                stmt.execute(params![group, user, role.as_str(), now])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_group(&self, address: &str) -> Result<Group> {
        self.conn()
            .query_row(
                "SELECT address, name, owner, created_at, updated_at FROM groups WHERE address = ?1",
                params![address],
                row_to_group,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    pub fn get_group_members(&self, address: &str) -> Result<Vec<GroupMember>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT group_address, user_address, role FROM group_members
             WHERE group_address = ?1
             ORDER BY user_address",
        )?;
        let rows = stmt.query_map(params![address], |row| {
            let role: String = row.get(2)?;
            Ok(GroupMember {
                group_address: row.get(0)?,
                user_address: row.get(1)?,
                role: MemberRole::parse(&role),
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    pub fn list_groups(&self, filter: Option<&str>, limit: i64) -> Result<Vec<Group>> {
        let conn = self.conn();
        let limit = clamp_limit(limit);

        let mut out = Vec::new();
        match filter {
            Some(q) if !q.is_empty() => {
                let mut stmt = conn.prepare(
                    "SELECT address, name, owner, created_at, updated_at FROM groups
                     WHERE name LIKE '%' || ?1 || '%' OR address LIKE '%' || ?1 || '%'
                     ORDER BY name
                     LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![q, limit], row_to_group)?;
                for row in rows {
                    out.push(row?);
                }
            }
            _ => {
                let mut stmt = conn.prepare(
                    "SELECT address, name, owner, created_at, updated_at FROM groups
                     ORDER BY name
                     LIMIT ?1",
                )?;
                let rows = stmt.query_map(params![limit], row_to_group)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    pub fn delete_group(&self, address: &str) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM groups WHERE address = ?1", params![address])?;
        Ok(affected > 0)
    }

    pub fn count_groups(&self) -> Result<i64> {
        let n = self
            .conn()
            .query_row("SELECT COUNT(*) FROM groups", [], |row| row.get(0))?;
        Ok(n)
    }
}

fn row_to_group(row: &rusqlite::Row<'_>) -> rusqlite::Result<Group> {
    let created_at = crate::messages::parse_rfc3339_opt(row, 3)?;
    let updated_str: String = row.get(4)?;
    let updated_at = DateTime::parse_from_rfc3339(&updated_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(Group {
        address: row.get(0)?,
        name: row.get(1)?,
        owner: row.get(2)?,
        created_at,
        updated_at,
    })
}
