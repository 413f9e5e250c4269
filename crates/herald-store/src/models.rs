use chrono::{DateTime, Utc};
use herald_shared::ChatKind;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chat {
    pub address: String,
    pub kind: ChatKind,
    pub name: String,
    pub last_activity: DateTime<Utc>,
}

/// A contact row joined with its local alias overlay.
///
/// `display_name` is resolved by the store: alias, then full name, then push
/// name, then business name, then first name, then the address itself. Empty
/// strings count as absent at every step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Contact {
    pub address: String,
    pub phone: String,
    pub push_name: String,
    pub full_name: String,
    pub first_name: String,
    pub business_name: String,
    pub alias: String,
    pub display_name: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Group {
    pub address: String,
    pub name: String,
    pub owner: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupMember {
    pub group_address: String,
    pub user_address: String,
    pub role: MemberRole,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Member,
    Admin,
    Superadmin,
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberRole::Member => "member",
            MemberRole::Admin => "admin",
            MemberRole::Superadmin => "superadmin",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "superadmin" => MemberRole::Superadmin,
            "admin" => MemberRole::Admin,
            _ => MemberRole::Member,
        }
    }
}

/// A search result: the full message row plus a snippet when the full-text
/// index produced one (empty under the substring fallback).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub message: herald_shared::Message,
    pub snippet: String,
}

/// Everything needed to download a message's media, plus the completion
/// fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaDownloadInfo {
    pub chat: String,
    pub msg_id: String,
    pub media: herald_shared::MediaInfo,
}

/// Row counts reported through diagnostics.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub messages: i64,
    pub chats: i64,
    pub contacts: i64,
    pub groups: i64,
    pub fts_enabled: bool,
}
