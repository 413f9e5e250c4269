//! WhatsApp addressing.
//!
//! Every routable entity has an address of the form `{local}@{authority}`.
//! The authority tags the address as a direct user, a group, or a broadcast
//! list. Addresses compare by exact string equality, so user addresses must
//! be reduced to their base form (device and agent suffixes stripped) before
//! they are used as store keys.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Authority of direct user addresses.
pub const USER_AUTHORITY: &str = "s.whatsapp.net";

/// Authority of group addresses.
pub const GROUP_AUTHORITY: &str = "g.us";

/// Authority of broadcast list addresses.
pub const BROADCAST_AUTHORITY: &str = "broadcast";

#[derive(Error, Debug)]
pub enum AddrError {
    #[error("empty address")]
    Empty,

    #[error("address '{0}' has no authority part")]
    MissingAuthority(String),

    #[error("address '{0}' has an empty local part")]
    MissingLocalPart(String),
}

/// Classification of a chat derived from its address authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Dm,
    Group,
    Broadcast,
    Unknown,
}

impl ChatKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatKind::Dm => "dm",
            ChatKind::Group => "group",
            ChatKind::Broadcast => "broadcast",
            ChatKind::Unknown => "unknown",
        }
    }

    /// Parse a stored kind string. Anything unrecognised maps to `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s {
            "dm" => ChatKind::Dm,
            "group" => ChatKind::Group,
            "broadcast" => ChatKind::Broadcast,
            _ => ChatKind::Unknown,
        }
    }
}

impl fmt::Display for ChatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A protocol address, `{local}@{authority}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Addr {
    local: String,
    authority: String,
}

impl Addr {
    /// Build an address from its two parts.
    pub fn new(local: impl Into<String>, authority: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            authority: authority.into(),
        }
    }

    /// The address of a direct user chat for the given phone local part.
    pub fn user(phone: impl Into<String>) -> Self {
        Self::new(phone, USER_AUTHORITY)
    }

    /// Parse a full `local@authority` address string.
    pub fn parse(s: &str) -> Result<Self, AddrError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AddrError::Empty);
        }
        let (local, authority) = s
            .split_once('@')
            .ok_or_else(|| AddrError::MissingAuthority(s.to_string()))?;
        if local.is_empty() {
            return Err(AddrError::MissingLocalPart(s.to_string()));
        }
        Ok(Self::new(local, authority))
    }

    /// Resolve user-supplied input: either a full address or a bare phone
    /// local part, which becomes a direct user address.
    pub fn from_user_input(s: &str) -> Result<Self, AddrError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AddrError::Empty);
        }
        if s.contains('@') {
            Self::parse(s)
        } else {
            Ok(Self::user(s))
        }
    }

    pub fn local(&self) -> &str {
        &self.local
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// The base form of the address: agent (`.N`) and device (`:N`) suffixes
    /// on the local part are dropped. Store keys are always base form.
    pub fn base(&self) -> Addr {
        let local = self
            .local
            .split(|c| c == ':' || c == '.')
            .next()
            .unwrap_or(&self.local);
        Addr::new(local, self.authority.clone())
    }

    /// Whether the local part still carries a device or agent suffix.
    pub fn has_device_suffix(&self) -> bool {
        self.local.contains(':') || self.local.contains('.')
    }

    pub fn kind(&self) -> ChatKind {
        match self.authority.as_str() {
            USER_AUTHORITY => ChatKind::Dm,
            GROUP_AUTHORITY => ChatKind::Group,
            BROADCAST_AUTHORITY => ChatKind::Broadcast,
            _ => ChatKind::Unknown,
        }
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.local, self.authority)
    }
}

impl FromStr for Addr {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Addr::parse(s)
    }
}

impl Serialize for Addr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Addr {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Addr::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trip() {
        let addr = Addr::parse("12025550123@s.whatsapp.net").unwrap();
        assert_eq!(addr.local(), "12025550123");
        assert_eq!(addr.authority(), "s.whatsapp.net");
        assert_eq!(addr.to_string(), "12025550123@s.whatsapp.net");
    }

    #[test]
    fn kind_from_authority() {
        assert_eq!(Addr::parse("1@s.whatsapp.net").unwrap().kind(), ChatKind::Dm);
        assert_eq!(
            Addr::parse("123-456@g.us").unwrap().kind(),
            ChatKind::Group
        );
        assert_eq!(
            Addr::parse("status@broadcast").unwrap().kind(),
            ChatKind::Broadcast
        );
        assert_eq!(
            Addr::parse("x@example.org").unwrap().kind(),
            ChatKind::Unknown
        );
    }

    #[test]
    fn base_strips_device_and_agent() {
        let addr = Addr::parse("12025550123.2:47@s.whatsapp.net").unwrap();
        assert!(addr.has_device_suffix());
        let base = addr.base();
        assert_eq!(base.to_string(), "12025550123@s.whatsapp.net");
        assert!(!base.has_device_suffix());
    }

    #[test]
    fn user_input_accepts_bare_phone() {
        let addr = Addr::from_user_input("12025550123").unwrap();
        assert_eq!(addr.to_string(), "12025550123@s.whatsapp.net");

        let full = Addr::from_user_input("123-456@g.us").unwrap();
        assert_eq!(full.kind(), ChatKind::Group);
    }

    #[test]
    fn rejects_malformed() {
        assert!(Addr::parse("").is_err());
        assert!(Addr::parse("no-authority").is_err());
        assert!(Addr::parse("@g.us").is_err());
    }
}
