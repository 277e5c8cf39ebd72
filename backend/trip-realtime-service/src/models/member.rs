//! Member role and related data structures
//!
//! Roles have a natural ordering: Member < Admin < Owner

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Member role in a trip with natural hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MemberRole {
    /// Regular member - can read the trip and contribute content
    Member = 0,
    /// Admin - can edit the trip, invite and change member roles
    Admin = 1,
    /// Owner - set at trip creation, never transferred
    Owner = 2,
}

impl MemberRole {
    pub const ALL: [MemberRole; 3] = [MemberRole::Member, MemberRole::Admin, MemberRole::Owner];

    /// Parse role from database string, case-insensitively
    pub fn from_db(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "MEMBER" => Some(Self::Member),
            "ADMIN" => Some(Self::Admin),
            "OWNER" => Some(Self::Owner),
            _ => None,
        }
    }

    /// Convert role to database string
    pub fn to_db(&self) -> &'static str {
        match self {
            Self::Member => "MEMBER",
            Self::Admin => "ADMIN",
            Self::Owner => "OWNER",
        }
    }

    /// Check if this role meets `minimum`
    pub fn at_least(&self, minimum: MemberRole) -> bool {
        *self >= minimum
    }
}

impl fmt::Display for MemberRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_db())
    }
}

/// Parse from string (for API requests)
impl std::str::FromStr for MemberRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db(s).ok_or_else(|| format!("Invalid role: {}", s))
    }
}

impl Serialize for MemberRole {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.to_db())
    }
}

impl<'de> Deserialize<'de> for MemberRole {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

/// Active membership of a user in a trip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TripMember {
    pub trip_id: String,
    pub user_id: String,
    pub role: MemberRole,
    pub joined_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_ordering() {
        assert!(MemberRole::Member < MemberRole::Admin);
        assert!(MemberRole::Admin < MemberRole::Owner);
        assert!(MemberRole::Owner.at_least(MemberRole::Admin));
        assert!(!MemberRole::Member.at_least(MemberRole::Admin));
    }

    #[test]
    fn test_from_db() {
        assert_eq!(MemberRole::from_db("MEMBER"), Some(MemberRole::Member));
        assert_eq!(MemberRole::from_db("admin"), Some(MemberRole::Admin));
        assert_eq!(MemberRole::from_db("Owner"), Some(MemberRole::Owner));
        assert_eq!(MemberRole::from_db("moderator"), None);
    }

    #[test]
    fn test_serde_is_uppercase_and_lenient() {
        assert_eq!(serde_json::to_string(&MemberRole::Admin).unwrap(), "\"ADMIN\"");
        let role: MemberRole = serde_json::from_str("\"owner\"").unwrap();
        assert_eq!(role, MemberRole::Owner);
        assert!(serde_json::from_str::<MemberRole>("\"guest\"").is_err());
    }
}
