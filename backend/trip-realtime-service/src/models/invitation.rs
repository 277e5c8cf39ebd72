use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::member::MemberRole;

/// Invitations expire a week after creation.
pub const INVITATION_TTL_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InvitationStatus {
    Pending,
    Accepted,
    Declined,
    Cancelled,
}

impl InvitationStatus {
    pub fn to_db(&self) -> &'static str {
        match self {
            InvitationStatus::Pending => "PENDING",
            InvitationStatus::Accepted => "ACCEPTED",
            InvitationStatus::Declined => "DECLINED",
            InvitationStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(InvitationStatus::Pending),
            "ACCEPTED" => Some(InvitationStatus::Accepted),
            "DECLINED" => Some(InvitationStatus::Declined),
            "CANCELLED" => Some(InvitationStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invitation {
    pub id: String,
    pub trip_id: String,
    pub inviter_id: String,
    pub invitee_email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invitee_id: Option<String>,
    pub role: MemberRole,
    pub status: InvitationStatus,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// `POST /v1/trips/{id}/invitations` body
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvitationRequest {
    pub email: String,
    #[serde(default = "default_invitation_role")]
    pub role: MemberRole,
}

fn default_invitation_role() -> MemberRole {
    MemberRole::Member
}

impl Invitation {
    pub fn pending(
        trip_id: &str,
        inviter_id: &str,
        invitee_email: &str,
        invitee_id: Option<String>,
        role: MemberRole,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            trip_id: trip_id.to_string(),
            inviter_id: inviter_id.to_string(),
            invitee_email: invitee_email.trim().to_ascii_lowercase(),
            invitee_id,
            role,
            status: InvitationStatus::Pending,
            expires_at: now + Duration::days(INVITATION_TTL_DAYS),
            created_at: now,
            updated_at: now,
        }
    }
}

/// User row resolved by email when inviting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_invitation_defaults() {
        let invitation = Invitation::pending("T1", "U1", " Friend@Example.com ", None, MemberRole::Member);
        assert_eq!(invitation.status, InvitationStatus::Pending);
        assert_eq!(invitation.invitee_email, "friend@example.com");
        assert!(invitation.expires_at > invitation.created_at);

        let wire = serde_json::to_value(&invitation).unwrap();
        assert_eq!(wire["status"], "PENDING");
        assert_eq!(wire["role"], "MEMBER");
        assert!(wire.get("inviteeId").is_none());
    }

    #[test]
    fn test_request_defaults_to_member() {
        let req: InvitationRequest = serde_json::from_str(r#"{"email":"a@b.c"}"#).unwrap();
        assert_eq!(req.role, MemberRole::Member);
    }
}
