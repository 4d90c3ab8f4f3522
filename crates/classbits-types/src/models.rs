use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Returned when a stored enum column holds an unknown value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} '{}'", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

/// Generates `as_str`, `Display` and `FromStr` for a fieldless enum whose
/// serde and database representations are the same lowercase string.
macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownVariant { kind: $kind, value: other.to_string() }),
                }
            }
        }
    };
}

// -- Roster --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Student,
    Teacher,
    Admin,
}

string_enum!(Role, "role", {
    Student => "student",
    Teacher => "teacher",
    Admin => "admin",
});

impl Role {
    /// Teachers and admins may decide group-approved siphons.
    pub fn is_staff(&self) -> bool {
        matches!(self, Self::Teacher | Self::Admin)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    Pending,
    Approved,
}

string_enum!(MemberStatus, "member status", {
    Pending => "pending",
    Approved => "approved",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub role: Role,
}

/// A group together with the group set and classroom that own it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupContext {
    pub group_id: Uuid,
    pub group_name: String,
    pub group_set_id: Uuid,
    pub group_set_name: String,
    pub classroom_id: Uuid,
    pub siphon_timeout_hours: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMember {
    pub user_id: Uuid,
    pub username: String,
    pub status: MemberStatus,
}

// -- Siphon --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiphonStatus {
    Pending,
    GroupApproved,
    Rejected,
    Expired,
    TeacherApproved,
}

string_enum!(SiphonStatus, "siphon status", {
    Pending => "pending",
    GroupApproved => "group_approved",
    Rejected => "rejected",
    Expired => "expired",
    TeacherApproved => "teacher_approved",
});

impl SiphonStatus {
    /// Pending and group-approved requests block a new siphon in the same group.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::GroupApproved)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteChoice {
    Yes,
    No,
}

string_enum!(VoteChoice, "vote", {
    Yes => "yes",
    No => "no",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vote {
    pub voter: Uuid,
    pub choice: VoteChoice,
}

/// Metadata of an evidentiary file attached to a siphon request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofMeta {
    pub original_name: String,
    pub stored_name: String,
    pub mime_type: String,
    pub size: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiphonRequest {
    pub id: Uuid,
    pub group: Uuid,
    pub classroom: Uuid,
    pub requested_by: Uuid,
    pub target_user: Uuid,
    pub amount: i64,
    pub reason: String,
    pub proof: Option<ProofMeta>,
    pub status: SiphonStatus,
    pub votes: Vec<Vote>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub version: i64,
}

impl SiphonRequest {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn vote_of(&self, voter: Uuid) -> Option<VoteChoice> {
        self.votes.iter().find(|v| v.voter == voter).map(|v| v.choice)
    }
}

// -- Ledger --

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub id: i64,
    pub user_id: Uuid,
    pub amount: i64,
    pub description: String,
    pub classroom: Option<Uuid>,
    pub assigned_by: Option<Uuid>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
