use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a notification is about. Stored as its snake_case name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// The recipient is the target of a new siphon; their account is frozen
    SiphonTargeted,
    /// A siphon was opened in the recipient's group and awaits their vote
    SiphonVoteRequested,
    /// The group approved a siphon; it now awaits a teacher decision
    SiphonGroupApproved,
    /// A teacher is asked to review a group-approved siphon
    SiphonTeacherReview,
    /// The group voted a siphon down
    SiphonRejected,
    /// A siphon expired before the group reached a decision
    SiphonExpired,
    /// A teacher rejected a group-approved siphon
    SiphonTeacherRejected,
    /// The recipient's account is no longer frozen
    AccountUnfrozen,
    /// Bits were taken from the recipient by an executed siphon
    SiphonBitsLost,
    /// The recipient received a share of an executed siphon
    SiphonShareReceived,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SiphonTargeted => "siphon_targeted",
            Self::SiphonVoteRequested => "siphon_vote_requested",
            Self::SiphonGroupApproved => "siphon_group_approved",
            Self::SiphonTeacherReview => "siphon_teacher_review",
            Self::SiphonRejected => "siphon_rejected",
            Self::SiphonExpired => "siphon_expired",
            Self::SiphonTeacherRejected => "siphon_teacher_rejected",
            Self::AccountUnfrozen => "account_unfrozen",
            Self::SiphonBitsLost => "siphon_bits_lost",
            Self::SiphonShareReceived => "siphon_share_received",
        }
    }
}

/// A single notification addressed to one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: Uuid,
    pub recipient: Uuid,
    pub kind: NotificationKind,
    pub message: String,
    pub siphon_id: Uuid,
    pub classroom_id: Uuid,
    pub created_at: DateTime<Utc>,
}
