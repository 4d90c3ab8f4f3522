use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{SiphonRequest, SiphonStatus, VoteChoice};

// -- JWT Claims --

/// Bearer token claims. Roles are not carried in the token; they are read
/// from the users table on every privileged action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub exp: usize,
}

// -- Siphon --

/// JSON body of `POST /group/{groupId}/create`. Multipart submissions carry
/// the same fields as text parts plus an optional `proof` file part.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateSiphonRequest {
    pub target_user_id: Uuid,
    pub reason: String,
    pub amount: i64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CastVoteRequest {
    pub vote: VoteChoice,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VotingProgress {
    pub yes_votes: usize,
    pub no_votes: usize,
    pub total_votes: usize,
    pub total_eligible_voters: usize,
    pub majority_threshold: usize,
    pub needs_more_votes: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteResponse {
    pub status: SiphonStatus,
    pub voting_progress: VotingProgress,
}

/// `GET /{id}`: the request plus its live tally.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SiphonDetailResponse {
    #[serde(flatten)]
    pub request: SiphonRequest,
    pub voting_progress: VotingProgress,
}

// -- Notifications --

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationResponse {
    pub id: Uuid,
    pub kind: String,
    pub message: String,
    pub siphon_id: Option<Uuid>,
    pub classroom_id: Option<Uuid>,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

// -- Errors --

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}
