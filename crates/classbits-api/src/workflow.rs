//! The siphon state machine.
//!
//! Every transition runs inside one `Database::transaction`: the status
//! change, votes, ledger transfer, freeze bookkeeping and the persisted
//! notifications commit together or not at all. Functions are synchronous and
//! take `now` explicitly; handlers call them through `spawn_blocking` and
//! publish the returned notifications once the call has returned.

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use classbits_db::ledger::{self, Transfer, TransferReceipt};
use classbits_db::{Database, DbError, DbResult, LedgerError, freeze, notifications, queries, siphons};
use classbits_notify::{SiphonContext, Transition, plan};
use classbits_types::api::{SiphonDetailResponse, VoteResponse};
use classbits_types::events::Notification;
use classbits_types::models::{
    GroupContext, MemberStatus, ProofMeta, SiphonRequest, SiphonStatus, VoteChoice,
};

use crate::sanitize::sanitize_reason;
use crate::storage::MAX_PROOF_SIZE;
use crate::tally::{Decision, tally};

pub const MAX_REASON_BYTES: usize = 5000;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    Forbidden(&'static str),

    #[error("{0}")]
    Validation(String),

    #[error("group already has an active siphon request")]
    ActiveSiphonExists,

    #[error("target balance {balance} is below the requested {requested} bits")]
    InsufficientFunds { balance: i64, requested: i64 },

    #[error("siphon request is not open for voting")]
    NotOpenForVoting,

    #[error("siphon request is {0}, not awaiting a teacher decision")]
    NotAwaitingTeacher(SiphonStatus),

    #[error("transfer failed: {0}")]
    Transfer(LedgerError),

    #[error("siphon request was modified concurrently")]
    Conflict,

    #[error(transparent)]
    Db(DbError),
}

impl From<DbError> for WorkflowError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Ledger(e) => Self::Transfer(e),
            other => Self::Db(other),
        }
    }
}

pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// The result of a committed transition and the notifications it persisted.
/// The caller publishes `notifications` to live subscribers.
#[derive(Debug)]
pub struct Committed<T> {
    pub value: T,
    pub notifications: Vec<Notification>,
}

#[derive(Debug)]
pub struct NewSiphon {
    pub group_id: Uuid,
    pub requested_by: Uuid,
    pub target_user: Uuid,
    pub reason: String,
    pub amount: i64,
    pub proof: Option<ProofMeta>,
}

#[derive(Debug)]
pub enum VoteOutcome {
    Recorded(VoteResponse),
    /// The deadline had passed; the request is now expired and the vote was
    /// not recorded.
    Expired,
}

#[derive(Debug)]
pub struct Execution {
    pub request: SiphonRequest,
    pub receipt: TransferReceipt,
}

// -- Transitions --

pub fn create(db: &Database, new: NewSiphon, now: DateTime<Utc>) -> WorkflowResult<Committed<SiphonRequest>> {
    if new.amount <= 0 {
        return Err(WorkflowError::Validation("amount must be a positive number of bits".into()));
    }
    let reason = sanitize_reason(&new.reason);
    if reason.is_empty() {
        return Err(WorkflowError::Validation("reason is required".into()));
    }
    if reason.len() > MAX_REASON_BYTES {
        return Err(WorkflowError::Validation(format!(
            "reason exceeds {} bytes",
            MAX_REASON_BYTES
        )));
    }
    if new.proof.as_ref().is_some_and(|p| p.size as usize > MAX_PROOF_SIZE) {
        return Err(WorkflowError::Validation("proof file exceeds 10 MiB".into()));
    }

    db.transaction(|tx| -> WorkflowResult<Committed<SiphonRequest>> {
        let group = queries::group_context(tx, new.group_id)?.ok_or(WorkflowError::NotFound("group"))?;

        if queries::member_status(tx, group.group_id, new.requested_by)? != Some(MemberStatus::Approved) {
            return Err(WorkflowError::Forbidden("only approved group members can request a siphon"));
        }
        if new.target_user == new.requested_by {
            return Err(WorkflowError::Validation("you cannot target yourself".into()));
        }
        if queries::member_status(tx, group.group_id, new.target_user)? != Some(MemberStatus::Approved) {
            return Err(WorkflowError::Validation("target user not found in this group".into()));
        }
        if siphons::active_for_group(tx, group.group_id)?.is_some() {
            return Err(WorkflowError::ActiveSiphonExists);
        }

        let balance = ledger::balance(tx, new.target_user, Some(group.classroom_id))?;
        if balance < new.amount {
            return Err(WorkflowError::InsufficientFunds {
                balance,
                requested: new.amount,
            });
        }

        let request = SiphonRequest {
            id: Uuid::new_v4(),
            group: group.group_id,
            classroom: group.classroom_id,
            requested_by: new.requested_by,
            target_user: new.target_user,
            amount: new.amount,
            reason,
            proof: new.proof,
            status: SiphonStatus::Pending,
            votes: Vec::new(),
            expires_at: now + Duration::hours(group.siphon_timeout_hours),
            created_at: now,
            updated_at: now,
            version: 0,
        };

        // The partial unique index backs up the check above
        siphons::insert(tx, &request).map_err(|e| {
            if siphons::is_constraint_violation(&e) {
                WorkflowError::ActiveSiphonExists
            } else {
                e.into()
            }
        })?;
        freeze::freeze(tx, request.target_user, request.classroom, request.id, now)?;

        let voters = eligible_voters(tx, &request)?;
        let target_name = username_of(tx, request.target_user)?;
        let out = plan(
            &siphon_context(&request, &group, &target_name),
            &Transition::Created {
                voters: &voters,
                expires_at: request.expires_at,
            },
            now,
        );
        notifications::insert_all(tx, &out)?;

        info!(
            "Siphon {} opened in group {} against {} for {} bits",
            request.id, group.group_id, request.target_user, request.amount
        );
        Ok(Committed {
            value: request,
            notifications: out,
        })
    })
}

pub fn vote(
    db: &Database,
    siphon_id: Uuid,
    voter: Uuid,
    choice: VoteChoice,
    now: DateTime<Utc>,
) -> WorkflowResult<Committed<VoteOutcome>> {
    db.transaction(|tx| -> WorkflowResult<Committed<VoteOutcome>> {
        let request = siphons::load(tx, siphon_id)?.ok_or(WorkflowError::NotFound("siphon request"))?;

        if voter == request.target_user {
            return Err(WorkflowError::Forbidden("the target of a siphon cannot vote on it"));
        }
        if request.status != SiphonStatus::Pending {
            return Err(WorkflowError::NotOpenForVoting);
        }
        if queries::member_status(tx, request.group, voter)? != Some(MemberStatus::Approved) {
            return Err(WorkflowError::Forbidden("only approved group members can vote"));
        }

        if request.is_expired_at(now) {
            let out = expire(tx, &request, now)?;
            return Ok(Committed {
                value: VoteOutcome::Expired,
                notifications: out,
            });
        }

        siphons::upsert_vote(tx, request.id, voter, choice, now)?;
        let votes = siphons::votes(tx, request.id)?;
        let eligible = eligible_voters(tx, &request)?;
        let result = tally(&eligible, &votes);

        let status = match result.decision {
            Decision::Pending => SiphonStatus::Pending,
            Decision::Approve => SiphonStatus::GroupApproved,
            Decision::Reject => SiphonStatus::Rejected,
        };
        set_status(tx, &request, status, now)?;

        let out = match result.decision {
            Decision::Pending => Vec::new(),
            Decision::Approve => {
                let group = group_of(tx, &request)?;
                let target_name = username_of(tx, request.target_user)?;
                let members = queries::approved_member_ids(tx, request.group)?;
                let teachers = queries::classroom_teacher_ids(tx, request.classroom)?;
                plan(
                    &siphon_context(&request, &group, &target_name),
                    &Transition::GroupApproved {
                        members: &members,
                        teachers: &teachers,
                    },
                    now,
                )
            }
            Decision::Reject => {
                freeze::unfreeze(tx, request.target_user, request.classroom, request.id, now)?;
                let group = group_of(tx, &request)?;
                let target_name = username_of(tx, request.target_user)?;
                let members = queries::approved_member_ids(tx, request.group)?;
                plan(
                    &siphon_context(&request, &group, &target_name),
                    &Transition::GroupRejected { members: &members },
                    now,
                )
            }
        };
        notifications::insert_all(tx, &out)?;

        debug!(
            "Vote on siphon {} by {}: {} yes / {} no of {} -> {}",
            request.id, voter, result.yes, result.no, result.eligible, status
        );
        Ok(Committed {
            value: VoteOutcome::Recorded(VoteResponse {
                status,
                voting_progress: result.progress(),
            }),
            notifications: out,
        })
    })
}

pub fn teacher_reject(
    db: &Database,
    siphon_id: Uuid,
    actor: Uuid,
    now: DateTime<Utc>,
) -> WorkflowResult<Committed<SiphonRequest>> {
    db.transaction(|tx| -> WorkflowResult<Committed<SiphonRequest>> {
        require_staff(tx, actor)?;
        let request = awaiting_teacher(tx, siphon_id)?;

        set_status(tx, &request, SiphonStatus::Rejected, now)?;
        freeze::unfreeze(tx, request.target_user, request.classroom, request.id, now)?;

        let group = group_of(tx, &request)?;
        let target_name = username_of(tx, request.target_user)?;
        let members = queries::approved_member_ids(tx, request.group)?;
        let out = plan(
            &siphon_context(&request, &group, &target_name),
            &Transition::TeacherRejected { members: &members },
            now,
        );
        notifications::insert_all(tx, &out)?;

        info!("Siphon {} rejected by teacher {}", request.id, actor);
        Ok(Committed {
            value: reload(tx, request.id)?,
            notifications: out,
        })
    })
}

pub fn teacher_approve(
    db: &Database,
    siphon_id: Uuid,
    actor: Uuid,
    now: DateTime<Utc>,
) -> WorkflowResult<Committed<Execution>> {
    db.transaction(|tx| -> WorkflowResult<Committed<Execution>> {
        require_staff(tx, actor)?;
        let request = awaiting_teacher(tx, siphon_id)?;
        let group = group_of(tx, &request)?;

        // Recipients are whoever is an approved member right now
        let recipients = eligible_voters(tx, &request)?;
        let receipt = ledger::execute_transfer(
            tx,
            &Transfer {
                from: request.target_user,
                recipients: &recipients,
                amount: request.amount,
                classroom: Some(request.classroom),
                assigned_by: Some(actor),
                memo: "Group siphon",
                metadata: json!({
                    "siphonId": request.id,
                    "groupId": group.group_id,
                    "groupName": group.group_name,
                    "groupSetId": group.group_set_id,
                    "groupSetName": group.group_set_name,
                }),
                siphon: Some(request.id),
                at: now,
            },
        )?;

        set_status(tx, &request, SiphonStatus::TeacherApproved, now)?;
        freeze::unfreeze(tx, request.target_user, request.classroom, request.id, now)?;

        let target_name = username_of(tx, request.target_user)?;
        let out = plan(
            &siphon_context(&request, &group, &target_name),
            &Transition::Executed {
                credits: &receipt.credits,
            },
            now,
        );
        notifications::insert_all(tx, &out)?;

        info!(
            "Siphon {} executed by {}: {} bits to {} members ({} each, remainder {})",
            request.id,
            actor,
            request.amount,
            receipt.credits.len(),
            receipt.per_person,
            receipt.remainder
        );
        Ok(Committed {
            value: Execution {
                request: reload(tx, request.id)?,
                receipt,
            },
            notifications: out,
        })
    })
}

/// Expire every pending request whose deadline is at or before `now`. Each
/// request commits separately; one failure is logged and does not stop the
/// rest.
pub fn expire_stale(db: &Database, now: DateTime<Utc>) -> WorkflowResult<Committed<usize>> {
    let stale = db.with_conn(|conn| siphons::stale_pending(conn, now))?;

    let mut expired = 0;
    let mut out = Vec::new();
    for id in stale {
        let result = db.transaction(|tx| -> WorkflowResult<Option<Vec<Notification>>> {
            match siphons::load(tx, id)? {
                Some(request) if request.status == SiphonStatus::Pending && request.is_expired_at(now) => {
                    expire(tx, &request, now).map(Some)
                }
                // Resolved since the scan
                _ => Ok(None),
            }
        });
        match result {
            Ok(Some(notes)) => {
                expired += 1;
                out.extend(notes);
            }
            Ok(None) => {}
            Err(e) => warn!("Failed to expire siphon {}: {}", id, e),
        }
    }

    Ok(Committed {
        value: expired,
        notifications: out,
    })
}

// -- Reads --

pub fn detail(db: &Database, siphon_id: Uuid, viewer: Uuid) -> WorkflowResult<SiphonDetailResponse> {
    db.with_conn(|conn| -> DbResult<WorkflowResult<SiphonDetailResponse>> {
        let Some(request) = siphons::load(conn, siphon_id)? else {
            return Ok(Err(WorkflowError::NotFound("siphon request")));
        };
        if !can_view(conn, request.group, viewer)? {
            return Ok(Err(WorkflowError::Forbidden(
                "only group members and teachers can view this request",
            )));
        }
        let eligible = eligible_voters(conn, &request)?;
        let voting_progress = tally(&eligible, &request.votes).progress();
        Ok(Ok(SiphonDetailResponse {
            request,
            voting_progress,
        }))
    })?
}

pub fn list_for_group(db: &Database, group_id: Uuid, viewer: Uuid) -> WorkflowResult<Vec<SiphonRequest>> {
    db.with_conn(|conn| -> DbResult<WorkflowResult<Vec<SiphonRequest>>> {
        if queries::group_context(conn, group_id)?.is_none() {
            return Ok(Err(WorkflowError::NotFound("group")));
        }
        if !can_view(conn, group_id, viewer)? {
            return Ok(Err(WorkflowError::Forbidden(
                "only group members and teachers can list siphon requests",
            )));
        }
        Ok(Ok(siphons::list_for_group(conn, group_id)?))
    })?
}

/// Proof metadata, if the viewer may download it.
pub fn proof_for(db: &Database, siphon_id: Uuid, viewer: Uuid) -> WorkflowResult<ProofMeta> {
    db.with_conn(|conn| -> DbResult<WorkflowResult<ProofMeta>> {
        let Some(request) = siphons::load(conn, siphon_id)? else {
            return Ok(Err(WorkflowError::NotFound("siphon request")));
        };
        if !can_view(conn, request.group, viewer)? {
            return Ok(Err(WorkflowError::Forbidden(
                "only group members and teachers can view the proof",
            )));
        }
        Ok(request.proof.ok_or(WorkflowError::NotFound("proof")))
    })?
}

// -- Helpers --

/// Commit the expiry of a pending request and return its notifications.
fn expire(conn: &Connection, request: &SiphonRequest, now: DateTime<Utc>) -> WorkflowResult<Vec<Notification>> {
    set_status(conn, request, SiphonStatus::Expired, now)?;
    freeze::unfreeze(conn, request.target_user, request.classroom, request.id, now)?;

    let group = group_of(conn, request)?;
    let target_name = username_of(conn, request.target_user)?;
    let members = queries::approved_member_ids(conn, request.group)?;
    let out = plan(
        &siphon_context(request, &group, &target_name),
        &Transition::Expired { members: &members },
        now,
    );
    notifications::insert_all(conn, &out)?;

    info!("Siphon {} expired", request.id);
    Ok(out)
}

fn set_status(conn: &Connection, request: &SiphonRequest, status: SiphonStatus, now: DateTime<Utc>) -> WorkflowResult<()> {
    if siphons::update_status(conn, request.id, request.version, status, now)? {
        Ok(())
    } else {
        warn!("Version conflict on siphon {} (expected {})", request.id, request.version);
        Err(WorkflowError::Conflict)
    }
}

/// Approved members other than the target, in join order.
fn eligible_voters(conn: &Connection, request: &SiphonRequest) -> DbResult<Vec<Uuid>> {
    Ok(queries::approved_member_ids(conn, request.group)?
        .into_iter()
        .filter(|id| *id != request.target_user)
        .collect())
}

fn require_staff(conn: &Connection, actor: Uuid) -> WorkflowResult<()> {
    match queries::get_user(conn, actor)? {
        Some(user) if user.role.is_staff() => Ok(()),
        _ => Err(WorkflowError::Forbidden("only teachers and admins can decide siphon requests")),
    }
}

fn awaiting_teacher(conn: &Connection, siphon_id: Uuid) -> WorkflowResult<SiphonRequest> {
    let request = siphons::load(conn, siphon_id)?.ok_or(WorkflowError::NotFound("siphon request"))?;
    if request.status != SiphonStatus::GroupApproved {
        return Err(WorkflowError::NotAwaitingTeacher(request.status));
    }
    Ok(request)
}

fn can_view(conn: &Connection, group_id: Uuid, viewer: Uuid) -> DbResult<bool> {
    if queries::member_status(conn, group_id, viewer)? == Some(MemberStatus::Approved) {
        return Ok(true);
    }
    Ok(queries::get_user(conn, viewer)?.is_some_and(|u| u.role.is_staff()))
}

fn group_of(conn: &Connection, request: &SiphonRequest) -> WorkflowResult<GroupContext> {
    queries::group_context(conn, request.group)?.ok_or(WorkflowError::NotFound("group"))
}

fn username_of(conn: &Connection, user: Uuid) -> WorkflowResult<String> {
    Ok(queries::get_user(conn, user)?
        .map(|u| u.username)
        .unwrap_or_else(|| "a group member".to_string()))
}

fn reload(conn: &Connection, id: Uuid) -> WorkflowResult<SiphonRequest> {
    siphons::load(conn, id)?.ok_or(WorkflowError::NotFound("siphon request"))
}

fn siphon_context<'a>(request: &SiphonRequest, group: &'a GroupContext, target_name: &'a str) -> SiphonContext<'a> {
    SiphonContext {
        siphon_id: request.id,
        classroom_id: request.classroom,
        group_name: &group.group_name,
        target: request.target_user,
        target_name,
        amount: request.amount,
    }
}
