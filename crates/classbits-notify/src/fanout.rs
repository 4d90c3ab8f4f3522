//! Audience and wording for every siphon transition.
//!
//! `plan` is pure: it turns a typed transition into one `Notification` per
//! recipient. The caller persists the batch in the same transaction as the
//! transition and publishes it after commit.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use classbits_types::events::{Notification, NotificationKind};

/// Facts about the siphon every message may use. `classroom_id` is always
/// explicit; nothing is inferred from the recipients.
#[derive(Debug, Clone)]
pub struct SiphonContext<'a> {
    pub siphon_id: Uuid,
    pub classroom_id: Uuid,
    pub group_name: &'a str,
    pub target: Uuid,
    pub target_name: &'a str,
    pub amount: i64,
}

#[derive(Debug, Clone)]
pub enum Transition<'a> {
    /// A request was opened and the target frozen.
    Created {
        voters: &'a [Uuid],
        expires_at: DateTime<Utc>,
    },
    /// The group reached a yes majority.
    GroupApproved {
        members: &'a [Uuid],
        teachers: &'a [Uuid],
    },
    /// The group reached a no majority.
    GroupRejected { members: &'a [Uuid] },
    /// The deadline passed before a decision.
    Expired { members: &'a [Uuid] },
    /// A teacher turned down a group-approved request.
    TeacherRejected { members: &'a [Uuid] },
    /// A teacher approved and the transfer ran; `credits` in payout order.
    /// Zero shares get no message.
    Executed { credits: &'a [(Uuid, i64)] },
}

pub fn plan(ctx: &SiphonContext<'_>, transition: &Transition<'_>, at: DateTime<Utc>) -> Vec<Notification> {
    let mut out = Vec::new();
    let mut push = |recipient: Uuid, kind: NotificationKind, message: String| {
        if out.iter().any(|n: &Notification| n.recipient == recipient && n.kind == kind) {
            return;
        }
        out.push(Notification {
            id: Uuid::new_v4(),
            recipient,
            kind,
            message,
            siphon_id: ctx.siphon_id,
            classroom_id: ctx.classroom_id,
            created_at: at,
        });
    };
    let others = |ids: &[Uuid]| -> Vec<Uuid> { ids.iter().copied().filter(|id| *id != ctx.target).collect() };

    match transition {
        Transition::Created { voters, expires_at } => {
            push(
                ctx.target,
                NotificationKind::SiphonTargeted,
                format!(
                    "A siphon request for {} bits was opened against you in {}. \
                     Your balance in this classroom is frozen until it is resolved.",
                    ctx.amount, ctx.group_name
                ),
            );
            for voter in others(*voters) {
                push(
                    voter,
                    NotificationKind::SiphonVoteRequested,
                    format!(
                        "{} is the target of a siphon request for {} bits in {}. Vote before {}.",
                        ctx.target_name,
                        ctx.amount,
                        ctx.group_name,
                        expires_at.format("%Y-%m-%d %H:%M UTC")
                    ),
                );
            }
        }
        Transition::GroupApproved { members, teachers } => {
            for member in members.iter().copied() {
                push(
                    member,
                    NotificationKind::SiphonGroupApproved,
                    format!(
                        "{} approved the siphon request against {}. It now awaits a teacher decision.",
                        ctx.group_name, ctx.target_name
                    ),
                );
            }
            for teacher in teachers.iter().copied() {
                push(
                    teacher,
                    NotificationKind::SiphonTeacherReview,
                    format!(
                        "{} approved a siphon of {} bits from {}. Please approve or reject it.",
                        ctx.group_name, ctx.amount, ctx.target_name
                    ),
                );
            }
        }
        Transition::GroupRejected { members } => {
            push(
                ctx.target,
                NotificationKind::AccountUnfrozen,
                format!(
                    "{} voted down the siphon request against you. Your account is unfrozen.",
                    ctx.group_name
                ),
            );
            for member in others(*members) {
                push(
                    member,
                    NotificationKind::SiphonRejected,
                    format!("{} voted down the siphon request against {}.", ctx.group_name, ctx.target_name),
                );
            }
        }
        Transition::Expired { members } => {
            push(
                ctx.target,
                NotificationKind::AccountUnfrozen,
                "The siphon request against you expired without a decision. Your account is unfrozen."
                    .to_string(),
            );
            for member in others(*members) {
                push(
                    member,
                    NotificationKind::SiphonExpired,
                    format!(
                        "The siphon request against {} in {} expired without a decision.",
                        ctx.target_name, ctx.group_name
                    ),
                );
            }
        }
        Transition::TeacherRejected { members } => {
            push(
                ctx.target,
                NotificationKind::AccountUnfrozen,
                "Your teacher rejected the siphon request against you. Your account is unfrozen.".to_string(),
            );
            // Other members are not told who the target was.
            for member in others(*members) {
                push(
                    member,
                    NotificationKind::SiphonTeacherRejected,
                    format!("Your teacher rejected a siphon request in {}.", ctx.group_name),
                );
            }
        }
        Transition::Executed { credits } => {
            push(
                ctx.target,
                NotificationKind::SiphonBitsLost,
                format!(
                    "{} bits were taken from your balance and shared with {}. Your account is unfrozen.",
                    ctx.amount, ctx.group_name
                ),
            );
            for &(recipient, share) in credits.iter().filter(|(id, share)| *id != ctx.target && *share > 0) {
                push(
                    recipient,
                    NotificationKind::SiphonShareReceived,
                    format!("You received {} bits from a siphon in {}.", share, ctx.group_name),
                );
            }
        }
    }

    out
}
