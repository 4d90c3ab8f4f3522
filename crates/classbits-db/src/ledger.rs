//! Balances and the append-only transaction log.
//!
//! Balances are either classroom-scoped (`balances` table) or global
//! (`users.balance`). Every change goes through this module and writes a
//! matching row to `transactions`. Functions take a plain `&Connection` so the
//! caller decides the transaction boundary; `Database::transfer` wraps a
//! standalone transfer in its own.

use chrono::{DateTime, Utc};
use classbits_types::models::TransactionRecord;
use rusqlite::Connection;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::freeze;
use crate::queries::user_exists;
use crate::{Database, DbError, DbResult, OptionalExt, parse_ts, parse_uuid, ts};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("transfer amount must be positive, got {0}")]
    InvalidAmount(i64),

    #[error("no eligible recipients")]
    NoEligibleRecipients,

    #[error("sender {0} not found")]
    SenderNotFound(Uuid),

    #[error("insufficient funds: balance {balance}, requested {requested}")]
    InsufficientFunds { balance: i64, requested: i64 },

    #[error("account {user} is frozen in classroom {classroom}")]
    AccountFrozen { user: Uuid, classroom: Uuid },
}

/// A debit from one account split across several recipients.
#[derive(Debug, Clone)]
pub struct Transfer<'a> {
    pub from: Uuid,
    /// Order matters: the first surviving recipient takes the remainder.
    pub recipients: &'a [Uuid],
    pub amount: i64,
    /// `None` moves the global balance.
    pub classroom: Option<Uuid>,
    pub assigned_by: Option<Uuid>,
    /// Short label used in both descriptions, e.g. "group siphon".
    pub memo: &'a str,
    /// Attached to every transaction row written by the transfer.
    pub metadata: serde_json::Value,
    /// The group-approved siphon being paid out. Only that siphon may debit
    /// its frozen target.
    pub siphon: Option<Uuid>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReceipt {
    pub per_person: i64,
    pub remainder: i64,
    /// Amount credited to each recipient, in recipient order.
    pub credits: Vec<(Uuid, i64)>,
    /// Requested recipients without an account.
    pub skipped: Vec<Uuid>,
}

impl TransferReceipt {
    pub fn total_credited(&self) -> i64 {
        self.credits.iter().map(|(_, amount)| amount).sum()
    }
}

/// Split `amount` into an equal share per recipient and the leftover that
/// goes to the first recipient.
fn split(amount: i64, recipients: usize) -> Result<(i64, i64), LedgerError> {
    let n = recipients as i64;
    let per_person = amount.checked_div(n).ok_or(LedgerError::NoEligibleRecipients)?;
    Ok((per_person, amount - per_person * n))
}

impl Database {
    pub fn balance(&self, user: Uuid, classroom: Option<Uuid>) -> DbResult<i64> {
        self.with_conn(|conn| balance(conn, user, classroom))
    }

    pub fn deposit(
        &self,
        user: Uuid,
        classroom: Option<Uuid>,
        amount: i64,
        description: &str,
        assigned_by: Option<Uuid>,
    ) -> DbResult<()> {
        self.transaction(|tx| {
            credit(tx, user, classroom, amount)?;
            append_record(tx, user, amount, description, classroom, assigned_by, &serde_json::json!({}), Utc::now())
        })
    }

    pub fn transfer(&self, transfer: &Transfer<'_>) -> DbResult<TransferReceipt> {
        self.transaction(|tx| execute_transfer(tx, transfer))
    }

    pub fn transactions_for(&self, user: Uuid) -> DbResult<Vec<TransactionRecord>> {
        self.with_conn(|conn| transactions_for(conn, user))
    }
}

pub fn balance(conn: &Connection, user: Uuid, classroom: Option<Uuid>) -> DbResult<i64> {
    let value: Option<i64> = match classroom {
        Some(cid) => conn
            .query_row(
                "SELECT balance FROM balances WHERE user_id = ?1 AND classroom_id = ?2",
                (user.to_string(), cid.to_string()),
                |row| row.get(0),
            )
            .optional()?,
        None => conn
            .query_row("SELECT balance FROM users WHERE id = ?1", [user.to_string()], |row| row.get(0))
            .optional()?,
    };
    Ok(value.unwrap_or(0))
}

fn credit(conn: &Connection, user: Uuid, classroom: Option<Uuid>, amount: i64) -> DbResult<()> {
    match classroom {
        Some(cid) => {
            conn.execute(
                "INSERT INTO balances (user_id, classroom_id, balance) VALUES (?1, ?2, ?3)
                 ON CONFLICT (user_id, classroom_id) DO UPDATE SET balance = balance + excluded.balance",
                (user.to_string(), cid.to_string(), amount),
            )?;
        }
        None => {
            conn.execute(
                "UPDATE users SET balance = balance + ?1 WHERE id = ?2",
                (amount, user.to_string()),
            )?;
        }
    }
    Ok(())
}

fn debit(conn: &Connection, user: Uuid, classroom: Option<Uuid>, amount: i64) -> DbResult<()> {
    let current = balance(conn, user, classroom)?;
    if current < amount {
        return Err(LedgerError::InsufficientFunds {
            balance: current,
            requested: amount,
        }
        .into());
    }

    match classroom {
        Some(cid) => conn.execute(
            "UPDATE balances SET balance = balance - ?1 WHERE user_id = ?2 AND classroom_id = ?3",
            (amount, user.to_string(), cid.to_string()),
        )?,
        None => conn.execute(
            "UPDATE users SET balance = balance - ?1 WHERE id = ?2",
            (amount, user.to_string()),
        )?,
    };
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn append_record(
    conn: &Connection,
    user: Uuid,
    amount: i64,
    description: &str,
    classroom: Option<Uuid>,
    assigned_by: Option<Uuid>,
    metadata: &serde_json::Value,
    at: DateTime<Utc>,
) -> DbResult<()> {
    conn.execute(
        "INSERT INTO transactions (user_id, amount, description, classroom_id, assigned_by, metadata, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            user.to_string(),
            amount,
            description,
            classroom.map(|c| c.to_string()),
            assigned_by.map(|a| a.to_string()),
            metadata.to_string(),
            ts(at),
        ],
    )?;
    Ok(())
}

/// Debit the sender and credit every recipient. Not atomic on its own: run
/// it inside a transaction so a failure part-way rolls back the debit.
pub fn execute_transfer(conn: &Connection, transfer: &Transfer<'_>) -> DbResult<TransferReceipt> {
    if transfer.amount <= 0 {
        return Err(LedgerError::InvalidAmount(transfer.amount).into());
    }

    // Never pay the sender, never pay anyone twice, skip unknown accounts.
    let mut recipients: Vec<Uuid> = Vec::with_capacity(transfer.recipients.len());
    let mut skipped = Vec::new();
    for &id in transfer.recipients {
        if id == transfer.from || recipients.contains(&id) || skipped.contains(&id) {
            continue;
        }
        if user_exists(conn, id)? {
            recipients.push(id);
        } else {
            warn!("Transfer from {}: recipient {} not found, skipping", transfer.from, id);
            skipped.push(id);
        }
    }

    if recipients.is_empty() {
        return Err(LedgerError::NoEligibleRecipients.into());
    }
    if !user_exists(conn, transfer.from)? {
        return Err(LedgerError::SenderNotFound(transfer.from).into());
    }

    if let Some(classroom) = transfer.classroom {
        if freeze::is_frozen(conn, transfer.from, classroom)? {
            let own_payout = match transfer.siphon {
                Some(siphon) => freeze::is_executing_siphon(conn, siphon, transfer.from, classroom)?,
                None => false,
            };
            if !own_payout {
                return Err(LedgerError::AccountFrozen {
                    user: transfer.from,
                    classroom,
                }
                .into());
            }
        }
    }

    let (per_person, remainder) = split(transfer.amount, recipients.len())?;
    debit(conn, transfer.from, transfer.classroom, transfer.amount)?;
    append_record(
        conn,
        transfer.from,
        -transfer.amount,
        &format!(
            "{}: {} bits redistributed to {} group member(s)",
            transfer.memo,
            transfer.amount,
            recipients.len()
        ),
        transfer.classroom,
        transfer.assigned_by,
        &transfer.metadata,
        transfer.at,
    )?;

    // A zero share leaves no record; the receipt still lists it.
    let mut credits = Vec::with_capacity(recipients.len());
    for (i, &id) in recipients.iter().enumerate() {
        let share = if i == 0 { per_person + remainder } else { per_person };
        if share > 0 {
            credit(conn, id, transfer.classroom, share)?;
            append_record(
                conn,
                id,
                share,
                &format!("{}: received {} bits", transfer.memo, share),
                transfer.classroom,
                transfer.assigned_by,
                &transfer.metadata,
                transfer.at,
            )?;
        }
        credits.push((id, share));
    }

    debug!(
        "Transfer {} bits from {} to {} recipients ({} each, remainder {})",
        transfer.amount,
        transfer.from,
        recipients.len(),
        per_person,
        remainder
    );

    Ok(TransferReceipt {
        per_person,
        remainder,
        credits,
        skipped,
    })
}

/// Newest first.
pub fn transactions_for(conn: &Connection, user: Uuid) -> DbResult<Vec<TransactionRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, user_id, amount, description, classroom_id, assigned_by, metadata, created_at
         FROM transactions WHERE user_id = ?1 ORDER BY id DESC",
    )?;

    let rows = stmt
        .query_map([user.to_string()], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(
            |(id, uid, amount, description, classroom, assigned_by, metadata, created_at)| -> DbResult<TransactionRecord> {
                Ok(TransactionRecord {
                    id,
                    user_id: parse_uuid(&uid)?,
                    amount,
                    description,
                    classroom: classroom.as_deref().map(parse_uuid).transpose()?,
                    assigned_by: assigned_by.as_deref().map(parse_uuid).transpose()?,
                    metadata: serde_json::from_str(&metadata)
                        .map_err(|e| DbError::Corrupt(format!("transaction {} metadata: {}", id, e)))?,
                    created_at: parse_ts(&created_at)?,
                })
            },
        )
        .collect()
}
