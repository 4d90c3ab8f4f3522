//! Frozen (user, classroom) pairs.
//!
//! The `frozen_accounts` set is the only freeze state; nothing keeps a
//! separate per-user flag. Every call, including no-op repeats, is appended to
//! `freeze_log` with the siphon that caused it.
//!
//! Several open siphons may target the same pair. The entry stays until the
//! last of them reaches a terminal status, so callers must update the siphon's
//! status before calling `unfreeze`.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::debug;
use uuid::Uuid;

use crate::{Database, DbResult, OptionalExt, parse_uuid, ts};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreezeAction {
    Freeze,
    Unfreeze,
}

impl FreezeAction {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Freeze => "freeze",
            Self::Unfreeze => "unfreeze",
        }
    }
}

pub fn freeze(conn: &Connection, user: Uuid, classroom: Uuid, siphon: Uuid, at: DateTime<Utc>) -> DbResult<()> {
    conn.execute(
        "INSERT OR IGNORE INTO frozen_accounts (user_id, classroom_id) VALUES (?1, ?2)",
        (user.to_string(), classroom.to_string()),
    )?;
    log(conn, user, classroom, siphon, FreezeAction::Freeze, at)?;
    debug!("Froze {} in classroom {} (siphon {})", user, classroom, siphon);
    Ok(())
}

/// Log the unfreeze for `siphon` and drop the set entry unless another open
/// siphon still targets the pair. Returns whether the entry was released.
pub fn unfreeze(conn: &Connection, user: Uuid, classroom: Uuid, siphon: Uuid, at: DateTime<Utc>) -> DbResult<bool> {
    let held_by = other_open_siphons(conn, user, classroom, siphon)?;
    if held_by == 0 {
        conn.execute(
            "DELETE FROM frozen_accounts WHERE user_id = ?1 AND classroom_id = ?2",
            (user.to_string(), classroom.to_string()),
        )?;
        debug!("Unfroze {} in classroom {} (siphon {})", user, classroom, siphon);
    } else {
        debug!(
            "Siphon {} closed; {} in classroom {} stays frozen for {} other request(s)",
            siphon, user, classroom, held_by
        );
    }
    log(conn, user, classroom, siphon, FreezeAction::Unfreeze, at)?;
    Ok(held_by == 0)
}

fn other_open_siphons(conn: &Connection, user: Uuid, classroom: Uuid, siphon: Uuid) -> DbResult<i64> {
    let n = conn.query_row(
        "SELECT COUNT(*) FROM siphon_requests
         WHERE target_user_id = ?1 AND classroom_id = ?2 AND id <> ?3
           AND status IN ('pending', 'group_approved')",
        (user.to_string(), classroom.to_string(), siphon.to_string()),
        |row| row.get(0),
    )?;
    Ok(n)
}

/// True when `siphon` is the group-approved request whose payout may debit
/// the frozen `user` in `classroom`.
pub fn is_executing_siphon(conn: &Connection, siphon: Uuid, user: Uuid, classroom: Uuid) -> DbResult<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM siphon_requests
             WHERE id = ?1 AND target_user_id = ?2 AND classroom_id = ?3 AND status = 'group_approved'",
            (siphon.to_string(), user.to_string(), classroom.to_string()),
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn is_frozen(conn: &Connection, user: Uuid, classroom: Uuid) -> DbResult<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM frozen_accounts WHERE user_id = ?1 AND classroom_id = ?2",
            (user.to_string(), classroom.to_string()),
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Every classroom the user is frozen in. Empty means not frozen anywhere.
pub fn frozen_classrooms(conn: &Connection, user: Uuid) -> DbResult<Vec<Uuid>> {
    let mut stmt =
        conn.prepare("SELECT classroom_id FROM frozen_accounts WHERE user_id = ?1 ORDER BY classroom_id")?;
    let ids = stmt
        .query_map([user.to_string()], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    ids.iter().map(|id| parse_uuid(id)).collect()
}

/// Number of logged calls of `action` attributed to `siphon`.
pub fn count_actions(conn: &Connection, siphon: Uuid, action: FreezeAction) -> DbResult<usize> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM freeze_log WHERE siphon_id = ?1 AND action = ?2",
        (siphon.to_string(), action.as_str()),
        |row| row.get(0),
    )?;
    Ok(n as usize)
}

fn log(
    conn: &Connection,
    user: Uuid,
    classroom: Uuid,
    siphon: Uuid,
    action: FreezeAction,
    at: DateTime<Utc>,
) -> DbResult<()> {
    conn.execute(
        "INSERT INTO freeze_log (user_id, classroom_id, siphon_id, action, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        (user.to_string(), classroom.to_string(), siphon.to_string(), action.as_str(), ts(at)),
    )?;
    Ok(())
}

impl Database {
    pub fn is_frozen(&self, user: Uuid, classroom: Uuid) -> DbResult<bool> {
        self.with_conn(|conn| is_frozen(conn, user, classroom))
    }

    pub fn frozen_classrooms(&self, user: Uuid) -> DbResult<Vec<Uuid>> {
        self.with_conn(|conn| frozen_classrooms(conn, user))
    }

    pub fn freeze_count(&self, siphon: Uuid, action: FreezeAction) -> DbResult<usize> {
        self.with_conn(|conn| count_actions(conn, siphon, action))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freeze_is_idempotent_and_scoped_to_classroom() {
        let db = Database::open_in_memory().unwrap();
        let (user, math, art, siphon) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let now = Utc::now();

        db.with_conn(|conn| {
            freeze(conn, user, math, siphon, now)?;
            freeze(conn, user, math, siphon, now)
        })
        .unwrap();

        assert!(db.is_frozen(user, math).unwrap());
        assert!(!db.is_frozen(user, art).unwrap());
        assert_eq!(db.frozen_classrooms(user).unwrap(), vec![math]);

        db.with_conn(|conn| {
            assert!(unfreeze(conn, user, math, siphon, now)?);
            unfreeze(conn, user, math, siphon, now).map(|_| ())
        })
        .unwrap();

        assert!(!db.is_frozen(user, math).unwrap());
        assert!(db.frozen_classrooms(user).unwrap().is_empty());
        assert_eq!(db.freeze_count(siphon, FreezeAction::Freeze).unwrap(), 2);
        assert_eq!(db.freeze_count(siphon, FreezeAction::Unfreeze).unwrap(), 2);
    }

    #[test]
    fn concurrent_freezes_in_different_classrooms_are_independent() {
        let db = Database::open_in_memory().unwrap();
        let (user, a, b) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let now = Utc::now();

        db.with_conn(|conn| {
            freeze(conn, user, a, Uuid::new_v4(), now)?;
            freeze(conn, user, b, Uuid::new_v4(), now)?;
            unfreeze(conn, user, a, Uuid::new_v4(), now).map(|_| ())
        })
        .unwrap();

        assert!(!db.is_frozen(user, a).unwrap());
        assert!(db.is_frozen(user, b).unwrap());
    }
}
