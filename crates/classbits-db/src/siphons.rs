//! Siphon request persistence. Rows are never deleted.

use chrono::{DateTime, Utc};
use classbits_types::models::{ProofMeta, SiphonRequest, SiphonStatus, Vote, VoteChoice};
use rusqlite::{Connection, ErrorCode, Row};
use uuid::Uuid;

use crate::{Database, DbError, DbResult, OptionalExt, parse_ts, parse_uuid, ts};

const SELECT_COLUMNS: &str = "id, group_id, classroom_id, requested_by, target_user_id, amount, reason,
     proof_original_name, proof_stored_name, proof_mime_type, proof_size, proof_sha256,
     status, expires_at, created_at, updated_at, version";

struct SiphonRow {
    id: String,
    group_id: String,
    classroom_id: String,
    requested_by: String,
    target_user_id: String,
    amount: i64,
    reason: String,
    proof_original_name: Option<String>,
    proof_stored_name: Option<String>,
    proof_mime_type: Option<String>,
    proof_size: Option<i64>,
    proof_sha256: Option<String>,
    status: String,
    expires_at: String,
    created_at: String,
    updated_at: String,
    version: i64,
}

impl SiphonRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            group_id: row.get(1)?,
            classroom_id: row.get(2)?,
            requested_by: row.get(3)?,
            target_user_id: row.get(4)?,
            amount: row.get(5)?,
            reason: row.get(6)?,
            proof_original_name: row.get(7)?,
            proof_stored_name: row.get(8)?,
            proof_mime_type: row.get(9)?,
            proof_size: row.get(10)?,
            proof_sha256: row.get(11)?,
            status: row.get(12)?,
            expires_at: row.get(13)?,
            created_at: row.get(14)?,
            updated_at: row.get(15)?,
            version: row.get(16)?,
        })
    }

    fn into_request(self, votes: Vec<Vote>) -> DbResult<SiphonRequest> {
        let proof = match (self.proof_original_name, self.proof_stored_name) {
            (Some(original_name), Some(stored_name)) => Some(ProofMeta {
                original_name,
                stored_name,
                mime_type: self
                    .proof_mime_type
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
                size: self.proof_size.unwrap_or(0) as u64,
                sha256: self.proof_sha256.unwrap_or_default(),
            }),
            _ => None,
        };

        Ok(SiphonRequest {
            id: parse_uuid(&self.id)?,
            group: parse_uuid(&self.group_id)?,
            classroom: parse_uuid(&self.classroom_id)?,
            requested_by: parse_uuid(&self.requested_by)?,
            target_user: parse_uuid(&self.target_user_id)?,
            amount: self.amount,
            reason: self.reason,
            proof,
            status: self
                .status
                .parse::<SiphonStatus>()
                .map_err(|e| DbError::Corrupt(format!("siphon {}: {}", self.id, e)))?,
            votes,
            expires_at: parse_ts(&self.expires_at)?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            version: self.version,
        })
    }
}

/// True when `err` is SQLite refusing a write because of a constraint, e.g.
/// the one-active-siphon-per-group index.
pub fn is_constraint_violation(err: &DbError) -> bool {
    matches!(
        err,
        DbError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation
    )
}

pub fn insert(conn: &Connection, request: &SiphonRequest) -> DbResult<()> {
    let proof = request.proof.as_ref();
    conn.execute(
        "INSERT INTO siphon_requests (
             id, group_id, classroom_id, requested_by, target_user_id, amount, reason,
             proof_original_name, proof_stored_name, proof_mime_type, proof_size, proof_sha256,
             status, expires_at, created_at, updated_at, version)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        rusqlite::params![
            request.id.to_string(),
            request.group.to_string(),
            request.classroom.to_string(),
            request.requested_by.to_string(),
            request.target_user.to_string(),
            request.amount,
            request.reason,
            proof.map(|p| p.original_name.as_str()),
            proof.map(|p| p.stored_name.as_str()),
            proof.map(|p| p.mime_type.as_str()),
            proof.map(|p| p.size as i64),
            proof.map(|p| p.sha256.as_str()),
            request.status.as_str(),
            ts(request.expires_at),
            ts(request.created_at),
            ts(request.updated_at),
            request.version,
        ],
    )?;
    Ok(())
}

pub fn load(conn: &Connection, id: Uuid) -> DbResult<Option<SiphonRequest>> {
    let sql = format!("SELECT {} FROM siphon_requests WHERE id = ?1", SELECT_COLUMNS);
    let row = conn
        .query_row(&sql, [id.to_string()], SiphonRow::from_row)
        .optional()?;

    match row {
        Some(row) => {
            let votes = votes(conn, id)?;
            Ok(Some(row.into_request(votes)?))
        }
        None => Ok(None),
    }
}

/// The group's pending or group-approved request, if any.
pub fn active_for_group(conn: &Connection, group_id: Uuid) -> DbResult<Option<Uuid>> {
    let id: Option<String> = conn
        .query_row(
            "SELECT id FROM siphon_requests
             WHERE group_id = ?1 AND status IN ('pending', 'group_approved')",
            [group_id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    id.as_deref().map(parse_uuid).transpose()
}

/// Newest first.
pub fn list_for_group(conn: &Connection, group_id: Uuid) -> DbResult<Vec<SiphonRequest>> {
    let sql = format!(
        "SELECT {} FROM siphon_requests WHERE group_id = ?1 ORDER BY created_at DESC, id",
        SELECT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([group_id.to_string()], SiphonRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|row| -> DbResult<SiphonRequest> {
            let votes = votes(conn, parse_uuid(&row.id)?)?;
            row.into_request(votes)
        })
        .collect()
}

/// Pending requests whose deadline is at or before `now`.
pub fn stale_pending(conn: &Connection, now: DateTime<Utc>) -> DbResult<Vec<Uuid>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM siphon_requests
         WHERE status = 'pending' AND expires_at <= ?1
         ORDER BY expires_at",
    )?;
    let ids = stmt
        .query_map([ts(now)], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    ids.iter().map(|id| parse_uuid(id)).collect()
}

pub fn votes(conn: &Connection, siphon_id: Uuid) -> DbResult<Vec<Vote>> {
    let mut stmt = conn.prepare(
        "SELECT voter_id, choice FROM siphon_votes WHERE siphon_id = ?1 ORDER BY voted_at, voter_id",
    )?;
    let rows = stmt
        .query_map([siphon_id.to_string()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(voter, choice)| -> DbResult<Vote> {
            Ok(Vote {
                voter: parse_uuid(&voter)?,
                choice: choice
                    .parse::<VoteChoice>()
                    .map_err(|e| DbError::Corrupt(format!("{}", e)))?,
            })
        })
        .collect()
}

/// Record a vote, replacing the voter's earlier choice.
pub fn upsert_vote(
    conn: &Connection,
    siphon_id: Uuid,
    voter: Uuid,
    choice: VoteChoice,
    at: DateTime<Utc>,
) -> DbResult<()> {
    conn.execute(
        "INSERT INTO siphon_votes (siphon_id, voter_id, choice, voted_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (siphon_id, voter_id) DO UPDATE SET choice = excluded.choice, voted_at = excluded.voted_at",
        (siphon_id.to_string(), voter.to_string(), choice.as_str(), ts(at)),
    )?;
    Ok(())
}

/// Compare-and-set on `version`. Returns `false` when another writer got
/// there first and nothing was updated.
pub fn update_status(
    conn: &Connection,
    id: Uuid,
    expected_version: i64,
    status: SiphonStatus,
    at: DateTime<Utc>,
) -> DbResult<bool> {
    let updated = conn.execute(
        "UPDATE siphon_requests SET status = ?1, updated_at = ?2, version = version + 1
         WHERE id = ?3 AND version = ?4",
        (status.as_str(), ts(at), id.to_string(), expected_version),
    )?;
    Ok(updated == 1)
}

impl Database {
    pub fn siphon(&self, id: Uuid) -> DbResult<Option<SiphonRequest>> {
        self.with_conn(|conn| load(conn, id))
    }

    pub fn siphons_for_group(&self, group_id: Uuid) -> DbResult<Vec<SiphonRequest>> {
        self.with_conn(|conn| list_for_group(conn, group_id))
    }

    pub fn stale_pending_siphons(&self, now: DateTime<Utc>) -> DbResult<Vec<Uuid>> {
        self.with_conn(|conn| stale_pending(conn, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use classbits_types::models::{MemberStatus, Role};

    struct Fixture {
        db: Database,
        group: Uuid,
        classroom: Uuid,
        alice: Uuid,
        bob: Uuid,
    }

    fn fixture() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let (classroom, set, group) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        db.create_classroom(classroom, "History", 72).unwrap();
        db.create_group_set(set, classroom, "Debate").unwrap();
        db.create_group(group, set, "Owls").unwrap();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        db.create_user(alice, "alice", Role::Student).unwrap();
        db.create_user(bob, "bob", Role::Student).unwrap();
        db.upsert_group_member(group, alice, MemberStatus::Approved).unwrap();
        db.upsert_group_member(group, bob, MemberStatus::Approved).unwrap();
        Fixture {
            db,
            group,
            classroom,
            alice,
            bob,
        }
    }

    fn request(f: &Fixture, now: DateTime<Utc>) -> SiphonRequest {
        SiphonRequest {
            id: Uuid::new_v4(),
            group: f.group,
            classroom: f.classroom,
            requested_by: f.alice,
            target_user: f.bob,
            amount: 10,
            reason: "<p>slacking</p>".into(),
            proof: Some(ProofMeta {
                original_name: "chat.png".into(),
                stored_name: "abc.png".into(),
                mime_type: "image/png".into(),
                size: 42,
                sha256: "00".into(),
            }),
            status: SiphonStatus::Pending,
            votes: vec![],
            expires_at: now + Duration::hours(72),
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    #[test]
    fn insert_then_load_keeps_fields_and_votes() {
        let f = fixture();
        let now = Utc::now();
        let req = request(&f, now);

        f.db.with_conn(|conn| {
            insert(conn, &req)?;
            upsert_vote(conn, req.id, f.alice, VoteChoice::Yes, now)?;
            upsert_vote(conn, req.id, f.alice, VoteChoice::No, now)
        })
        .unwrap();

        let loaded = f.db.siphon(req.id).unwrap().unwrap();
        assert_eq!(loaded.proof, req.proof);
        assert_eq!(loaded.status, SiphonStatus::Pending);
        assert_eq!(loaded.votes, vec![Vote { voter: f.alice, choice: VoteChoice::No }]);
        assert_eq!(loaded.expires_at, req.expires_at);
    }

    #[test]
    fn second_active_request_violates_index() {
        let f = fixture();
        let now = Utc::now();
        f.db.with_conn(|conn| insert(conn, &request(&f, now))).unwrap();

        let err = f.db.with_conn(|conn| insert(conn, &request(&f, now))).unwrap_err();
        assert!(is_constraint_violation(&err));
    }

    #[test]
    fn stale_version_does_not_update() {
        let f = fixture();
        let now = Utc::now();
        let req = request(&f, now);
        f.db.with_conn(|conn| insert(conn, &req)).unwrap();

        let first = f
            .db
            .with_conn(|conn| update_status(conn, req.id, 0, SiphonStatus::GroupApproved, now))
            .unwrap();
        let second = f
            .db
            .with_conn(|conn| update_status(conn, req.id, 0, SiphonStatus::Rejected, now))
            .unwrap();

        assert!(first);
        assert!(!second);
        let loaded = f.db.siphon(req.id).unwrap().unwrap();
        assert_eq!(loaded.status, SiphonStatus::GroupApproved);
        assert_eq!(loaded.version, 1);
    }

    #[test]
    fn stale_pending_respects_deadline() {
        let f = fixture();
        let now = Utc::now();
        let req = request(&f, now);
        f.db.with_conn(|conn| insert(conn, &req)).unwrap();

        assert!(f.db.stale_pending_siphons(now).unwrap().is_empty());
        assert_eq!(
            f.db.stale_pending_siphons(now + Duration::hours(72)).unwrap(),
            vec![req.id]
        );
        assert_eq!(f.db.with_conn(|conn| active_for_group(conn, f.group)).unwrap(), Some(req.id));
    }
}
