use rusqlite::Connection;
use tracing::info;

use crate::DbResult;

pub fn run(conn: &Connection) -> DbResult<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 =
        conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;

    if version < 1 {
        info!("Running migration v1 (roster, ledger, siphon)");
        conn.execute_batch(
            "
            CREATE TABLE users (
                id          TEXT PRIMARY KEY,
                username    TEXT NOT NULL UNIQUE,
                role        TEXT NOT NULL DEFAULT 'student',
                balance     INTEGER NOT NULL DEFAULT 0 CHECK (balance >= 0),
                created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );

            CREATE TABLE classrooms (
                id                    TEXT PRIMARY KEY,
                name                  TEXT NOT NULL,
                siphon_timeout_hours  INTEGER NOT NULL DEFAULT 72,
                created_at            TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );

            CREATE TABLE classroom_teachers (
                classroom_id  TEXT NOT NULL REFERENCES classrooms(id),
                user_id       TEXT NOT NULL REFERENCES users(id),
                PRIMARY KEY (classroom_id, user_id)
            );

            CREATE TABLE group_sets (
                id            TEXT PRIMARY KEY,
                classroom_id  TEXT NOT NULL REFERENCES classrooms(id),
                name          TEXT NOT NULL
            );

            CREATE TABLE student_groups (
                id            TEXT PRIMARY KEY,
                group_set_id  TEXT NOT NULL REFERENCES group_sets(id),
                name          TEXT NOT NULL
            );

            CREATE TABLE group_members (
                seq        INTEGER PRIMARY KEY AUTOINCREMENT,
                group_id   TEXT NOT NULL REFERENCES student_groups(id),
                user_id    TEXT NOT NULL REFERENCES users(id),
                status     TEXT NOT NULL DEFAULT 'pending',
                joined_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                UNIQUE (group_id, user_id)
            );

            CREATE TABLE balances (
                user_id       TEXT NOT NULL REFERENCES users(id),
                classroom_id  TEXT NOT NULL REFERENCES classrooms(id),
                balance       INTEGER NOT NULL DEFAULT 0 CHECK (balance >= 0),
                PRIMARY KEY (user_id, classroom_id)
            );

            CREATE TABLE transactions (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id       TEXT NOT NULL REFERENCES users(id),
                amount        INTEGER NOT NULL,
                description   TEXT NOT NULL,
                classroom_id  TEXT,
                assigned_by   TEXT,
                metadata      TEXT NOT NULL DEFAULT '{}',
                created_at    TEXT NOT NULL
            );

            CREATE INDEX idx_transactions_user ON transactions(user_id, id);

            CREATE TABLE frozen_accounts (
                user_id       TEXT NOT NULL,
                classroom_id  TEXT NOT NULL,
                PRIMARY KEY (user_id, classroom_id)
            );

            CREATE TABLE freeze_log (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id       TEXT NOT NULL,
                classroom_id  TEXT NOT NULL,
                siphon_id     TEXT NOT NULL,
                action        TEXT NOT NULL,
                created_at    TEXT NOT NULL
            );

            CREATE TABLE siphon_requests (
                id                   TEXT PRIMARY KEY,
                group_id             TEXT NOT NULL REFERENCES student_groups(id),
                classroom_id         TEXT NOT NULL REFERENCES classrooms(id),
                requested_by         TEXT NOT NULL REFERENCES users(id),
                target_user_id       TEXT NOT NULL REFERENCES users(id),
                amount               INTEGER NOT NULL CHECK (amount > 0),
                reason               TEXT NOT NULL,
                proof_original_name  TEXT,
                proof_stored_name    TEXT,
                proof_mime_type      TEXT,
                proof_size           INTEGER,
                proof_sha256         TEXT,
                status               TEXT NOT NULL DEFAULT 'pending',
                expires_at           TEXT NOT NULL,
                created_at           TEXT NOT NULL,
                updated_at           TEXT NOT NULL,
                version              INTEGER NOT NULL DEFAULT 0
            );

            -- At most one active siphon per group
            CREATE UNIQUE INDEX idx_siphon_active_group
                ON siphon_requests(group_id)
                WHERE status IN ('pending', 'group_approved');

            CREATE INDEX idx_siphon_status_expiry
                ON siphon_requests(status, expires_at);

            CREATE TABLE siphon_votes (
                siphon_id  TEXT NOT NULL REFERENCES siphon_requests(id),
                voter_id   TEXT NOT NULL REFERENCES users(id),
                choice     TEXT NOT NULL,
                voted_at   TEXT NOT NULL,
                PRIMARY KEY (siphon_id, voter_id)
            );

            CREATE TABLE notifications (
                id            TEXT PRIMARY KEY,
                user_id       TEXT NOT NULL,
                kind          TEXT NOT NULL,
                message       TEXT NOT NULL,
                siphon_id     TEXT,
                classroom_id  TEXT,
                read          INTEGER NOT NULL DEFAULT 0,
                created_at    TEXT NOT NULL
            );

            CREATE INDEX idx_notifications_user ON notifications(user_id, created_at);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
