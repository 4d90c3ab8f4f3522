use classbits_types::api::NotificationResponse;
use classbits_types::events::Notification;
use rusqlite::Connection;
use uuid::Uuid;

use crate::{Database, DbResult, parse_ts, parse_uuid, ts};

pub fn insert_all(conn: &Connection, notifications: &[Notification]) -> DbResult<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO notifications (id, user_id, kind, message, siphon_id, classroom_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?;
    for n in notifications {
        stmt.execute((
            n.id.to_string(),
            n.recipient.to_string(),
            n.kind.as_str(),
            n.message.as_str(),
            n.siphon_id.to_string(),
            n.classroom_id.to_string(),
            ts(n.created_at),
        ))?;
    }
    Ok(())
}

impl Database {
    /// Newest first, at most `limit`.
    pub fn notifications_for(&self, user: Uuid, limit: u32) -> DbResult<Vec<NotificationResponse>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, kind, message, siphon_id, classroom_id, read, created_at
                 FROM notifications WHERE user_id = ?1
                 ORDER BY created_at DESC, id LIMIT ?2",
            )?;
            let rows = stmt
                .query_map((user.to_string(), limit), |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, bool>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(
                    |(id, kind, message, siphon_id, classroom_id, read, created_at)| -> DbResult<NotificationResponse> {
                        Ok(NotificationResponse {
                            id: parse_uuid(&id)?,
                            kind,
                            message,
                            siphon_id: siphon_id.as_deref().map(parse_uuid).transpose()?,
                            classroom_id: classroom_id.as_deref().map(parse_uuid).transpose()?,
                            read,
                            created_at: parse_ts(&created_at)?,
                        })
                    },
                )
                .collect()
        })
    }

    pub fn mark_notifications_read(&self, user: Uuid) -> DbResult<usize> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE notifications SET read = 1 WHERE user_id = ?1 AND read = 0",
                [user.to_string()],
            )?;
            Ok(n)
        })
    }
}
