//! Roster lookups used by the siphon workflow, plus the few inserts the
//! surrounding CRUD surface performs (users, classrooms, groups, members).

use classbits_types::models::{GroupContext, GroupMember, MemberStatus, Role, User};
use rusqlite::Connection;
use uuid::Uuid;

use crate::{Database, DbError, DbResult, OptionalExt, parse_uuid};

impl Database {
    // -- Users --

    pub fn create_user(&self, id: Uuid, username: &str, role: Role) -> DbResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, role) VALUES (?1, ?2, ?3)",
                (id.to_string(), username, role.as_str()),
            )?;
            Ok(())
        })
    }

    pub fn get_user(&self, id: Uuid) -> DbResult<Option<User>> {
        self.with_conn(|conn| get_user(conn, id))
    }

    // -- Classrooms --

    pub fn create_classroom(&self, id: Uuid, name: &str, siphon_timeout_hours: i64) -> DbResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO classrooms (id, name, siphon_timeout_hours) VALUES (?1, ?2, ?3)",
                (id.to_string(), name, siphon_timeout_hours),
            )?;
            Ok(())
        })
    }

    pub fn add_classroom_teacher(&self, classroom_id: Uuid, user_id: Uuid) -> DbResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO classroom_teachers (classroom_id, user_id) VALUES (?1, ?2)",
                (classroom_id.to_string(), user_id.to_string()),
            )?;
            Ok(())
        })
    }

    // -- Groups --

    pub fn create_group_set(&self, id: Uuid, classroom_id: Uuid, name: &str) -> DbResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO group_sets (id, classroom_id, name) VALUES (?1, ?2, ?3)",
                (id.to_string(), classroom_id.to_string(), name),
            )?;
            Ok(())
        })
    }

    pub fn create_group(&self, id: Uuid, group_set_id: Uuid, name: &str) -> DbResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO student_groups (id, group_set_id, name) VALUES (?1, ?2, ?3)",
                (id.to_string(), group_set_id.to_string(), name),
            )?;
            Ok(())
        })
    }

    /// Add a member, or update the status of an existing one. Re-adding keeps
    /// the original join position.
    pub fn upsert_group_member(&self, group_id: Uuid, user_id: Uuid, status: MemberStatus) -> DbResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO group_members (group_id, user_id, status) VALUES (?1, ?2, ?3)
                 ON CONFLICT (group_id, user_id) DO UPDATE SET status = excluded.status",
                (group_id.to_string(), user_id.to_string(), status.as_str()),
            )?;
            Ok(())
        })
    }

    pub fn remove_group_member(&self, group_id: Uuid, user_id: Uuid) -> DbResult<bool> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM group_members WHERE group_id = ?1 AND user_id = ?2",
                (group_id.to_string(), user_id.to_string()),
            )?;
            Ok(removed > 0)
        })
    }

    pub fn group_context(&self, group_id: Uuid) -> DbResult<Option<GroupContext>> {
        self.with_conn(|conn| group_context(conn, group_id))
    }

    pub fn group_members(&self, group_id: Uuid) -> DbResult<Vec<GroupMember>> {
        self.with_conn(|conn| group_members(conn, group_id))
    }
}

pub fn get_user(conn: &Connection, id: Uuid) -> DbResult<Option<User>> {
    let row = conn
        .query_row(
            "SELECT id, username, role FROM users WHERE id = ?1",
            [id.to_string()],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?)),
        )
        .optional()?;

    row.map(|(id, username, role)| -> DbResult<User> {
        Ok(User {
            id: parse_uuid(&id)?,
            username,
            role: role.parse::<Role>().map_err(|e| DbError::Corrupt(format!("{}", e)))?,
        })
    })
    .transpose()
}

pub fn user_exists(conn: &Connection, id: Uuid) -> DbResult<bool> {
    let found = conn
        .query_row("SELECT 1 FROM users WHERE id = ?1", [id.to_string()], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}

/// Resolve a group with its owning group set and classroom.
pub fn group_context(conn: &Connection, group_id: Uuid) -> DbResult<Option<GroupContext>> {
    let row = conn
        .query_row(
            "SELECT g.id, g.name, s.id, s.name, c.id, c.siphon_timeout_hours
             FROM student_groups g
             JOIN group_sets s ON s.id = g.group_set_id
             JOIN classrooms c ON c.id = s.classroom_id
             WHERE g.id = ?1",
            [group_id.to_string()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            },
        )
        .optional()?;

    row.map(|(gid, group_name, sid, group_set_name, cid, siphon_timeout_hours)| -> DbResult<GroupContext> {
        Ok(GroupContext {
            group_id: parse_uuid(&gid)?,
            group_name,
            group_set_id: parse_uuid(&sid)?,
            group_set_name,
            classroom_id: parse_uuid(&cid)?,
            siphon_timeout_hours,
        })
    })
    .transpose()
}

/// Members in join order.
pub fn group_members(conn: &Connection, group_id: Uuid) -> DbResult<Vec<GroupMember>> {
    let mut stmt = conn.prepare(
        "SELECT m.user_id, u.username, m.status
         FROM group_members m
         JOIN users u ON u.id = m.user_id
         WHERE m.group_id = ?1
         ORDER BY m.seq",
    )?;

    let rows = stmt
        .query_map([group_id.to_string()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(uid, username, status)| -> DbResult<GroupMember> {
            Ok(GroupMember {
                user_id: parse_uuid(&uid)?,
                username,
                status: status.parse::<MemberStatus>().map_err(|e| DbError::Corrupt(format!("{}", e)))?,
            })
        })
        .collect()
}

/// Approved members in join order. This order decides who receives a
/// transfer remainder.
pub fn approved_member_ids(conn: &Connection, group_id: Uuid) -> DbResult<Vec<Uuid>> {
    Ok(group_members(conn, group_id)?
        .into_iter()
        .filter(|m| m.status == MemberStatus::Approved)
        .map(|m| m.user_id)
        .collect())
}

pub fn member_status(conn: &Connection, group_id: Uuid, user_id: Uuid) -> DbResult<Option<MemberStatus>> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM group_members WHERE group_id = ?1 AND user_id = ?2",
            (group_id.to_string(), user_id.to_string()),
            |row| row.get(0),
        )
        .optional()?;

    status
        .map(|s| s.parse::<MemberStatus>().map_err(|e| DbError::Corrupt(format!("{}", e))))
        .transpose()
}

pub fn classroom_teacher_ids(conn: &Connection, classroom_id: Uuid) -> DbResult<Vec<Uuid>> {
    let mut stmt = conn.prepare(
        "SELECT user_id FROM classroom_teachers WHERE classroom_id = ?1 ORDER BY user_id",
    )?;
    let ids = stmt
        .query_map([classroom_id.to_string()], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    ids.iter().map(|id| parse_uuid(id)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn members_keep_join_order_and_status() {
        let db = Database::open_in_memory().unwrap();
        let classroom = Uuid::new_v4();
        let set = Uuid::new_v4();
        let group = Uuid::new_v4();
        db.create_classroom(classroom, "Civics", 48).unwrap();
        db.create_group_set(set, classroom, "Projects").unwrap();
        db.create_group(group, set, "Team A").unwrap();

        let users: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for (i, id) in users.iter().enumerate() {
            db.create_user(*id, &format!("student{}", i), Role::Student).unwrap();
            db.upsert_group_member(group, *id, MemberStatus::Approved).unwrap();
        }
        db.upsert_group_member(group, users[1], MemberStatus::Pending).unwrap();

        let approved = db.with_conn(|conn| approved_member_ids(conn, group)).unwrap();
        assert_eq!(approved, vec![users[0], users[2]]);

        let ctx = db.group_context(group).unwrap().unwrap();
        assert_eq!(ctx.classroom_id, classroom);
        assert_eq!(ctx.siphon_timeout_hours, 48);
        assert_eq!(ctx.group_set_name, "Projects");

        assert!(db.remove_group_member(group, users[0]).unwrap());
        let status = db.with_conn(|conn| member_status(conn, group, users[0])).unwrap();
        assert_eq!(status, None);
    }

    #[test]
    fn unknown_group_has_no_context() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.group_context(Uuid::new_v4()).unwrap().is_none());
    }
}
