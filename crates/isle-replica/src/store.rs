//! Shadow tables for entities owned by other services.
//!
//! Every write is an upsert keyed by the owner's id, so applying the same
//! event twice leaves one row. Rows are never deleted; soft-delete flags
//! arrive as ordinary updates.

use isle_events::{
    AttemptPayload, ChallengePayload, CoursePayload, IslandPayload, LevelPayload, SlidePayload,
    UserPayload,
};
use isle_types::{UserRole, UserStatus};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::error::ReplicaError;

/// A shadowed user: only what access checks need.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaUser {
    pub user_id: String,
    pub role: UserRole,
    pub status: UserStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaIsland {
    pub island_id: String,
    pub course_id: String,
    pub name: String,
    pub description: String,
    pub position: i64,
    pub is_deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaLevel {
    pub level_id: String,
    pub island_id: String,
    pub name: String,
    pub position: i64,
    pub is_deleted: bool,
}

/// Tables whose rows can be referenced by other replica rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    User,
    Course,
    Island,
    Level,
}

impl Entity {
    pub fn name(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Course => "course",
            Self::Island => "island",
            Self::Level => "level",
        }
    }

    fn exists_sql(self) -> &'static str {
        match self {
            Self::User => "SELECT 1 FROM replica_users WHERE user_id = ?1",
            Self::Course => "SELECT 1 FROM replica_courses WHERE course_id = ?1",
            Self::Island => "SELECT 1 FROM replica_islands WHERE island_id = ?1",
            Self::Level => "SELECT 1 FROM replica_levels WHERE level_id = ?1",
        }
    }
}

/// Whether a replica row for `entity` with `id` is present.
pub fn exists(conn: &Connection, entity: Entity, id: &str) -> Result<bool, ReplicaError> {
    Ok(conn
        .query_row(entity.exists_sql(), [id], |_| Ok(()))
        .optional()?
        .is_some())
}

pub fn upsert_user(conn: &Connection, user: &UserPayload) -> Result<(), ReplicaError> {
    conn.execute(
        "INSERT INTO replica_users (user_id, role, status) VALUES (?1, ?2, ?3)
         ON CONFLICT(user_id) DO UPDATE SET
             role = excluded.role,
             status = excluded.status,
             synced_at = datetime('now')",
        params![user.id, user.role.as_str(), user.status.as_str()],
    )?;
    Ok(())
}

pub fn upsert_course(conn: &Connection, course: &CoursePayload) -> Result<(), ReplicaError> {
    conn.execute(
        "INSERT INTO replica_courses (course_id, owner_id, name, description, is_deleted)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(course_id) DO UPDATE SET
             owner_id = excluded.owner_id,
             name = excluded.name,
             description = excluded.description,
             is_deleted = excluded.is_deleted,
             synced_at = datetime('now')",
        params![
            course.id,
            course.owner_id,
            course.name,
            course.description,
            course.is_deleted
        ],
    )?;
    Ok(())
}

pub fn upsert_island(conn: &Connection, island: &IslandPayload) -> Result<(), ReplicaError> {
    conn.execute(
        "INSERT INTO replica_islands (island_id, course_id, name, description, position, is_deleted)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(island_id) DO UPDATE SET
             course_id = excluded.course_id,
             name = excluded.name,
             description = excluded.description,
             position = excluded.position,
             is_deleted = excluded.is_deleted,
             synced_at = datetime('now')",
        params![
            island.id,
            island.course_id,
            island.name,
            island.description,
            island.position,
            island.is_deleted
        ],
    )?;
    Ok(())
}

pub fn upsert_level(conn: &Connection, level: &LevelPayload) -> Result<(), ReplicaError> {
    conn.execute(
        "INSERT INTO replica_levels (level_id, island_id, name, position, is_deleted)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(level_id) DO UPDATE SET
             island_id = excluded.island_id,
             name = excluded.name,
             position = excluded.position,
             is_deleted = excluded.is_deleted,
             synced_at = datetime('now')",
        params![
            level.id,
            level.island_id,
            level.name,
            level.position,
            level.is_deleted
        ],
    )?;
    Ok(())
}

pub fn upsert_attempt(conn: &Connection, attempt: &AttemptPayload) -> Result<(), ReplicaError> {
    conn.execute(
        "INSERT INTO replica_attempts (attempt_id, user_id, level_id, score, completed)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(attempt_id) DO UPDATE SET
             user_id = excluded.user_id,
             level_id = excluded.level_id,
             score = excluded.score,
             completed = excluded.completed,
             synced_at = datetime('now')",
        params![
            attempt.id,
            attempt.user_id,
            attempt.level_id,
            attempt.score,
            attempt.completed
        ],
    )?;
    Ok(())
}

pub fn upsert_challenge(conn: &Connection, challenge: &ChallengePayload) -> Result<(), ReplicaError> {
    conn.execute(
        "INSERT INTO replica_challenges (challenge_id, level_id, name, position, is_deleted)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(challenge_id) DO UPDATE SET
             level_id = excluded.level_id,
             name = excluded.name,
             position = excluded.position,
             is_deleted = excluded.is_deleted,
             synced_at = datetime('now')",
        params![
            challenge.id,
            challenge.level_id,
            challenge.name,
            challenge.position,
            challenge.is_deleted
        ],
    )?;
    Ok(())
}

pub fn upsert_slide(conn: &Connection, slide: &SlidePayload) -> Result<(), ReplicaError> {
    conn.execute(
        "INSERT INTO replica_slides (slide_id, level_id, name, position, is_deleted)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(slide_id) DO UPDATE SET
             level_id = excluded.level_id,
             name = excluded.name,
             position = excluded.position,
             is_deleted = excluded.is_deleted,
             synced_at = datetime('now')",
        params![
            slide.id,
            slide.level_id,
            slide.name,
            slide.position,
            slide.is_deleted
        ],
    )?;
    Ok(())
}

/// Removes every replica edge of `island_id`. Returns how many went.
pub fn delete_prerequisites(conn: &Connection, island_id: &str) -> Result<usize, ReplicaError> {
    Ok(conn.execute(
        "DELETE FROM replica_island_prerequisites WHERE island_id = ?1",
        [island_id],
    )?)
}

pub fn insert_prerequisite(
    conn: &Connection,
    island_id: &str,
    prerequisite_island_id: &str,
) -> Result<(), ReplicaError> {
    conn.execute(
        "INSERT INTO replica_island_prerequisites (island_id, prerequisite_island_id)
         VALUES (?1, ?2)
         ON CONFLICT(island_id, prerequisite_island_id) DO UPDATE SET synced_at = datetime('now')",
        params![island_id, prerequisite_island_id],
    )?;
    Ok(())
}

pub fn get_user(conn: &Connection, user_id: &str) -> Result<Option<ReplicaUser>, ReplicaError> {
    let row = conn
        .query_row(
            "SELECT user_id, role, status FROM replica_users WHERE user_id = ?1",
            [user_id],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?)),
        )
        .optional()?;

    row.map(|(user_id, role, status)| {
        Ok(ReplicaUser {
            user_id,
            role: role
                .parse()
                .map_err(|e: isle_types::ParseLabelError| ReplicaError::InvalidData(e.to_string()))?,
            status: status
                .parse()
                .map_err(|e: isle_types::ParseLabelError| ReplicaError::InvalidData(e.to_string()))?,
        })
    })
    .transpose()
}

pub fn get_island(conn: &Connection, island_id: &str) -> Result<Option<ReplicaIsland>, ReplicaError> {
    Ok(conn
        .query_row(
            "SELECT island_id, course_id, name, description, position, is_deleted
             FROM replica_islands WHERE island_id = ?1",
            [island_id],
            map_row_to_island,
        )
        .optional()?)
}

pub fn get_level(conn: &Connection, level_id: &str) -> Result<Option<ReplicaLevel>, ReplicaError> {
    Ok(conn
        .query_row(
            "SELECT level_id, island_id, name, position, is_deleted
             FROM replica_levels WHERE level_id = ?1",
            [level_id],
            |row| {
                Ok(ReplicaLevel {
                    level_id: row.get(0)?,
                    island_id: row.get(1)?,
                    name: row.get(2)?,
                    position: row.get(3)?,
                    is_deleted: row.get(4)?,
                })
            },
        )
        .optional()?)
}

/// Prerequisites of `island_id` known locally, sorted by id.
pub fn list_prerequisites(conn: &Connection, island_id: &str) -> Result<Vec<String>, ReplicaError> {
    let mut stmt = conn.prepare(
        "SELECT prerequisite_island_id FROM replica_island_prerequisites
         WHERE island_id = ?1 ORDER BY prerequisite_island_id",
    )?;
    let ids = stmt
        .query_map([island_id], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

/// Attempts recorded for a level.
pub fn count_attempts(conn: &Connection, level_id: &str) -> Result<i64, ReplicaError> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM replica_attempts WHERE level_id = ?1",
        [level_id],
        |row| row.get(0),
    )?)
}

pub fn count_levels(conn: &Connection) -> Result<i64, ReplicaError> {
    Ok(conn.query_row("SELECT COUNT(*) FROM replica_levels", [], |row| row.get(0))?)
}

fn map_row_to_island(row: &Row) -> rusqlite::Result<ReplicaIsland> {
    Ok(ReplicaIsland {
        island_id: row.get(0)?,
        course_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        position: row.get(4)?,
        is_deleted: row.get(5)?,
    })
}
