//! SQLite access for courses, islands and prerequisite edges.
//!
//! Functions take a plain `&Connection` so they compose inside whatever
//! transaction the caller holds.

use isle_events::{CoursePayload, IslandPayload};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::dag::CourseGraph;
use crate::error::GraphError;

/// A course owned by this service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Course {
    /// Internal database ID.
    #[serde(skip)]
    pub id: i64,
    #[serde(rename = "id")]
    pub course_id: String,
    pub owner_id: String,
    pub name: String,
    pub description: String,
    pub is_deleted: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl Course {
    pub fn to_payload(&self) -> CoursePayload {
        CoursePayload {
            id: self.course_id.clone(),
            owner_id: self.owner_id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            is_deleted: self.is_deleted,
        }
    }
}

/// An island of a course.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Island {
    /// Internal database ID; also the island's creation order.
    #[serde(skip)]
    pub id: i64,
    #[serde(rename = "id")]
    pub island_id: String,
    pub course_id: String,
    pub name: String,
    pub description: String,
    pub position: i64,
    pub path_type: Option<String>,
    pub template_id: Option<String>,
    pub background_image_id: Option<String>,
    pub is_deleted: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl Island {
    /// The replicated view of the island. Presentation fields (path type,
    /// template, background image) stay local.
    pub fn to_payload(&self) -> IslandPayload {
        IslandPayload {
            id: self.island_id.clone(),
            course_id: self.course_id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            position: self.position,
            is_deleted: self.is_deleted,
        }
    }
}

/// Fields supplied when creating a course.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCourse {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Fields supplied when creating an island.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewIsland {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub path_type: Option<String>,
    pub template_id: Option<String>,
    pub background_image_id: Option<String>,
}

/// Non-graph island fields to change. `None` leaves a field untouched.
///
/// Position is absent on purpose: it is derived from the edge set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateIslandParams {
    pub name: Option<String>,
    pub description: Option<String>,
    pub path_type: Option<String>,
    pub template_id: Option<String>,
    pub background_image_id: Option<String>,
    pub is_deleted: Option<bool>,
}

impl UpdateIslandParams {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

const COURSE_COLUMNS: &str =
    "id, course_id, owner_id, name, description, is_deleted, created_at, updated_at";

const ISLAND_COLUMNS: &str = "id, island_id, course_id, name, description, position, path_type,
     template_id, background_image_id, is_deleted, created_at, updated_at";

pub fn insert_course(
    conn: &Connection,
    course_id: &str,
    owner_id: &str,
    course: &NewCourse,
) -> Result<Course, GraphError> {
    conn.execute(
        "INSERT INTO courses (course_id, owner_id, name, description) VALUES (?1, ?2, ?3, ?4)",
        params![course_id, owner_id, course.name, course.description],
    )?;
    get_course(conn, course_id)
}

/// Retrieves a course by its public ID, including soft-deleted ones.
pub fn get_course(conn: &Connection, course_id: &str) -> Result<Course, GraphError> {
    conn.query_row(
        &format!("SELECT {COURSE_COLUMNS} FROM courses WHERE course_id = ?1"),
        [course_id],
        map_row_to_course,
    )
    .optional()?
    .ok_or_else(|| GraphError::not_found("course", course_id))
}

pub fn insert_island(
    conn: &Connection,
    island_id: &str,
    course_id: &str,
    island: &NewIsland,
) -> Result<Island, GraphError> {
    conn.execute(
        "INSERT INTO islands (
            island_id, course_id, name, description, position,
            path_type, template_id, background_image_id
        ) VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?7)",
        params![
            island_id,
            course_id,
            island.name,
            island.description,
            island.path_type,
            island.template_id,
            island.background_image_id,
        ],
    )?;
    get_island(conn, island_id)
}

pub fn get_island(conn: &Connection, island_id: &str) -> Result<Island, GraphError> {
    conn.query_row(
        &format!("SELECT {ISLAND_COLUMNS} FROM islands WHERE island_id = ?1"),
        [island_id],
        map_row_to_island,
    )
    .optional()?
    .ok_or_else(|| GraphError::not_found("island", island_id))
}

/// Lists a course's islands ordered by position, then creation order.
pub fn list_islands(conn: &Connection, course_id: &str) -> Result<Vec<Island>, GraphError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ISLAND_COLUMNS} FROM islands WHERE course_id = ?1 ORDER BY position ASC, id ASC"
    ))?;

    let rows = stmt.query_map([course_id], map_row_to_island)?;
    let mut islands = Vec::new();
    for row in rows {
        islands.push(row?);
    }
    Ok(islands)
}

/// Applies non-graph field updates with a single UPDATE statement.
///
/// Only fields that are `Some` are written.
pub fn update_island_fields(
    conn: &Connection,
    island_id: &str,
    updates: &UpdateIslandParams,
) -> Result<(), GraphError> {
    let mut set_parts: Vec<String> = Vec::new();
    let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
    let mut idx = 1usize;

    let text_fields = [
        ("name", &updates.name),
        ("description", &updates.description),
        ("path_type", &updates.path_type),
        ("template_id", &updates.template_id),
        ("background_image_id", &updates.background_image_id),
    ];
    for (column, value) in text_fields {
        if let Some(value) = value {
            set_parts.push(format!("{column} = ?{idx}"));
            values.push(Box::new(value.clone()));
            idx += 1;
        }
    }
    if let Some(deleted) = updates.is_deleted {
        set_parts.push(format!("is_deleted = ?{idx}"));
        values.push(Box::new(deleted));
        idx += 1;
    }

    if set_parts.is_empty() {
        return Ok(());
    }
    set_parts.push("updated_at = datetime('now')".to_string());

    let sql = format!(
        "UPDATE islands SET {} WHERE island_id = ?{}",
        set_parts.join(", "),
        idx
    );
    values.push(Box::new(island_id.to_string()));

    let params: Vec<&dyn rusqlite::types::ToSql> = values.iter().map(|v| v.as_ref()).collect();
    let count = conn.execute(&sql, params.as_slice())?;
    if count == 0 {
        return Err(GraphError::not_found("island", island_id));
    }
    Ok(())
}

/// Returns an island's prerequisites in the order they were supplied.
pub fn list_prerequisites(conn: &Connection, island_id: &str) -> Result<Vec<String>, GraphError> {
    let mut stmt = conn.prepare(
        "SELECT prerequisite_island_id FROM island_prerequisites
         WHERE island_id = ?1 ORDER BY ordinal ASC",
    )?;
    let ids = stmt
        .query_map([island_id], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

/// Loads the graph snapshot of a course.
pub fn load_graph(conn: &Connection, course_id: &str) -> Result<CourseGraph, GraphError> {
    let mut stmt =
        conn.prepare("SELECT island_id, position FROM islands WHERE course_id = ?1 ORDER BY id")?;
    let islands = stmt
        .query_map([course_id], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<(String, i64)>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT p.island_id, p.prerequisite_island_id
         FROM island_prerequisites p
         JOIN islands i ON i.island_id = p.island_id
         WHERE i.course_id = ?1
         ORDER BY i.id, p.ordinal",
    )?;
    let edges = stmt
        .query_map([course_id], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<(String, String)>, _>>()?;

    Ok(CourseGraph::new(islands, edges))
}

/// Replaces every prerequisite edge of `island_id` with `prerequisites`.
pub fn replace_prerequisites(
    conn: &Connection,
    island_id: &str,
    prerequisites: &[String],
) -> Result<(), GraphError> {
    conn.execute(
        "DELETE FROM island_prerequisites WHERE island_id = ?1",
        [island_id],
    )?;

    let mut stmt = conn.prepare_cached(
        "INSERT INTO island_prerequisites (island_id, prerequisite_island_id, ordinal)
         VALUES (?1, ?2, ?3)",
    )?;
    for (ordinal, prerequisite) in prerequisites.iter().enumerate() {
        stmt.execute(params![island_id, prerequisite, ordinal as i64])?;
    }
    Ok(())
}

pub fn set_position(conn: &Connection, island_id: &str, position: i64) -> Result<(), GraphError> {
    conn.execute(
        "UPDATE islands SET position = ?1, updated_at = datetime('now') WHERE island_id = ?2",
        params![position, island_id],
    )?;
    Ok(())
}

fn map_row_to_course(row: &Row) -> rusqlite::Result<Course> {
    Ok(Course {
        id: row.get(0)?,
        course_id: row.get(1)?,
        owner_id: row.get(2)?,
        name: row.get(3)?,
        description: row.get(4)?,
        is_deleted: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn map_row_to_island(row: &Row) -> rusqlite::Result<Island> {
    Ok(Island {
        id: row.get(0)?,
        island_id: row.get(1)?,
        course_id: row.get(2)?,
        name: row.get(3)?,
        description: row.get(4)?,
        position: row.get(5)?,
        path_type: row.get(6)?,
        template_id: row.get(7)?,
        background_image_id: row.get(8)?,
        is_deleted: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}
