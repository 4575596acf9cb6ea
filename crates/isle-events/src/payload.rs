//! Payload schemas for each event subject.
//!
//! Field sets are fixed per subject. Local-only attributes (an island's
//! template, path type and background image) are presentation data of the
//! authoring service and are deliberately absent from [`IslandPayload`].

use isle_types::{UserRole, UserStatus};
use serde::{Deserialize, Serialize};

use crate::subject::Subject;

/// A user account as seen by other services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPayload {
    pub id: String,
    pub role: UserRole,
    pub status: UserStatus,
}

/// A course as seen by other services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoursePayload {
    pub id: String,
    /// The user who authored the course.
    pub owner_id: String,
    pub name: String,
    pub description: String,
    pub is_deleted: bool,
}

/// An island as seen by other services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IslandPayload {
    pub id: String,
    pub course_id: String,
    pub name: String,
    pub description: String,
    /// Topological depth in the course's prerequisite graph.
    pub position: i64,
    pub is_deleted: bool,
}

/// Signals that every prerequisite edge of an island was removed.
///
/// Always published before the `prerequisite:created` events of the same
/// replacement, so a subscriber never keeps edges from the old set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrerequisitesDeletedPayload {
    pub island_id: String,
}

/// One prerequisite edge: `island_id` requires `prerequisite_island_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrerequisitePayload {
    pub island_id: String,
    pub prerequisite_island_id: String,
}

/// A level inside an island.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelPayload {
    pub id: String,
    pub island_id: String,
    pub name: String,
    pub position: i64,
    pub is_deleted: bool,
}

/// A learner's attempt at a level, owned by the progress service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptPayload {
    pub id: String,
    pub user_id: String,
    pub level_id: String,
    pub score: i64,
    pub completed: bool,
}

/// A challenge inside a level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengePayload {
    pub id: String,
    pub level_id: String,
    pub name: String,
    pub position: i64,
    pub is_deleted: bool,
}

/// A slide inside a level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlidePayload {
    pub id: String,
    pub level_id: String,
    pub name: String,
    pub position: i64,
    pub is_deleted: bool,
}

/// A typed event: the subject and its payload in one value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    UserCreated(UserPayload),
    UserUpdated(UserPayload),
    CourseCreated(CoursePayload),
    CourseUpdated(CoursePayload),
    LevelCreated(LevelPayload),
    LevelUpdated(LevelPayload),
    IslandCreated(IslandPayload),
    IslandUpdated(IslandPayload),
    PrerequisitesDeleted(PrerequisitesDeletedPayload),
    PrerequisiteCreated(PrerequisitePayload),
    AttemptCreated(AttemptPayload),
    ChallengeCreated(ChallengePayload),
    ChallengeUpdated(ChallengePayload),
    SlideCreated(SlidePayload),
    SlideUpdated(SlidePayload),
}

impl EventPayload {
    /// Returns the subject this payload is published on.
    pub fn subject(&self) -> Subject {
        match self {
            Self::UserCreated(_) => Subject::UserCreated,
            Self::UserUpdated(_) => Subject::UserUpdated,
            Self::CourseCreated(_) => Subject::CourseCreated,
            Self::CourseUpdated(_) => Subject::CourseUpdated,
            Self::LevelCreated(_) => Subject::LevelCreated,
            Self::LevelUpdated(_) => Subject::LevelUpdated,
            Self::IslandCreated(_) => Subject::IslandCreated,
            Self::IslandUpdated(_) => Subject::IslandUpdated,
            Self::PrerequisitesDeleted(_) => Subject::PrerequisitesDeleted,
            Self::PrerequisiteCreated(_) => Subject::PrerequisiteCreated,
            Self::AttemptCreated(_) => Subject::AttemptCreated,
            Self::ChallengeCreated(_) => Subject::ChallengeCreated,
            Self::ChallengeUpdated(_) => Subject::ChallengeUpdated,
            Self::SlideCreated(_) => Subject::SlideCreated,
            Self::SlideUpdated(_) => Subject::SlideUpdated,
        }
    }

    /// Returns the identifier of the entity the event is about.
    ///
    /// Edge events report the dependent island.
    pub fn entity_id(&self) -> &str {
        match self {
            Self::UserCreated(p) | Self::UserUpdated(p) => &p.id,
            Self::CourseCreated(p) | Self::CourseUpdated(p) => &p.id,
            Self::LevelCreated(p) | Self::LevelUpdated(p) => &p.id,
            Self::IslandCreated(p) | Self::IslandUpdated(p) => &p.id,
            Self::PrerequisitesDeleted(p) => &p.island_id,
            Self::PrerequisiteCreated(p) => &p.island_id,
            Self::AttemptCreated(p) => &p.id,
            Self::ChallengeCreated(p) | Self::ChallengeUpdated(p) => &p.id,
            Self::SlideCreated(p) | Self::SlideUpdated(p) => &p.id,
        }
    }

    /// Serialises the payload body (without subject) to a JSON value.
    pub fn to_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            Self::UserCreated(p) | Self::UserUpdated(p) => serde_json::to_value(p),
            Self::CourseCreated(p) | Self::CourseUpdated(p) => serde_json::to_value(p),
            Self::LevelCreated(p) | Self::LevelUpdated(p) => serde_json::to_value(p),
            Self::IslandCreated(p) | Self::IslandUpdated(p) => serde_json::to_value(p),
            Self::PrerequisitesDeleted(p) => serde_json::to_value(p),
            Self::PrerequisiteCreated(p) => serde_json::to_value(p),
            Self::AttemptCreated(p) => serde_json::to_value(p),
            Self::ChallengeCreated(p) | Self::ChallengeUpdated(p) => serde_json::to_value(p),
            Self::SlideCreated(p) | Self::SlideUpdated(p) => serde_json::to_value(p),
        }
    }

    /// Builds a payload from a subject and its JSON body.
    pub fn from_value(
        subject: Subject,
        value: serde_json::Value,
    ) -> Result<Self, serde_json::Error> {
        use serde_json::from_value;

        Ok(match subject {
            Subject::UserCreated => Self::UserCreated(from_value(value)?),
            Subject::UserUpdated => Self::UserUpdated(from_value(value)?),
            Subject::CourseCreated => Self::CourseCreated(from_value(value)?),
            Subject::CourseUpdated => Self::CourseUpdated(from_value(value)?),
            Subject::LevelCreated => Self::LevelCreated(from_value(value)?),
            Subject::LevelUpdated => Self::LevelUpdated(from_value(value)?),
            Subject::IslandCreated => Self::IslandCreated(from_value(value)?),
            Subject::IslandUpdated => Self::IslandUpdated(from_value(value)?),
            Subject::PrerequisitesDeleted => Self::PrerequisitesDeleted(from_value(value)?),
            Subject::PrerequisiteCreated => Self::PrerequisiteCreated(from_value(value)?),
            Subject::AttemptCreated => Self::AttemptCreated(from_value(value)?),
            Subject::ChallengeCreated => Self::ChallengeCreated(from_value(value)?),
            Subject::ChallengeUpdated => Self::ChallengeUpdated(from_value(value)?),
            Subject::SlideCreated => Self::SlideCreated(from_value(value)?),
            Subject::SlideUpdated => Self::SlideUpdated(from_value(value)?),
        })
    }
}
