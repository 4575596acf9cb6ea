//! Shared types and constants for the isle services.
//!
//! Every isle service (course authoring, progress tracking, storefront)
//! owns a slice of the domain and keeps shadow copies of the rest. The
//! enums here are the values that cross service boundaries inside event
//! payloads, so every crate agrees on their string labels.
//!
//! Only `serde` and `thiserror` are allowed as dependencies; everything
//! else in the workspace may depend on this crate without cycles.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name of the service that owns courses, islands, levels and the
/// prerequisite graph.
pub const COURSE_AUTHORING_SERVICE: &str = "course-authoring";

/// Name of the service that records attempts and learner progress.
pub const PROGRESS_SERVICE: &str = "progress";

/// Returns the queue group a service uses for every subscription.
///
/// All instances of one service share the group, so each event is handled
/// once per service rather than once per process.
pub fn queue_group_for(service: &str) -> String {
    format!("{service}-service")
}

/// Error returned when a stored or transmitted label is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} label: {label}")]
pub struct ParseLabelError {
    /// What was being parsed (e.g. `"user role"`).
    pub kind: &'static str,
    /// The offending label.
    pub label: String,
}

/// Role of a user account, owned by the identity service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserRole {
    /// A learner taking courses.
    Student,
    /// An author who owns courses.
    Teacher,
    /// Platform administrator.
    Admin,
}

impl UserRole {
    /// Returns the canonical label stored in replica tables.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Student => "STUDENT",
            Self::Teacher => "TEACHER",
            Self::Admin => "ADMIN",
        }
    }
}

impl std::fmt::Display for UserRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for UserRole {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STUDENT" => Ok(Self::Student),
            "TEACHER" => Ok(Self::Teacher),
            "ADMIN" => Ok(Self::Admin),
            _ => Err(ParseLabelError {
                kind: "user role",
                label: s.to_string(),
            }),
        }
    }
}

/// Account status of a user. Users are never deleted, only deactivated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserStatus {
    /// Normal, usable account.
    Active,
    /// Temporarily blocked by an administrator.
    Suspended,
    /// Closed by the user or an administrator.
    Deactivated,
}

impl UserStatus {
    /// Returns the canonical label stored in replica tables.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Suspended => "SUSPENDED",
            Self::Deactivated => "DEACTIVATED",
        }
    }
}

impl std::fmt::Display for UserStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for UserStatus {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(Self::Active),
            "SUSPENDED" => Ok(Self::Suspended),
            "DEACTIVATED" => Ok(Self::Deactivated),
            _ => Err(ParseLabelError {
                kind: "user status",
                label: s.to_string(),
            }),
        }
    }
}

/// How events leave the owning service after a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Publish inline after commit. A crash or bus failure between commit
    /// and publish loses the event.
    #[default]
    Direct,
    /// Write events to the outbox table inside the transaction and let a
    /// relay forward them.
    Outbox,
}

impl std::str::FromStr for DeliveryMode {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "outbox" => Ok(Self::Outbox),
            _ => Err(ParseLabelError {
                kind: "delivery mode",
                label: s.to_string(),
            }),
        }
    }
}
