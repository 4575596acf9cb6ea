//! Event subjects: one per event type in the catalog.

use serde::{Deserialize, Serialize};

use crate::error::EnvelopeError;

/// The type of an event, used both as the envelope `type` field and as the
/// bus subject it is published on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Subject {
    #[serde(rename = "user:created")]
    UserCreated,
    #[serde(rename = "user:updated")]
    UserUpdated,
    #[serde(rename = "course:created")]
    CourseCreated,
    #[serde(rename = "course:updated")]
    CourseUpdated,
    #[serde(rename = "level:created")]
    LevelCreated,
    #[serde(rename = "level:updated")]
    LevelUpdated,
    #[serde(rename = "island:created")]
    IslandCreated,
    #[serde(rename = "island:updated")]
    IslandUpdated,
    /// "Replace all" marker: every prerequisite edge of the island is gone.
    #[serde(rename = "prerequisites:deleted")]
    PrerequisitesDeleted,
    #[serde(rename = "prerequisite:created")]
    PrerequisiteCreated,
    #[serde(rename = "attempt:created")]
    AttemptCreated,
    #[serde(rename = "challenge:created")]
    ChallengeCreated,
    #[serde(rename = "challenge:updated")]
    ChallengeUpdated,
    #[serde(rename = "slide:created")]
    SlideCreated,
    #[serde(rename = "slide:updated")]
    SlideUpdated,
}

impl Subject {
    /// Every subject in the catalog.
    pub const ALL: [Subject; 15] = [
        Self::UserCreated,
        Self::UserUpdated,
        Self::CourseCreated,
        Self::CourseUpdated,
        Self::LevelCreated,
        Self::LevelUpdated,
        Self::IslandCreated,
        Self::IslandUpdated,
        Self::PrerequisitesDeleted,
        Self::PrerequisiteCreated,
        Self::AttemptCreated,
        Self::ChallengeCreated,
        Self::ChallengeUpdated,
        Self::SlideCreated,
        Self::SlideUpdated,
    ];

    /// An edge replacement: one `prerequisites:deleted` marker followed by
    /// the island's new `prerequisite:created` edges. Consumers must see
    /// them in publish order.
    pub const PREREQUISITE_EDGES: [Subject; 2] =
        [Self::PrerequisitesDeleted, Self::PrerequisiteCreated];

    /// Returns the canonical subject string.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserCreated => "user:created",
            Self::UserUpdated => "user:updated",
            Self::CourseCreated => "course:created",
            Self::CourseUpdated => "course:updated",
            Self::LevelCreated => "level:created",
            Self::LevelUpdated => "level:updated",
            Self::IslandCreated => "island:created",
            Self::IslandUpdated => "island:updated",
            Self::PrerequisitesDeleted => "prerequisites:deleted",
            Self::PrerequisiteCreated => "prerequisite:created",
            Self::AttemptCreated => "attempt:created",
            Self::ChallengeCreated => "challenge:created",
            Self::ChallengeUpdated => "challenge:updated",
            Self::SlideCreated => "slide:created",
            Self::SlideUpdated => "slide:updated",
        }
    }

    /// Whether this is a "created" event type.
    pub fn is_creation(self) -> bool {
        self.as_str().ends_with(":created")
    }

    /// Returns the dotted token form used on NATS (`island.updated`).
    pub fn token(self) -> String {
        self.as_str().replace(':', ".")
    }

    /// Parses the dotted token form produced by [`Subject::token`].
    pub fn from_token(token: &str) -> Result<Self, EnvelopeError> {
        token.replacen('.', ":", 1).parse()
    }
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Subject {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|subject| subject.as_str() == s)
            .ok_or_else(|| EnvelopeError::UnknownSubject(s.to_string()))
    }
}
