//! Event envelope and catalog for the isle replication bus.
//!
//! Every change that crosses a service boundary travels as one of a fixed
//! set of typed events. This crate holds those contracts and nothing else:
//! no I/O and no bus logic.
//!
//! # Catalog
//!
//! | Subject | Payload | Owner |
//! |---------|---------|-------|
//! | `user:created`, `user:updated` | [`UserPayload`] | identity |
//! | `course:created`, `course:updated` | [`CoursePayload`] | course authoring |
//! | `island:created`, `island:updated` | [`IslandPayload`] | course authoring |
//! | `prerequisites:deleted` | [`PrerequisitesDeletedPayload`] | course authoring |
//! | `prerequisite:created` | [`PrerequisitePayload`] | course authoring |
//! | `level:created`, `level:updated` | [`LevelPayload`] | course authoring |
//! | `challenge:created`, `challenge:updated` | [`ChallengePayload`] | course authoring |
//! | `slide:created`, `slide:updated` | [`SlidePayload`] | course authoring |
//! | `attempt:created` | [`AttemptPayload`] | progress |
//!
//! # Wire format
//!
//! ```json
//! {
//!   "type": "island:updated",
//!   "deliveryToken": "8c1f0f7e-...",
//!   "payload": { "id": "...", "courseId": "...", "name": "...", ... }
//! }
//! ```
//!
//! Events carry no version field. Two updates for the same entity are
//! applied in arrival order and the later one wins.

mod envelope;
mod error;
mod payload;
mod subject;

pub use envelope::Envelope;
pub use error::EnvelopeError;
pub use payload::{
    AttemptPayload, ChallengePayload, CoursePayload, EventPayload, IslandPayload, LevelPayload,
    PrerequisitePayload, PrerequisitesDeletedPayload, SlidePayload, UserPayload,
};
pub use subject::Subject;
