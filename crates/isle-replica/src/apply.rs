//! Applying foreign events to the replica store.

use isle_bus::HandleOutcome;
use isle_events::EventPayload;
use rusqlite::Connection;

use crate::error::ReplicaError;
use crate::store::{self, Entity};

/// Applies one event in its own transaction.
///
/// Every referenced row must already be present locally. When one is
/// missing nothing is written and [`HandleOutcome::Skipped`] names it; the
/// event is not retried, so the change is dropped until the owner publishes
/// a newer one. Created and updated events both upsert, which makes the
/// apply idempotent and total: a redelivered `created` is a no-op update
/// and an `updated` for an unknown row inserts it.
pub fn apply_event(conn: &mut Connection, event: &EventPayload) -> Result<HandleOutcome, ReplicaError> {
    let tx = conn.transaction()?;

    if let Some((entity, id)) = missing_reference(&tx, event)? {
        return Ok(HandleOutcome::Skipped {
            entity: entity.name(),
            id,
        });
    }

    match event {
        EventPayload::UserCreated(user) | EventPayload::UserUpdated(user) => {
            store::upsert_user(&tx, user)?
        }
        EventPayload::CourseCreated(course) | EventPayload::CourseUpdated(course) => {
            store::upsert_course(&tx, course)?
        }
        EventPayload::IslandCreated(island) | EventPayload::IslandUpdated(island) => {
            store::upsert_island(&tx, island)?
        }
        EventPayload::LevelCreated(level) | EventPayload::LevelUpdated(level) => {
            store::upsert_level(&tx, level)?
        }
        EventPayload::PrerequisitesDeleted(edges) => {
            let removed = store::delete_prerequisites(&tx, &edges.island_id)?;
            tracing::debug!(island_id = %edges.island_id, removed, "cleared replica prerequisites");
        }
        EventPayload::PrerequisiteCreated(edge) => {
            store::insert_prerequisite(&tx, &edge.island_id, &edge.prerequisite_island_id)?
        }
        EventPayload::AttemptCreated(attempt) => store::upsert_attempt(&tx, attempt)?,
        EventPayload::ChallengeCreated(challenge) | EventPayload::ChallengeUpdated(challenge) => {
            store::upsert_challenge(&tx, challenge)?
        }
        EventPayload::SlideCreated(slide) | EventPayload::SlideUpdated(slide) => {
            store::upsert_slide(&tx, slide)?
        }
    }

    tx.commit()?;
    Ok(HandleOutcome::Applied)
}

/// Returns the first reference of `event` that has no local row.
fn missing_reference(
    conn: &Connection,
    event: &EventPayload,
) -> Result<Option<(Entity, String)>, ReplicaError> {
    let required: Vec<(Entity, &str)> = match event {
        EventPayload::UserCreated(_)
        | EventPayload::UserUpdated(_)
        | EventPayload::CourseCreated(_)
        | EventPayload::CourseUpdated(_)
        | EventPayload::PrerequisitesDeleted(_) => vec![],
        EventPayload::IslandCreated(island) | EventPayload::IslandUpdated(island) => {
            vec![(Entity::Course, island.course_id.as_str())]
        }
        EventPayload::LevelCreated(level) | EventPayload::LevelUpdated(level) => {
            vec![(Entity::Island, level.island_id.as_str())]
        }
        EventPayload::PrerequisiteCreated(edge) => vec![
            (Entity::Island, edge.island_id.as_str()),
            (Entity::Island, edge.prerequisite_island_id.as_str()),
        ],
        EventPayload::AttemptCreated(attempt) => vec![
            (Entity::User, attempt.user_id.as_str()),
            (Entity::Level, attempt.level_id.as_str()),
        ],
        EventPayload::ChallengeCreated(challenge) | EventPayload::ChallengeUpdated(challenge) => {
            vec![(Entity::Level, challenge.level_id.as_str())]
        }
        EventPayload::SlideCreated(slide) | EventPayload::SlideUpdated(slide) => {
            vec![(Entity::Level, slide.level_id.as_str())]
        }
    };

    for (entity, id) in required {
        if !store::exists(conn, entity, id)? {
            return Ok(Some((entity, id.to_string())));
        }
    }
    Ok(None)
}
