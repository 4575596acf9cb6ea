//! Transactional entry points of the graph engine.
//!
//! Each function runs in one `IMMEDIATE` transaction, so concurrent writers
//! on the same database serialise at `BEGIN` instead of failing on lock
//! upgrade. Events are collected while the transaction is open and handed
//! back as a [`Dispatch`]: already written to the outbox in
//! [`DeliveryMode::Outbox`], or to be published after commit in
//! [`DeliveryMode::Direct`].

use std::collections::HashSet;

use isle_events::{
    Envelope, EventPayload, PrerequisitePayload, PrerequisitesDeletedPayload,
};
use isle_types::DeliveryMode;
use rusqlite::{Connection, Transaction, TransactionBehavior};

use crate::dag::{plan_prerequisites, CycleError, PositionChange};
use crate::error::GraphError;
use crate::store::{self, Course, Island, NewCourse, NewIsland, UpdateIslandParams};

/// Committed events on their way to the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Publish these after commit; nothing else will.
    Direct(Vec<EventPayload>),
    /// Already stored in the outbox by the committed transaction.
    Outboxed(Vec<Envelope>),
}

impl Dispatch {
    pub fn subjects(&self) -> Vec<isle_events::Subject> {
        match self {
            Self::Direct(events) => events.iter().map(EventPayload::subject).collect(),
            Self::Outboxed(envelopes) => envelopes.iter().map(Envelope::subject).collect(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Direct(events) => events.len(),
            Self::Outboxed(envelopes) => envelopes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Parameters of one `update_island` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateIslandRequest {
    pub course_id: String,
    pub island_id: String,
    /// The user performing the change; must own the course.
    pub actor_id: String,
    pub fields: UpdateIslandParams,
    /// Complete replacement prerequisite list. `None` leaves edges alone;
    /// an empty list removes every prerequisite.
    pub prerequisite_island_ids: Option<Vec<String>>,
}

/// What happened to the island's edge set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeChange {
    Untouched,
    Replaced {
        prerequisites: Vec<String>,
        moved: Vec<PositionChange>,
    },
    /// The edge list was refused; the stored edges are unchanged.
    Rejected(CycleError),
}

/// Result of a committed `update_island`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// The island as committed.
    pub island: Island,
    pub edges: EdgeChange,
    pub dispatch: Dispatch,
}

/// Creates a course owned by `owner_id` and queues `course:created`.
pub fn create_course(
    conn: &mut Connection,
    owner_id: &str,
    course: &NewCourse,
    mode: DeliveryMode,
) -> Result<(Course, Dispatch), GraphError> {
    validate_name(&course.name)?;
    if owner_id.trim().is_empty() {
        return Err(GraphError::Validation("owner id must not be empty".to_string()));
    }

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let course_id = uuid::Uuid::new_v4().to_string();
    let created = store::insert_course(&tx, &course_id, owner_id, course)?;

    let events = vec![EventPayload::CourseCreated(created.to_payload())];
    let dispatch = finish(tx, events, mode)?;

    tracing::info!(course_id = %created.course_id, owner_id, "created course");
    Ok((created, dispatch))
}

/// Creates an island without prerequisites at position 0 and queues
/// `island:created`.
pub fn create_island(
    conn: &mut Connection,
    course_id: &str,
    actor_id: &str,
    island: &NewIsland,
    mode: DeliveryMode,
) -> Result<(Island, Dispatch), GraphError> {
    validate_name(&island.name)?;

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    authorize(&tx, course_id, actor_id)?;

    let island_id = uuid::Uuid::new_v4().to_string();
    let created = store::insert_island(&tx, &island_id, course_id, island)?;

    let events = vec![EventPayload::IslandCreated(created.to_payload())];
    let dispatch = finish(tx, events, mode)?;

    tracing::info!(course_id, island_id = %created.island_id, "created island");
    Ok((created, dispatch))
}

/// Updates an island's fields and, optionally, replaces its prerequisite
/// edge set.
///
/// Steps, inside one transaction:
///
/// 1. Check the course exists, is live and is owned by the actor, that the
///    island belongs to it and that every requested prerequisite is a live
///    island of the same course other than the island itself. Any failure
///    here returns before anything is written.
/// 2. Write the field updates.
/// 3. Plan the new edge set against a snapshot of the course graph. An
///    accepted plan replaces the island's edges and rewrites every position
///    that changed; a rejected plan leaves the edges untouched.
/// 4. Queue `island:updated` for the island, then on acceptance
///    `prerequisites:deleted`, one `prerequisite:created` per edge and
///    `island:updated` for every other island whose position moved.
/// 5. Commit.
///
/// A cycle is reported as `Ok` with [`EdgeChange::Rejected`] so the caller
/// can publish the committed field changes before failing the request.
pub fn update_island(
    conn: &mut Connection,
    request: &UpdateIslandRequest,
    mode: DeliveryMode,
) -> Result<UpdateOutcome, GraphError> {
    if let Some(name) = &request.fields.name {
        validate_name(name)?;
    }

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    authorize(&tx, &request.course_id, &request.actor_id)?;

    let island = store::get_island(&tx, &request.island_id)?;
    if island.course_id != request.course_id {
        return Err(GraphError::not_found("island", &request.island_id));
    }

    let requested = match &request.prerequisite_island_ids {
        Some(ids) => Some(validate_prerequisites(&tx, &request.course_id, &island, ids)?),
        None => None,
    };

    store::update_island_fields(&tx, &island.island_id, &request.fields)?;

    let edges = match requested {
        None => EdgeChange::Untouched,
        Some(requested) => {
            let graph = store::load_graph(&tx, &request.course_id)?;
            match plan_prerequisites(&graph, &island.island_id, &requested) {
                Ok(plan) => {
                    store::replace_prerequisites(&tx, &island.island_id, &plan.prerequisites)?;
                    for change in &plan.moved {
                        store::set_position(&tx, &change.island_id, change.to)?;
                    }
                    EdgeChange::Replaced {
                        prerequisites: plan.prerequisites,
                        moved: plan.moved,
                    }
                }
                Err(cycle) => {
                    tracing::info!(
                        course_id = %request.course_id,
                        island_id = %island.island_id,
                        path = %cycle.path.join(" -> "),
                        "rejected prerequisites that would create a cycle"
                    );
                    EdgeChange::Rejected(cycle)
                }
            }
        }
    };

    let updated = store::get_island(&tx, &island.island_id)?;
    let mut events = vec![EventPayload::IslandUpdated(updated.to_payload())];

    if let EdgeChange::Replaced {
        prerequisites,
        moved,
    } = &edges
    {
        events.push(EventPayload::PrerequisitesDeleted(
            PrerequisitesDeletedPayload {
                island_id: updated.island_id.clone(),
            },
        ));
        events.extend(prerequisites.iter().map(|prerequisite| {
            EventPayload::PrerequisiteCreated(PrerequisitePayload {
                island_id: updated.island_id.clone(),
                prerequisite_island_id: prerequisite.clone(),
            })
        }));
        for change in moved.iter().filter(|m| m.island_id != updated.island_id) {
            let other = store::get_island(&tx, &change.island_id)?;
            events.push(EventPayload::IslandUpdated(other.to_payload()));
        }
    }

    let dispatch = finish(tx, events, mode)?;

    tracing::debug!(
        course_id = %request.course_id,
        island_id = %updated.island_id,
        position = updated.position,
        events = dispatch.len(),
        "updated island"
    );

    Ok(UpdateOutcome {
        island: updated,
        edges,
        dispatch,
    })
}

/// Lists a course's islands in position order.
pub fn list_islands(conn: &Connection, course_id: &str) -> Result<Vec<Island>, GraphError> {
    let course = store::get_course(conn, course_id)?;
    if course.is_deleted {
        return Err(GraphError::not_found("course", course_id));
    }
    store::list_islands(conn, course_id)
}

fn authorize(conn: &Connection, course_id: &str, actor_id: &str) -> Result<Course, GraphError> {
    let course = store::get_course(conn, course_id)?;
    if course.is_deleted {
        return Err(GraphError::not_found("course", course_id));
    }
    if course.owner_id != actor_id {
        return Err(GraphError::NotOwner {
            course_id: course_id.to_string(),
            actor_id: actor_id.to_string(),
        });
    }
    Ok(course)
}

fn validate_name(name: &str) -> Result<(), GraphError> {
    if name.trim().is_empty() {
        return Err(GraphError::Validation("name must not be empty".to_string()));
    }
    Ok(())
}

/// Checks every requested prerequisite and collapses duplicates, keeping
/// the first occurrence.
fn validate_prerequisites(
    conn: &Connection,
    course_id: &str,
    island: &Island,
    requested: &[String],
) -> Result<Vec<String>, GraphError> {
    let mut seen = HashSet::new();
    let mut accepted = Vec::with_capacity(requested.len());

    for id in requested {
        if !seen.insert(id.as_str()) {
            continue;
        }
        if *id == island.island_id {
            return Err(GraphError::Validation(format!(
                "island {id} cannot be its own prerequisite"
            )));
        }
        let prerequisite = match store::get_island(conn, id) {
            Ok(prerequisite) => prerequisite,
            Err(GraphError::NotFound { .. }) => {
                return Err(GraphError::Validation(format!(
                    "prerequisite island {id} does not exist"
                )))
            }
            Err(e) => return Err(e),
        };
        if prerequisite.course_id != course_id {
            return Err(GraphError::Validation(format!(
                "prerequisite island {id} belongs to another course"
            )));
        }
        if prerequisite.is_deleted {
            return Err(GraphError::Validation(format!(
                "prerequisite island {id} is deleted"
            )));
        }
        accepted.push(id.clone());
    }
    Ok(accepted)
}

fn finish(
    tx: Transaction<'_>,
    events: Vec<EventPayload>,
    mode: DeliveryMode,
) -> Result<Dispatch, GraphError> {
    let dispatch = match mode {
        DeliveryMode::Direct => Dispatch::Direct(events),
        DeliveryMode::Outbox => Dispatch::Outboxed(isle_bus::enqueue(&tx, &events)?),
    };
    tx.commit()?;
    Ok(dispatch)
}
