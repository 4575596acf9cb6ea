//! Async facade over the engine: runs each call on the blocking pool and
//! hands committed events to the bus.

use isle_bus::{OutboxRelay, Publisher};
use isle_db::DbPool;
use isle_types::DeliveryMode;

use crate::engine::{self, Dispatch, EdgeChange, UpdateIslandRequest, UpdateOutcome};
use crate::error::GraphError;
use crate::store::{Course, Island, NewCourse, NewIsland};

/// Rows relayed per outbox batch when triggered after a commit.
const RELAY_BATCH_SIZE: usize = 100;

/// The course-authoring service's graph operations.
#[derive(Clone)]
pub struct IslandService {
    pool: DbPool,
    publisher: Publisher,
    mode: DeliveryMode,
    relay: OutboxRelay,
}

impl IslandService {
    pub fn new(pool: DbPool, publisher: Publisher, mode: DeliveryMode) -> Self {
        let relay = OutboxRelay::new(pool.clone(), publisher.clone(), RELAY_BATCH_SIZE);
        Self {
            pool,
            publisher,
            mode,
            relay,
        }
    }

    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    /// The relay draining this service's outbox.
    pub fn relay(&self) -> &OutboxRelay {
        &self.relay
    }

    pub async fn create_course(
        &self,
        owner_id: &str,
        course: NewCourse,
    ) -> Result<Course, GraphError> {
        let pool = self.pool.clone();
        let owner_id = owner_id.to_string();
        let mode = self.mode;

        let (created, dispatch) = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            engine::create_course(&mut conn, &owner_id, &course, mode)
        })
        .await
        .map_err(|e| GraphError::Join(e.to_string()))??;

        self.dispatch(dispatch).await;
        Ok(created)
    }

    pub async fn create_island(
        &self,
        course_id: &str,
        actor_id: &str,
        island: NewIsland,
    ) -> Result<Island, GraphError> {
        let pool = self.pool.clone();
        let course_id = course_id.to_string();
        let actor_id = actor_id.to_string();
        let mode = self.mode;

        let (created, dispatch) = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            engine::create_island(&mut conn, &course_id, &actor_id, &island, mode)
        })
        .await
        .map_err(|e| GraphError::Join(e.to_string()))??;

        self.dispatch(dispatch).await;
        Ok(created)
    }

    /// Runs `UpdateIsland` and publishes its events after commit.
    ///
    /// A rejected edge list still commits the field changes and publishes
    /// the island's `island:updated`; the call then fails with
    /// [`GraphError::Cycle`].
    pub async fn update_island(
        &self,
        request: UpdateIslandRequest,
    ) -> Result<UpdateOutcome, GraphError> {
        let pool = self.pool.clone();
        let mode = self.mode;

        let outcome = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            engine::update_island(&mut conn, &request, mode)
        })
        .await
        .map_err(|e| GraphError::Join(e.to_string()))??;

        self.dispatch(outcome.dispatch.clone()).await;

        match outcome.edges {
            EdgeChange::Rejected(cycle) => Err(GraphError::Cycle(cycle)),
            _ => Ok(outcome),
        }
    }

    pub async fn list_islands(&self, course_id: &str) -> Result<Vec<Island>, GraphError> {
        let pool = self.pool.clone();
        let course_id = course_id.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            engine::list_islands(&conn, &course_id)
        })
        .await
        .map_err(|e| GraphError::Join(e.to_string()))?
    }

    /// Sends committed events on their way. Never fails the request: the
    /// state change is already durable.
    async fn dispatch(&self, dispatch: Dispatch) {
        match dispatch {
            Dispatch::Direct(events) => {
                let report = self.publisher.publish_committed(events).await;
                if !report.is_complete() {
                    tracing::warn!(
                        published = report.published,
                        lost = report.lost,
                        "events lost after commit"
                    );
                }
            }
            Dispatch::Outboxed(_) => {
                if let Err(e) = self.relay.relay_pending().await {
                    tracing::warn!(error = %e, "outbox relay after commit failed");
                }
            }
        }
    }
}
