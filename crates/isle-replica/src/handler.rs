//! Bus handlers that feed the replica store.

use std::sync::Arc;

use async_trait::async_trait;
use isle_bus::{EventHandler, HandleOutcome, HandlerError};
use isle_db::DbPool;
use isle_events::{Envelope, Subject};
use isle_types::{queue_group_for, COURSE_AUTHORING_SERVICE, PROGRESS_SERVICE};

use crate::apply::apply_event;
use crate::error::ReplicaError;

/// Applies the events of one ordered subscription to the local replica
/// tables.
pub struct ReplicaHandler {
    pool: DbPool,
    subjects: Vec<Subject>,
    queue_group: String,
}

impl ReplicaHandler {
    pub fn new(pool: DbPool, subjects: Vec<Subject>, queue_group: impl Into<String>) -> Self {
        Self {
            pool,
            subjects,
            queue_group: queue_group.into(),
        }
    }
}

#[async_trait]
impl EventHandler for ReplicaHandler {
    fn subjects(&self) -> &[Subject] {
        &self.subjects
    }

    fn queue_group(&self) -> &str {
        &self.queue_group
    }

    async fn handle(&self, envelope: &Envelope) -> Result<HandleOutcome, HandlerError> {
        let pool = self.pool.clone();
        let payload = envelope.payload().clone();

        let result = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            apply_event(&mut conn, &payload)
        })
        .await
        .map_err(|e| ReplicaError::Join(e.to_string()));

        match result {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(e)) | Err(e) => Err(HandlerError::Transient(e.to_string())),
        }
    }
}

/// Subjects a service shadows. A service never replicates what it owns.
pub fn replicated_subjects(service: &str) -> Vec<Subject> {
    match service {
        COURSE_AUTHORING_SERVICE => vec![Subject::UserCreated, Subject::UserUpdated],
        PROGRESS_SERVICE => Subject::ALL
            .into_iter()
            .filter(|s| *s != Subject::AttemptCreated)
            .collect(),
        _ => Subject::ALL.to_vec(),
    }
}

/// Groups the replicated subjects into ordered subscriptions.
///
/// Every subject gets its own subscription except the prerequisite edge
/// subjects, which share one so a replacement's delete marker is always
/// applied before its new edges.
pub fn subscription_sets(service: &str) -> Vec<Vec<Subject>> {
    let (edges, rest): (Vec<Subject>, Vec<Subject>) = replicated_subjects(service)
        .into_iter()
        .partition(|subject| Subject::PREREQUISITE_EDGES.contains(subject));

    let mut sets: Vec<Vec<Subject>> = rest.into_iter().map(|subject| vec![subject]).collect();
    if !edges.is_empty() {
        sets.push(edges);
    }
    sets
}

/// One handler per subscription set, all in the service's queue group.
pub fn replica_handlers(pool: &DbPool, service: &str) -> Vec<Arc<dyn EventHandler>> {
    let group = queue_group_for(service);
    subscription_sets(service)
        .into_iter()
        .map(|subjects| {
            Arc::new(ReplicaHandler::new(pool.clone(), subjects, group.clone()))
                as Arc<dyn EventHandler>
        })
        .collect()
}
