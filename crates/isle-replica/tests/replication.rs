use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use isle_bus::{
    process_delivery, run_listener, DeadLetterReason, DeadLetterSink, Disposition, EventHandler,
    HandleOutcome, HandlerError, InMemoryBus, ListenerConfig, ListenerStats, MessageBus, Publisher,
    Subscription,
};
use isle_db::{create_pool, run_migrations, DbPool, DbRuntimeSettings};
use isle_events::{AttemptPayload, Envelope, EventPayload, Subject, UserPayload};
use isle_graph::{IslandService, NewCourse, NewIsland, UpdateIslandParams, UpdateIslandRequest};
use isle_replica::{
    list_dead_letters, replica_handlers, store, DeadLetterFilter, Entity, SqliteDeadLetterStore,
};
use isle_types::{DeliveryMode, UserRole, UserStatus};
use tokio::sync::watch;

const OWNER: &str = "author-1";
const SERVICE: &str = "storefront";

fn file_pool(dir: &tempfile::TempDir, name: &str) -> DbPool {
    let path = dir.path().join(name);
    let pool = create_pool(path.to_str().unwrap(), DbRuntimeSettings::default()).unwrap();
    run_migrations(&pool.get().unwrap()).unwrap();
    pool
}

/// A replicating service whose deliveries are pumped by hand, in publish
/// order, so tests can reason about the exact sequence applied.
struct Replica {
    pool: DbPool,
    bus: InMemoryBus,
    handlers: Vec<Arc<dyn EventHandler>>,
    subscriptions: Vec<Box<dyn Subscription>>,
    dead_letters: SqliteDeadLetterStore,
    stats: ListenerStats,
    cursor: usize,
}

impl Replica {
    async fn new(pool: DbPool, bus: InMemoryBus) -> Self {
        let handlers = replica_handlers(&pool, SERVICE);
        let mut subscriptions = Vec::new();
        for handler in &handlers {
            let sub = bus
                .subscribe(handler.subjects(), handler.queue_group())
                .await
                .unwrap();
            subscriptions.push(sub);
        }
        Self {
            dead_letters: SqliteDeadLetterStore::new(pool.clone()),
            pool,
            bus,
            handlers,
            subscriptions,
            stats: ListenerStats::default(),
            cursor: 0,
        }
    }

    /// Applies every envelope published since the last pump.
    async fn pump(&mut self) -> Vec<Disposition> {
        let published = self.bus.published();
        let mut dispositions = Vec::new();
        for envelope in &published[self.cursor..] {
            let subject = envelope.subject();
            let index = self
                .handlers
                .iter()
                .position(|handler| handler.subjects().contains(&subject))
                .unwrap();
            let sub = &mut self.subscriptions[index];
            let delivery = tokio::time::timeout(Duration::from_secs(1), sub.next_delivery())
                .await
                .expect("delivery should arrive")
                .expect("subscription open")
                .expect("delivery ok");
            let handler = self.handlers[index].clone();
            dispositions.push(
                process_delivery(
                    handler.as_ref(),
                    &self.dead_letters,
                    &ListenerConfig::default(),
                    &self.stats,
                    delivery,
                )
                .await,
            );
        }
        self.cursor = published.len();
        dispositions
    }
}

struct World {
    _dir: tempfile::TempDir,
    service: IslandService,
    replica: Replica,
    course_id: String,
}

impl World {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let bus = InMemoryBus::new();
        let replica = Replica::new(file_pool(&dir, "storefront.db"), bus.clone()).await;
        let service = IslandService::new(
            file_pool(&dir, "authoring.db"),
            Publisher::new(Arc::new(bus)),
            DeliveryMode::Direct,
        );
        let course = service
            .create_course(
                OWNER,
                NewCourse {
                    name: "Rust".to_string(),
                    description: String::new(),
                },
            )
            .await
            .unwrap();

        Self {
            _dir: dir,
            service,
            replica,
            course_id: course.course_id,
        }
    }

    async fn island(&self, name: &str) -> String {
        self.service
            .create_island(
                &self.course_id,
                OWNER,
                NewIsland {
                    name: name.to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .island_id
    }

    async fn set_prerequisites(&self, island: &str, prerequisites: Vec<String>) {
        self.service
            .update_island(UpdateIslandRequest {
                course_id: self.course_id.clone(),
                island_id: island.to_string(),
                actor_id: OWNER.to_string(),
                fields: UpdateIslandParams::default(),
                prerequisite_island_ids: Some(prerequisites),
            })
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn replica_follows_prerequisite_replacement() {
    let mut world = World::new().await;
    let a = world.island("A").await;
    let b = world.island("B").await;
    let d = world.island("D").await;

    world.set_prerequisites(&d, vec![a.clone(), b.clone()]).await;
    let dispositions = world.replica.pump().await;
    assert!(dispositions.iter().all(|d| *d == Disposition::Applied));

    let conn = world.replica.pool.get().unwrap();
    let mut expected = vec![a.clone(), b.clone()];
    expected.sort();
    assert_eq!(store::list_prerequisites(&conn, &d).unwrap(), expected);
    assert_eq!(store::get_island(&conn, &d).unwrap().unwrap().position, 1);
    drop(conn);

    // [A, B] -> []: one delete marker and no creates.
    world.set_prerequisites(&d, vec![]).await;
    let subjects: Vec<Subject> = world.replica.bus.published()[world.replica.cursor..]
        .iter()
        .map(Envelope::subject)
        .collect();
    assert_eq!(subjects, vec![Subject::IslandUpdated, Subject::PrerequisitesDeleted]);
    world.replica.pump().await;

    let conn = world.replica.pool.get().unwrap();
    assert!(store::list_prerequisites(&conn, &d).unwrap().is_empty());
    assert_eq!(store::get_island(&conn, &d).unwrap().unwrap().position, 0);
}

#[tokio::test]
async fn redelivered_events_leave_one_row() {
    let mut world = World::new().await;
    let a = world.island("A").await;
    world.replica.pump().await;

    // Publishing the same envelope again stands in for a redelivery.
    let duplicate = world.replica.bus.published().last().cloned().unwrap();
    world.replica.bus.publish(&duplicate).await.unwrap();
    let dispositions = world.replica.pump().await;
    assert_eq!(dispositions, vec![Disposition::Applied]);

    let conn = world.replica.pool.get().unwrap();
    assert_eq!(store::get_island(&conn, &a).unwrap().unwrap().name, "A");
    let islands: i64 = conn
        .query_row("SELECT COUNT(*) FROM replica_islands", [], |row| row.get(0))
        .unwrap();
    assert_eq!(islands, 1);
}

#[tokio::test]
async fn missing_reference_is_dead_lettered() {
    let mut world = World::new().await;
    world.replica.pump().await;

    let attempt = Envelope::new(EventPayload::AttemptCreated(AttemptPayload {
        id: "attempt-1".to_string(),
        user_id: "student-1".to_string(),
        level_id: "level-1".to_string(),
        score: 70,
        completed: false,
    }));
    world.replica.bus.publish(&attempt).await.unwrap();

    let dispositions = world.replica.pump().await;
    assert_eq!(dispositions, vec![Disposition::Skipped]);
    assert_eq!(world.replica.stats.snapshot().skipped, 1);
    assert_eq!(world.replica.bus.pending(Subject::AttemptCreated, "storefront-service"), 0);

    let conn = world.replica.pool.get().unwrap();
    let letters = list_dead_letters(
        &conn,
        &DeadLetterFilter {
            reason: Some(DeadLetterReason::MissingReference),
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].subject, "attempt:created");
    assert_eq!(letters[0].queue_group, "storefront-service");
    assert_eq!(letters[0].delivery_token.as_deref(), Some(attempt.delivery_token()));
    assert_eq!(letters[0].detail, "missing user student-1");
}

#[tokio::test]
async fn sqlite_sink_records_letters() {
    let dir = tempfile::tempdir().unwrap();
    let pool = file_pool(&dir, "sink.db");
    let sink = SqliteDeadLetterStore::new(pool.clone());

    sink.record(isle_bus::DeadLetter {
        subject: Subject::LevelCreated,
        queue_group: "progress-service".to_string(),
        delivery_token: None,
        reason: DeadLetterReason::MalformedPayload,
        detail: "expected value at line 1 column 1".to_string(),
        payload: "not json".to_string(),
        attempt: 2,
    })
    .await
    .unwrap();

    let letters = list_dead_letters(&pool.get().unwrap(), &DeadLetterFilter::default()).unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].reason, "MALFORMED_PAYLOAD");
    assert_eq!(letters[0].attempt, 2);
    assert!(letters[0].delivery_token.is_none());
}

/// Listeners running as background tasks converge on the published user
/// state and stop cleanly on shutdown.
#[tokio::test]
async fn background_listeners_apply_user_updates() {
    let dir = tempfile::tempdir().unwrap();
    let pool = file_pool(&dir, "authoring.db");
    let bus = InMemoryBus::new();
    let stats = Arc::new(ListenerStats::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tasks = Vec::new();
    for handler in replica_handlers(&pool, isle_types::COURSE_AUTHORING_SERVICE) {
        // Subscribe up front so nothing published below is missed.
        bus.subscribe(handler.subjects(), handler.queue_group())
            .await
            .unwrap();
        tasks.push(tokio::spawn(run_listener(
            Arc::new(bus.clone()) as Arc<dyn MessageBus>,
            handler,
            Arc::new(SqliteDeadLetterStore::new(pool.clone())),
            ListenerConfig::default(),
            stats.clone(),
            shutdown_rx.clone(),
        )));
    }

    let user = |status| UserPayload {
        id: "student-1".to_string(),
        role: UserRole::Student,
        status,
    };
    bus.publish(&Envelope::new(EventPayload::UserCreated(user(UserStatus::Active))))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while stats.snapshot().applied < 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("user:created should be applied");

    bus.publish(&Envelope::new(EventPayload::UserUpdated(user(UserStatus::Suspended))))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while stats.snapshot().applied < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("user:updated should be applied");

    let stored = store::get_user(&pool.get().unwrap(), "student-1").unwrap().unwrap();
    assert_eq!(stored.status, UserStatus::Suspended);

    shutdown_tx.send(true).unwrap();
    for task in tasks {
        task.await.unwrap().unwrap();
    }
}

/// Fails the first `prerequisites:deleted` it sees, then delegates.
struct FailFirstDelete {
    inner: Arc<dyn EventHandler>,
    failed: AtomicBool,
}

#[async_trait]
impl EventHandler for FailFirstDelete {
    fn subjects(&self) -> &[Subject] {
        self.inner.subjects()
    }

    fn queue_group(&self) -> &str {
        self.inner.queue_group()
    }

    async fn handle(&self, envelope: &Envelope) -> Result<HandleOutcome, HandlerError> {
        if envelope.subject() == Subject::PrerequisitesDeleted
            && !self.failed.swap(true, Ordering::SeqCst)
        {
            return Err(HandlerError::Transient("database is locked".to_string()));
        }
        self.inner.handle(envelope).await
    }
}

/// The owner service and a replica driven by background listeners, as
/// wired in production.
struct Live {
    _dir: tempfile::TempDir,
    owner: IslandService,
    owner_pool: DbPool,
    replica_pool: DbPool,
    bus: InMemoryBus,
    shutdown: watch::Sender<bool>,
    tasks: Vec<tokio::task::JoinHandle<Result<(), isle_bus::BusError>>>,
}

impl Live {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let bus = InMemoryBus::new();
        let owner_pool = file_pool(&dir, "authoring.db");
        let owner = IslandService::new(
            owner_pool.clone(),
            Publisher::new(Arc::new(bus.clone())),
            DeliveryMode::Direct,
        );
        let (shutdown, _) = watch::channel(false);
        Self {
            replica_pool: file_pool(&dir, "storefront.db"),
            _dir: dir,
            owner,
            owner_pool,
            bus,
            shutdown,
            tasks: Vec::new(),
        }
    }

    fn is_edge_handler(handler: &Arc<dyn EventHandler>) -> bool {
        handler.subjects().contains(&Subject::PrerequisitesDeleted)
    }

    /// Joins every replica queue group so messages accumulate from now on.
    async fn join_groups(&self) {
        for handler in replica_handlers(&self.replica_pool, SERVICE) {
            drop(
                self.bus
                    .subscribe(handler.subjects(), handler.queue_group())
                    .await
                    .unwrap(),
            );
        }
    }

    fn start(&mut self, handler: Arc<dyn EventHandler>, stats: Arc<ListenerStats>) {
        self.tasks.push(tokio::spawn(run_listener(
            Arc::new(self.bus.clone()) as Arc<dyn MessageBus>,
            handler,
            Arc::new(SqliteDeadLetterStore::new(self.replica_pool.clone())),
            ListenerConfig::default(),
            stats,
            self.shutdown.subscribe(),
        )));
    }

    async fn wait_for(&self, what: &str, entity: Entity, ids: &[&str]) {
        let pool = self.replica_pool.clone();
        let ids: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        tokio::time::timeout(Duration::from_secs(5), async move {
            loop {
                let conn = pool.get().unwrap();
                if ids
                    .iter()
                    .all(|id| store::exists(&conn, entity, id).unwrap())
                {
                    return;
                }
                drop(conn);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{what} should replicate"));
    }

    async fn course_with_islands(&self, names: &[&str]) -> (String, Vec<String>) {
        let course = self
            .owner
            .create_course(
                OWNER,
                NewCourse {
                    name: "Rust".to_string(),
                    description: String::new(),
                },
            )
            .await
            .unwrap();
        self.wait_for("course", Entity::Course, &[&course.course_id])
            .await;

        let mut islands = Vec::new();
        for name in names {
            let island = self
                .owner
                .create_island(
                    &course.course_id,
                    OWNER,
                    NewIsland {
                        name: name.to_string(),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            islands.push(island.island_id);
        }
        let ids: Vec<&str> = islands.iter().map(String::as_str).collect();
        self.wait_for("islands", Entity::Island, &ids).await;

        (course.course_id, islands)
    }

    async fn set_prerequisites(&self, course_id: &str, island: &str, prerequisites: &[&String]) {
        self.owner
            .update_island(UpdateIslandRequest {
                course_id: course_id.to_string(),
                island_id: island.to_string(),
                actor_id: OWNER.to_string(),
                fields: UpdateIslandParams::default(),
                prerequisite_island_ids: Some(
                    prerequisites.iter().map(|id| id.to_string()).collect(),
                ),
            })
            .await
            .unwrap();
    }

    fn edge_events_published(&self) -> u64 {
        self.bus
            .published()
            .iter()
            .filter(|envelope| Subject::PREREQUISITE_EDGES.contains(&envelope.subject()))
            .count() as u64
    }

    async fn wait_for_edges(&self, stats: &ListenerStats) {
        let expected = self.edge_events_published();
        tokio::time::timeout(Duration::from_secs(5), async {
            while stats.snapshot().applied < expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("edge events should be applied");
    }

    fn owner_edges(&self, island: &str) -> Vec<String> {
        let conn = self.owner_pool.get().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT prerequisite_island_id FROM island_prerequisites
                 WHERE island_id = ?1 ORDER BY prerequisite_island_id",
            )
            .unwrap();
        stmt.query_map([island], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<String>, _>>()
            .unwrap()
    }

    fn replica_edges(&self, island: &str) -> Vec<String> {
        store::list_prerequisites(&self.replica_pool.get().unwrap(), island).unwrap()
    }

    async fn stop(self) {
        self.shutdown.send(true).unwrap();
        for task in self.tasks {
            task.await.unwrap().unwrap();
        }
    }
}

#[tokio::test]
async fn late_edge_listener_converges_on_owner_edges() {
    let mut live = Live::new();
    live.join_groups().await;

    let mut edge_handler = None;
    for handler in replica_handlers(&live.replica_pool, SERVICE) {
        if Live::is_edge_handler(&handler) {
            edge_handler = Some(handler);
        } else {
            live.start(handler, Arc::new(ListenerStats::default()));
        }
    }

    let (course, islands) = live.course_with_islands(&["A", "B", "D"]).await;
    let (a, b, d) = (&islands[0], &islands[1], &islands[2]);
    live.set_prerequisites(&course, d, &[a, b]).await;
    live.set_prerequisites(&course, d, &[b]).await;
    assert!(live.replica_edges(d).is_empty());

    // The edge listener comes up only now, with both replacements queued.
    let edge_stats = Arc::new(ListenerStats::default());
    live.start(edge_handler.unwrap(), edge_stats.clone());
    live.wait_for_edges(&edge_stats).await;

    assert_eq!(live.owner_edges(d), vec![b.clone()]);
    assert_eq!(live.replica_edges(d), live.owner_edges(d));
    live.stop().await;
}

#[tokio::test]
async fn failed_delete_marker_holds_back_the_new_edges() {
    let mut live = Live::new();
    live.join_groups().await;

    let edge_stats = Arc::new(ListenerStats::default());
    for handler in replica_handlers(&live.replica_pool, SERVICE) {
        if Live::is_edge_handler(&handler) {
            let flaky = Arc::new(FailFirstDelete {
                inner: handler,
                failed: AtomicBool::new(false),
            });
            live.start(flaky, edge_stats.clone());
        } else {
            live.start(handler, Arc::new(ListenerStats::default()));
        }
    }

    let (course, islands) = live.course_with_islands(&["A", "B", "D"]).await;
    let (a, b, d) = (&islands[0], &islands[1], &islands[2]);
    live.set_prerequisites(&course, d, &[a, b]).await;
    live.wait_for_edges(&edge_stats).await;

    let mut expected = vec![a.clone(), b.clone()];
    expected.sort();
    assert_eq!(live.replica_edges(d), expected);
    assert_eq!(edge_stats.snapshot().failed, 1);
    assert_eq!(live.replica_edges(d), live.owner_edges(d));
    live.stop().await;
}
