use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbBackend, DbErr, Statement,
    TransactionTrait,
};
use serde_json::json;
use uuid::Uuid;

use tracelink_domain::event::EventType;
use tracelink_domain::id::{OutboxEventId, ProjectId};
use tracelink_relay::domain::repository::{ConsumerGroupStream, Projector, StreamPublisher};
use tracelink_relay::domain::types::{
    AppendOutcome, NewOutboxEvent, StreamEntry, StreamEntryId, StreamMessage,
};
use tracelink_relay::error::RelayError;
use tracelink_relay::infra::db::SeaOrmOutboxStore;
use tracelink_relay::infra::writer::append;
use tracelink_relay::usecase::poll::{PollOutboxUseCase, PollSettings};
use tracelink_relay_migration::{Migrator, MigratorTrait};

pub const PROJECT: Uuid = Uuid::from_u128(0x0195_5d2c_7a00_7000_8000_0000_0000_00aa);

// ── Database ─────────────────────────────────────────────────────────────────

/// Fresh in-memory SQLite database with the outbox schema and a
/// `requirements` table standing in for the system of record.
pub async fn setup_db() -> DatabaseConnection {
    let mut options = ConnectOptions::new("sqlite::memory:");
    // One connection: every pooled connection would otherwise get its own empty database.
    options
        .max_connections(1)
        .min_connections(1)
        .sqlx_logging(false);
    let db = Database::connect(options).await.unwrap();
    Migrator::up(&db, None).await.unwrap();
    db.execute_unprepared(
        "CREATE TABLE requirements (id TEXT PRIMARY KEY, project_id TEXT NOT NULL, title TEXT NOT NULL)",
    )
    .await
    .unwrap();
    db
}

pub fn store(db: &DatabaseConnection) -> SeaOrmOutboxStore {
    SeaOrmOutboxStore { db: db.clone() }
}

pub async fn insert_requirement<C: ConnectionTrait>(
    conn: &C,
    id: &str,
    title: &str,
) -> Result<(), DbErr> {
    conn.execute(Statement::from_sql_and_values(
        DbBackend::Sqlite,
        "INSERT INTO requirements (id, project_id, title) VALUES (?, ?, ?)",
        [id.into(), PROJECT.to_string().into(), title.into()],
    ))
    .await?;
    Ok(())
}

pub async fn count(db: &DatabaseConnection, table: &str) -> i64 {
    let row = db
        .query_one(Statement::from_string(
            DbBackend::Sqlite,
            format!("SELECT COUNT(*) AS n FROM {table}"),
        ))
        .await
        .unwrap()
        .unwrap();
    row.try_get::<i64>("", "n").unwrap()
}

/// Business mutation plus its outbox event in one transaction.
pub async fn create_requirement(db: &DatabaseConnection, id: &str, title: &str) -> AppendOutcome {
    let id = id.to_owned();
    let title = title.to_owned();
    db.transaction::<_, AppendOutcome, DbErr>(|txn| {
        Box::pin(async move {
            insert_requirement(txn, &id, &title).await?;
            append(
                txn,
                &NewOutboxEvent::new(
                    EventType::RequirementCreated,
                    id.clone(),
                    ProjectId(PROJECT),
                    json!({ "title": title }),
                )
                .with_idempotency_key(format!("requirement_created:{id}")),
            )
            .await
        })
    })
    .await
    .unwrap()
}

pub async fn append_event(
    db: &DatabaseConnection,
    event_type: EventType,
    aggregate_id: &str,
) -> OutboxEventId {
    append(
        db,
        &NewOutboxEvent::new(
            event_type,
            aggregate_id,
            ProjectId(PROJECT),
            json!({ "aggregate": aggregate_id }),
        ),
    )
    .await
    .unwrap()
    .id()
}

pub fn poll_settings(max_retries: u32) -> PollSettings {
    PollSettings {
        batch_size: 100,
        publish_timeout: Duration::from_millis(200),
        claim_ttl: Duration::from_secs(30),
        max_retries,
    }
}

pub fn poller<P: StreamPublisher>(
    db: &DatabaseConnection,
    publisher: P,
    max_retries: u32,
) -> PollOutboxUseCase<SeaOrmOutboxStore, P> {
    PollOutboxUseCase {
        store: store(db),
        publisher,
        settings: poll_settings(max_retries),
    }
}

// ── MemoryStream ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct GroupState {
    /// Index of the next never-delivered entry.
    cursor: usize,
    /// Delivered, unacknowledged entries: id → (consumer, delivered at).
    pending: HashMap<String, (String, Instant)>,
}

#[derive(Default)]
struct StreamState {
    entries: Vec<(StreamEntryId, HashMap<String, String>)>,
    groups: HashMap<String, GroupState>,
}

/// In-process stand-in for the Redis stream with consumer-group semantics.
#[derive(Clone, Default)]
pub struct MemoryStream {
    state: Arc<Mutex<StreamState>>,
}

impl MemoryStream {
    pub fn entries(&self) -> Vec<StreamEntry> {
        let state = self.state.lock().unwrap();
        state
            .entries
            .iter()
            .map(|(_, fields)| StreamEntry::from_fields(fields).unwrap())
            .collect()
    }

    pub fn member(&self, group: &str, consumer: &str) -> MemoryGroupMember {
        MemoryGroupMember {
            state: Arc::clone(&self.state),
            group: group.to_owned(),
            consumer: consumer.to_owned(),
        }
    }

    pub fn pending_count(&self, group: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.groups.get(group).map_or(0, |g| g.pending.len())
    }
}

impl StreamPublisher for MemoryStream {
    async fn publish(&self, entry: &StreamEntry) -> Result<StreamEntryId, RelayError> {
        let mut state = self.state.lock().unwrap();
        let id = StreamEntryId(format!("{}-0", state.entries.len() + 1));
        let fields = entry
            .to_fields()
            .into_iter()
            .map(|(k, v)| (k.to_owned(), v))
            .collect();
        state.entries.push((id.clone(), fields));
        Ok(id)
    }
}

pub struct MemoryGroupMember {
    state: Arc<Mutex<StreamState>>,
    group: String,
    consumer: String,
}

impl ConsumerGroupStream for MemoryGroupMember {
    async fn read_new(
        &self,
        count: usize,
        _block: Duration,
    ) -> Result<Vec<StreamMessage>, RelayError> {
        let mut state = self.state.lock().unwrap();
        let StreamState { entries, groups } = &mut *state;
        let group = groups.entry(self.group.clone()).or_default();
        let end = (group.cursor + count).min(entries.len());
        let batch: Vec<StreamMessage> = entries[group.cursor..end]
            .iter()
            .map(|(id, fields)| StreamMessage {
                id: id.clone(),
                fields: fields.clone(),
            })
            .collect();
        for message in &batch {
            group
                .pending
                .insert(message.id.0.clone(), (self.consumer.clone(), Instant::now()));
        }
        group.cursor = end;
        Ok(batch)
    }

    async fn reclaim_stale(
        &self,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamMessage>, RelayError> {
        let mut state = self.state.lock().unwrap();
        let StreamState { entries, groups } = &mut *state;
        let group = groups.entry(self.group.clone()).or_default();
        let mut claimed = Vec::new();
        for (id, fields) in entries.iter() {
            if claimed.len() == count {
                break;
            }
            if let Some((owner, delivered)) = group.pending.get_mut(&id.0) {
                if delivered.elapsed() >= min_idle {
                    *owner = self.consumer.clone();
                    *delivered = Instant::now();
                    claimed.push(StreamMessage {
                        id: id.clone(),
                        fields: fields.clone(),
                    });
                }
            }
        }
        Ok(claimed)
    }

    async fn ack(&self, ids: &[StreamEntryId]) -> Result<u64, RelayError> {
        let mut state = self.state.lock().unwrap();
        let group = state.groups.entry(self.group.clone()).or_default();
        Ok(ids
            .iter()
            .filter(|id| group.pending.remove(&id.0).is_some())
            .count() as u64)
    }
}

// ── FlakyPublisher ───────────────────────────────────────────────────────────

/// Fails publishes for selected aggregates a set number of times, then
/// forwards to the wrapped stream.
#[derive(Clone, Default)]
pub struct FlakyPublisher {
    pub stream: MemoryStream,
    failures: Arc<Mutex<HashMap<String, usize>>>,
}

impl FlakyPublisher {
    pub fn fail(&self, aggregate_id: &str, times: usize) {
        self.failures
            .lock()
            .unwrap()
            .insert(aggregate_id.to_owned(), times);
    }

    pub fn heal(&self, aggregate_id: &str) {
        self.failures.lock().unwrap().remove(aggregate_id);
    }
}

impl StreamPublisher for FlakyPublisher {
    async fn publish(&self, entry: &StreamEntry) -> Result<StreamEntryId, RelayError> {
        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&entry.aggregate_id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(RelayError::Transport("connection reset by peer".to_owned()));
                }
            }
        }
        self.stream.publish(entry).await
    }
}

// ── SlowPublisher ────────────────────────────────────────────────────────────

/// Takes `delay` per publish before forwarding to the wrapped stream.
#[derive(Clone, Default)]
pub struct SlowPublisher {
    pub stream: MemoryStream,
    pub delay: Duration,
}

impl StreamPublisher for SlowPublisher {
    async fn publish(&self, entry: &StreamEntry) -> Result<StreamEntryId, RelayError> {
        tokio::time::sleep(self.delay).await;
        self.stream.publish(entry).await
    }
}

// ── DedupProjector ───────────────────────────────────────────────────────────

/// Projection keyed on outbox id: redelivered entries are acknowledged
/// without being applied twice.
#[derive(Clone, Default)]
pub struct DedupProjector {
    seen: Arc<Mutex<HashSet<OutboxEventId>>>,
    pub applied: Arc<Mutex<Vec<StreamEntry>>>,
    failing: Arc<Mutex<bool>>,
}

impl DedupProjector {
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    pub fn applied_ids(&self) -> Vec<OutboxEventId> {
        self.applied
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.outbox_id)
            .collect()
    }
}

impl Projector for DedupProjector {
    fn name(&self) -> &str {
        "lineage-projector"
    }

    async fn project(&self, entry: &StreamEntry) -> anyhow::Result<()> {
        if *self.failing.lock().unwrap() {
            anyhow::bail!("graph store unavailable");
        }
        if self.seen.lock().unwrap().insert(entry.outbox_id) {
            self.applied.lock().unwrap().push(entry.clone());
        }
        Ok(())
    }
}
