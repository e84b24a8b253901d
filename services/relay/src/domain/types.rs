use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use tracelink_core::serde::{format_rfc3339_ms, to_rfc3339_ms, to_rfc3339_ms_opt};
use tracelink_domain::event::{AggregateType, EventType};
use tracelink_domain::id::{OutboxEventId, ProjectId};
use tracelink_domain::outbox::{OutboxStatus, is_retryable};

/// Event to append to the outbox inside a business transaction.
#[derive(Debug, Clone)]
pub struct NewOutboxEvent {
    pub event_type: EventType,
    pub aggregate_type: AggregateType,
    pub aggregate_id: String,
    pub project_id: ProjectId,
    pub payload: serde_json::Value,
    pub idempotency_key: Option<String>,
}

impl NewOutboxEvent {
    /// The aggregate type is derived from the event tag.
    pub fn new(
        event_type: EventType,
        aggregate_id: impl Into<String>,
        project_id: ProjectId,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_type,
            aggregate_type: event_type.aggregate_type(),
            aggregate_id: aggregate_id.into(),
            project_id,
            payload,
            idempotency_key: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Result of an outbox append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted(OutboxEventId),
    /// A row with the same idempotency key already exists; nothing was written.
    Duplicate(OutboxEventId),
}

impl AppendOutcome {
    pub fn id(self) -> OutboxEventId {
        match self {
            Self::Inserted(id) | Self::Duplicate(id) => id,
        }
    }
}

/// Outbox row as seen by the relay.
///
/// Type tags are carried as stored strings: the relay forwards them without
/// interpreting them, so a tag written by a newer writer never wedges the poller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboxEvent {
    pub id: OutboxEventId,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub project_id: ProjectId,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub idempotency_key: Option<String>,
    #[serde(serialize_with = "to_rfc3339_ms")]
    pub created_at: DateTime<Utc>,
    #[serde(serialize_with = "to_rfc3339_ms_opt")]
    pub published_at: Option<DateTime<Utc>>,
}

impl OutboxEvent {
    pub fn aggregate_key(&self) -> AggregateKey {
        AggregateKey {
            aggregate_type: self.aggregate_type.clone(),
            aggregate_id: self.aggregate_id.clone(),
        }
    }

    pub fn is_dead_lettered(&self, max_retries: u32) -> bool {
        self.status == OutboxStatus::Failed && !is_retryable(self.retry_count, max_retries)
    }

    pub fn to_stream_entry(&self) -> StreamEntry {
        StreamEntry {
            outbox_id: self.id,
            event_type: self.event_type.clone(),
            aggregate_type: self.aggregate_type.clone(),
            aggregate_id: self.aggregate_id.clone(),
            project_id: self.project_id,
            payload: self.payload.clone(),
            created_at: self.created_at,
        }
    }
}

/// Ordering unit: events of one aggregate are published in creation order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AggregateKey {
    pub aggregate_type: String,
    pub aggregate_id: String,
}

/// Parameters of one poller claim.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub token: Uuid,
    pub batch_size: u64,
    pub now: DateTime<Utc>,
    pub lease_until: DateTime<Utc>,
    /// Retryable FAILED rows hold back later rows of their aggregate.
    pub max_retries: u32,
}

/// Filter for operator queries.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProjectScope {
    pub project_id: Option<ProjectId>,
}

/// Operator-facing outbox health signals.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboxHealth {
    pub pending: u64,
    /// PENDING rows older than the lag threshold.
    pub lagging: u64,
    pub in_flight: u64,
    /// FAILED rows the sweep will retry.
    pub failed_retryable: u64,
    /// FAILED rows at or above the retry ceiling. Needs operator attention.
    pub dead_lettered: u64,
    #[serde(serialize_with = "to_rfc3339_ms_opt")]
    pub oldest_pending_at: Option<DateTime<Utc>>,
}

impl OutboxHealth {
    pub fn is_healthy(&self) -> bool {
        self.lagging == 0 && self.dead_lettered == 0
    }
}

/// Stream entry id (`<ms>-<seq>`). Orders numerically, not lexically.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamEntryId(pub String);

impl StreamEntryId {
    fn parts(&self) -> (u64, u64) {
        let (ms, seq) = self.0.split_once('-').unwrap_or((self.0.as_str(), "0"));
        (ms.parse().unwrap_or(0), seq.parse().unwrap_or(0))
    }
}

impl Ord for StreamEntryId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.parts().cmp(&other.parts())
    }
}

impl PartialOrd for StreamEntryId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for StreamEntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub mod fields {
    pub const OUTBOX_ID: &str = "outbox_id";
    pub const EVENT_TYPE: &str = "event_type";
    pub const AGGREGATE_TYPE: &str = "aggregate_type";
    pub const AGGREGATE_ID: &str = "aggregate_id";
    pub const PROJECT_ID: &str = "project_id";
    pub const PAYLOAD: &str = "payload";
    pub const CREATED_AT: &str = "created_at";
}

/// Entry appended to the event stream for one outbox row. Carries everything
/// a consumer needs to deduplicate and correlate without reading the outbox.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub outbox_id: OutboxEventId,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub project_id: ProjectId,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl StreamEntry {
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            (fields::OUTBOX_ID, self.outbox_id.to_string()),
            (fields::EVENT_TYPE, self.event_type.clone()),
            (fields::AGGREGATE_TYPE, self.aggregate_type.clone()),
            (fields::AGGREGATE_ID, self.aggregate_id.clone()),
            (fields::PROJECT_ID, self.project_id.to_string()),
            (fields::PAYLOAD, self.payload.to_string()),
            (fields::CREATED_AT, format_rfc3339_ms(&self.created_at)),
        ]
    }

    pub fn from_fields(map: &HashMap<String, String>) -> Result<Self, EntryDecodeError> {
        let get = |name: &'static str| {
            map.get(name)
                .map(String::as_str)
                .ok_or(EntryDecodeError::MissingField(name))
        };
        fn invalid<E>(name: &'static str) -> impl FnOnce(E) -> EntryDecodeError {
            move |_| EntryDecodeError::InvalidField(name)
        }

        Ok(Self {
            outbox_id: get(fields::OUTBOX_ID)?
                .parse()
                .map_err(invalid(fields::OUTBOX_ID))?,
            event_type: get(fields::EVENT_TYPE)?.to_owned(),
            aggregate_type: get(fields::AGGREGATE_TYPE)?.to_owned(),
            aggregate_id: get(fields::AGGREGATE_ID)?.to_owned(),
            project_id: get(fields::PROJECT_ID)?
                .parse()
                .map_err(invalid(fields::PROJECT_ID))?,
            payload: serde_json::from_str(get(fields::PAYLOAD)?)
                .map_err(invalid(fields::PAYLOAD))?,
            created_at: DateTime::parse_from_rfc3339(get(fields::CREATED_AT)?)
                .map_err(invalid(fields::CREATED_AT))?
                .with_timezone(&Utc),
        })
    }

    /// The tag parsed against the current taxonomy, if known.
    pub fn known_event_type(&self) -> Option<EventType> {
        self.event_type.parse().ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EntryDecodeError {
    #[error("missing stream field `{0}`")]
    MissingField(&'static str),
    #[error("invalid stream field `{0}`")]
    InvalidField(&'static str),
}

/// Raw entry as delivered to a consumer group member.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMessage {
    pub id: StreamEntryId,
    pub fields: HashMap<String, String>,
}
