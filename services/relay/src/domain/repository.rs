#![allow(async_fn_in_trait)]

use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use tracelink_domain::id::OutboxEventId;

use crate::domain::types::{
    ClaimRequest, OutboxEvent, OutboxHealth, ProjectScope, StreamEntry, StreamEntryId,
    StreamMessage,
};
use crate::error::RelayError;

/// Poller-side access to the outbox table.
///
/// Status mutations are conditional on the claim token, so an instance whose
/// lease expired can never overwrite the outcome of the instance that took the
/// row over.
pub trait OutboxStore: Send + Sync {
    /// Claim up to `batch_size` PENDING rows, oldest first, stamping them with
    /// `claim.token` until `claim.lease_until`. Rows whose aggregate has an
    /// earlier row in flight or awaiting retry are skipped.
    async fn claim_pending(&self, claim: &ClaimRequest) -> Result<Vec<OutboxEvent>, RelayError>;

    /// PENDING → PUBLISHED. Returns `false` if the claim was lost.
    async fn mark_published(
        &self,
        id: OutboxEventId,
        claim_token: Uuid,
        published_at: DateTime<Utc>,
    ) -> Result<bool, RelayError>;

    /// PENDING → FAILED, incrementing `retry_count` and recording `error`.
    /// Returns the new retry count, or `None` if the claim was lost.
    async fn mark_failed(
        &self,
        id: OutboxEventId,
        claim_token: Uuid,
        error: &str,
    ) -> Result<Option<u32>, RelayError>;

    /// Drop a claim without changing the row's status.
    async fn release_claim(&self, id: OutboxEventId, claim_token: Uuid)
    -> Result<bool, RelayError>;

    /// FAILED → PENDING for every row below `max_retries`. Returns the count.
    async fn requeue_failed(&self, max_retries: u32) -> Result<u64, RelayError>;

    async fn health(
        &self,
        scope: ProjectScope,
        now: DateTime<Utc>,
        lag_threshold: Duration,
        max_retries: u32,
    ) -> Result<OutboxHealth, RelayError>;

    /// Dead-lettered rows, oldest first.
    async fn list_dead_letters(
        &self,
        scope: ProjectScope,
        max_retries: u32,
        limit: u64,
    ) -> Result<Vec<OutboxEvent>, RelayError>;

    async fn find(&self, id: OutboxEventId) -> Result<Option<OutboxEvent>, RelayError>;

    /// Operator requeue of a dead letter: FAILED → PENDING with the retry
    /// budget restored. Returns `false` if the row was not dead-lettered.
    async fn requeue_dead_letter(
        &self,
        id: OutboxEventId,
        max_retries: u32,
    ) -> Result<bool, RelayError>;

    /// Delete PUBLISHED rows of `scope` published before `cutoff`.
    async fn purge_published_before(
        &self,
        scope: ProjectScope,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, RelayError>;
}

/// Append-only access to the durable event stream.
pub trait StreamPublisher: Send + Sync {
    async fn publish(&self, entry: &StreamEntry) -> Result<StreamEntryId, RelayError>;
}

/// One member of a consumer group.
pub trait ConsumerGroupStream: Send + Sync {
    /// Entries never delivered to this group.
    async fn read_new(&self, count: usize, block: Duration)
    -> Result<Vec<StreamMessage>, RelayError>;

    /// Take over entries another member left unacknowledged for `min_idle`.
    async fn reclaim_stale(
        &self,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamMessage>, RelayError>;

    async fn ack(&self, ids: &[StreamEntryId]) -> Result<u64, RelayError>;
}

/// Downstream projection (graph store, audit trail, search index).
///
/// Implementations must be idempotent: the same entry may be delivered more
/// than once, so writes are keyed on `entry.outbox_id`.
pub trait Projector: Send + Sync {
    fn name(&self) -> &str;

    async fn project(&self, entry: &StreamEntry) -> anyhow::Result<()>;
}
