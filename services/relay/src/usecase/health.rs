use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use tracelink_domain::id::OutboxEventId;

use crate::domain::repository::OutboxStore;
use crate::domain::types::{OutboxEvent, OutboxHealth, ProjectScope};
use crate::error::RelayError;

pub const DEFAULT_DEAD_LETTER_LIMIT: u64 = 50;
pub const MAX_DEAD_LETTER_LIMIT: u64 = 500;

// ── OutboxHealth ─────────────────────────────────────────────────────────────

pub struct OutboxHealthUseCase<S: OutboxStore> {
    pub store: S,
    pub lag_threshold: Duration,
    pub max_retries: u32,
}

impl<S: OutboxStore> OutboxHealthUseCase<S> {
    pub async fn execute(&self, scope: ProjectScope) -> Result<OutboxHealth, RelayError> {
        let health = self
            .store
            .health(scope, Utc::now(), self.lag_threshold, self.max_retries)
            .await?;
        if !health.is_healthy() {
            warn!(
                project_id = ?scope.project_id.map(|p| p.to_string()),
                lagging = health.lagging,
                dead_lettered = health.dead_lettered,
                "outbox unhealthy"
            );
        }
        Ok(health)
    }
}

// ── ListDeadLetters ──────────────────────────────────────────────────────────

pub struct ListDeadLettersUseCase<S: OutboxStore> {
    pub store: S,
    pub max_retries: u32,
}

impl<S: OutboxStore> ListDeadLettersUseCase<S> {
    pub async fn execute(
        &self,
        scope: ProjectScope,
        limit: Option<u64>,
    ) -> Result<Vec<OutboxEvent>, RelayError> {
        let limit = match limit {
            None => DEFAULT_DEAD_LETTER_LIMIT,
            Some(0) => {
                return Err(RelayError::InvalidRequest(
                    "limit must be at least 1".to_owned(),
                ));
            }
            Some(n) => n.min(MAX_DEAD_LETTER_LIMIT),
        };
        self.store
            .list_dead_letters(scope, self.max_retries, limit)
            .await
    }
}

// ── RequeueDeadLetter ────────────────────────────────────────────────────────

pub struct RequeueDeadLetterUseCase<S: OutboxStore> {
    pub store: S,
    pub max_retries: u32,
}

impl<S: OutboxStore> RequeueDeadLetterUseCase<S> {
    /// Returns the row as it stands after the requeue.
    pub async fn execute(&self, id: OutboxEventId) -> Result<OutboxEvent, RelayError> {
        if !self.store.requeue_dead_letter(id, self.max_retries).await? {
            return match self.store.find(id).await? {
                None => Err(RelayError::NotFound),
                Some(_) => Err(RelayError::NotDeadLettered),
            };
        }
        let event = self.store.find(id).await?.ok_or(RelayError::NotFound)?;
        info!(outbox_id = %id, event_type = %event.event_type, "dead-lettered outbox event requeued");
        Ok(event)
    }
}
