use std::collections::HashSet;
use std::time::Duration;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tracelink_domain::outbox::is_retryable;

use crate::domain::repository::{OutboxStore, StreamPublisher};
use crate::domain::types::{AggregateKey, ClaimRequest, OutboxEvent, StreamEntryId};
use crate::error::RelayError;

// ── PollOutbox ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub batch_size: u64,
    pub publish_timeout: Duration,
    pub claim_ttl: Duration,
    pub max_retries: u32,
}

/// What one poll tick did with the rows it claimed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub claimed: usize,
    pub published: usize,
    pub failed: usize,
    /// Failures that exhausted the retry budget.
    pub dead_lettered: usize,
    /// Rows released unpublished to keep their aggregate in order or because
    /// the lease ran short. They are picked up again by a later tick.
    pub deferred: usize,
    /// Rows whose claim was taken over before the outcome could be recorded.
    pub lost: usize,
}

/// Claims a batch of PENDING rows and publishes them one by one, oldest first.
///
/// A failed publish stalls its aggregate for the rest of the tick: later rows
/// of that aggregate are released instead of published, so a consumer never
/// sees event N+1 before event N.
pub struct PollOutboxUseCase<S: OutboxStore, P: StreamPublisher> {
    pub store: S,
    pub publisher: P,
    pub settings: PollSettings,
}

impl<S: OutboxStore, P: StreamPublisher> PollOutboxUseCase<S, P> {
    pub async fn execute(&self) -> Result<TickReport, RelayError> {
        let now = Utc::now();
        let claim_ttl =
            chrono::Duration::from_std(self.settings.claim_ttl).context("claim ttl out of range")?;
        let publish_timeout = chrono::Duration::from_std(self.settings.publish_timeout)
            .context("publish timeout out of range")?;
        let claim = ClaimRequest {
            token: Uuid::now_v7(),
            batch_size: self.settings.batch_size,
            now,
            lease_until: now + claim_ttl,
            max_retries: self.settings.max_retries,
        };
        // No attempt may start unless it can finish inside the lease.
        let last_start = claim.lease_until - publish_timeout;

        let events = self.store.claim_pending(&claim).await?;
        let mut report = TickReport {
            claimed: events.len(),
            ..TickReport::default()
        };
        let mut stalled: HashSet<AggregateKey> = HashSet::new();

        for (i, event) in events.iter().enumerate() {
            if let Err(e) = self
                .handle(event, claim.token, last_start, &mut stalled, &mut report)
                .await
            {
                // Hand back what is left of the batch instead of holding it
                // until the lease runs out.
                self.release_all(&events[i..], claim.token).await;
                return Err(e);
            }
        }

        if report.claimed > 0 {
            info!(
                claimed = report.claimed,
                published = report.published,
                failed = report.failed,
                dead_lettered = report.dead_lettered,
                deferred = report.deferred,
                lost = report.lost,
                "outbox poll tick"
            );
        }
        Ok(report)
    }

    async fn handle(
        &self,
        event: &OutboxEvent,
        claim_token: Uuid,
        last_start: DateTime<Utc>,
        stalled: &mut HashSet<AggregateKey>,
        report: &mut TickReport,
    ) -> Result<(), RelayError> {
        let key = event.aggregate_key();
        if stalled.contains(&key) || Utc::now() >= last_start {
            stalled.insert(key);
            self.store.release_claim(event.id, claim_token).await?;
            report.deferred += 1;
            return Ok(());
        }

        match self.publish(event).await {
            Ok(entry_id) => {
                if self
                    .store
                    .mark_published(event.id, claim_token, Utc::now())
                    .await?
                {
                    debug!(outbox_id = %event.id, entry_id = %entry_id, event_type = %event.event_type, "outbox event published");
                    report.published += 1;
                } else {
                    // Another instance owns the row now and will publish it
                    // again; consumers deduplicate on outbox_id.
                    warn!(outbox_id = %event.id, "claim lost after publish");
                    report.lost += 1;
                }
            }
            Err(e) => {
                stalled.insert(key);
                self.record_failure(event, claim_token, &e, report).await?;
            }
        }
        Ok(())
    }

    async fn release_all(&self, events: &[OutboxEvent], claim_token: Uuid) {
        for event in events {
            if let Err(e) = self.store.release_claim(event.id, claim_token).await {
                warn!(outbox_id = %event.id, error = %e, "failed to release outbox claim");
            }
        }
    }

    async fn publish(&self, event: &OutboxEvent) -> Result<StreamEntryId, RelayError> {
        let entry = event.to_stream_entry();
        match timeout(self.settings.publish_timeout, self.publisher.publish(&entry)).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::Timeout(
                self.settings.publish_timeout.as_millis() as u64,
            )),
        }
    }

    async fn record_failure(
        &self,
        event: &OutboxEvent,
        claim_token: Uuid,
        cause: &RelayError,
        report: &mut TickReport,
    ) -> Result<(), RelayError> {
        let diagnostic = cause.diagnostic();
        match self
            .store
            .mark_failed(event.id, claim_token, &diagnostic)
            .await?
        {
            Some(retry_count) if !is_retryable(retry_count, self.settings.max_retries) => {
                error!(
                    outbox_id = %event.id,
                    event_type = %event.event_type,
                    aggregate_id = %event.aggregate_id,
                    retry_count,
                    error = %diagnostic,
                    "outbox event dead-lettered"
                );
                report.failed += 1;
                report.dead_lettered += 1;
            }
            Some(retry_count) => {
                warn!(
                    outbox_id = %event.id,
                    retry_count,
                    max_retries = self.settings.max_retries,
                    error = %diagnostic,
                    "outbox publish failed"
                );
                report.failed += 1;
            }
            None => {
                warn!(outbox_id = %event.id, error = %diagnostic, "claim lost before failure was recorded");
                report.lost += 1;
            }
        }
        Ok(())
    }
}
