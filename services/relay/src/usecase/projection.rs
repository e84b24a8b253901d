use std::collections::HashSet;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::domain::repository::{ConsumerGroupStream, Projector};
use crate::domain::types::{StreamEntry, StreamEntryId};
use crate::error::RelayError;

// ── Projection ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct ProjectionSettings {
    pub batch_size: usize,
    /// How long a read waits for new entries.
    pub block: Duration,
    /// Idle time after which another member's unacknowledged entries are taken over.
    pub min_idle: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProjectionReport {
    pub reclaimed: usize,
    pub delivered: usize,
    pub projected: usize,
    /// Left unacknowledged; redelivered after `min_idle`.
    pub failed: usize,
    /// Undecodable entries, acknowledged so they do not block the group.
    pub malformed: usize,
    pub acked: u64,
}

/// Drives one consumer-group member: take over stale entries, read new ones,
/// project each, acknowledge what succeeded.
///
/// Once an entry of an aggregate fails, later entries of the same aggregate in
/// the batch are left unacknowledged too, so they are reprojected after it.
pub struct ProjectionWorker<G: ConsumerGroupStream, P: Projector> {
    pub stream: G,
    pub projector: P,
    pub settings: ProjectionSettings,
}

impl<G: ConsumerGroupStream, P: Projector> ProjectionWorker<G, P> {
    pub async fn execute(&self) -> Result<ProjectionReport, RelayError> {
        let reclaimed = self
            .stream
            .reclaim_stale(self.settings.min_idle, self.settings.batch_size)
            .await?;
        let fresh = self
            .stream
            .read_new(self.settings.batch_size, self.settings.block)
            .await?;

        let mut report = ProjectionReport {
            reclaimed: reclaimed.len(),
            delivered: reclaimed.len() + fresh.len(),
            ..ProjectionReport::default()
        };
        let mut stalled: HashSet<(String, String)> = HashSet::new();
        let mut acks: Vec<StreamEntryId> = Vec::new();

        for message in reclaimed.into_iter().chain(fresh) {
            let entry = match StreamEntry::from_fields(&message.fields) {
                Ok(entry) => entry,
                Err(e) => {
                    error!(projector = self.projector.name(), entry_id = %message.id, error = %e, "malformed stream entry dropped");
                    report.malformed += 1;
                    acks.push(message.id);
                    continue;
                }
            };

            let key = (entry.aggregate_type.clone(), entry.aggregate_id.clone());
            if stalled.contains(&key) {
                report.failed += 1;
                continue;
            }

            match self.projector.project(&entry).await {
                Ok(()) => {
                    debug!(projector = self.projector.name(), outbox_id = %entry.outbox_id, entry_id = %message.id, "entry projected");
                    report.projected += 1;
                    acks.push(message.id);
                }
                Err(e) => {
                    warn!(
                        projector = self.projector.name(),
                        outbox_id = %entry.outbox_id,
                        event_type = %entry.event_type,
                        error = %format!("{e:#}"),
                        "projection failed; entry left pending"
                    );
                    report.failed += 1;
                    stalled.insert(key);
                }
            }
        }

        report.acked = self.stream.ack(&acks).await?;
        if report.delivered > 0 {
            info!(
                projector = self.projector.name(),
                reclaimed = report.reclaimed,
                projected = report.projected,
                failed = report.failed,
                malformed = report.malformed,
                "projection batch"
            );
        }
        Ok(report)
    }
}
