use tracing::{debug, info};

use crate::domain::repository::OutboxStore;
use crate::error::RelayError;

// ── RetrySweep ───────────────────────────────────────────────────────────────

/// Moves FAILED rows that still have retry budget back to PENDING.
///
/// Rows at or above `max_retries` stay FAILED; they are dead letters and only
/// an operator requeue brings them back.
pub struct RetrySweepUseCase<S: OutboxStore> {
    pub store: S,
    pub max_retries: u32,
}

impl<S: OutboxStore> RetrySweepUseCase<S> {
    pub async fn execute(&self) -> Result<u64, RelayError> {
        let requeued = self.store.requeue_failed(self.max_retries).await?;
        if requeued > 0 {
            info!(requeued, "failed outbox events requeued for retry");
        } else {
            debug!("retry sweep found nothing to requeue");
        }
        Ok(requeued)
    }
}
