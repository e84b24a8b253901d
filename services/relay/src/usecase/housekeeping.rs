use std::time::Duration;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::domain::repository::OutboxStore;
use crate::domain::types::ProjectScope;
use crate::error::RelayError;

// ── PurgePublished ───────────────────────────────────────────────────────────

/// Deletes PUBLISHED rows older than the retention window, for one project or,
/// with an unscoped filter, the whole deployment. PENDING and FAILED rows are
/// never touched.
pub struct PurgePublishedUseCase<S: OutboxStore> {
    pub store: S,
    pub retention: Duration,
}

impl<S: OutboxStore> PurgePublishedUseCase<S> {
    pub async fn execute(
        &self,
        scope: ProjectScope,
        now: DateTime<Utc>,
    ) -> Result<u64, RelayError> {
        let cutoff = now
            - chrono::Duration::from_std(self.retention).context("retention out of range")?;
        let purged = self.store.purge_published_before(scope, cutoff).await?;
        if purged > 0 {
            info!(purged, cutoff = %cutoff, "published outbox events purged");
        }
        Ok(purged)
    }
}
