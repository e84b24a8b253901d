//! Background timer tasks: outbox poller, retry sweep, housekeeping purge.
//!
//! Each task ticks on its own `tokio::time::interval` and stops when the
//! shared `CancellationToken` fires. A tick in progress always runs to
//! completion, so shutdown never leaves a row half-processed beyond what the
//! claim lease already covers.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::domain::types::ProjectScope;
use crate::error::RelayError;
use crate::state::AppState;
use crate::usecase::housekeeping::PurgePublishedUseCase;
use crate::usecase::poll::{PollOutboxUseCase, PollSettings};
use crate::usecase::sweep::RetrySweepUseCase;

/// Run `tick` every `period` until `cancel` fires. Tick errors are logged and
/// the loop carries on; the next tick retries from the store's state.
pub async fn run_periodic<F, Fut, T>(
    name: &'static str,
    period: Duration,
    cancel: CancellationToken,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RelayError>>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(task = name, period_ms = period.as_millis() as u64, "background task started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        if let Err(e) = tick().await {
            error!(task = name, kind = e.kind(), error = %e.diagnostic(), "background tick failed");
        }
    }

    info!(task = name, "background task stopped");
}

pub fn poll_settings(state: &AppState) -> PollSettings {
    PollSettings {
        batch_size: state.config.batch_size,
        publish_timeout: state.config.publish_timeout(),
        claim_ttl: state.config.claim_ttl(),
        max_retries: state.config.max_retries,
    }
}

/// Spawn the relay's timer tasks onto a `JoinSet`. Await the set after
/// cancelling to drain in-flight ticks.
pub fn spawn_relay_tasks(state: &AppState, cancel: &CancellationToken) -> JoinSet<()> {
    let mut tasks = JoinSet::new();

    let poller = Arc::new(PollOutboxUseCase {
        store: state.outbox_store(),
        publisher: state.stream_publisher(),
        settings: poll_settings(state),
    });
    tasks.spawn(run_periodic(
        "outbox-poller",
        state.config.poll_interval(),
        cancel.clone(),
        move || {
            let poller = Arc::clone(&poller);
            async move { poller.execute().await }
        },
    ));

    let sweep = Arc::new(RetrySweepUseCase {
        store: state.outbox_store(),
        max_retries: state.config.max_retries,
    });
    tasks.spawn(run_periodic(
        "retry-sweep",
        state.config.sweep_interval(),
        cancel.clone(),
        move || {
            let sweep = Arc::clone(&sweep);
            async move { sweep.execute().await }
        },
    ));

    match state.config.published_retention() {
        Some(retention) => {
            let purge = Arc::new(PurgePublishedUseCase {
                store: state.outbox_store(),
                retention,
            });
            tasks.spawn(run_periodic(
                "housekeeping",
                state.config.housekeeping_interval(),
                cancel.clone(),
                move || {
                    let purge = Arc::clone(&purge);
                    async move { purge.execute(ProjectScope::default(), Utc::now()).await }
                },
            ));
        }
        None => info!("published outbox purge disabled"),
    }

    tasks
}
