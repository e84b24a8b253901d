use std::time::Duration;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Alias, Expr, Query, SelectStatement};
use sea_orm::{
    ColumnTrait, Condition, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, Select, TransactionTrait,
};
use uuid::Uuid;

use tracelink_domain::id::{OutboxEventId, ProjectId};
use tracelink_domain::outbox::OutboxStatus;
use tracelink_relay_schema::outbox_events::{self, Column};

use crate::domain::repository::OutboxStore;
use crate::domain::types::{ClaimRequest, OutboxEvent, OutboxHealth, ProjectScope};
use crate::error::RelayError;

/// Longest diagnostic kept in `last_error`.
const MAX_ERROR_LEN: usize = 2_000;

// ── Outbox store ──────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct SeaOrmOutboxStore {
    pub db: DatabaseConnection,
}

impl OutboxStore for SeaOrmOutboxStore {
    async fn claim_pending(&self, claim: &ClaimRequest) -> Result<Vec<OutboxEvent>, RelayError> {
        let txn = self.db.begin().await.context("begin outbox claim")?;

        // Aggregates with an earlier row still in flight or awaiting retry are
        // filtered before the LIMIT so they cannot starve the rest of the batch.
        let eligible: Vec<Uuid> = outbox_events::Entity::find()
            .filter(Column::Status.eq(OutboxStatus::Pending.as_str()))
            .filter(unclaimed_at(claim.now))
            .filter(Expr::exists(aggregate_blocker(claim)).not())
            .order_by_asc(Column::CreatedAt)
            .order_by_asc(Column::Id)
            .limit(claim.batch_size)
            .all(&txn)
            .await
            .context("select claim candidates")?
            .into_iter()
            .map(|m| m.id)
            .collect();
        if eligible.is_empty() {
            txn.commit().await.context("commit empty outbox claim")?;
            return Ok(vec![]);
        }

        // Re-check status and claim in the UPDATE itself: a concurrent poller
        // may have claimed some of these rows since the SELECT.
        outbox_events::Entity::update_many()
            .col_expr(Column::ClaimToken, Expr::value(claim.token))
            .col_expr(Column::ClaimedUntil, Expr::value(claim.lease_until))
            .filter(Column::Id.is_in(eligible))
            .filter(Column::Status.eq(OutboxStatus::Pending.as_str()))
            .filter(unclaimed_at(claim.now))
            .exec(&txn)
            .await
            .context("claim outbox events")?;

        let claimed = outbox_events::Entity::find()
            .filter(Column::ClaimToken.eq(claim.token))
            .order_by_asc(Column::CreatedAt)
            .order_by_asc(Column::Id)
            .all(&txn)
            .await
            .context("load claimed outbox events")?;
        txn.commit().await.context("commit outbox claim")?;

        claimed
            .into_iter()
            .map(|m| event_from_model(m).map_err(RelayError::from))
            .collect()
    }

    async fn mark_published(
        &self,
        id: OutboxEventId,
        claim_token: Uuid,
        published_at: DateTime<Utc>,
    ) -> Result<bool, RelayError> {
        let result = outbox_events::Entity::update_many()
            .col_expr(Column::Status, Expr::value(OutboxStatus::Published.as_str()))
            .col_expr(Column::PublishedAt, Expr::value(published_at))
            .col_expr(Column::ClaimToken, Expr::value(Option::<Uuid>::None))
            .col_expr(
                Column::ClaimedUntil,
                Expr::value(Option::<DateTime<Utc>>::None),
            )
            .filter(Column::Id.eq(id.0))
            .filter(Column::ClaimToken.eq(claim_token))
            .filter(Column::Status.eq(OutboxStatus::Pending.as_str()))
            .exec(&self.db)
            .await
            .context("mark outbox event published")?;
        Ok(result.rows_affected == 1)
    }

    async fn mark_failed(
        &self,
        id: OutboxEventId,
        claim_token: Uuid,
        error: &str,
    ) -> Result<Option<u32>, RelayError> {
        let txn = self.db.begin().await.context("begin mark failed")?;
        let result = outbox_events::Entity::update_many()
            .col_expr(Column::Status, Expr::value(OutboxStatus::Failed.as_str()))
            .col_expr(Column::RetryCount, Expr::col(Column::RetryCount).add(1))
            .col_expr(Column::LastError, Expr::value(truncate_error(error)))
            .col_expr(Column::ClaimToken, Expr::value(Option::<Uuid>::None))
            .col_expr(
                Column::ClaimedUntil,
                Expr::value(Option::<DateTime<Utc>>::None),
            )
            .filter(Column::Id.eq(id.0))
            .filter(Column::ClaimToken.eq(claim_token))
            .filter(Column::Status.eq(OutboxStatus::Pending.as_str()))
            .exec(&txn)
            .await
            .context("mark outbox event failed")?;
        if result.rows_affected == 0 {
            txn.commit().await.context("commit mark failed")?;
            return Ok(None);
        }

        let model = outbox_events::Entity::find_by_id(id.0)
            .one(&txn)
            .await
            .context("reload failed outbox event")?
            .context("failed outbox event disappeared")?;
        txn.commit().await.context("commit mark failed")?;
        Ok(Some(retry_count_from(model.retry_count)))
    }

    async fn release_claim(
        &self,
        id: OutboxEventId,
        claim_token: Uuid,
    ) -> Result<bool, RelayError> {
        let result = outbox_events::Entity::update_many()
            .col_expr(Column::ClaimToken, Expr::value(Option::<Uuid>::None))
            .col_expr(
                Column::ClaimedUntil,
                Expr::value(Option::<DateTime<Utc>>::None),
            )
            .filter(Column::Id.eq(id.0))
            .filter(Column::ClaimToken.eq(claim_token))
            .exec(&self.db)
            .await
            .context("release outbox claim")?;
        Ok(result.rows_affected == 1)
    }

    async fn requeue_failed(&self, max_retries: u32) -> Result<u64, RelayError> {
        let result = outbox_events::Entity::update_many()
            .col_expr(Column::Status, Expr::value(OutboxStatus::Pending.as_str()))
            .filter(retryable(max_retries))
            .exec(&self.db)
            .await
            .context("requeue failed outbox events")?;
        Ok(result.rows_affected)
    }

    async fn health(
        &self,
        scope: ProjectScope,
        now: DateTime<Utc>,
        lag_threshold: Duration,
        max_retries: u32,
    ) -> Result<OutboxHealth, RelayError> {
        let lag_cutoff = now
            - chrono::Duration::from_std(lag_threshold).context("lag threshold out of range")?;

        let pending = scoped(scope)
            .filter(Column::Status.eq(OutboxStatus::Pending.as_str()))
            .count(&self.db)
            .await
            .context("count pending outbox events")?;
        let lagging = scoped(scope)
            .filter(Column::Status.eq(OutboxStatus::Pending.as_str()))
            .filter(Column::CreatedAt.lt(lag_cutoff))
            .count(&self.db)
            .await
            .context("count lagging outbox events")?;
        let in_flight = scoped(scope)
            .filter(Column::Status.eq(OutboxStatus::Pending.as_str()))
            .filter(Column::ClaimedUntil.gte(now))
            .count(&self.db)
            .await
            .context("count in-flight outbox events")?;
        let failed_retryable = scoped(scope)
            .filter(retryable(max_retries))
            .count(&self.db)
            .await
            .context("count retryable outbox events")?;
        let dead_lettered = scoped(scope)
            .filter(dead_lettered(max_retries))
            .count(&self.db)
            .await
            .context("count dead-lettered outbox events")?;
        let oldest_pending_at = scoped(scope)
            .filter(Column::Status.eq(OutboxStatus::Pending.as_str()))
            .order_by_asc(Column::CreatedAt)
            .one(&self.db)
            .await
            .context("find oldest pending outbox event")?
            .map(|m| m.created_at);

        Ok(OutboxHealth {
            pending,
            lagging,
            in_flight,
            failed_retryable,
            dead_lettered,
            oldest_pending_at,
        })
    }

    async fn list_dead_letters(
        &self,
        scope: ProjectScope,
        max_retries: u32,
        limit: u64,
    ) -> Result<Vec<OutboxEvent>, RelayError> {
        let models = scoped(scope)
            .filter(dead_lettered(max_retries))
            .order_by_asc(Column::CreatedAt)
            .order_by_asc(Column::Id)
            .limit(limit)
            .all(&self.db)
            .await
            .context("list dead-lettered outbox events")?;
        models
            .into_iter()
            .map(|m| event_from_model(m).map_err(RelayError::from))
            .collect()
    }

    async fn find(&self, id: OutboxEventId) -> Result<Option<OutboxEvent>, RelayError> {
        let model = outbox_events::Entity::find_by_id(id.0)
            .one(&self.db)
            .await
            .context("find outbox event")?;
        Ok(model.map(event_from_model).transpose()?)
    }

    async fn requeue_dead_letter(
        &self,
        id: OutboxEventId,
        max_retries: u32,
    ) -> Result<bool, RelayError> {
        let result = outbox_events::Entity::update_many()
            .col_expr(Column::Status, Expr::value(OutboxStatus::Pending.as_str()))
            .col_expr(Column::RetryCount, Expr::value(0))
            .filter(Column::Id.eq(id.0))
            .filter(dead_lettered(max_retries))
            .exec(&self.db)
            .await
            .context("requeue dead-lettered outbox event")?;
        Ok(result.rows_affected == 1)
    }

    async fn purge_published_before(
        &self,
        scope: ProjectScope,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, RelayError> {
        let mut delete = outbox_events::Entity::delete_many();
        if let Some(ProjectId(project_id)) = scope.project_id {
            delete = delete.filter(Column::ProjectId.eq(project_id));
        }
        let result = delete
            .filter(Column::Status.eq(OutboxStatus::Published.as_str()))
            .filter(Column::PublishedAt.lt(cutoff))
            .exec(&self.db)
            .await
            .context("purge published outbox events")?;
        Ok(result.rows_affected)
    }
}

fn unclaimed_at(now: DateTime<Utc>) -> Condition {
    Condition::any()
        .add(Column::ClaimedUntil.is_null())
        .add(Column::ClaimedUntil.lt(now))
}

/// Rows that hold back later rows of the candidate's aggregate: a retryable
/// failure or a live claim.
fn aggregate_blocker(claim: &ClaimRequest) -> SelectStatement {
    let blocker = Alias::new("blocker");
    let col = |c: Column| Expr::col((blocker.clone(), c));
    Query::select()
        .expr(Expr::val(1))
        .from_as(outbox_events::Entity, blocker.clone())
        .and_where(
            col(Column::AggregateType)
                .equals((outbox_events::Entity, Column::AggregateType)),
        )
        .and_where(col(Column::AggregateId).equals((outbox_events::Entity, Column::AggregateId)))
        .cond_where(
            Condition::any()
                .add(
                    Condition::all()
                        .add(col(Column::Status).eq(OutboxStatus::Failed.as_str()))
                        .add(col(Column::RetryCount).lt(ceiling(claim.max_retries))),
                )
                .add(
                    Condition::all()
                        .add(col(Column::Status).eq(OutboxStatus::Pending.as_str()))
                        .add(col(Column::ClaimedUntil).gte(claim.now)),
                ),
        )
        .to_owned()
}

/// FAILED rows the sweep will still retry.
fn retryable(max_retries: u32) -> Condition {
    Condition::all()
        .add(Column::Status.eq(OutboxStatus::Failed.as_str()))
        .add(Column::RetryCount.lt(ceiling(max_retries)))
}

/// FAILED rows whose retry budget is spent.
fn dead_lettered(max_retries: u32) -> Condition {
    Condition::all()
        .add(Column::Status.eq(OutboxStatus::Failed.as_str()))
        .add(Column::RetryCount.gte(ceiling(max_retries)))
}

fn scoped(scope: ProjectScope) -> Select<outbox_events::Entity> {
    let query = outbox_events::Entity::find();
    match scope.project_id {
        Some(ProjectId(project_id)) => query.filter(Column::ProjectId.eq(project_id)),
        None => query,
    }
}

fn ceiling(max_retries: u32) -> i32 {
    i32::try_from(max_retries).unwrap_or(i32::MAX)
}

fn retry_count_from(stored: i32) -> u32 {
    u32::try_from(stored).unwrap_or(0)
}

fn truncate_error(error: &str) -> String {
    match error.char_indices().nth(MAX_ERROR_LEN) {
        Some((cut, _)) => error[..cut].to_owned(),
        None => error.to_owned(),
    }
}

pub(crate) fn event_from_model(model: outbox_events::Model) -> anyhow::Result<OutboxEvent> {
    let status: OutboxStatus = model
        .status
        .parse()
        .with_context(|| format!("outbox event {} has invalid status", model.id))?;
    Ok(OutboxEvent {
        id: OutboxEventId(model.id),
        event_type: model.event_type,
        aggregate_type: model.aggregate_type,
        aggregate_id: model.aggregate_id,
        project_id: ProjectId(model.project_id),
        payload: model.payload,
        status,
        retry_count: retry_count_from(model.retry_count),
        last_error: model.last_error,
        idempotency_key: model.idempotency_key,
        created_at: model.created_at,
        published_at: model.published_at,
    })
}
