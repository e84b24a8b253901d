//! Outbox writer: appends an event row on the caller's connection.
//!
//! Call it with the same `DatabaseTransaction` that writes the business rows.
//! The writer never commits or rolls back, so the event row lives and dies
//! with the mutation it describes.
//!
//! ```ignore
//! db.transaction::<_, (), DbErr>(|txn| {
//!     Box::pin(async move {
//!         insert_requirement(txn, &requirement).await?;
//!         writer::append(
//!             txn,
//!             &NewOutboxEvent::new(
//!                 EventType::RequirementCreated,
//!                 requirement.id.to_string(),
//!                 project_id,
//!                 json!({ "title": requirement.title }),
//!             )
//!             .with_idempotency_key(format!("requirement_created:{}", requirement.id)),
//!         )
//!         .await?;
//!         Ok(())
//!     })
//! })
//! .await?;
//! ```

use chrono::Utc;
use sea_orm::sea_query::OnConflict;
use sea_orm::{ActiveValue::Set, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, QueryFilter};
use tracing::debug;

use tracelink_domain::id::OutboxEventId;
use tracelink_domain::outbox::OutboxStatus;
use tracelink_relay_schema::outbox_events::{self, Column};

use crate::domain::types::{AppendOutcome, NewOutboxEvent};

/// Insert a PENDING outbox row, or return the existing row's id when
/// `idempotency_key` was already used.
///
/// Duplicates are resolved with `ON CONFLICT DO NOTHING` rather than by
/// catching a unique violation, because PostgreSQL aborts the surrounding
/// transaction on any constraint error.
pub async fn append<C>(conn: &C, event: &NewOutboxEvent) -> Result<AppendOutcome, DbErr>
where
    C: ConnectionTrait,
{
    let id = OutboxEventId::new();
    let row = outbox_events::ActiveModel {
        id: Set(id.0),
        event_type: Set(event.event_type.as_str().to_owned()),
        aggregate_type: Set(event.aggregate_type.as_str().to_owned()),
        aggregate_id: Set(event.aggregate_id.clone()),
        project_id: Set(event.project_id.0),
        payload: Set(event.payload.clone()),
        status: Set(OutboxStatus::Pending.as_str().to_owned()),
        retry_count: Set(0),
        last_error: Set(None),
        idempotency_key: Set(event.idempotency_key.clone()),
        created_at: Set(Utc::now()),
        published_at: Set(None),
        claim_token: Set(None),
        claimed_until: Set(None),
    };

    let Some(key) = event.idempotency_key.as_deref() else {
        outbox_events::Entity::insert(row)
            .exec_without_returning(conn)
            .await?;
        debug!(outbox_id = %id, event_type = %event.event_type, aggregate_id = %event.aggregate_id, "outbox event appended");
        return Ok(AppendOutcome::Inserted(id));
    };

    let inserted = outbox_events::Entity::insert(row)
        .on_conflict(
            OnConflict::column(Column::IdempotencyKey)
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(conn)
        .await?;
    if inserted > 0 {
        debug!(outbox_id = %id, event_type = %event.event_type, aggregate_id = %event.aggregate_id, "outbox event appended");
        return Ok(AppendOutcome::Inserted(id));
    }

    let existing = outbox_events::Entity::find()
        .filter(Column::IdempotencyKey.eq(key))
        .one(conn)
        .await?
        .ok_or_else(|| DbErr::RecordNotFound(format!("outbox event with idempotency key {key}")))?;
    debug!(outbox_id = %existing.id, idempotency_key = key, "duplicate outbox append ignored");
    Ok(AppendOutcome::Duplicate(OutboxEventId(existing.id)))
}
