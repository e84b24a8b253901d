use sea_orm::entity::prelude::*;

/// Outbox row: one event per committed business mutation, relayed to the
/// event stream by the poller.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "outbox_events")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub project_id: Uuid,
    pub payload: Json,
    /// `PENDING` | `PUBLISHED` | `FAILED`.
    pub status: String,
    pub retry_count: i32,
    pub last_error: Option<String>,
    #[sea_orm(unique)]
    pub idempotency_key: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub published_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Poller claim; set while a publish attempt is in flight.
    pub claim_token: Option<Uuid>,
    pub claimed_until: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
