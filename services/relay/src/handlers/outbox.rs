use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::{Deserialize, Serialize};

use tracelink_domain::id::{OutboxEventId, ProjectId};

use crate::domain::types::{OutboxEvent, OutboxHealth, ProjectScope};
use crate::error::RelayError;
use crate::state::AppState;
use crate::usecase::health::{
    ListDeadLettersUseCase, OutboxHealthUseCase, RequeueDeadLetterUseCase,
};

// ── Response types ───────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct OutboxHealthResponse {
    pub healthy: bool,
    #[serde(flatten)]
    pub health: OutboxHealth,
    pub lag_threshold_secs: u64,
    pub max_retries: u32,
}

// ── Query params ─────────────────────────────────────────────────────────────

#[derive(Deserialize, Default)]
pub struct HealthQuery {
    pub project_id: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct DeadLetterQuery {
    pub project_id: Option<String>,
    pub limit: Option<u64>,
}

fn scope(project_id: Option<&str>) -> Result<ProjectScope, RelayError> {
    let project_id = project_id
        .map(|raw| {
            raw.parse::<ProjectId>()
                .map_err(|_| RelayError::InvalidRequest(format!("invalid project_id: {raw}")))
        })
        .transpose()?;
    Ok(ProjectScope { project_id })
}

// ── GET /outbox/health ───────────────────────────────────────────────────────

pub async fn get_outbox_health(
    State(state): State<AppState>,
    Query(query): Query<HealthQuery>,
) -> Result<Json<OutboxHealthResponse>, RelayError> {
    let usecase = OutboxHealthUseCase {
        store: state.outbox_store(),
        lag_threshold: state.config.lag_threshold(),
        max_retries: state.config.max_retries,
    };
    let health = usecase.execute(scope(query.project_id.as_deref())?).await?;
    Ok(Json(OutboxHealthResponse {
        healthy: health.is_healthy(),
        health,
        lag_threshold_secs: state.config.lag_threshold_secs,
        max_retries: state.config.max_retries,
    }))
}

// ── GET /outbox/dead-letters ─────────────────────────────────────────────────

pub async fn list_dead_letters(
    State(state): State<AppState>,
    Query(query): Query<DeadLetterQuery>,
) -> Result<Json<Vec<OutboxEvent>>, RelayError> {
    let usecase = ListDeadLettersUseCase {
        store: state.outbox_store(),
        max_retries: state.config.max_retries,
    };
    let events = usecase
        .execute(scope(query.project_id.as_deref())?, query.limit)
        .await?;
    Ok(Json(events))
}

// ── POST /outbox/dead-letters/{id}/requeue ───────────────────────────────────

pub async fn requeue_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<OutboxEvent>, RelayError> {
    let id: OutboxEventId = id
        .parse()
        .map_err(|_| RelayError::InvalidRequest(format!("invalid outbox event id: {id}")))?;
    let usecase = RequeueDeadLetterUseCase {
        store: state.outbox_store(),
        max_retries: state.config.max_retries,
    };
    let event = usecase.execute(id).await?;
    Ok(Json(event))
}
