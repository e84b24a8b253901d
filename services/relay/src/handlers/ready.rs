use axum::{extract::State, http::StatusCode};
use deadpool_redis::redis;
use tracing::warn;

use crate::state::AppState;

/// Handler for `GET /readyz`: both the outbox database and the stream must answer.
pub async fn readyz(State(state): State<AppState>) -> StatusCode {
    if let Err(e) = state.db.ping().await {
        warn!(error = %e, "readiness: database ping failed");
        return StatusCode::SERVICE_UNAVAILABLE;
    }

    let mut conn = match state.redis.get().await {
        Ok(conn) => conn,
        Err(e) => {
            warn!(error = %e, "readiness: redis pool unavailable");
            return StatusCode::SERVICE_UNAVAILABLE;
        }
    };
    let pong: Result<String, redis::RedisError> = redis::cmd("PING").query_async(&mut conn).await;
    match pong {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            warn!(error = %e, "readiness: redis ping failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}
