use std::sync::Arc;

use deadpool_redis::Pool as RedisPool;
use sea_orm::DatabaseConnection;

use crate::config::RelayConfig;
use crate::infra::db::SeaOrmOutboxStore;
use crate::infra::stream::RedisStreamPublisher;

/// Shared application state passed to every handler via axum `State` and
/// cloned into the background workers.
#[derive(Clone)]
pub struct AppState {
    pub db: DatabaseConnection,
    pub redis: RedisPool,
    pub config: Arc<RelayConfig>,
}

impl AppState {
    pub fn outbox_store(&self) -> SeaOrmOutboxStore {
        SeaOrmOutboxStore {
            db: self.db.clone(),
        }
    }

    pub fn stream_publisher(&self) -> RedisStreamPublisher {
        RedisStreamPublisher {
            pool: self.redis.clone(),
            stream_key: self.config.stream_key.clone(),
            max_len: self.config.stream_max_len,
        }
    }
}
