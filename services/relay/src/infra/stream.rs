use std::collections::HashMap;
use std::time::Duration;

use deadpool_redis::Pool;
use deadpool_redis::redis::{self, Cmd, RedisError};
use tracing::{debug, info};

use crate::domain::repository::{ConsumerGroupStream, StreamPublisher};
use crate::domain::types::{StreamEntry, StreamEntryId, StreamMessage};
use crate::error::RelayError;

/// `[(stream, [(id, {field: value})])]` as returned by XREADGROUP.
type ReadReply = Vec<(String, Vec<(String, HashMap<String, String>)>)>;
/// `(next cursor, claimed entries, deleted ids)` as returned by XAUTOCLAIM.
type AutoClaimReply = (String, Vec<(String, HashMap<String, String>)>, Vec<String>);

fn transport(e: impl std::fmt::Display) -> RelayError {
    RelayError::Transport(e.to_string())
}

fn to_messages(entries: Vec<(String, HashMap<String, String>)>) -> Vec<StreamMessage> {
    entries
        .into_iter()
        .map(|(id, fields)| StreamMessage {
            id: StreamEntryId(id),
            fields,
        })
        .collect()
}

// ── Publisher ────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct RedisStreamPublisher {
    pub pool: Pool,
    pub stream_key: String,
    /// Approximate trim length; `None` keeps the full history.
    pub max_len: Option<usize>,
}

pub(crate) fn xadd_cmd(stream_key: &str, max_len: Option<usize>, entry: &StreamEntry) -> Cmd {
    let mut cmd = redis::cmd("XADD");
    cmd.arg(stream_key);
    if let Some(max_len) = max_len {
        cmd.arg("MAXLEN").arg("~").arg(max_len);
    }
    cmd.arg("*");
    for (field, value) in entry.to_fields() {
        cmd.arg(field).arg(value);
    }
    cmd
}

impl StreamPublisher for RedisStreamPublisher {
    async fn publish(&self, entry: &StreamEntry) -> Result<StreamEntryId, RelayError> {
        let mut conn = self.pool.get().await.map_err(transport)?;
        let id: String = xadd_cmd(&self.stream_key, self.max_len, entry)
            .query_async(&mut conn)
            .await
            .map_err(transport)?;
        Ok(StreamEntryId(id))
    }
}

// ── Initializer ──────────────────────────────────────────────────────────────

fn is_existing_group(code: Option<&str>) -> bool {
    code == Some("BUSYGROUP")
}

/// Create the stream and every consumer group if missing. Safe to run on
/// every start and from several instances at once.
pub async fn ensure_stream(
    pool: &Pool,
    stream_key: &str,
    groups: &[String],
    start_id: &str,
) -> Result<(), RelayError> {
    let mut conn = pool.get().await.map_err(transport)?;
    for group in groups {
        let created: Result<(), RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream_key)
            .arg(group)
            .arg(start_id)
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match created {
            Ok(()) => info!(stream = stream_key, group = %group, start_id, "consumer group created"),
            Err(e) if is_existing_group(e.code()) => {
                debug!(stream = stream_key, group = %group, "consumer group already exists");
            }
            Err(e) => return Err(transport(e)),
        }
    }
    Ok(())
}

// ── Consumer group member ────────────────────────────────────────────────────

#[derive(Clone)]
pub struct RedisConsumerGroup {
    pub pool: Pool,
    pub stream_key: String,
    pub group: String,
    pub consumer: String,
}

impl RedisConsumerGroup {
    pub(crate) fn xreadgroup_cmd(&self, count: usize, block: Duration) -> Cmd {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(count);
        // BLOCK 0 would wait forever.
        if !block.is_zero() {
            cmd.arg("BLOCK").arg(block.as_millis() as u64);
        }
        cmd.arg("STREAMS").arg(&self.stream_key).arg(">");
        cmd
    }

    pub(crate) fn xautoclaim_cmd(&self, min_idle: Duration, count: usize) -> Cmd {
        let mut cmd = redis::cmd("XAUTOCLAIM");
        cmd.arg(&self.stream_key)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(min_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(count);
        cmd
    }

    pub(crate) fn xack_cmd(&self, ids: &[StreamEntryId]) -> Cmd {
        let mut cmd = redis::cmd("XACK");
        cmd.arg(&self.stream_key).arg(&self.group);
        for id in ids {
            cmd.arg(&id.0);
        }
        cmd
    }
}

fn read_messages(reply: Option<ReadReply>) -> Vec<StreamMessage> {
    reply
        .into_iter()
        .flatten()
        .flat_map(|(_stream, entries)| to_messages(entries))
        .collect()
}

impl ConsumerGroupStream for RedisConsumerGroup {
    async fn read_new(
        &self,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamMessage>, RelayError> {
        let mut conn = self.pool.get().await.map_err(transport)?;
        let reply: Option<ReadReply> = self
            .xreadgroup_cmd(count, block)
            .query_async(&mut conn)
            .await
            .map_err(transport)?;
        Ok(read_messages(reply))
    }

    async fn reclaim_stale(
        &self,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamMessage>, RelayError> {
        let mut conn = self.pool.get().await.map_err(transport)?;
        let (_cursor, entries, deleted): AutoClaimReply = self
            .xautoclaim_cmd(min_idle, count)
            .query_async(&mut conn)
            .await
            .map_err(transport)?;
        if !deleted.is_empty() {
            debug!(group = %self.group, deleted = deleted.len(), "pending entries trimmed from stream");
        }
        Ok(to_messages(entries))
    }

    async fn ack(&self, ids: &[StreamEntryId]) -> Result<u64, RelayError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.pool.get().await.map_err(transport)?;
        let acked: u64 = self
            .xack_cmd(ids)
            .query_async(&mut conn)
            .await
            .map_err(transport)?;
        Ok(acked)
    }
}
