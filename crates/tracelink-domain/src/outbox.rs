//! Outbox row lifecycle.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::event::UnknownTag;

/// Publication status of an outbox row.
///
/// ```text
/// PENDING ──publish ok──▶ PUBLISHED (terminal)
///    │  ▲
///  fail│  │sweep (retry_count < max_retries)
///    ▼  │
///  FAILED ──retry_count >= max_retries──▶ dead letter (stays FAILED)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    Published,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Published => "PUBLISHED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = UnknownTag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "PUBLISHED" => Ok(Self::Published),
            "FAILED" => Ok(Self::Failed),
            other => Err(UnknownTag(other.to_owned())),
        }
    }
}

/// Whether a FAILED row with `retry_count` attempts is still eligible for the
/// retry sweep. Once this turns false the row is a dead letter.
pub fn is_retryable(retry_count: u32, max_retries: u32) -> bool {
    retry_count < max_retries
}
