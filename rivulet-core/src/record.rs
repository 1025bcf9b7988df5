//! Wire format of a review record.
//!
//! One JSON object per line. The bulk source provides `review_id`, `text`, `stars`, `date`,
//! `business_id` and `user_id`, optionally the vote counters. The producer stamps `timestamp`
//! right before delivery, and the consumer refuses records without it.

use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tool::partition_key;

/// A review record.
///
/// Missing fields fall back to their defaults, the same way the bulk dataset is read.
#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
pub struct Review {
    #[serde(default)]
    pub review_id: String,

    #[serde(default)]
    pub text: String,

    /// Rating, from 0 to 5.
    #[serde(default)]
    pub stars: f64,

    #[serde(default)]
    pub date: String,

    #[serde(default)]
    pub useful: i64,

    #[serde(default)]
    pub funny: i64,

    #[serde(default)]
    pub cool: i64,

    /// The reviewed entity.
    #[serde(default)]
    pub business_id: String,

    /// The owner of the review, used for partition routing.
    #[serde(default)]
    pub user_id: String,

    /// Send time in ISO-8601, set by the producer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl Review {
    /// Parse one line of the bulk source.
    pub fn from_json_line(line: &str) -> Result<Self> {
        serde_json::from_str(line).map_err(|e| anyhow!("invalid review json, error: {}", e))
    }

    /// Decode a record fetched from the log.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| anyhow!("invalid review payload, error: {}", e))
    }

    /// Encode as log payload.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| e.into())
    }

    /// Return the record with `timestamp` set to `now`.
    pub fn stamped(mut self, now: DateTime<Utc>) -> Self {
        self.timestamp = Some(now.to_rfc3339());
        self
    }

    /// Partition key derived from `user_id`.
    pub fn partition_key(&self) -> String {
        partition_key(&self.user_id)
    }

    /// Event time of the record, parsed from `timestamp`.
    ///
    /// Accepts RFC 3339 and naive ISO-8601 (treated as UTC).
    pub fn event_time(&self) -> Result<DateTime<Utc>> {
        let ts = self
            .timestamp
            .as_deref()
            .ok_or_else(|| anyhow!("missing timestamp, review_id: {}", self.review_id))?;

        parse_timestamp(ts)
    }

    /// First `n` chars of the text.
    pub fn preview(&self, n: usize) -> &str {
        match self.text.char_indices().nth(n) {
            Some((pos, _)) => &self.text[..pos],
            None => &self.text,
        }
    }
}

/// Parse an ISO-8601 timestamp.
pub fn parse_timestamp(ts: &str) -> Result<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(ts) {
        return Ok(t.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(ts, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|t| t.and_utc())
        .map_err(|e| anyhow!("invalid timestamp: {}, error: {}", ts, e))
}
