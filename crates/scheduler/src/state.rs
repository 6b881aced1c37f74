//! The versioned on-disk state document.
//!
//! Version 2 is current. Version 1 is a legacy header-only document (no
//! `tasks`); it migrates on load to an empty v2 and the next mutation writes
//! the new schema.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::task::TaskRecord;
use cw_cron::CronExpression;

pub const CURRENT_STATE_VERSION: u32 = 2;

/// Complete persisted scheduler state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeState {
    pub version: u32,
    /// Instant the document was first created; preserved across writes.
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub tasks: Vec<PersistedTask>,
}

impl RuntimeState {
    pub fn empty(start_time: DateTime<Utc>) -> Self {
        Self {
            version: CURRENT_STATE_VERSION,
            start_time,
            tasks: Vec::new(),
        }
    }
}

/// Serializable form of one task record. Timing fields are ISO-8601 UTC.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedTask {
    pub name: String,
    pub cron_expression: String,
    pub retry_delay_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_retry_until: Option<DateTime<Utc>>,
}

impl PersistedTask {
    pub fn from_record(record: &TaskRecord) -> Self {
        Self {
            name: record.name.clone(),
            cron_expression: record.cron_expression.clone(),
            retry_delay_ms: record.retry_delay.num_milliseconds().max(0) as u64,
            last_success_time: record.last_success_time,
            last_failure_time: record.last_failure_time,
            last_attempt_time: record.last_attempt_time,
            pending_retry_until: record.pending_retry_until,
        }
    }

    /// Rebuild an in-memory record with an absent callback. The cron text is
    /// reparsed; a malformed entry reports why it was dropped.
    pub fn rebuild(&self) -> Result<TaskRecord, String> {
        if self.name.trim().is_empty() {
            return Err("empty task name".to_string());
        }
        let cron = CronExpression::parse(&self.cron_expression).map_err(|e| e.to_string())?;
        let retry_ms = i64::try_from(self.retry_delay_ms)
            .map_err(|_| format!("retry delay {}ms out of range", self.retry_delay_ms))?;
        let mut record = TaskRecord::new(
            self.name.clone(),
            self.cron_expression.clone(),
            cron,
            None,
            chrono::Duration::milliseconds(retry_ms),
        );
        record.last_success_time = self.last_success_time;
        record.last_failure_time = self.last_failure_time;
        record.last_attempt_time = self.last_attempt_time;
        record.pending_retry_until = self.pending_retry_until;
        Ok(record)
    }
}

/// A schema upgrade applied while loading.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Migration {
    pub from: u32,
    pub to: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum StateDecodeError {
    #[error("state document has no integer 'version' field")]
    MissingVersion,

    #[error("unsupported state version {0}")]
    UnsupportedVersion(u64),

    #[error("malformed state document: {0}")]
    Malformed(String),
}

/// Decode a raw persisted document, migrating legacy versions.
pub fn decode(value: Value) -> Result<(RuntimeState, Option<Migration>), StateDecodeError> {
    let version = value
        .get("version")
        .and_then(Value::as_u64)
        .ok_or(StateDecodeError::MissingVersion)?;
    match version {
        1 => {
            let start_time: DateTime<Utc> = value
                .get("startTime")
                .cloned()
                .ok_or_else(|| StateDecodeError::Malformed("v1 missing startTime".into()))
                .and_then(|v| {
                    serde_json::from_value(v)
                        .map_err(|e| StateDecodeError::Malformed(e.to_string()))
                })?;
            Ok((
                RuntimeState::empty(start_time),
                Some(Migration { from: 1, to: 2 }),
            ))
        }
        2 => {
            let state: RuntimeState = serde_json::from_value(value)
                .map_err(|e| StateDecodeError::Malformed(e.to_string()))?;
            Ok((state, None))
        }
        other => Err(StateDecodeError::UnsupportedVersion(other)),
    }
}
