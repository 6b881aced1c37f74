//! Operational events and the event-sink capability.
//!
//! Every observable action of the scheduler is emitted as a
//! [`SchedulerEvent`]. The default sink forwards to `tracing`; tests and
//! operators can install a [`CollectingSink`] to assert on or snapshot the
//! stream.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::task::{RunMode, SkipReason};

/// Structured operational events, tagged with their stable names.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event")]
pub enum SchedulerEvent {
    SchedulerStateLoaded {
        task_count: usize,
    },
    RuntimeStateMigrated {
        from: u32,
        to: u32,
    },
    DuplicateTaskSkipped {
        name: String,
    },
    SkippedInvalidTask {
        name: String,
        reason: String,
    },
    StatePersisted {
        task_count: usize,
    },
    StateWriteFailed {
        error: String,
    },
    StateWriteFailedAfterSuccess {
        name: String,
        error: String,
    },
    StateWriteFailedAfterFailure {
        name: String,
        error: String,
    },
    StateReadFailed {
        error: String,
    },
    TaskRunStarted {
        name: String,
        mode: RunMode,
    },
    TaskRunSuccess {
        name: String,
        mode: RunMode,
        duration_ms: u64,
    },
    TaskRunFailure {
        name: String,
        mode: RunMode,
        error: String,
        retry_at: DateTime<Utc>,
    },
    TaskSkip {
        name: String,
        reason: SkipReason,
    },
    TaskSkippedNoCallback {
        name: String,
    },
    PollSkipped {
        reason: &'static str,
    },
    PollSummary {
        total: usize,
        due_cron: usize,
        due_retry: usize,
        skipped_running: usize,
        skipped_retry_future: usize,
        skipped_not_due: usize,
        skipped_concurrency: usize,
    },
    UnexpectedPollError {
        error: String,
    },
    CancelAllPersisted {
        task_count: usize,
    },
}

/// Reason attached to `PollSkipped`.
pub const POLL_IN_PROGRESS: &str = "pollInProgress";

/// Receiver of operational events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: SchedulerEvent);
}

/// Default sink: structured `tracing` records carrying the event name.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: SchedulerEvent) {
        use SchedulerEvent::*;
        match &event {
            SchedulerStateLoaded { task_count } => {
                tracing::info!(task_count, "SchedulerStateLoaded");
            }
            RuntimeStateMigrated { from, to } => {
                tracing::info!(from, to, "RuntimeStateMigrated");
            }
            DuplicateTaskSkipped { name } => {
                tracing::warn!(name = %name, "DuplicateTaskSkipped");
            }
            SkippedInvalidTask { name, reason } => {
                tracing::warn!(name = %name, reason = %reason, "SkippedInvalidTask");
            }
            StatePersisted { task_count } => {
                tracing::debug!(task_count, "StatePersisted");
            }
            StateWriteFailed { error } => {
                tracing::warn!(error = %error, "StateWriteFailed");
            }
            StateWriteFailedAfterSuccess { name, error } => {
                tracing::warn!(name = %name, error = %error, "StateWriteFailedAfterSuccess");
            }
            StateWriteFailedAfterFailure { name, error } => {
                tracing::warn!(name = %name, error = %error, "StateWriteFailedAfterFailure");
            }
            StateReadFailed { error } => {
                tracing::warn!(error = %error, "StateReadFailed");
            }
            TaskRunStarted { name, mode } => {
                tracing::info!(name = %name, mode = %mode, "TaskRunStarted");
            }
            TaskRunSuccess {
                name,
                mode,
                duration_ms,
            } => {
                tracing::info!(name = %name, mode = %mode, duration_ms, "TaskRunSuccess");
            }
            TaskRunFailure {
                name,
                mode,
                error,
                retry_at,
            } => {
                tracing::warn!(
                    name = %name,
                    mode = %mode,
                    error = %error,
                    retry_at = %retry_at,
                    "TaskRunFailure"
                );
            }
            TaskSkip { name, reason } => {
                tracing::debug!(name = %name, reason = %reason, "TaskSkip");
            }
            TaskSkippedNoCallback { name } => {
                tracing::debug!(name = %name, "TaskSkippedNoCallback");
            }
            PollSkipped { reason } => {
                tracing::warn!(reason = %reason, "PollSkipped");
            }
            PollSummary {
                total,
                due_cron,
                due_retry,
                skipped_running,
                skipped_retry_future,
                skipped_not_due,
                skipped_concurrency,
            } => {
                tracing::debug!(
                    total,
                    due_cron,
                    due_retry,
                    skipped_running,
                    skipped_retry_future,
                    skipped_not_due,
                    skipped_concurrency,
                    "PollSummary"
                );
            }
            UnexpectedPollError { error } => {
                tracing::error!(error = %error, "UnexpectedPollError");
            }
            CancelAllPersisted { task_count } => {
                tracing::info!(task_count, "CancelAllPersisted");
            }
        }
    }
}

/// Sink that records every event, for assertions and operational snapshots.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<SchedulerEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything emitted so far.
    pub fn events(&self) -> Vec<SchedulerEvent> {
        self.events.lock().clone()
    }

    /// Drain the recorded events.
    pub fn take(&self) -> Vec<SchedulerEvent> {
        std::mem::take(&mut self.events.lock())
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: SchedulerEvent) {
        self.events.lock().push(event);
    }
}
