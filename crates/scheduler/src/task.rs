//! Task records, the in-memory task table, and due classification.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use cw_cron::CronExpression;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Error produced by a task callback.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// A registered task callback: zero-argument, asynchronous, shareable.
pub type TaskCallback = dyn Fn() -> BoxFuture<'static, Result<(), CallbackError>> + Send + Sync;

/// Adapter so callbacks may return either `()` or a `Result`.
pub trait IntoCallbackResult {
    fn into_callback_result(self) -> Result<(), CallbackError>;
}

impl IntoCallbackResult for () {
    fn into_callback_result(self) -> Result<(), CallbackError> {
        Ok(())
    }
}

impl<E: Into<CallbackError>> IntoCallbackResult for Result<(), E> {
    fn into_callback_result(self) -> Result<(), CallbackError> {
        self.map_err(Into::into)
    }
}

/// Why a due task is being run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunMode {
    Cron,
    Retry,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Cron => "cron",
            Self::Retry => "retry",
        })
    }
}

/// Why a task was not dispatched this poll.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SkipReason {
    Running,
    RetryNotDue,
    NotDue,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Running => "running",
            Self::RetryNotDue => "retryNotDue",
            Self::NotDue => "notDue",
        })
    }
}

/// Listing hint: what the next poll would do with the task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ModeHint {
    Cron,
    Retry,
    Idle,
}

/// One scheduled task.
///
/// `callback` is absent for records rebuilt from persistence that have not
/// been re-registered in this process; such records are never dispatched.
#[derive(Clone)]
pub struct TaskRecord {
    pub name: String,
    pub cron_expression: String,
    pub cron: CronExpression,
    pub callback: Option<Arc<TaskCallback>>,
    pub retry_delay: Duration,
    pub last_success_time: Option<DateTime<Utc>>,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub last_attempt_time: Option<DateTime<Utc>>,
    pub pending_retry_until: Option<DateTime<Utc>>,
    pub running: bool,
}

impl TaskRecord {
    pub fn new(
        name: String,
        cron_expression: String,
        cron: CronExpression,
        callback: Option<Arc<TaskCallback>>,
        retry_delay: Duration,
    ) -> Self {
        Self {
            name,
            cron_expression,
            cron,
            callback,
            retry_delay,
            last_success_time: None,
            last_failure_time: None,
            last_attempt_time: None,
            pending_retry_until: None,
            running: false,
        }
    }
}

impl std::fmt::Debug for TaskRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRecord")
            .field("name", &self.name)
            .field("cron_expression", &self.cron_expression)
            .field(
                "callback",
                &if self.callback.is_some() {
                    "<bound>"
                } else {
                    "<absent>"
                },
            )
            .field("retry_delay", &self.retry_delay)
            .field("last_success_time", &self.last_success_time)
            .field("last_failure_time", &self.last_failure_time)
            .field("last_attempt_time", &self.last_attempt_time)
            .field("pending_retry_until", &self.pending_retry_until)
            .field("running", &self.running)
            .finish()
    }
}

/// Poll-time verdict for one task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DueState {
    Due(RunMode),
    Skip(SkipReason),
}

/// The due rule shared by the poll loop and the listing projection.
///
/// Cron mode: the most recent firing exists and either the task was never
/// attempted or its last success predates that firing. Retry mode: a pending
/// retry deadline has arrived. When both hold, retry wins iff its deadline is
/// not later than the firing.
pub(crate) fn classify(
    record: &TaskRecord,
    now: DateTime<Utc>,
    last_fire: Option<DateTime<Utc>>,
) -> DueState {
    if record.running {
        return DueState::Skip(SkipReason::Running);
    }

    let cron_due = last_fire.is_some_and(|fire| {
        record.last_attempt_time.is_none()
            || record.last_success_time.is_some_and(|success| success < fire)
    });
    let retry_due = record
        .pending_retry_until
        .is_some_and(|deadline| now >= deadline);

    match (cron_due, retry_due) {
        (true, true) => {
            // Both apply; the earlier trigger wins.
            let deadline = record.pending_retry_until.expect("retry_due checked");
            let fire = last_fire.expect("cron_due checked");
            if deadline <= fire {
                DueState::Due(RunMode::Retry)
            } else {
                DueState::Due(RunMode::Cron)
            }
        }
        (true, false) => DueState::Due(RunMode::Cron),
        (false, true) => DueState::Due(RunMode::Retry),
        (false, false) => {
            if record.pending_retry_until.is_some() {
                DueState::Skip(SkipReason::RetryNotDue)
            } else {
                DueState::Skip(SkipReason::NotDue)
            }
        }
    }
}

/// Outcome of [`TaskTable::bind_or_insert`].
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum BindOutcome {
    /// A fresh record was inserted.
    Inserted,
    /// An existing callback-less record (loaded from persistence) was
    /// re-bound; its timing fields were preserved.
    Rebound,
    /// A record with a bound callback already holds the name.
    Duplicate,
}

/// Process-wide mapping from task name to task state.
///
/// Every operation is one exclusive section; the poll loop iterates a
/// snapshot, never the live map.
pub(crate) struct TaskTable {
    inner: Mutex<HashMap<String, TaskRecord>>,
}

impl TaskTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Insert a loaded record unless the name is already taken.
    pub fn insert_if_absent(&self, record: TaskRecord) -> bool {
        let mut map = self.inner.lock();
        if map.contains_key(&record.name) {
            return false;
        }
        map.insert(record.name.clone(), record);
        true
    }

    /// Insert a fresh record, or bind the callback onto a persisted record
    /// that has not been re-registered yet.
    pub fn bind_or_insert(&self, record: TaskRecord) -> BindOutcome {
        let mut map = self.inner.lock();
        match map.entry(record.name.clone()) {
            std::collections::hash_map::Entry::Occupied(mut slot) => {
                if slot.get().callback.is_some() {
                    return BindOutcome::Duplicate;
                }
                let existing = slot.get_mut();
                existing.cron_expression = record.cron_expression;
                existing.cron = record.cron;
                existing.retry_delay = record.retry_delay;
                existing.callback = record.callback;
                BindOutcome::Rebound
            }
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(record);
                BindOutcome::Inserted
            }
        }
    }

    /// Apply `mutate` to the named record. Returns false if it is gone.
    pub fn update<F: FnOnce(&mut TaskRecord)>(&self, name: &str, mutate: F) -> bool {
        let mut map = self.inner.lock();
        match map.get_mut(name) {
            Some(record) => {
                mutate(record);
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, name: &str) -> bool {
        self.inner.lock().remove(name).is_some()
    }

    /// Clear the table, returning how many records were dropped.
    pub fn clear(&self) -> usize {
        let mut map = self.inner.lock();
        let count = map.len();
        map.clear();
        count
    }

    pub fn get(&self, name: &str) -> Option<TaskRecord> {
        self.inner.lock().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Point-in-time copy for iteration.
    pub fn snapshot(&self) -> Vec<TaskRecord> {
        self.inner.lock().values().cloned().collect()
    }
}
