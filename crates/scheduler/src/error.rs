//! Errors surfaced synchronously from the scheduler façade.
//!
//! Background failures (persistence, callbacks, the poll tick itself) are
//! never surfaced; they are recovered locally and observable only as events.

use cw_cron::CronParseError;

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("task name must be a non-empty string")]
    InvalidName,

    #[error("task '{name}' is already scheduled")]
    Duplicate { name: String },

    #[error(
        "task would fire every {task_ms}ms, more often than the {poll_ms}ms poll interval"
    )]
    Frequency { task_ms: u64, poll_ms: u64 },

    #[error(transparent)]
    Cron(#[from] CronParseError),
}
