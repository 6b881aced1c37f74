//! Durable polling cron scheduler.
//!
//! A fixed set of named cron tasks is evaluated at a coarse poll interval
//! (default 10 minutes). A task runs when its expression has fired since its
//! last successful attempt; failed tasks are retried after a per-task delay;
//! the task table is persisted through a transactional state store so a
//! restart replays at most the single most recent missed firing per task.
//!
//! Split into submodules:
//! - [`clock`] — wall-clock capability (`SystemClock`, `ManualClock`)
//! - [`events`] — operational events and the [`events::EventSink`] capability
//! - [`task`] — task records, the in-memory table, due classification
//! - [`state`] — the versioned on-disk document and its v1→v2 migration
//! - [`store`] — the transactional [`store::StateStore`] capability with
//!   file-backed and in-memory implementations
//! - [`scheduler`] — the public [`Scheduler`] façade
//!
//! All time reasoning is UTC at minute resolution.

pub mod clock;
mod engine;
pub mod error;
pub mod events;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod task;

pub use clock::{Clock, ManualClock, SystemClock};
pub use cw_cron::{CronExpression, CronParseError};
pub use error::ScheduleError;
pub use events::{CollectingSink, EventSink, SchedulerEvent, TracingSink, POLL_IN_PROGRESS};
pub use scheduler::{Scheduler, SchedulerConfig, TaskInfo};
pub use state::{PersistedTask, RuntimeState};
pub use store::{JsonFileStore, MemoryStore, StateStore, StateTransaction};
pub use task::{CallbackError, IntoCallbackResult, ModeHint, RunMode, SkipReason};
