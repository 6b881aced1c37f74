//! Polling engine — tick loop, due-task dispatch, and outcome recording.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Duration;
use cw_cron::FiringCalculator;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::events::{EventSink, SchedulerEvent, POLL_IN_PROGRESS};
use crate::scheduler::SchedulerConfig;
use crate::state::{PersistedTask, RuntimeState, CURRENT_STATE_VERSION};
use crate::store::StateStore;
use crate::task::{classify, DueState, RunMode, SkipReason, TaskCallback, TaskTable};

struct Ticker {
    token: CancellationToken,
    _handle: JoinHandle<()>,
}

/// Which façade operation asked for the write, so the failure event names
/// the context.
pub(crate) enum PersistContext {
    General,
    CancelAll { removed: usize },
    AfterSuccess { name: String },
    AfterFailure { name: String },
}

/// Shared scheduler core: the table, capabilities, and the poll machinery.
pub(crate) struct SchedulerInner {
    pub(crate) config: SchedulerConfig,
    pub(crate) table: TaskTable,
    pub(crate) calc: FiringCalculator,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) store: Arc<dyn StateStore>,
    pub(crate) events: Arc<dyn EventSink>,
    semaphore: Arc<Semaphore>,
    poll_active: AtomicBool,
    ticker: Mutex<Option<Ticker>>,
}

impl SchedulerInner {
    pub(crate) fn new(
        config: SchedulerConfig,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
    ) -> Arc<Self> {
        let permits = config.max_concurrent_tasks.max(1);
        Arc::new(Self {
            config,
            table: TaskTable::new(),
            calc: FiringCalculator::new(),
            clock,
            store,
            events,
            semaphore: Arc::new(Semaphore::new(permits)),
            poll_active: AtomicBool::new(false),
            ticker: Mutex::new(None),
        })
    }

    /// Arm the repeating poll timer. Idempotent.
    pub(crate) fn start(self: &Arc<Self>) {
        let mut ticker = self.ticker.lock();
        if ticker.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let stop = token.clone();
        let inner = Arc::clone(self);
        let period = std::time::Duration::from_millis(self.config.poll_interval_ms);
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // Consume the immediate first tick; polls start one period in.
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tick.tick() => inner.poll().await,
                }
            }
        });
        *ticker = Some(Ticker {
            token,
            _handle: handle,
        });
    }

    /// Disarm the timer. The in-flight poll and its dispatched tasks finish;
    /// only new ticks stop.
    pub(crate) fn stop(&self) {
        if let Some(ticker) = self.ticker.lock().take() {
            ticker.token.cancel();
        }
    }

    pub(crate) fn is_started(&self) -> bool {
        self.ticker.lock().is_some()
    }

    /// One tick. Guarded so at most one poll is in flight per instance.
    pub(crate) async fn poll(self: &Arc<Self>) {
        if self
            .poll_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.events.emit(SchedulerEvent::PollSkipped {
                reason: POLL_IN_PROGRESS,
            });
            return;
        }
        let outcome = std::panic::AssertUnwindSafe(self.evaluate()).catch_unwind().await;
        if let Err(panic) = outcome {
            self.events.emit(SchedulerEvent::UnexpectedPollError {
                error: panic_message(&panic),
            });
        }
        self.poll_active.store(false, Ordering::SeqCst);
    }

    /// Snapshot, classify, dispatch, summarize.
    async fn evaluate(self: &Arc<Self>) {
        let now = self.clock.now_utc();
        let snapshot = self.table.snapshot();
        let total = snapshot.len();

        let mut due: Vec<(String, RunMode, Arc<TaskCallback>, Duration)> = Vec::new();
        let mut due_cron = 0usize;
        let mut due_retry = 0usize;
        let mut skipped_running = 0usize;
        let mut skipped_retry_future = 0usize;
        let mut skipped_not_due = 0usize;

        for record in snapshot {
            let Some(callback) = record.callback.clone() else {
                self.events.emit(SchedulerEvent::TaskSkippedNoCallback {
                    name: record.name.clone(),
                });
                continue;
            };
            if record.running {
                skipped_running += 1;
                self.events.emit(SchedulerEvent::TaskSkip {
                    name: record.name.clone(),
                    reason: SkipReason::Running,
                });
                continue;
            }
            let last_fire = self.calc.most_recent_firing(&record.cron, now);
            match classify(&record, now, last_fire) {
                DueState::Due(mode) => {
                    match mode {
                        RunMode::Cron => due_cron += 1,
                        RunMode::Retry => due_retry += 1,
                    }
                    due.push((record.name.clone(), mode, callback, record.retry_delay));
                }
                DueState::Skip(reason) => {
                    match reason {
                        SkipReason::Running => skipped_running += 1,
                        SkipReason::RetryNotDue => skipped_retry_future += 1,
                        SkipReason::NotDue => skipped_not_due += 1,
                    }
                    self.events.emit(SchedulerEvent::TaskSkip {
                        name: record.name.clone(),
                        reason,
                    });
                }
            }
        }

        // Items beyond the free permits wait for a slot; they are counted,
        // not dropped.
        let available = self.semaphore.available_permits();
        let skipped_concurrency = due.len().saturating_sub(available);

        for (name, mode, callback, retry_delay) in due {
            // Claim before spawning so a later poll cannot double-dispatch.
            if !self.table.update(&name, |t| t.running = true) {
                continue;
            }
            let inner = Arc::clone(self);
            tokio::spawn(inner.run_task(name, mode, callback, retry_delay));
        }

        self.events.emit(SchedulerEvent::PollSummary {
            total,
            due_cron,
            due_retry,
            skipped_running,
            skipped_retry_future,
            skipped_not_due,
            skipped_concurrency,
        });
    }

    /// Execute one due task: permit, callback, state transition, persist.
    async fn run_task(
        self: Arc<Self>,
        name: String,
        mode: RunMode,
        callback: Arc<TaskCallback>,
        retry_delay: Duration,
    ) {
        let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                self.table.update(&name, |t| t.running = false);
                return;
            }
        };

        let started = self.clock.now_utc();
        self.table
            .update(&name, |t| t.last_attempt_time = Some(started));
        self.events.emit(SchedulerEvent::TaskRunStarted {
            name: name.clone(),
            mode,
        });

        // The callback runs in its own task so a panic becomes a failure
        // instead of tearing down the engine.
        let outcome = tokio::spawn((callback)()).await;
        let finished = self.clock.now_utc();
        let result = match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(join) if join.is_panic() => Err("callback panicked".to_string()),
            Err(_) => Err("callback was cancelled".to_string()),
        };

        match result {
            Ok(()) => {
                let present = self.table.update(&name, |t| {
                    t.last_success_time = Some(finished);
                    t.last_failure_time = None;
                    t.pending_retry_until = None;
                    t.running = false;
                });
                let duration_ms = finished
                    .signed_duration_since(started)
                    .num_milliseconds()
                    .max(0) as u64;
                self.events.emit(SchedulerEvent::TaskRunSuccess {
                    name: name.clone(),
                    mode,
                    duration_ms,
                });
                if present {
                    self.persist(PersistContext::AfterSuccess { name }).await;
                }
            }
            Err(error) => {
                let retry_at = finished.checked_add_signed(retry_delay).unwrap_or(finished);
                let present = self.table.update(&name, |t| {
                    t.last_failure_time = Some(finished);
                    t.pending_retry_until = Some(retry_at);
                    t.running = false;
                });
                self.events.emit(SchedulerEvent::TaskRunFailure {
                    name: name.clone(),
                    mode,
                    error,
                    retry_at,
                });
                if present {
                    self.persist(PersistContext::AfterFailure { name }).await;
                }
            }
        }
        drop(permit);
    }

    /// Write a complete snapshot of the table. Best-effort: a failure is
    /// logged and the in-memory state stays authoritative.
    pub(crate) async fn persist(&self, context: PersistContext) -> bool {
        let now = self.clock.now_utc();
        let mut tasks: Vec<PersistedTask> = self
            .table
            .snapshot()
            .iter()
            .map(PersistedTask::from_record)
            .collect();
        tasks.sort_by(|a, b| a.name.cmp(&b.name));
        let task_count = tasks.len();

        let result = self
            .store
            .transaction(
                now,
                Box::new(move |tx| {
                    let start_time = tx.current_state().start_time;
                    tx.set_state(RuntimeState {
                        version: CURRENT_STATE_VERSION,
                        start_time,
                        tasks,
                    });
                }),
            )
            .await;

        match result {
            Ok(()) => {
                match context {
                    PersistContext::CancelAll { removed } => {
                        self.events.emit(SchedulerEvent::CancelAllPersisted {
                            task_count: removed,
                        });
                    }
                    _ => {
                        self.events
                            .emit(SchedulerEvent::StatePersisted { task_count });
                    }
                }
                true
            }
            Err(e) => {
                let error = e.to_string();
                let event = match context {
                    PersistContext::AfterSuccess { name } => {
                        SchedulerEvent::StateWriteFailedAfterSuccess { name, error }
                    }
                    PersistContext::AfterFailure { name } => {
                        SchedulerEvent::StateWriteFailedAfterFailure { name, error }
                    }
                    PersistContext::General | PersistContext::CancelAll { .. } => {
                        SchedulerEvent::StateWriteFailed { error }
                    }
                };
                self.events.emit(event);
                false
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "poll panicked".to_string()
    }
}
