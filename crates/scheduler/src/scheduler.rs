//! Scheduler façade — registration, cancellation, listing, lifecycle.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use crate::clock::{Clock, SystemClock};
use crate::engine::{PersistContext, SchedulerInner};
use crate::error::ScheduleError;
use crate::events::{EventSink, SchedulerEvent, TracingSink};
use crate::state::{Migration, RuntimeState};
use crate::store::StateStore;
use crate::task::{
    classify, BindOutcome, CallbackError, DueState, IntoCallbackResult, ModeHint, RunMode,
    TaskCallback, TaskRecord,
};
use cw_cron::CronExpression;

fn default_poll_interval_ms() -> u64 {
    600_000
}

fn default_max_concurrent_tasks() -> usize {
    10
}

/// Scheduler tuning. Embedders can deserialize this from their own config
/// files; omitted fields take the defaults.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Polling period in milliseconds; also the admission threshold — tasks
    /// that fire more often than this are rejected.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Dispatcher semaphore capacity.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
        }
    }
}

/// Listing projection of one task.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    pub name: String,
    pub cron_expression: String,
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attempt_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_retry_until: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_firing_time: Option<String>,
    pub mode_hint: ModeHint,
}

/// Durable polling cron scheduler.
///
/// One instance per persistence target; nothing protects two schedulers
/// sharing a state document.
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    loaded: OnceCell<()>,
}

impl Scheduler {
    /// Scheduler with the system clock and `tracing` event output.
    pub fn new(config: SchedulerConfig, store: Arc<dyn StateStore>) -> Self {
        Self::with_capabilities(config, store, Arc::new(SystemClock), Arc::new(TracingSink))
    }

    /// Scheduler with explicit clock and event-sink capabilities.
    pub fn with_capabilities(
        config: SchedulerConfig,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            inner: SchedulerInner::new(config, store, clock, events),
            loaded: OnceCell::new(),
        }
    }

    /// Register a named task.
    ///
    /// Rejects empty names, unparseable expressions, expressions that fire
    /// more often than the poll interval, and names already bound to a
    /// callback. A name loaded from persistence without a callback is
    /// re-bound instead, keeping its timing fields. Starts the polling
    /// engine.
    pub async fn schedule<F, Fut, R>(
        &self,
        name: &str,
        cron_expression: &str,
        callback: F,
        retry_delay: std::time::Duration,
    ) -> Result<String, ScheduleError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoCallbackResult,
    {
        let name = name.trim();
        if name.is_empty() {
            return Err(ScheduleError::InvalidName);
        }
        let cron = CronExpression::parse(cron_expression)?;

        let now = self.inner.clock.now_utc();
        let task_ms = self
            .inner
            .calc
            .min_interval(&cron, now)
            .num_milliseconds()
            .max(0) as u64;
        if task_ms < self.inner.config.poll_interval_ms {
            return Err(ScheduleError::Frequency {
                task_ms,
                poll_ms: self.inner.config.poll_interval_ms,
            });
        }

        self.ensure_loaded().await;

        let callback: Arc<TaskCallback> = Arc::new(
            move || -> BoxFuture<'static, Result<(), CallbackError>> {
                let fut = callback();
                Box::pin(async move { fut.await.into_callback_result() })
            },
        );
        let retry_delay =
            chrono::Duration::from_std(retry_delay).unwrap_or(chrono::Duration::MAX);
        let record = TaskRecord::new(
            name.to_string(),
            cron_expression.to_string(),
            cron,
            Some(callback),
            retry_delay,
        );

        match self.inner.table.bind_or_insert(record) {
            BindOutcome::Duplicate => {
                return Err(ScheduleError::Duplicate {
                    name: name.to_string(),
                })
            }
            BindOutcome::Inserted | BindOutcome::Rebound => {}
        }

        self.inner.persist(PersistContext::General).await;
        self.inner.start();
        Ok(name.to_string())
    }

    /// Remove a task. Does not interrupt an in-flight run; stops the engine
    /// once the table is empty.
    pub async fn cancel(&self, name: &str) -> bool {
        self.ensure_loaded().await;
        let removed = self.inner.table.remove(name.trim());
        if removed {
            self.inner.persist(PersistContext::General).await;
            if self.inner.table.is_empty() {
                self.inner.stop();
            }
        }
        removed
    }

    /// Remove every task and stop the engine. Returns how many were removed.
    pub async fn cancel_all(&self) -> usize {
        self.ensure_loaded().await;
        let removed = self.inner.table.clear();
        if removed > 0 {
            self.inner
                .persist(PersistContext::CancelAll { removed })
                .await;
        }
        self.inner.stop();
        removed
    }

    /// Snapshot of all tasks with timing fields as ISO-8601 strings and a
    /// hint of what the next poll would do.
    pub async fn list(&self) -> Vec<TaskInfo> {
        self.ensure_loaded().await;
        let now = self.inner.clock.now_utc();
        let mut infos: Vec<TaskInfo> = self
            .inner
            .table
            .snapshot()
            .iter()
            .map(|record| {
                let last_fire = self.inner.calc.most_recent_firing(&record.cron, now);
                let mode_hint = match classify(record, now, last_fire) {
                    DueState::Due(RunMode::Cron) => ModeHint::Cron,
                    DueState::Due(RunMode::Retry) => ModeHint::Retry,
                    DueState::Skip(_) => ModeHint::Idle,
                };
                TaskInfo {
                    name: record.name.clone(),
                    cron_expression: record.cron_expression.clone(),
                    running: record.running,
                    last_success_time: record.last_success_time.map(iso),
                    last_failure_time: record.last_failure_time.map(iso),
                    last_attempt_time: record.last_attempt_time.map(iso),
                    pending_retry_until: record.pending_retry_until.map(iso),
                    next_firing_time: self.inner.calc.next_firing(&record.cron, now).map(iso),
                    mode_hint,
                }
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Arm the polling timer without registering anything.
    pub fn start(&self) {
        self.inner.start();
    }

    /// Stop starting new polls. In-flight work finishes.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// One-shot lazy load of persisted state into the table.
    async fn ensure_loaded(&self) {
        self.loaded
            .get_or_init(|| async {
                let inner = &self.inner;
                let now = inner.clock.now_utc();

                type LoadView = (Option<RuntimeState>, Option<Migration>, Option<String>);
                let view: Arc<Mutex<Option<LoadView>>> = Arc::new(Mutex::new(None));
                let out = view.clone();
                let result = inner
                    .store
                    .transaction(
                        now,
                        Box::new(move |tx| {
                            *out.lock() = Some((
                                tx.existing_state().cloned(),
                                tx.migration(),
                                tx.read_error().map(str::to_string),
                            ));
                        }),
                    )
                    .await;

                let observed = view.lock().take();
                let (existing, migration, read_error) = match (result, observed) {
                    (Ok(()), Some(v)) => v,
                    (Err(e), _) => {
                        inner.events.emit(SchedulerEvent::StateReadFailed {
                            error: e.to_string(),
                        });
                        (None, None, None)
                    }
                    (Ok(()), None) => (None, None, None),
                };

                if let Some(error) = read_error {
                    inner
                        .events
                        .emit(SchedulerEvent::StateReadFailed { error });
                }
                if let Some(migration) = migration {
                    inner.events.emit(SchedulerEvent::RuntimeStateMigrated {
                        from: migration.from,
                        to: migration.to,
                    });
                }
                if let Some(state) = existing {
                    for task in &state.tasks {
                        match task.rebuild() {
                            Ok(record) => {
                                if !inner.table.insert_if_absent(record) {
                                    inner.events.emit(SchedulerEvent::DuplicateTaskSkipped {
                                        name: task.name.clone(),
                                    });
                                }
                            }
                            Err(reason) => {
                                inner.events.emit(SchedulerEvent::SkippedInvalidTask {
                                    name: task.name.clone(),
                                    reason,
                                });
                            }
                        }
                    }
                }
                inner.events.emit(SchedulerEvent::SchedulerStateLoaded {
                    task_count: inner.table.len(),
                });
            })
            .await;
    }
}

fn iso(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    use crate::clock::ManualClock;
    use crate::events::CollectingSink;
    use crate::store::MemoryStore;

    struct Harness {
        scheduler: Scheduler,
        clock: Arc<ManualClock>,
        store: Arc<MemoryStore>,
        sink: Arc<CollectingSink>,
    }

    fn harness(config: SchedulerConfig) -> Harness {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2021, 3, 1, 12, 0, 0).unwrap(),
        ));
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(CollectingSink::new());
        let scheduler = Scheduler::with_capabilities(
            config,
            store.clone(),
            clock.clone(),
            sink.clone(),
        );
        Harness {
            scheduler,
            clock,
            store,
            sink,
        }
    }

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig {
            poll_interval_ms: 10,
            max_concurrent_tasks: 10,
        }
    }

    fn noop() -> impl Fn() -> futures_util::future::Ready<()> + Send + Sync + 'static {
        || futures_util::future::ready(())
    }

    #[tokio::test]
    async fn schedule_rejects_blank_names() {
        let h = harness(fast_config());
        let err = h
            .scheduler
            .schedule("", "* * * * *", noop(), std::time::Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidName));

        let err = h
            .scheduler
            .schedule("   ", "* * * * *", noop(), std::time::Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidName));
    }

    #[tokio::test]
    async fn schedule_propagates_parse_errors() {
        let h = harness(fast_config());
        let err = h
            .scheduler
            .schedule("t", "*/5 * * * *", noop(), std::time::Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, ScheduleError::Cron(_)));
    }

    #[tokio::test]
    async fn admission_check_compares_min_interval_to_poll_interval() {
        let h = harness(SchedulerConfig {
            poll_interval_ms: 600_000,
            max_concurrent_tasks: 10,
        });

        // 15-minute cadence beats a 10-minute poll interval.
        h.scheduler
            .schedule("ok", "0,15,45 * * * *", noop(), std::time::Duration::ZERO)
            .await
            .unwrap();

        // 5-minute cadence does not.
        let err = h
            .scheduler
            .schedule("fast", "0,5 * * * *", noop(), std::time::Duration::ZERO)
            .await
            .unwrap_err();
        match err {
            ScheduleError::Frequency { task_ms, poll_ms } => {
                assert_eq!(task_ms, 5 * 60 * 1000);
                assert_eq!(poll_ms, 600_000);
            }
            other => panic!("expected Frequency, got {other:?}"),
        }
        h.scheduler.stop();
    }

    #[tokio::test]
    async fn schedule_rejects_duplicate_bound_names() {
        let h = harness(fast_config());
        h.scheduler
            .schedule("t", "0 * * * *", noop(), std::time::Duration::ZERO)
            .await
            .unwrap();
        let err = h
            .scheduler
            .schedule("t", "0 * * * *", noop(), std::time::Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, ScheduleError::Duplicate { name } if name == "t"));
        h.scheduler.stop();
    }

    #[tokio::test]
    async fn schedule_persists_and_starts_engine() {
        let h = harness(fast_config());
        h.scheduler
            .schedule("t", "0 * * * *", noop(), std::time::Duration::from_millis(250))
            .await
            .unwrap();

        let state = h.store.state().expect("persisted");
        assert_eq!(state.version, 2);
        assert_eq!(state.tasks.len(), 1);
        assert_eq!(state.tasks[0].name, "t");
        assert_eq!(state.tasks[0].retry_delay_ms, 250);
        assert!(h
            .sink
            .events()
            .iter()
            .any(|e| matches!(e, SchedulerEvent::StatePersisted { task_count: 1 })));
        h.scheduler.stop();
    }

    #[tokio::test]
    async fn v1_document_migrates_on_load() {
        let h = harness(fast_config());
        h.store
            .seed(json!({"version": 1, "startTime": "2025-01-01T10:00:00Z"}));

        h.scheduler
            .schedule("t", "0 * * * *", noop(), std::time::Duration::ZERO)
            .await
            .unwrap();

        let events = h.sink.events();
        assert!(events
            .iter()
            .any(|e| matches!(e, SchedulerEvent::RuntimeStateMigrated { from: 1, to: 2 })));
        assert!(events
            .iter()
            .any(|e| matches!(e, SchedulerEvent::SchedulerStateLoaded { task_count: 0 })));

        // The mutation wrote a v2 document, preserving the original start.
        let state = h.store.state().unwrap();
        assert_eq!(state.version, 2);
        assert_eq!(
            state.start_time,
            Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap()
        );
        assert_eq!(state.tasks.len(), 1);
        h.scheduler.stop();
    }

    #[tokio::test]
    async fn persisted_duplicates_and_invalid_entries_are_skipped() {
        let h = harness(fast_config());
        h.store.seed(json!({
            "version": 2,
            "startTime": "2025-01-01T10:00:00Z",
            "tasks": [
                {"name": "d", "cronExpression": "0 * * * *", "retryDelayMs": 0},
                {"name": "d", "cronExpression": "30 * * * *", "retryDelayMs": 0},
                {"name": "u", "cronExpression": "0 0 * * *", "retryDelayMs": 0},
                {"name": "bad", "cronExpression": "*/9 * * * *", "retryDelayMs": 0},
            ],
        }));

        let listed = h.scheduler.list().await;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].name, "d");
        assert_eq!(listed[1].name, "u");

        let events = h.sink.events();
        assert!(events
            .iter()
            .any(|e| matches!(e, SchedulerEvent::DuplicateTaskSkipped { name } if name == "d")));
        assert!(events
            .iter()
            .any(|e| matches!(e, SchedulerEvent::SkippedInvalidTask { name, .. } if name == "bad")));
        assert!(events
            .iter()
            .any(|e| matches!(e, SchedulerEvent::SchedulerStateLoaded { task_count: 2 })));
    }

    #[tokio::test]
    async fn rescheduling_a_loaded_task_rebinds_and_keeps_timing() {
        let h = harness(fast_config());
        h.store.seed(json!({
            "version": 2,
            "startTime": "2025-01-01T10:00:00Z",
            "tasks": [
                {
                    "name": "t",
                    "cronExpression": "0 * * * *",
                    "retryDelayMs": 100,
                    "lastSuccessTime": "2021-03-01T11:30:00Z",
                    "lastAttemptTime": "2021-03-01T11:30:00Z",
                },
            ],
        }));

        h.scheduler
            .schedule("t", "30 * * * *", noop(), std::time::Duration::from_millis(900))
            .await
            .unwrap();
        h.scheduler.stop();

        let listed = h.scheduler.list().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].cron_expression, "30 * * * *");
        assert_eq!(
            listed[0].last_success_time.as_deref(),
            Some("2021-03-01T11:30:00.000Z")
        );

        let state = h.store.state().unwrap();
        assert_eq!(state.tasks[0].retry_delay_ms, 900);
        assert!(state.tasks[0].last_success_time.is_some());
        h.scheduler.stop();
    }

    #[tokio::test]
    async fn load_happens_at_most_once() {
        let h = harness(fast_config());
        h.store.seed(json!({
            "version": 2,
            "startTime": "2025-01-01T10:00:00Z",
            "tasks": [{"name": "t", "cronExpression": "0 * * * *", "retryDelayMs": 0}],
        }));

        h.scheduler.list().await;
        h.scheduler.list().await;
        h.scheduler.cancel("missing").await;

        let loads = h
            .sink
            .events()
            .iter()
            .filter(|e| matches!(e, SchedulerEvent::SchedulerStateLoaded { .. }))
            .count();
        assert_eq!(loads, 1);
    }

    #[tokio::test]
    async fn read_failure_is_soft_and_scheduling_continues() {
        let h = harness(fast_config());
        h.store.fail_reads(true);

        h.scheduler
            .schedule("t", "0 * * * *", noop(), std::time::Duration::ZERO)
            .await
            .unwrap();

        assert!(h
            .sink
            .events()
            .iter()
            .any(|e| matches!(e, SchedulerEvent::StateReadFailed { .. })));
        assert_eq!(h.scheduler.list().await.len(), 1);
        h.scheduler.stop();
    }

    #[tokio::test]
    async fn write_failure_during_schedule_is_soft() {
        let h = harness(fast_config());
        h.store.fail_writes(true);

        h.scheduler
            .schedule("t", "0 * * * *", noop(), std::time::Duration::ZERO)
            .await
            .unwrap();
        h.scheduler.stop();

        assert!(h
            .sink
            .events()
            .iter()
            .any(|e| matches!(e, SchedulerEvent::StateWriteFailed { .. })));
        assert_eq!(h.scheduler.list().await.len(), 1, "in-memory state kept");
    }

    #[tokio::test]
    async fn cancel_removes_and_stops_when_empty() {
        let h = harness(fast_config());
        h.scheduler
            .schedule("a", "0 * * * *", noop(), std::time::Duration::ZERO)
            .await
            .unwrap();
        h.scheduler
            .schedule("b", "0 0 * * *", noop(), std::time::Duration::ZERO)
            .await
            .unwrap();

        assert!(h.scheduler.cancel("a").await);
        assert!(!h.scheduler.cancel("a").await);
        assert_eq!(h.scheduler.list().await.len(), 1);

        assert!(h.scheduler.cancel("b").await);
        assert_eq!(h.scheduler.list().await.len(), 0);
        let state = h.store.state().unwrap();
        assert!(state.tasks.is_empty());
    }

    #[tokio::test]
    async fn cancel_all_clears_persists_and_reports_count() {
        let h = harness(fast_config());
        h.scheduler
            .schedule("a", "0 * * * *", noop(), std::time::Duration::ZERO)
            .await
            .unwrap();
        h.scheduler
            .schedule("b", "0 0 * * *", noop(), std::time::Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(h.scheduler.cancel_all().await, 2);
        assert_eq!(h.scheduler.cancel_all().await, 0);
        assert!(h
            .sink
            .events()
            .iter()
            .any(|e| matches!(e, SchedulerEvent::CancelAllPersisted { task_count: 2 })));
        assert!(h.store.state().unwrap().tasks.is_empty());
    }

    #[tokio::test]
    async fn list_reports_mode_hints_and_next_firing() {
        let h = harness(fast_config());
        // Never-attempted hourly task with a recent firing, a task whose
        // success postdates its firing, and a task with an arrived retry
        // deadline. The clock sits at 2021-03-01T12:00:00Z.
        h.store.seed(json!({
            "version": 2,
            "startTime": "2025-01-01T10:00:00Z",
            "tasks": [
                {"name": "due", "cronExpression": "0 * * * *", "retryDelayMs": 0},
                {
                    "name": "quiet",
                    "cronExpression": "0 0 * * *",
                    "retryDelayMs": 0,
                    "lastSuccessTime": "2021-03-01T00:00:30Z",
                    "lastAttemptTime": "2021-03-01T00:00:30Z",
                },
                {
                    "name": "retrying",
                    "cronExpression": "0 0 * * *",
                    "retryDelayMs": 1000,
                    "lastFailureTime": "2021-03-01T10:59:59Z",
                    "lastAttemptTime": "2021-03-01T10:59:59Z",
                    "pendingRetryUntil": "2021-03-01T11:00:00Z",
                },
            ],
        }));

        let listed = h.scheduler.list().await;
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[0].name, "due");
        assert_eq!(listed[0].mode_hint, ModeHint::Cron);
        assert_eq!(
            listed[0].next_firing_time.as_deref(),
            Some("2021-03-01T13:00:00.000Z")
        );
        assert!(!listed[0].running);

        assert_eq!(listed[1].name, "quiet");
        assert_eq!(listed[1].mode_hint, ModeHint::Idle);

        assert_eq!(listed[2].name, "retrying");
        assert_eq!(listed[2].mode_hint, ModeHint::Retry);
        assert_eq!(
            listed[2].pending_retry_until.as_deref(),
            Some("2021-03-01T11:00:00.000Z")
        );

        // Past the next midnight firing, the quiet task reads as due again.
        h.clock
            .set(Utc.with_ymd_and_hms(2021, 3, 2, 0, 5, 0).unwrap());
        let listed = h.scheduler.list().await;
        assert_eq!(listed[1].mode_hint, ModeHint::Cron);
    }

    #[tokio::test]
    async fn config_defaults() {
        let config: SchedulerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.poll_interval_ms, 600_000);
        assert_eq!(config.max_concurrent_tasks, 10);

        let config = SchedulerConfig::default();
        assert_eq!(config.poll_interval_ms, 600_000);
        assert_eq!(config.max_concurrent_tasks, 10);
    }
}
