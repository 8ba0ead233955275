//! Schedule table and the coordinator loop that fires due schedules through a [`TaskDispatcher`].

use autobrowse_core::types::new_id;
use autobrowse_core::{Error, RecordStore, Result, ScheduleSpec, ScheduledTask, TaskDispatcher};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Notify};
use tracing::{debug, info, warn};

use crate::next_run::{next_run, validate_spec};

/// Stale heap items tolerated beyond twice the armed count before the heap is rebuilt.
const HEAP_SLACK: usize = 32;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRequest {
    #[serde(default)]
    pub name: String,
    pub task_id: String,
    pub browser_id: String,
    pub spec: ScheduleSpec,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub max_executions: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum SchedulerEvent {
    #[serde(rename_all = "camelCase")]
    Fired {
        schedule_id: String,
        execution_id: String,
        execution_count: u64,
        at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    FireFailed {
        schedule_id: String,
        error: String,
        at: DateTime<Utc>,
    },
    /// The schedule ran out of iterations, executions or time and was deactivated.
    #[serde(rename_all = "camelCase")]
    Completed {
        schedule_id: String,
        execution_count: u64,
        at: DateTime<Utc>,
    },
}

struct Entry {
    record: ScheduledTask,
    /// Generation of the live heap entry. `None` when disarmed.
    generation: Option<u64>,
}

#[derive(Default)]
struct State {
    entries: HashMap<String, Entry>,
    heap: BinaryHeap<Reverse<(DateTime<Utc>, u64, String)>>,
    generation: u64,
}

impl State {
    fn arm(&mut self, id: &str) {
        self.generation += 1;
        let generation = self.generation;
        if let Some(entry) = self.entries.get_mut(id) {
            match entry.record.next_execution_time {
                Some(at) if entry.record.is_active => {
                    entry.generation = Some(generation);
                    self.heap.push(Reverse((at, generation, id.to_string())));
                }
                _ => entry.generation = None,
            }
        }
        self.compact();
    }

    fn disarm(&mut self, id: &str) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.generation = None;
        }
        self.compact();
    }

    /// Drop heap items superseded by a later arm, a pause or a delete.
    fn compact(&mut self) {
        let armed = self
            .entries
            .values()
            .filter(|e| e.generation.is_some())
            .count();
        if self.heap.len() <= armed * 2 + HEAP_SLACK {
            return;
        }
        let entries = &self.entries;
        self.heap.retain(|Reverse((_, generation, id))| {
            entries
                .get(id)
                .map_or(false, |e| e.generation == Some(*generation))
        });
        debug!(remaining = self.heap.len(), "Schedule heap compacted");
    }

    fn entry(&mut self, id: &str) -> Result<&mut Entry> {
        self.entries
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("Schedule {}", id)))
    }
}

fn limit_reached(record: &ScheduledTask) -> bool {
    let count = record.execution_count;
    let iterations = !record.spec.kind.is_single_shot()
        && record.spec.max_iterations.map_or(false, |max| count >= max);
    iterations || record.max_executions.map_or(false, |max| count >= max)
}

fn exhausted(record: &ScheduledTask) -> bool {
    (record.spec.kind.is_single_shot() && record.execution_count > 0) || limit_reached(record)
}

struct Inner {
    store: Arc<dyn RecordStore>,
    dispatcher: Arc<dyn TaskDispatcher>,
    state: Mutex<State>,
    wake: Notify,
    events: broadcast::Sender<SchedulerEvent>,
    idle_wake: Duration,
}

/// Time-based trigger for task executions.
///
/// All armed schedules share one min-heap of due times polled by [`TaskScheduler::run_loop`].
/// Disarming only bumps the entry's generation; stale heap items are skipped when popped.
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<Inner>,
}

impl TaskScheduler {
    pub fn new(
        store: Arc<dyn RecordStore>,
        dispatcher: Arc<dyn TaskDispatcher>,
        idle_wake: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                store,
                dispatcher,
                state: Mutex::new(State::default()),
                wake: Notify::new(),
                events,
                idle_wake,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.inner.events.subscribe()
    }

    pub async fn schedule(&self, request: ScheduleRequest) -> Result<ScheduledTask> {
        validate_spec(&request.spec)?;
        if self.inner.store.get_task(&request.task_id).await?.is_none() {
            return Err(Error::NotFound(format!("Task {}", request.task_id)));
        }
        if self.inner.store.get_profile(&request.browser_id).await?.is_none() {
            return Err(Error::NotFound(format!(
                "Browser profile {}",
                request.browser_id
            )));
        }

        let now = Utc::now();
        let next = next_run(&request.spec, now)?.ok_or_else(|| {
            Error::Validation("Schedule has no run before its endAt".to_string())
        })?;
        let record = ScheduledTask {
            id: new_id(),
            name: request.name,
            task_id: request.task_id,
            spec: request.spec,
            browser_id: request.browser_id,
            parameters: request.parameters,
            is_active: true,
            next_execution_time: Some(next),
            last_execution_time: None,
            execution_count: 0,
            max_executions: request.max_executions,
            last_error: None,
            created_at: now,
            updated_at: now,
        };

        let mut state = self.inner.state.lock().await;
        self.inner.store.insert_schedule(&record).await?;
        state.entries.insert(
            record.id.clone(),
            Entry {
                record: record.clone(),
                generation: None,
            },
        );
        state.arm(&record.id);
        drop(state);
        self.inner.wake.notify_one();

        info!(schedule_id = %record.id, task_id = %record.task_id, next = %next, "Schedule created");
        Ok(record)
    }

    /// Disarm and deactivate, keeping count and next-time history.
    pub async fn pause(&self, id: &str) -> Result<ScheduledTask> {
        let mut state = self.inner.state.lock().await;
        let entry = state.entry(id)?;
        if entry.record.is_active {
            entry.record.is_active = false;
            entry.record.updated_at = Utc::now();
            self.inner.persist(&entry.record).await;
            info!(schedule_id = id, "Schedule paused");
        }
        let record = entry.record.clone();
        state.disarm(id);
        Ok(record)
    }

    /// Re-arm from now, not from the original timeline.
    pub async fn resume(&self, id: &str) -> Result<ScheduledTask> {
        let mut state = self.inner.state.lock().await;
        let entry = state.entry(id)?;
        if entry.record.is_active {
            return Ok(entry.record.clone());
        }
        if exhausted(&entry.record) {
            return Err(Error::InvalidState(format!(
                "Schedule {} has already completed",
                id
            )));
        }
        let now = Utc::now();
        let next = next_run(&entry.record.spec, now)?.ok_or_else(|| {
            Error::InvalidState(format!("Schedule {} has no future run", id))
        })?;
        entry.record.is_active = true;
        entry.record.next_execution_time = Some(next);
        entry.record.updated_at = now;
        self.inner.persist(&entry.record).await;
        let record = entry.record.clone();
        state.arm(id);
        drop(state);
        self.inner.wake.notify_one();
        info!(schedule_id = id, next = %next, "Schedule resumed");
        Ok(record)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let removed = state.entries.remove(id).is_some();
        state.compact();
        let deleted = self.inner.store.delete_schedule(id).await?;
        if !removed && !deleted {
            return Err(Error::NotFound(format!("Schedule {}", id)));
        }
        info!(schedule_id = id, "Schedule deleted");
        Ok(())
    }

    /// Fire once now without moving the armed timer. Returns the execution id.
    pub async fn run_now(&self, id: &str) -> Result<String> {
        let mut state = self.inner.state.lock().await;
        state.entry(id)?;
        self.inner.fire(&mut state, id, Utc::now(), true).await
    }

    pub async fn list(&self) -> Vec<ScheduledTask> {
        let state = self.inner.state.lock().await;
        let mut records: Vec<ScheduledTask> =
            state.entries.values().map(|e| e.record.clone()).collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records
    }

    pub async fn get(&self, id: &str) -> Result<ScheduledTask> {
        let mut state = self.inner.state.lock().await;
        Ok(state.entry(id)?.record.clone())
    }

    /// Impose (or lift) a cap on total firings. Deactivates at once if already reached.
    pub async fn set_max_executions(&self, id: &str, max: Option<u64>) -> Result<ScheduledTask> {
        let mut state = self.inner.state.lock().await;
        let entry = state.entry(id)?;
        entry.record.max_executions = max;
        entry.record.updated_at = Utc::now();
        if entry.record.is_active && limit_reached(&entry.record) {
            self.inner.complete(entry);
        }
        self.inner.persist(&entry.record).await;
        Ok(entry.record.clone())
    }

    /// Load persisted schedules and re-arm every active one from now.
    pub async fn restore(&self) -> Result<usize> {
        let records = self.inner.store.list_schedules().await?;
        let now = Utc::now();
        let mut state = self.inner.state.lock().await;
        *state = State::default();

        let mut armed = 0;
        for mut record in records {
            if record.is_active {
                let next = if exhausted(&record) {
                    None
                } else {
                    match next_run(&record.spec, now) {
                        Ok(next) => next,
                        Err(e) => {
                            warn!(schedule_id = %record.id, error = %e, "Schedule spec no longer valid");
                            None
                        }
                    }
                };
                record.next_execution_time = next;
                record.is_active = next.is_some();
                record.updated_at = now;
                self.inner.persist(&record).await;
            }
            let id = record.id.clone();
            let active = record.is_active;
            state.entries.insert(
                id.clone(),
                Entry {
                    record,
                    generation: None,
                },
            );
            if active {
                state.arm(&id);
                armed += 1;
            }
        }
        let total = state.entries.len();
        drop(state);
        self.inner.wake.notify_one();
        info!(total, armed, "Schedules restored");
        Ok(armed)
    }

    /// Fire every armed schedule due at or before `now`. Returns how many fired.
    pub async fn fire_due(&self, now: DateTime<Utc>) -> usize {
        let mut state = self.inner.state.lock().await;
        let mut fired = 0;
        while let Some(Reverse((at, generation, id))) = state.heap.peek().cloned() {
            if at > now {
                break;
            }
            state.heap.pop();
            match state.entries.get_mut(&id) {
                Some(entry) if entry.generation == Some(generation) && entry.record.is_active => {
                    entry.generation = None;
                }
                _ => continue,
            }
            let _ = self.inner.fire(&mut state, &id, now, false).await;
            fired += 1;
        }
        fired
    }

    /// Poll the heap until `shutdown` fires.
    pub async fn run_loop(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(idle_wake_secs = self.inner.idle_wake.as_secs(), "TaskScheduler started");
        loop {
            self.fire_due(Utc::now()).await;

            let sleep_for = {
                let state = self.inner.state.lock().await;
                match state.heap.peek() {
                    Some(Reverse((at, _, _))) => (*at - Utc::now())
                        .to_std()
                        .unwrap_or(Duration::ZERO)
                        .min(self.inner.idle_wake),
                    None => self.inner.idle_wake,
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = self.inner.wake.notified() => {}
                _ = shutdown.recv() => {
                    info!("TaskScheduler shutting down");
                    break;
                }
            }
        }
    }
}

impl Inner {
    async fn persist(&self, record: &ScheduledTask) {
        match self.store.update_schedule(record).await {
            Ok(true) => {}
            Ok(false) => debug!(schedule_id = %record.id, "Schedule record gone, update skipped"),
            Err(e) => warn!(schedule_id = %record.id, error = %e, "Failed to persist schedule"),
        }
    }

    fn complete(&self, entry: &mut Entry) {
        entry.generation = None;
        entry.record.is_active = false;
        entry.record.next_execution_time = None;
        info!(
            schedule_id = %entry.record.id,
            executions = entry.record.execution_count,
            "Schedule completed"
        );
        let _ = self.events.send(SchedulerEvent::Completed {
            schedule_id: entry.record.id.clone(),
            execution_count: entry.record.execution_count,
            at: Utc::now(),
        });
    }

    /// Dispatch one firing and advance the schedule. `manual` firings leave the timer alone.
    async fn fire(
        &self,
        state: &mut State,
        id: &str,
        now: DateTime<Utc>,
        manual: bool,
    ) -> Result<String> {
        let entry = state.entry(id)?;
        let outcome = self
            .dispatcher
            .dispatch(
                &entry.record.task_id,
                &entry.record.browser_id,
                entry.record.parameters.clone(),
            )
            .await;

        let record = &mut entry.record;
        record.execution_count += 1;
        record.last_execution_time = Some(now);
        record.updated_at = now;
        match &outcome {
            Ok(execution_id) => {
                record.last_error = None;
                info!(schedule_id = id, execution_id = %execution_id, count = record.execution_count, "Schedule fired");
                let _ = self.events.send(SchedulerEvent::Fired {
                    schedule_id: id.to_string(),
                    execution_id: execution_id.clone(),
                    execution_count: record.execution_count,
                    at: now,
                });
            }
            Err(e) => {
                record.last_error = Some(e.to_string());
                warn!(schedule_id = id, error = %e, "Scheduled firing failed");
                let _ = self.events.send(SchedulerEvent::FireFailed {
                    schedule_id: id.to_string(),
                    error: e.to_string(),
                    at: now,
                });
            }
        }

        let mut rearm = false;
        if manual {
            if entry.record.is_active && limit_reached(&entry.record) {
                self.complete(entry);
            }
        } else if exhausted(&entry.record) {
            self.complete(entry);
        } else {
            match next_run(&entry.record.spec, now) {
                Ok(Some(next)) => {
                    entry.record.next_execution_time = Some(next);
                    rearm = true;
                }
                Ok(None) => self.complete(entry),
                Err(e) => {
                    warn!(schedule_id = id, error = %e, "Failed to compute next run");
                    entry.record.last_error = Some(e.to_string());
                    self.complete(entry);
                }
            }
        }
        self.persist(&entry.record).await;
        if rearm {
            state.arm(id);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use autobrowse_core::{BrowserProfile, LaunchConfig, Task};
    use autobrowse_storage::InMemoryStore;
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeDispatcher {
        calls: AtomicUsize,
        fail: AtomicBool,
    }

    impl FakeDispatcher {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TaskDispatcher for FakeDispatcher {
        async fn dispatch(&self, task_id: &str, _browser_id: &str, _parameters: Value) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::NotFound(format!("Task {}", task_id)));
            }
            Ok(format!("exec-{}", n))
        }
    }

    struct Harness {
        scheduler: TaskScheduler,
        store: Arc<InMemoryStore>,
        dispatcher: Arc<FakeDispatcher>,
        task_id: String,
        browser_id: String,
    }

    impl Harness {
        fn request(&self, spec: ScheduleSpec) -> ScheduleRequest {
            ScheduleRequest {
                name: "job".to_string(),
                task_id: self.task_id.clone(),
                browser_id: self.browser_id.clone(),
                spec,
                parameters: serde_json::json!({"q": 1}),
                max_executions: None,
            }
        }
    }

    async fn harness() -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let task = Task::new("t", "fn run() { 1 }");
        store.save_task(&task).await.unwrap();
        let profile = BrowserProfile::new("p", LaunchConfig::default());
        store.save_profile(&profile).await.unwrap();
        let dispatcher = Arc::new(FakeDispatcher::default());
        let scheduler = TaskScheduler::new(store.clone(), dispatcher.clone(), Duration::from_secs(1));
        Harness {
            scheduler,
            store,
            dispatcher,
            task_id: task.id,
            browser_id: profile.id,
        }
    }

    fn later(ms: i64) -> DateTime<Utc> {
        Utc::now() + ChronoDuration::milliseconds(ms)
    }

    #[tokio::test]
    async fn test_delayed_fires_exactly_once() {
        let h = harness().await;
        let s = h.scheduler.schedule(h.request(ScheduleSpec::delayed(1000))).await.unwrap();
        assert!(s.is_active);

        assert_eq!(h.scheduler.fire_due(Utc::now()).await, 0);
        assert_eq!(h.scheduler.fire_due(later(1500)).await, 1);

        let s = h.scheduler.get(&s.id).await.unwrap();
        assert!(!s.is_active);
        assert_eq!(s.execution_count, 1);
        assert!(s.last_execution_time.is_some());
        assert_eq!(h.scheduler.fire_due(later(60_000)).await, 0);
        assert_eq!(h.dispatcher.calls(), 1);

        let stored = h.store.get_schedule(&s.id).await.unwrap().unwrap();
        assert!(!stored.is_active);
    }

    #[tokio::test]
    async fn test_unbounded_interval_advances() {
        let h = harness().await;
        let s = h.scheduler.schedule(h.request(ScheduleSpec::interval(1000))).await.unwrap();

        let mut last_next = s.next_execution_time.unwrap();
        for i in 1..=5u64 {
            let fire_at = last_next + ChronoDuration::milliseconds(10);
            assert_eq!(h.scheduler.fire_due(fire_at).await, 1);
            let s = h.scheduler.get(&s.id).await.unwrap();
            assert_eq!(s.execution_count, i);
            let next = s.next_execution_time.unwrap();
            assert!(next > last_next);
            last_next = next;
        }
        assert!(h.scheduler.get(&s.id).await.unwrap().is_active);
    }

    #[tokio::test]
    async fn test_iteration_limit_completes() {
        let h = harness().await;
        let mut events = h.scheduler.subscribe();
        let mut spec = ScheduleSpec::interval(1000);
        spec.max_iterations = Some(2);
        let s = h.scheduler.schedule(h.request(spec)).await.unwrap();

        h.scheduler.fire_due(later(2000)).await;
        h.scheduler.fire_due(later(4000)).await;
        let s = h.scheduler.get(&s.id).await.unwrap();
        assert!(!s.is_active);
        assert_eq!(s.execution_count, 2);
        assert_eq!(h.scheduler.fire_due(later(10_000)).await, 0);

        let mut completed = false;
        while let Ok(event) = events.try_recv() {
            if let SchedulerEvent::Completed { execution_count, .. } = event {
                assert_eq!(execution_count, 2);
                completed = true;
            }
        }
        assert!(completed);
    }

    #[tokio::test]
    async fn test_failed_firing_keeps_schedule_armed() {
        let h = harness().await;
        h.dispatcher.fail.store(true, Ordering::SeqCst);
        let s = h.scheduler.schedule(h.request(ScheduleSpec::interval(1000))).await.unwrap();

        assert_eq!(h.scheduler.fire_due(later(1500)).await, 1);
        let s = h.scheduler.get(&s.id).await.unwrap();
        assert!(s.is_active);
        assert!(s.last_error.unwrap().contains("Task"));

        h.dispatcher.fail.store(false, Ordering::SeqCst);
        assert_eq!(h.scheduler.fire_due(later(5000)).await, 1);
        assert!(h.scheduler.get(&s.id).await.unwrap().last_error.is_none());
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let h = harness().await;
        let s = h.scheduler.schedule(h.request(ScheduleSpec::interval(1000))).await.unwrap();
        h.scheduler.fire_due(later(1500)).await;

        let paused = h.scheduler.pause(&s.id).await.unwrap();
        assert!(!paused.is_active);
        assert_eq!(paused.execution_count, 1);
        assert!(paused.next_execution_time.is_some());
        assert_eq!(h.scheduler.fire_due(later(60_000)).await, 0);

        let before = Utc::now();
        let resumed = h.scheduler.resume(&s.id).await.unwrap();
        assert!(resumed.is_active);
        assert!(resumed.next_execution_time.unwrap() > before);
        assert_eq!(h.scheduler.fire_due(later(60_000)).await, 1);
    }

    #[tokio::test]
    async fn test_heap_stays_bounded_across_pause_resume() {
        let h = harness().await;
        let s = h.scheduler.schedule(h.request(ScheduleSpec::cron("0 9 * * *"))).await.unwrap();
        for _ in 0..200 {
            h.scheduler.pause(&s.id).await.unwrap();
            h.scheduler.resume(&s.id).await.unwrap();
        }
        let heap_len = h.scheduler.inner.state.lock().await.heap.len();
        assert!(heap_len <= 2 + HEAP_SLACK, "heap grew to {}", heap_len);

        h.scheduler.delete(&s.id).await.unwrap();
        assert_eq!(h.scheduler.fire_due(later(2 * 86_400_000)).await, 0);
    }

    #[tokio::test]
    async fn test_restore_recomputes_from_now() {
        let h = harness().await;
        let delayed = h.scheduler.schedule(h.request(ScheduleSpec::delayed(5000))).await.unwrap();
        let fired = h.scheduler.schedule(h.request(ScheduleSpec::immediate())).await.unwrap();
        h.scheduler.fire_due(Utc::now()).await;
        let paused = h.scheduler.schedule(h.request(ScheduleSpec::interval(1000))).await.unwrap();
        h.scheduler.pause(&paused.id).await.unwrap();

        // Stale next time from a previous run
        let mut stale = h.store.get_schedule(&delayed.id).await.unwrap().unwrap();
        stale.next_execution_time = Some(Utc::now() - ChronoDuration::hours(1));
        h.store.update_schedule(&stale).await.unwrap();

        let dispatcher = Arc::new(FakeDispatcher::default());
        let restarted = TaskScheduler::new(h.store.clone(), dispatcher.clone(), Duration::from_secs(1));
        let before = Utc::now();
        assert_eq!(restarted.restore().await.unwrap(), 1);

        let delayed = restarted.get(&delayed.id).await.unwrap();
        assert!(delayed.next_execution_time.unwrap() >= before + ChronoDuration::milliseconds(5000));
        assert!(!restarted.get(&fired.id).await.unwrap().is_active);
        assert!(!restarted.get(&paused.id).await.unwrap().is_active);

        assert_eq!(restarted.fire_due(Utc::now()).await, 0);
        assert_eq!(restarted.fire_due(later(6000)).await, 1);
        assert_eq!(dispatcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_run_now_and_max_executions() {
        let h = harness().await;
        let s = h.scheduler.schedule(h.request(ScheduleSpec::interval(60_000))).await.unwrap();
        let armed_next = s.next_execution_time;

        let exec = h.scheduler.run_now(&s.id).await.unwrap();
        assert_eq!(exec, "exec-0");
        let s = h.scheduler.get(&s.id).await.unwrap();
        assert_eq!(s.execution_count, 1);
        assert_eq!(s.next_execution_time, armed_next);

        let s = h.scheduler.set_max_executions(&s.id, Some(1)).await.unwrap();
        assert!(!s.is_active);
        assert!(h.scheduler.resume(&s.id).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_and_validation() {
        let h = harness().await;
        let s = h.scheduler.schedule(h.request(ScheduleSpec::delayed(10))).await.unwrap();
        h.scheduler.delete(&s.id).await.unwrap();
        assert_eq!(h.scheduler.fire_due(later(1000)).await, 0);
        assert!(matches!(h.scheduler.delete(&s.id).await, Err(Error::NotFound(_))));
        assert!(h.store.get_schedule(&s.id).await.unwrap().is_none());

        let err = h
            .scheduler
            .schedule(h.request(ScheduleSpec::cron("61 * * * *")))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");

        let err = h
            .scheduler
            .schedule(h.request(ScheduleSpec::delayed(i64::MAX / 2)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");

        let mut request = h.request(ScheduleSpec::immediate());
        request.task_id = "missing".to_string();
        assert!(matches!(
            h.scheduler.schedule(request).await,
            Err(Error::NotFound(_))
        ));
        assert!(h.scheduler.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_run_loop_fires_and_stops() {
        let h = harness().await;
        let mut events = h.scheduler.subscribe();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let scheduler = h.scheduler.clone();
        let handle = tokio::spawn(async move { scheduler.run_loop(shutdown_rx).await });

        h.scheduler.schedule(h.request(ScheduleSpec::delayed(50))).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, SchedulerEvent::Fired { execution_count: 1, .. }));

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
