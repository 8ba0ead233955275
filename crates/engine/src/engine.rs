//! Drives task executions through `pending -> running -> completed | failed | cancelled`.
//!
//! Live executions sit in a table guarded by one async lock. Every mutation is persisted before
//! the lock is released and no transition leaves a terminal state.

use async_trait::async_trait;
use autobrowse_browser::{classify_launch_failure, BrowserProcessManager, PageDriver};
use autobrowse_core::config::EngineConfig;
use autobrowse_core::{
    Error, Execution, ExecutionStatus, LogEntry, LogLevel, Progress, RecordStore, Result, Task,
    TaskDispatcher,
};
use autobrowse_deps::manifest::rhai_module;
use autobrowse_deps::DependencyInstallQueue;
use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info, warn};

use crate::events::ExecutionEvent;
use crate::result_cache::{CachedResult, ResultCache};
use crate::sandbox::{ScriptContext, ScriptModule, ScriptObserver, ScriptSandbox};
use crate::validate::{validate_parameters, validate_schema, validate_script};

struct LiveExecution {
    record: Execution,
    cancelled: Arc<AtomicBool>,
    status: watch::Sender<ExecutionStatus>,
}

struct Inner {
    store: Arc<dyn RecordStore>,
    browsers: BrowserProcessManager,
    deps: Arc<DependencyInstallQueue>,
    sandbox: ScriptSandbox,
    results: ResultCache,
    config: EngineConfig,
    live: Mutex<HashMap<String, LiveExecution>>,
    events: broadcast::Sender<ExecutionEvent>,
}

#[derive(Clone)]
pub struct TaskExecutionEngine {
    inner: Arc<Inner>,
}

impl TaskExecutionEngine {
    pub fn new(
        store: Arc<dyn RecordStore>,
        browsers: BrowserProcessManager,
        deps: Arc<DependencyInstallQueue>,
        results_dir: PathBuf,
        config: EngineConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(Inner {
                store,
                browsers,
                deps,
                sandbox: ScriptSandbox::new(config.clone()),
                results: ResultCache::new(results_dir),
                config,
                live: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.inner.events.subscribe()
    }

    // ─── Tasks ──────────────────────────────────────────────────────────

    /// Create or replace a task after checking its script and parameter schema.
    pub async fn save_task(&self, mut task: Task) -> Result<Task> {
        if task.name.trim().is_empty() {
            return Err(Error::Validation("Task name must not be empty".to_string()));
        }
        validate_script(&self.inner.config, &task.script)?;
        validate_schema(&task.parameters)?;
        if let Some(dep) = task.dependencies.iter().find(|d| d.name.trim().is_empty()) {
            return Err(Error::Validation(format!("Invalid dependency '{}'", dep)));
        }
        if let Some(existing) = self.inner.store.get_task(&task.id).await? {
            task.created_at = existing.created_at;
        }
        task.updated_at = Utc::now();
        self.inner.store.save_task(&task).await?;
        info!(task_id = %task.id, name = %task.name, "Task saved");
        Ok(task)
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Task> {
        self.inner
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Task {}", task_id)))
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>> {
        self.inner.store.list_tasks().await
    }

    /// Delete a task with no live executions, with its cached results and package references.
    pub async fn delete_task(&self, task_id: &str) -> Result<()> {
        {
            let live = self.inner.live.lock().await;
            if live.values().any(|l| l.record.task_id == task_id) {
                return Err(Error::InvalidState(format!(
                    "Task {} has executions in progress",
                    task_id
                )));
            }
        }
        if !self.inner.store.delete_task(task_id).await? {
            return Err(Error::NotFound(format!("Task {}", task_id)));
        }
        if let Err(e) = self.inner.results.remove_task(task_id) {
            warn!(task_id, error = %e, "Failed to remove cached results");
        }
        self.inner.deps.cache().release(task_id).await;
        info!(task_id, "Task deleted");
        Ok(())
    }

    // ─── Executions ─────────────────────────────────────────────────────

    /// Fail executions a previous process left `pending` or `running`, and release the package
    /// references their tasks held. Returns how many were failed.
    pub async fn reset_stale(&self) -> Result<usize> {
        let stale = self.inner.store.list_unfinished_executions().await?;
        let mut tasks = BTreeSet::new();
        let mut count = 0;
        {
            let live = self.inner.live.lock().await;
            for mut execution in stale {
                if live.contains_key(&execution.id) {
                    continue;
                }
                warn!(execution_id = %execution.id, status = %execution.status, "Failing interrupted execution");
                execution.status = ExecutionStatus::Failed;
                execution.error = Some("Execution was interrupted by a restart".to_string());
                execution.end_time = Some(Utc::now());
                self.inner.store.save_execution(&execution).await?;
                tasks.insert(execution.task_id);
                count += 1;
            }
            tasks.retain(|task_id| !live.values().any(|l| &l.record.task_id == task_id));
        }
        for task_id in tasks {
            self.inner.deps.cache().release(&task_id).await;
            if let Err(e) = self.inner.deps.cleanup(&task_id).await {
                warn!(task_id = %task_id, error = %e, "Failed to remove install workspace");
            }
        }
        if count > 0 {
            info!(count, "Interrupted executions marked failed");
        }
        Ok(count)
    }

    /// Validate and start an execution. Returns the pending record immediately.
    pub async fn execute(
        &self,
        task_id: &str,
        browser_id: &str,
        parameters: Value,
    ) -> Result<Execution> {
        let task = self.get_task(task_id).await?;
        validate_script(&self.inner.config, &task.script)?;
        let parameters = validate_parameters(&task.parameters, parameters)?;
        if self.inner.store.get_profile(browser_id).await?.is_none() {
            return Err(Error::NotFound(format!("Browser profile {}", browser_id)));
        }

        let execution = Execution::pending(task_id, browser_id, parameters.clone());
        let cancelled = Arc::new(AtomicBool::new(false));
        {
            let mut live = self.inner.live.lock().await;
            self.inner.store.save_execution(&execution).await?;
            let (status, _) = watch::channel(ExecutionStatus::Pending);
            live.insert(
                execution.id.clone(),
                LiveExecution {
                    record: execution.clone(),
                    cancelled: cancelled.clone(),
                    status,
                },
            );
        }
        info!(execution_id = %execution.id, task_id, browser_id, "Execution accepted");

        let inner = self.inner.clone();
        let execution_id = execution.id.clone();
        tokio::spawn(async move {
            inner.run(execution_id, task, parameters, cancelled).await;
        });
        Ok(execution)
    }

    /// Cancel a running execution. The script keeps running until it observes `is_cancelled()`.
    pub async fn cancel(&self, execution_id: &str) -> Result<Execution> {
        let mut live = self.inner.live.lock().await;
        let Some(entry) = live.get_mut(execution_id) else {
            drop(live);
            let stored = self.get(execution_id).await?;
            return Err(Error::InvalidState(format!(
                "Execution {} is {}",
                execution_id, stored.status
            )));
        };
        if entry.record.status != ExecutionStatus::Running {
            return Err(Error::InvalidState(format!(
                "Execution {} is {}",
                execution_id, entry.record.status
            )));
        }
        entry.cancelled.store(true, Ordering::SeqCst);
        self.inner
            .set_status(entry, ExecutionStatus::Cancelled, |e| {
                e.end_time = Some(Utc::now());
            })
            .await;
        info!(execution_id, "Execution cancelled");
        Ok(entry.record.clone())
    }

    pub async fn get(&self, execution_id: &str) -> Result<Execution> {
        if let Some(entry) = self.inner.live.lock().await.get(execution_id) {
            return Ok(entry.record.clone());
        }
        self.inner
            .store
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Execution {}", execution_id)))
    }

    /// Executions of a task, newest first.
    pub async fn list_by_task(&self, task_id: &str) -> Result<Vec<Execution>> {
        self.inner.store.list_executions(task_id).await
    }

    /// Wait until the execution reaches a terminal state.
    pub async fn wait(&self, execution_id: &str) -> Result<Execution> {
        let rx = self
            .inner
            .live
            .lock()
            .await
            .get(execution_id)
            .map(|entry| entry.status.subscribe());
        if let Some(mut rx) = rx {
            let _ = rx.wait_for(|s| s.is_terminal()).await;
        }
        self.get(execution_id).await
    }

    /// Result of an earlier completed run with equivalent parameters.
    pub async fn cached_result(
        &self,
        task_id: &str,
        parameters: Value,
    ) -> Result<Option<CachedResult>> {
        let task = self.get_task(task_id).await?;
        let parameters = validate_parameters(&task.parameters, parameters)?;
        Ok(self.inner.results.get(task_id, &parameters))
    }
}

#[async_trait]
impl TaskDispatcher for TaskExecutionEngine {
    async fn dispatch(&self, task_id: &str, browser_id: &str, parameters: Value) -> Result<String> {
        Ok(self.execute(task_id, browser_id, parameters).await?.id)
    }
}

impl Inner {
    async fn persist(&self, execution: &Execution) {
        if let Err(e) = self.store.save_execution(execution).await {
            warn!(execution_id = %execution.id, error = %e, "Failed to persist execution");
        }
    }

    async fn set_status(
        &self,
        entry: &mut LiveExecution,
        new: ExecutionStatus,
        apply: impl FnOnce(&mut Execution) + Send,
    ) {
        let old = entry.record.status;
        entry.record.status = new;
        apply(&mut entry.record);
        self.persist(&entry.record).await;
        entry.status.send_replace(new);
        debug!(execution_id = %entry.record.id, %old, %new, "Execution status changed");
        let _ = self.events.send(ExecutionEvent::StatusChanged {
            execution_id: entry.record.id.clone(),
            task_id: entry.record.task_id.clone(),
            old,
            new,
            at: Utc::now(),
        });
    }

    /// Move to `new` unless the execution already reached a terminal state.
    async fn transition(
        &self,
        execution_id: &str,
        new: ExecutionStatus,
        apply: impl FnOnce(&mut Execution) + Send,
    ) -> bool {
        let mut live = self.live.lock().await;
        match live.get_mut(execution_id) {
            Some(entry) if !entry.record.status.is_terminal() => {
                self.set_status(entry, new, apply).await;
                true
            }
            _ => false,
        }
    }

    async fn run(
        self: Arc<Self>,
        execution_id: String,
        task: Task,
        parameters: Value,
        cancelled: Arc<AtomicBool>,
    ) {
        let started = self
            .transition(&execution_id, ExecutionStatus::Running, |e| {
                e.start_time = Some(Utc::now());
            })
            .await;
        if started {
            let (result, page) = self
                .drive(&execution_id, &task, &parameters, cancelled)
                .await;
            self.complete(&execution_id, &task, &parameters, result).await;

            if task.config.restore_browser_state {
                if let Some(page) = page {
                    match page.reset_state().await {
                        Ok(()) => debug!(execution_id = %execution_id, "Browser state restored"),
                        Err(e) => {
                            warn!(execution_id = %execution_id, error = %e, "Browser state restoration failed")
                        }
                    }
                }
            }
        }
        self.finish(&execution_id, &task).await;
    }

    async fn drive(
        &self,
        execution_id: &str,
        task: &Task,
        parameters: &Value,
        cancelled: Arc<AtomicBool>,
    ) -> (Result<Value>, Option<Arc<dyn PageDriver>>) {
        let browser_id = match self.live.lock().await.get(execution_id) {
            Some(entry) => entry.record.browser_id.clone(),
            None => return (Err(Error::NotFound(format!("Execution {}", execution_id))), None),
        };

        let page = match self.browsers.ensure_running(&browser_id).await {
            Ok(page) => page,
            Err(e) => {
                let message = match e {
                    Error::Browser(message) => message,
                    other => classify_launch_failure(&other.to_string()).message,
                };
                return (
                    Err(Error::Browser(format!("Browser unavailable: {}", message))),
                    None,
                );
            }
        };
        if cancelled.load(Ordering::SeqCst) {
            return (Err(cancelled_before_script()), Some(page));
        }

        let mut modules = Vec::new();
        if !task.dependencies.is_empty() {
            let report = self.deps.install_all(&task.dependencies, &task.id).await;
            if !report.is_success() {
                return (
                    Err(Error::Dependency(format!(
                        "Failed to resolve dependencies: {}",
                        report.failure_summary()
                    ))),
                    Some(page),
                );
            }
            modules = report
                .installed
                .iter()
                .filter_map(|entry| {
                    rhai_module(&entry.path).map(|path| ScriptModule {
                        name: entry.name.clone(),
                        path,
                    })
                })
                .collect();
            if cancelled.load(Ordering::SeqCst) {
                return (Err(cancelled_before_script()), Some(page));
            }
        }

        let timeout = Duration::from_secs(
            task.config
                .timeout_secs
                .unwrap_or(self.config.script_timeout_secs),
        );
        let observer = ExecutionObserver {
            inner: self,
            execution_id,
        };
        let ctx = ScriptContext {
            page: page.clone(),
            modules,
            cancelled,
            timeout,
        };
        let result = self
            .sandbox
            .run(&task.script, parameters.clone(), ctx, &observer)
            .await;
        (result, Some(page))
    }

    async fn complete(
        &self,
        execution_id: &str,
        task: &Task,
        parameters: &Value,
        result: Result<Value>,
    ) {
        match result {
            Ok(value) => {
                let stored = value.clone();
                let applied = self
                    .transition(execution_id, ExecutionStatus::Completed, move |e| {
                        e.end_time = Some(Utc::now());
                        e.result = Some(stored);
                    })
                    .await;
                if !applied {
                    info!(execution_id, "Execution already terminal, result discarded");
                    return;
                }
                info!(execution_id, task_id = %task.id, "Execution completed");
                if task.config.cache_result && self.config.result_cache && !value.is_null() {
                    if let Err(e) = self.results.put(&task.id, execution_id, parameters, &value) {
                        warn!(execution_id, error = %e, "Failed to cache result");
                    }
                }
            }
            Err(e) => {
                let message = e.to_string();
                warn!(execution_id, task_id = %task.id, error = %message, "Execution failed");
                let applied = self
                    .transition(execution_id, ExecutionStatus::Failed, move |rec| {
                        rec.end_time = Some(Utc::now());
                        rec.error = Some(message);
                    })
                    .await;
                if !applied {
                    debug!(execution_id, "Execution already terminal, failure discarded");
                }
            }
        }
    }

    /// Drop the live entry and, when no other execution of the task remains, its package use.
    async fn finish(&self, execution_id: &str, task: &Task) {
        let others = {
            let mut live = self.live.lock().await;
            live.remove(execution_id);
            live.values().any(|l| l.record.task_id == task.id)
        };
        if others || task.dependencies.is_empty() {
            return;
        }
        self.deps.cache().release(&task.id).await;
        if let Err(e) = self.deps.cleanup(&task.id).await {
            warn!(task_id = %task.id, error = %e, "Failed to remove install workspace");
        }
    }
}

fn cancelled_before_script() -> Error {
    Error::Execution("Cancelled before the script started".to_string())
}

struct ExecutionObserver<'a> {
    inner: &'a Inner,
    execution_id: &'a str,
}

#[async_trait]
impl ScriptObserver for ExecutionObserver<'_> {
    async fn log(&self, level: LogLevel, message: String) {
        let entry = LogEntry {
            level,
            message,
            time: Utc::now(),
        };
        let mut live = self.inner.live.lock().await;
        match live.get_mut(self.execution_id) {
            Some(live_entry) if !live_entry.record.status.is_terminal() => {
                live_entry.record.logs.push(entry.clone());
                self.inner.persist(&live_entry.record).await;
            }
            _ => {
                debug!(execution_id = self.execution_id, "Log after terminal state dropped");
                return;
            }
        }
        drop(live);
        debug!(execution_id = self.execution_id, level = ?entry.level, "{}", entry.message);
        let _ = self.inner.events.send(ExecutionEvent::Log {
            execution_id: self.execution_id.to_string(),
            entry,
        });
    }

    async fn progress(&self, progress: Progress) {
        let mut live = self.inner.live.lock().await;
        match live.get_mut(self.execution_id) {
            Some(live_entry) if !live_entry.record.status.is_terminal() => {
                live_entry.record.progress = Some(progress.clone());
                self.inner.persist(&live_entry.record).await;
            }
            _ => return,
        }
        drop(live);
        let _ = self.inner.events.send(ExecutionEvent::Progress {
            execution_id: self.execution_id.to_string(),
            progress,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autobrowse_browser::testing::{FakeLauncher, FakePage};
    use autobrowse_core::paths::Paths;
    use autobrowse_core::{LaunchConfig, PackageRequirement, ParamType, ParameterSpec};
    use autobrowse_deps::testing::FakePackageManager;
    use autobrowse_deps::DependencyCache;
    use autobrowse_storage::InMemoryStore;
    use serde_json::json;

    struct Harness {
        engine: TaskExecutionEngine,
        store: Arc<InMemoryStore>,
        launcher: Arc<FakeLauncher>,
        page: Arc<FakePage>,
        packages: Arc<FakePackageManager>,
        cache: Arc<DependencyCache>,
        deps: Arc<DependencyInstallQueue>,
        browser_id: String,
        _dir: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        harness_with(FakePackageManager::new()).await
    }

    async fn harness_with(packages: FakePackageManager) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::with_base(dir.path().to_path_buf());
        let store = Arc::new(InMemoryStore::new());
        let page = Arc::new(FakePage::new());
        let launcher = Arc::new(FakeLauncher::with_page(page.clone()));
        let browsers = BrowserProcessManager::new(store.clone(), launcher.clone(), paths.clone());
        let profile = browsers.create("test", LaunchConfig::default()).await.unwrap();

        let cache = Arc::new(
            DependencyCache::open(paths.deps_cache_dir(), 100, u64::MAX)
                .await
                .unwrap(),
        );
        let packages = Arc::new(packages);
        let deps = Arc::new(DependencyInstallQueue::new(
            cache.clone(),
            packages.clone(),
            paths.deps_work_dir(),
            2,
            Duration::from_secs(5),
        ));
        let engine = TaskExecutionEngine::new(
            store.clone(),
            browsers,
            deps.clone(),
            paths.results_dir(),
            EngineConfig::default(),
        );
        Harness {
            engine,
            store,
            launcher,
            page,
            packages,
            cache,
            deps,
            browser_id: profile.id,
            _dir: dir,
        }
    }

    async fn task(h: &Harness, script: &str, configure: impl FnOnce(&mut Task)) -> Task {
        let mut task = Task::new("t", script);
        configure(&mut task);
        h.engine.save_task(task).await.unwrap()
    }

    async fn wait_until_running(events: &mut broadcast::Receiver<ExecutionEvent>, id: &str) {
        loop {
            match events.recv().await.unwrap() {
                ExecutionEvent::StatusChanged { execution_id, new, .. }
                    if execution_id == id && new == ExecutionStatus::Running =>
                {
                    return
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_successful_run() {
        let h = harness().await;
        h.page.set_element("h1", "Hello");
        let task = task(
            &h,
            r#"fn run(params) { log("visiting " + params.url); navigate(params.url); progress(1, 1, "ok"); #{ heading: get_text("h1") } }"#,
            |_| {},
        )
        .await;

        let pending = h
            .engine
            .execute(&task.id, &h.browser_id, json!({"url": "https://example.com"}))
            .await
            .unwrap();
        assert_eq!(pending.status, ExecutionStatus::Pending);

        let done = h.engine.wait(&pending.id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(done.result, Some(json!({"heading": "Hello"})));
        assert!(done.start_time.is_some() && done.end_time.is_some());
        assert_eq!(done.logs[0].message, "visiting https://example.com");
        assert_eq!(done.progress.unwrap().message, "ok");
        assert_eq!(h.launcher.launch_count(), 1);

        let stored = h.store.get_execution(&pending.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Completed);
        assert_eq!(h.engine.list_by_task(&task.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_validation_rejects_before_execution_exists() {
        let h = harness().await;
        let task = task(&h, "fn run(params) { params.n }", |t| {
            t.parameters = vec![ParameterSpec {
                name: "n".to_string(),
                kind: ParamType::Integer,
                required: true,
                default: None,
                description: None,
            }];
        })
        .await;

        let err = h
            .engine
            .execute(&task.id, &h.browser_id, json!({"n": "x"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
        assert!(h.engine.execute(&task.id, &h.browser_id, json!({})).await.is_err());
        assert!(h.engine.list_by_task(&task.id).await.unwrap().is_empty());

        // Stored directly, bypassing save_task checks
        let broken = Task::new("broken", "fn main() {}");
        h.store.save_task(&broken).await.unwrap();
        let err = h
            .engine
            .execute(&broken.id, &h.browser_id, json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
        assert!(h.engine.save_task(Task::new("x", "let a = ;")).await.is_err());
    }

    #[tokio::test]
    async fn test_throwing_script_fails_and_still_restores() {
        let h = harness().await;
        let task = task(&h, r#"fn run() { throw "boom"; }"#, |t| {
            t.config.restore_browser_state = true;
        })
        .await;

        let exec = h.engine.execute(&task.id, &h.browser_id, Value::Null).await.unwrap();
        let done = h.engine.wait(&exec.id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Failed);
        assert!(done.error.unwrap().contains("boom"));
        assert!(done.end_time.is_some());

        // Restoration runs after the terminal write
        for _ in 0..50 {
            if h.page.reset_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.page.reset_count(), 1);
    }

    #[tokio::test]
    async fn test_restoration_failure_is_not_fatal() {
        let h = harness().await;
        h.page.fail_reset(true);
        let task = task(&h, "fn run() { 42 }", |t| {
            t.config.restore_browser_state = true;
        })
        .await;
        let exec = h.engine.execute(&task.id, &h.browser_id, Value::Null).await.unwrap();
        let done = h.engine.wait(&exec.id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(done.result, Some(json!(42)));
    }

    #[tokio::test]
    async fn test_cancel_is_terminal() {
        let h = harness().await;
        let task = task(
            &h,
            r#"fn run() { while !is_cancelled() { wait(5); } log("still here"); progress(1, 1, "late"); "finished anyway" }"#,
            |_| {},
        )
        .await;
        let mut events = h.engine.subscribe();
        let exec = h.engine.execute(&task.id, &h.browser_id, Value::Null).await.unwrap();
        wait_until_running(&mut events, &exec.id).await;

        let cancelled = h.engine.cancel(&exec.id).await.unwrap();
        assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
        assert!(cancelled.end_time.is_some());

        let done = h.engine.wait(&exec.id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Cancelled);

        // The script returns after observing the flag; its result must not overwrite
        tokio::time::sleep(Duration::from_millis(100)).await;
        let after = h.engine.get(&exec.id).await.unwrap();
        assert_eq!(after.status, ExecutionStatus::Cancelled);
        assert!(after.result.is_none());
        assert!(after.logs.is_empty());
        assert!(after.progress.is_none());
        let stored = h.store.get_execution(&exec.id).await.unwrap().unwrap();
        assert!(stored.logs.is_empty());
        assert_eq!(h.engine.cancel(&exec.id).await.unwrap_err().kind(), "invalid_state");
    }

    #[tokio::test]
    async fn test_cancel_during_install_skips_script() {
        let h = harness_with(FakePackageManager::new().with_delay(Duration::from_millis(300))).await;
        h.page.set_element("body", "");
        let task = task(&h, r#"fn run() { click("body"); log("ran"); 1 }"#, |t| {
            t.dependencies = vec![PackageRequirement::new("slow-pkg", Some("1.0.0"))];
        })
        .await;
        let mut events = h.engine.subscribe();
        let exec = h.engine.execute(&task.id, &h.browser_id, Value::Null).await.unwrap();
        wait_until_running(&mut events, &exec.id).await;
        assert_eq!(
            h.engine.cancel(&exec.id).await.unwrap().status,
            ExecutionStatus::Cancelled
        );

        // The run winds down once the install returns and releases the task's reference
        let mut released = false;
        for _ in 0..200 {
            if let Some(entry) = h.cache.peek("slow-pkg", "1.0.0").await {
                if entry.used_by_tasks.is_empty() {
                    released = true;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(released);
        assert!(!h.page.calls().iter().any(|c| c.starts_with("click")));

        let done = h.engine.get(&exec.id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Cancelled);
        assert!(done.logs.is_empty());
        assert!(done.error.is_none());
    }

    #[tokio::test]
    async fn test_reset_stale_fails_interrupted_executions() {
        let h = harness().await;
        let task = task(&h, "fn run() { 1 }", |t| {
            t.dependencies = vec![PackageRequirement::new("left-over", Some("1.0.0"))];
        })
        .await;
        assert!(h.deps.install_all(&task.dependencies, &task.id).await.is_success());

        let mut running = Execution::pending(&task.id, &h.browser_id, json!({}));
        running.status = ExecutionStatus::Running;
        running.start_time = Some(Utc::now());
        let pending = Execution::pending(&task.id, &h.browser_id, json!({}));
        let mut finished = Execution::pending(&task.id, &h.browser_id, json!({}));
        finished.status = ExecutionStatus::Completed;
        for e in [&running, &pending, &finished] {
            h.store.save_execution(e).await.unwrap();
        }

        assert_eq!(h.engine.reset_stale().await.unwrap(), 2);
        for id in [&running.id, &pending.id] {
            let e = h.engine.get(id).await.unwrap();
            assert_eq!(e.status, ExecutionStatus::Failed);
            assert!(e.error.unwrap().contains("interrupted"));
            assert!(e.end_time.is_some());
        }
        assert_eq!(
            h.engine.get(&finished.id).await.unwrap().status,
            ExecutionStatus::Completed
        );
        let entry = h.cache.peek("left-over", "1.0.0").await.unwrap();
        assert!(entry.used_by_tasks.is_empty());

        let err = h.engine.cancel(&running.id).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_state");
        assert!(err.to_string().contains("failed"));
        assert_eq!(h.engine.reset_stale().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_browser_failure_is_classified() {
        let h = harness().await;
        h.launcher.fail_with("listen EADDRINUSE 127.0.0.1:9222");
        let task = task(&h, "fn run() { 1 }", |_| {}).await;
        let exec = h.engine.execute(&task.id, &h.browser_id, Value::Null).await.unwrap();
        let done = h.engine.wait(&exec.id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Failed);
        let error = done.error.unwrap();
        assert!(error.contains("Browser unavailable"));
        assert!(error.contains("port is already in use"));
    }

    #[tokio::test]
    async fn test_dependency_failure_skips_script() {
        let h = harness().await;
        h.packages.fail("bad-pkg");
        let task = task(&h, r#"fn run() { log("ran"); 1 }"#, |t| {
            t.dependencies = vec![PackageRequirement::new("bad-pkg", Some("1.0.0"))];
        })
        .await;
        let exec = h.engine.execute(&task.id, &h.browser_id, Value::Null).await.unwrap();
        let done = h.engine.wait(&exec.id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Failed);
        assert!(done.error.unwrap().contains("bad-pkg"));
        assert!(done.logs.is_empty());
    }

    #[tokio::test]
    async fn test_package_module_import_and_release() {
        let h = harness().await;
        h.packages
            .with_rhai_module("greeter", r#"fn greet(name) { "hello " + name }"#);
        let task = task(
            &h,
            r#"fn run() { import "greeter" as g; g::greet("bob") }"#,
            |t| t.dependencies = vec![PackageRequirement::new("greeter", Some("1.2.0"))],
        )
        .await;
        let exec = h.engine.execute(&task.id, &h.browser_id, Value::Null).await.unwrap();
        let done = h.engine.wait(&exec.id).await.unwrap();
        assert_eq!(done.result, Some(json!("hello bob")));

        for _ in 0..50 {
            let entry = h.cache.peek("greeter", "1.2.0").await.unwrap();
            if entry.used_by_tasks.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task reference was not released");
    }

    #[tokio::test]
    async fn test_result_cache_uses_canonical_parameters() {
        let h = harness().await;
        let task = task(&h, "fn run(params) { params.q + \"!\" }", |t| {
            t.config.cache_result = true;
            t.parameters = vec![
                ParameterSpec {
                    name: "q".to_string(),
                    kind: ParamType::String,
                    required: true,
                    default: None,
                    description: None,
                },
                ParameterSpec {
                    name: "limit".to_string(),
                    kind: ParamType::Integer,
                    required: false,
                    default: Some(json!(10)),
                    description: None,
                },
            ];
        })
        .await;
        let exec = h
            .engine
            .execute(&task.id, &h.browser_id, json!({"q": "rust"}))
            .await
            .unwrap();
        h.engine.wait(&exec.id).await.unwrap();

        let cached = h
            .engine
            .cached_result(&task.id, json!({"limit": 10, "q": "rust"}))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cached.result, json!("rust!"));
        assert_eq!(cached.execution_id, exec.id);
        assert!(h
            .engine
            .cached_result(&task.id, json!({"q": "go"}))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_dispatch_and_delete_task() {
        let h = harness().await;
        let task = task(&h, "fn run() { 1 }", |_| {}).await;
        let id = h
            .engine
            .dispatch(&task.id, &h.browser_id, Value::Null)
            .await
            .unwrap();
        h.engine.wait(&id).await.unwrap();

        h.engine.delete_task(&task.id).await.unwrap();
        assert!(matches!(
            h.engine.get_task(&task.id).await,
            Err(Error::NotFound(_))
        ));
        assert!(h
            .engine
            .execute(&task.id, &h.browser_id, Value::Null)
            .await
            .is_err());
    }
}
