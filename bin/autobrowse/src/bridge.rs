//! JSON-lines request/response bridge over any async byte stream.
//!
//! Each input line is `{"id", "command", "params"}`. Each response is
//! `{"id", "success", "data"}` or `{"id", "success": false, "error": {"kind", "message"}}`.
//! Requests run concurrently, so responses may come back out of order. Status, progress and log
//! events are interleaved as `{"notification", "data"}` lines.

use autobrowse_core::{
    Error, LaunchConfig, PackageRequirement, ParameterSpec, Result, Task, TaskConfig,
};
use autobrowse_scheduler::ScheduleRequest;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use crate::app::Orchestrator;

#[derive(Debug, Deserialize)]
pub struct BridgeRequest {
    #[serde(default)]
    pub id: Value,
    pub command: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct BridgeError {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct BridgeResponse {
    pub id: Value,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<BridgeError>,
}

impl BridgeResponse {
    fn ok(id: Value, data: Value) -> Self {
        Self {
            id,
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn err(id: Value, error: &Error) -> Self {
        Self {
            id,
            success: false,
            data: None,
            error: Some(BridgeError {
                kind: error.kind().to_string(),
                message: error.to_string(),
            }),
        }
    }
}

/// Run one request on its own task so a panicking handler still yields a failure response.
async fn guarded<F>(id: Value, handler: F) -> BridgeResponse
where
    F: Future<Output = BridgeResponse> + Send + 'static,
{
    match tokio::spawn(handler).await {
        Ok(response) => response,
        Err(e) => {
            warn!(id = %id, error = %e, "Bridge command handler aborted");
            BridgeResponse::err(id, &Error::Other(format!("Command handler failed: {}", e)))
        }
    }
}

// ─── Params ──────────────────────────────────────────────────────────────

fn parse<T: DeserializeOwned>(params: Value) -> Result<T> {
    let params = if params.is_null() { json!({}) } else { params };
    serde_json::from_value(params).map_err(|e| Error::Validation(format!("Invalid params: {}", e)))
}

#[derive(Deserialize)]
struct IdParams {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskIdParams {
    task_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateBrowserParams {
    name: String,
    #[serde(default)]
    launch: LaunchConfig,
}

/// A requirement as `"name@range"` or as a full object.
#[derive(Deserialize)]
#[serde(untagged)]
enum RequirementInput {
    Spec(String),
    Full(PackageRequirement),
}

impl RequirementInput {
    fn resolve(self) -> Result<PackageRequirement> {
        match self {
            RequirementInput::Spec(spec) => PackageRequirement::parse(&spec)
                .ok_or_else(|| Error::Validation(format!("Invalid requirement '{}'", spec))),
            RequirementInput::Full(req) => Ok(req),
        }
    }
}

fn requirements(inputs: Vec<RequirementInput>) -> Result<Vec<PackageRequirement>> {
    inputs.into_iter().map(RequirementInput::resolve).collect()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskParams {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    script: Option<String>,
    #[serde(default)]
    parameters: Option<Vec<ParameterSpec>>,
    #[serde(default)]
    dependencies: Option<Vec<RequirementInput>>,
    #[serde(default)]
    config: Option<TaskConfig>,
}

impl TaskParams {
    /// Overwrite the fields present in the request.
    fn apply(self, task: &mut Task) -> Result<()> {
        if let Some(name) = self.name {
            task.name = name;
        }
        if let Some(description) = self.description {
            task.description = description;
        }
        if let Some(script) = self.script {
            task.script = script;
        }
        if let Some(parameters) = self.parameters {
            task.parameters = parameters;
        }
        if let Some(dependencies) = self.dependencies {
            task.dependencies = requirements(dependencies)?;
        }
        if let Some(config) = self.config {
            task.config = config;
        }
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteParams {
    task_id: String,
    browser_id: String,
    #[serde(default)]
    parameters: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MaxExecutionsParams {
    id: String,
    #[serde(default)]
    max_executions: Option<u64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DepsParams {
    #[serde(default)]
    requirements: Vec<RequirementInput>,
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    force: bool,
}

/// Task id used for installs requested outside any task.
pub const MANUAL_TASK_ID: &str = "manual";

// ─── Bridge ──────────────────────────────────────────────────────────────

pub struct CommandBridge {
    app: Arc<Orchestrator>,
}

impl CommandBridge {
    pub fn new(app: Arc<Orchestrator>) -> Self {
        Self { app }
    }

    pub async fn handle(&self, request: BridgeRequest) -> BridgeResponse {
        debug!(command = %request.command, "Bridge request");
        match self.dispatch(&request.command, request.params).await {
            Ok(data) => BridgeResponse::ok(request.id, data),
            Err(e) => {
                debug!(command = %request.command, error = %e, "Bridge request failed");
                BridgeResponse::err(request.id, &e)
            }
        }
    }

    pub async fn handle_line(&self, line: &str) -> BridgeResponse {
        match serde_json::from_str::<BridgeRequest>(line) {
            Ok(request) => self.handle(request).await,
            Err(e) => BridgeResponse::err(Value::Null, &Error::Json(e)),
        }
    }

    async fn dispatch(&self, command: &str, params: Value) -> Result<Value> {
        let app = &self.app;
        let data = match command {
            // Browsers
            "browser.create" => {
                let p: CreateBrowserParams = parse(params)?;
                json!(app.browsers.create(&p.name, p.launch).await?)
            }
            "browser.list" => json!(app.browsers.list().await?),
            "browser.open" => {
                let p: IdParams = parse(params)?;
                app.browsers.open(&p.id).await?;
                self.browser_status(&p.id).await?
            }
            "browser.close" => {
                let p: IdParams = parse(params)?;
                app.browsers.close(&p.id).await?;
                self.browser_status(&p.id).await?
            }
            "browser.status" => {
                let p: IdParams = parse(params)?;
                self.browser_status(&p.id).await?
            }
            "browser.delete" => {
                let p: IdParams = parse(params)?;
                app.browsers.delete(&p.id).await?;
                json!({ "id": p.id, "deleted": true })
            }

            // Tasks
            "task.create" => {
                let p: TaskParams = parse(params)?;
                let name = p.name.clone().unwrap_or_default();
                let mut task = Task::new(&name, "");
                if let Some(id) = p.id.clone() {
                    task.id = id;
                }
                p.apply(&mut task)?;
                json!(app.engine.save_task(task).await?)
            }
            "task.update" => {
                let p: TaskParams = parse(params)?;
                let id = p
                    .id
                    .clone()
                    .ok_or_else(|| Error::Validation("Missing task id".to_string()))?;
                let mut task = app.engine.get_task(&id).await?;
                p.apply(&mut task)?;
                json!(app.engine.save_task(task).await?)
            }
            "task.get" => {
                let p: IdParams = parse(params)?;
                json!(app.engine.get_task(&p.id).await?)
            }
            "task.list" => json!(app.engine.list_tasks().await?),
            "task.delete" => {
                let p: IdParams = parse(params)?;
                app.engine.delete_task(&p.id).await?;
                json!({ "id": p.id, "deleted": true })
            }
            "task.execute" => {
                let p: ExecuteParams = parse(params)?;
                json!(app.engine.execute(&p.task_id, &p.browser_id, p.parameters).await?)
            }
            "task.cached_result" => {
                let p: ExecuteParams = parse(params)?;
                json!(app.engine.cached_result(&p.task_id, p.parameters).await?)
            }

            // Executions
            "execution.get" => {
                let p: IdParams = parse(params)?;
                json!(app.engine.get(&p.id).await?)
            }
            "execution.list" => {
                let p: TaskIdParams = parse(params)?;
                json!(app.engine.list_by_task(&p.task_id).await?)
            }
            "execution.cancel" => {
                let p: IdParams = parse(params)?;
                json!(app.engine.cancel(&p.id).await?)
            }
            "execution.wait" => {
                let p: IdParams = parse(params)?;
                json!(app.engine.wait(&p.id).await?)
            }

            // Schedules
            "schedule.create" => {
                let request: ScheduleRequest = parse(params)?;
                json!(app.scheduler.schedule(request).await?)
            }
            "schedule.list" => json!(app.scheduler.list().await),
            "schedule.get" => {
                let p: IdParams = parse(params)?;
                json!(app.scheduler.get(&p.id).await?)
            }
            "schedule.pause" => {
                let p: IdParams = parse(params)?;
                json!(app.scheduler.pause(&p.id).await?)
            }
            "schedule.resume" => {
                let p: IdParams = parse(params)?;
                json!(app.scheduler.resume(&p.id).await?)
            }
            "schedule.delete" => {
                let p: IdParams = parse(params)?;
                app.scheduler.delete(&p.id).await?;
                json!({ "id": p.id, "deleted": true })
            }
            "schedule.run_now" => {
                let p: IdParams = parse(params)?;
                json!({ "executionId": app.scheduler.run_now(&p.id).await? })
            }
            "schedule.set_max_executions" => {
                let p: MaxExecutionsParams = parse(params)?;
                json!(app.scheduler.set_max_executions(&p.id, p.max_executions).await?)
            }

            // Dependencies
            "deps.check" => {
                let p: DepsParams = parse(params)?;
                json!(app.deps.check(&requirements(p.requirements)?).await)
            }
            "deps.install" => {
                let p: DepsParams = parse(params)?;
                let mut reqs = requirements(p.requirements)?;
                if reqs.is_empty() {
                    return Err(Error::Validation("No requirements given".to_string()));
                }
                for req in reqs.iter_mut() {
                    req.force |= p.force;
                }
                let task_id = p.task_id.as_deref().unwrap_or(MANUAL_TASK_ID);
                json!(app.deps.install_all(&reqs, task_id).await)
            }
            "deps.cleanup" => {
                let p: DepsParams = parse(params)?;
                match p.task_id {
                    Some(task_id) => {
                        let released = app.deps.cache().release(&task_id).await;
                        let removed = app.deps.cleanup(&task_id).await?;
                        json!({ "released": released, "workspaces": usize::from(removed) })
                    }
                    None => json!({ "released": 0, "workspaces": app.deps.cleanup_all().await? }),
                }
            }
            "deps.evict" => json!({ "removed": app.deps.cache().evict().await }),
            "deps.stats" => json!(app.deps.stats().await),

            other => {
                return Err(Error::Validation(format!("Unknown command '{}'", other)));
            }
        };
        Ok(data)
    }

    async fn browser_status(&self, id: &str) -> Result<Value> {
        let status = self.app.browsers.status(id).await?;
        let pid = self.app.browsers.pid(id).await;
        Ok(json!({ "id": id, "status": status, "pid": pid }))
    }

    /// Serve requests from `reader` until EOF, writing responses and notifications to `writer`.
    pub async fn serve<R, W>(self: Arc<Self>, reader: R, writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let writer = Arc::new(Mutex::new(writer));
        let forwarder = self.spawn_notifications(writer.clone());
        let mut in_flight = JoinSet::new();

        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let bridge = self.clone();
            let writer = writer.clone();
            let id = serde_json::from_str::<Value>(&line)
                .ok()
                .and_then(|v| v.get("id").cloned())
                .unwrap_or(Value::Null);
            in_flight.spawn(async move {
                let response = guarded(id, async move { bridge.handle_line(&line).await }).await;
                match serde_json::to_value(&response) {
                    Ok(value) => {
                        if let Err(e) = write_line(&writer, &value).await {
                            warn!(error = %e, "Failed to write bridge response");
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to encode bridge response"),
                }
            });
        }

        while in_flight.join_next().await.is_some() {}
        forwarder.abort();
        Ok(())
    }

    fn spawn_notifications<W>(&self, writer: Arc<Mutex<W>>) -> JoinHandle<()>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut executions = self.app.engine.subscribe();
        let mut browsers = self.app.browsers.subscribe();
        let mut schedules = self.app.scheduler.subscribe();
        tokio::spawn(async move {
            loop {
                let step = tokio::select! {
                    r = executions.recv() => notification("execution", r),
                    r = browsers.recv() => notification("browser", r),
                    r = schedules.recv() => notification("schedule", r),
                };
                match step {
                    Notification::Send(value) => {
                        if write_line(&writer, &value).await.is_err() {
                            break;
                        }
                    }
                    Notification::Skip => {}
                    Notification::Stop => break,
                }
            }
        })
    }
}

enum Notification {
    Send(Value),
    Skip,
    Stop,
}

fn notification<T: Serialize>(source: &str, received: std::result::Result<T, RecvError>) -> Notification {
    match received {
        Ok(event) => match serde_json::to_value(&event) {
            Ok(data) => Notification::Send(json!({ "notification": source, "data": data })),
            Err(_) => Notification::Skip,
        },
        Err(RecvError::Lagged(skipped)) => {
            warn!(source, skipped, "Bridge notifications lagged");
            Notification::Skip
        }
        Err(RecvError::Closed) => Notification::Stop,
    }
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &Mutex<W>, value: &Value) -> std::io::Result<()> {
    let mut line = value.to_string();
    line.push('\n');
    let mut writer = writer.lock().await;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use autobrowse_browser::testing::FakeLauncher;
    use autobrowse_core::{Config, Paths};
    use autobrowse_deps::testing::FakePackageManager;
    use autobrowse_storage::InMemoryStore;
    use tokio::io::BufReader;

    async fn bridge(dir: &tempfile::TempDir) -> Arc<CommandBridge> {
        let paths = Paths::with_base(dir.path().to_path_buf());
        let app = Orchestrator::assemble(
            paths,
            Config::default(),
            Arc::new(InMemoryStore::new()),
            Arc::new(FakeLauncher::new()),
            Arc::new(FakePackageManager::new()),
        )
        .await
        .unwrap();
        Arc::new(CommandBridge::new(Arc::new(app)))
    }

    async fn call(bridge: &CommandBridge, command: &str, params: Value) -> BridgeResponse {
        bridge
            .handle(BridgeRequest {
                id: json!(1),
                command: command.to_string(),
                params,
            })
            .await
    }

    async fn data(bridge: &CommandBridge, command: &str, params: Value) -> Value {
        let response = call(bridge, command, params).await;
        assert!(response.success, "{} failed: {:?}", command, response.error);
        response.data.unwrap()
    }

    #[tokio::test]
    async fn test_execute_through_bridge() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = bridge(&dir).await;

        let profile = data(&bridge, "browser.create", json!({"name": "main"})).await;
        let browser_id = profile["id"].as_str().unwrap().to_string();
        let task = data(
            &bridge,
            "task.create",
            json!({
                "name": "sum",
                "script": "fn run(params) { params.a + params.b }",
                "parameters": [
                    {"name": "a", "type": "integer", "required": true},
                    {"name": "b", "type": "integer", "default": 2}
                ]
            }),
        )
        .await;
        let task_id = task["id"].as_str().unwrap().to_string();

        let exec = data(
            &bridge,
            "task.execute",
            json!({"taskId": task_id, "browserId": browser_id, "parameters": {"a": 40}}),
        )
        .await;
        assert_eq!(exec["status"], "pending");
        let done = data(&bridge, "execution.wait", json!({"id": exec["id"]})).await;
        assert_eq!(done["status"], "completed");
        assert_eq!(done["result"], 42);

        let status = data(&bridge, "browser.status", json!({"id": browser_id})).await;
        assert_eq!(status["status"], "running");
        let list = data(&bridge, "execution.list", json!({"taskId": task_id})).await;
        assert_eq!(list.as_array().unwrap().len(), 1);

        let updated = data(
            &bridge,
            "task.update",
            json!({"id": task_id, "description": "adds numbers"}),
        )
        .await;
        assert_eq!(updated["description"], "adds numbers");
        assert_eq!(updated["script"], task["script"]);
    }

    #[tokio::test]
    async fn test_errors_are_typed() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = bridge(&dir).await;

        let response = call(&bridge, "nope", Value::Null).await;
        assert!(!response.success);
        assert_eq!(response.error.unwrap().kind, "validation");

        let response = call(&bridge, "browser.open", json!({})).await;
        assert_eq!(response.error.unwrap().kind, "validation");

        let response = call(&bridge, "task.get", json!({"id": "missing"})).await;
        assert_eq!(response.error.unwrap().kind, "not_found");

        let response = call(&bridge, "task.create", json!({"name": "x", "script": "fn main() {}"})).await;
        assert_eq!(response.error.unwrap().kind, "validation");

        let response = bridge.handle_line("{not json").await;
        assert_eq!(response.id, Value::Null);
        assert_eq!(response.error.unwrap().kind, "json");
    }

    #[tokio::test]
    async fn test_schedule_overflow_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = bridge(&dir).await;
        let profile = data(&bridge, "browser.create", json!({"name": "main"})).await;
        let task = data(&bridge, "task.create", json!({"name": "t", "script": "fn run() { 1 }"})).await;

        let response = call(
            &bridge,
            "schedule.create",
            json!({
                "taskId": task["id"],
                "browserId": profile["id"],
                "spec": {"type": "delayed", "delayMs": i64::MAX / 2}
            }),
        )
        .await;
        assert!(!response.success);
        assert_eq!(response.error.unwrap().kind, "validation");
        assert!(data(&bridge, "schedule.list", Value::Null).await.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_panicking_handler_still_answers() {
        let response = guarded(json!(7), async {
            if true {
                panic!("boom");
            }
            BridgeResponse::ok(json!(7), Value::Null)
        })
        .await;
        assert_eq!(response.id, json!(7));
        assert!(!response.success);
        let error = response.error.unwrap();
        assert_eq!(error.kind, "other");
        assert!(error.message.contains("Command handler failed"));

        let response = guarded(json!("x"), async { BridgeResponse::ok(json!("x"), json!(1)) }).await;
        assert!(response.success);
    }

    #[tokio::test]
    async fn test_deps_commands() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = bridge(&dir).await;

        let report = data(
            &bridge,
            "deps.install",
            json!({"requirements": ["lodash@4.17.21", {"name": "dayjs", "version": "1.11.0"}]}),
        )
        .await;
        assert_eq!(report["installed"].as_array().unwrap().len(), 2);
        assert!(report["failed"].as_array().unwrap().is_empty());

        let checks = data(&bridge, "deps.check", json!({"requirements": ["lodash@^4.0.0", "react"]})).await;
        assert_eq!(checks[0]["installed"], true);
        assert_eq!(checks[1]["installed"], false);

        let cleanup = data(&bridge, "deps.cleanup", json!({"taskId": MANUAL_TASK_ID})).await;
        assert_eq!(cleanup["released"], 2);
        let stats = data(&bridge, "deps.stats", Value::Null).await;
        assert_eq!(stats["cache"]["entries"], 2);
        assert_eq!(stats["cache"]["referencedEntries"], 0);
    }

    #[tokio::test]
    async fn test_serve_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = bridge(&dir).await;
        let input = concat!(
            r#"{"id": "a", "command": "browser.list"}"#,
            "\n\n",
            r#"{"id": "b", "command": "schedule.list", "params": null}"#,
            "\n",
            "garbage\n"
        );
        let (client, server) = tokio::io::duplex(64 * 1024);
        bridge
            .serve(BufReader::new(input.as_bytes()), server)
            .await
            .unwrap();

        let mut lines = BufReader::new(client).lines();
        let mut responses = Vec::new();
        while responses.len() < 3 {
            let line = lines.next_line().await.unwrap().unwrap();
            let value: Value = serde_json::from_str(&line).unwrap();
            if value.get("notification").is_none() {
                responses.push(value);
            }
        }
        let ok: Vec<&Value> = responses.iter().filter(|r| r["success"] == true).collect();
        assert_eq!(ok.len(), 2);
        assert!(ok.iter().any(|r| r["id"] == "a"));
        let failed = responses.iter().find(|r| r["success"] == false).unwrap();
        assert_eq!(failed["error"]["kind"], "json");
    }
}
