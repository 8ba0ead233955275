use autobrowse_core::{ExecutionStatus, LogLevel, PackageRequirement, ParameterSpec, Task};
use autobrowse_engine::ExecutionEvent;
use std::path::PathBuf;

use super::{open_app, parse_json_arg, short_id, truncate};

pub struct AddOptions {
    pub name: String,
    pub script: PathBuf,
    pub description: Option<String>,
    pub params_schema: Option<PathBuf>,
    pub deps: Vec<String>,
    pub restore: bool,
    pub cache: bool,
    pub timeout_secs: Option<u64>,
}

pub async fn add(opts: AddOptions) -> anyhow::Result<()> {
    let script = std::fs::read_to_string(&opts.script)
        .map_err(|e| anyhow::anyhow!("Cannot read {}: {}", opts.script.display(), e))?;
    let mut task = Task::new(&opts.name, &script);
    task.description = opts.description.unwrap_or_default();
    if let Some(path) = opts.params_schema {
        let raw = std::fs::read_to_string(&path)?;
        task.parameters = serde_json::from_str::<Vec<ParameterSpec>>(&raw)?;
    }
    task.dependencies = opts
        .deps
        .iter()
        .map(|spec| {
            PackageRequirement::parse(spec)
                .ok_or_else(|| anyhow::anyhow!("Invalid dependency '{}'", spec))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    task.config.restore_browser_state = opts.restore;
    task.config.cache_result = opts.cache;
    task.config.timeout_secs = opts.timeout_secs;

    let app = open_app().await?;
    let task = app.engine.save_task(task).await?;
    println!("✓ Saved task {} ({})", task.name, task.id);
    Ok(())
}

pub async fn list() -> anyhow::Result<()> {
    let app = open_app().await?;
    let tasks = app.engine.list_tasks().await?;
    if tasks.is_empty() {
        println!("No tasks. Add one with `autobrowse task add`.");
        return Ok(());
    }
    println!("{:<10} {:<24} {:<6} {:<6} Updated", "ID", "Name", "Params", "Deps");
    println!("{}", "-".repeat(72));
    for t in tasks {
        println!(
            "{:<10} {:<24} {:<6} {:<6} {}",
            short_id(&t.id),
            truncate(&t.name, 24),
            t.parameters.len(),
            t.dependencies.len(),
            t.updated_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

pub async fn show(id: String) -> anyhow::Result<()> {
    let app = open_app().await?;
    let task = app.engine.get_task(&id).await?;
    println!("{}", serde_json::to_string_pretty(&task)?);

    let executions = app.engine.list_by_task(&id).await?;
    if !executions.is_empty() {
        println!();
        println!("Recent executions:");
        for e in executions.iter().take(10) {
            println!(
                "  {} {:<10} {} {}",
                short_id(&e.id),
                e.status,
                e.created_at.format("%Y-%m-%d %H:%M:%S"),
                e.error.as_deref().map(|m| truncate(m, 60)).unwrap_or_default()
            );
        }
    }
    Ok(())
}

/// Run a task and block until the execution ends. `follow` streams logs and progress.
pub async fn run(
    id: String,
    browser: String,
    params: Option<String>,
    follow: bool,
) -> anyhow::Result<()> {
    let parameters = parse_json_arg(params)?;
    let app = open_app().await?;
    let mut events = app.engine.subscribe();
    let execution = app.engine.execute(&id, &browser, parameters).await?;
    println!("Execution {} started", execution.id);

    let printer = follow.then(|| {
        let execution_id = execution.id.clone();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if event.execution_id() != execution_id {
                    continue;
                }
                match event {
                    ExecutionEvent::Log { entry, .. } => {
                        let level = match entry.level {
                            LogLevel::Debug => "debug",
                            LogLevel::Info => "info",
                            LogLevel::Warn => "warn",
                            LogLevel::Error => "error",
                        };
                        println!("[{}] {:<5} {}", entry.time.format("%H:%M:%S"), level, entry.message);
                    }
                    ExecutionEvent::Progress { progress, .. } => {
                        println!("  progress {}/{} {}", progress.current, progress.total, progress.message);
                    }
                    ExecutionEvent::StatusChanged { new, .. } if new.is_terminal() => break,
                    ExecutionEvent::StatusChanged { .. } => {}
                }
            }
        })
    });

    let done = app.engine.wait(&execution.id).await?;
    if let Some(printer) = printer {
        let _ = printer.await;
    }
    app.shutdown().await;

    match done.status {
        ExecutionStatus::Completed => {
            println!("✓ Completed");
            if let Some(result) = &done.result {
                println!("{}", serde_json::to_string_pretty(result)?);
            }
            Ok(())
        }
        status => anyhow::bail!(
            "Execution {}: {}",
            status,
            done.error.as_deref().unwrap_or("no error recorded")
        ),
    }
}

pub async fn delete(id: String) -> anyhow::Result<()> {
    let app = open_app().await?;
    app.engine.delete_task(&id).await?;
    println!("✓ Deleted task {}", id);
    Ok(())
}
