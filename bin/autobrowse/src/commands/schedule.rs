use autobrowse_core::{ScheduleKind, ScheduleSpec, ScheduledTask};
use autobrowse_scheduler::ScheduleRequest;
use chrono::{DateTime, Utc};

use super::{open_app, parse_json_arg, short_id, truncate};

pub struct AddOptions {
    pub task: String,
    pub browser: String,
    pub name: Option<String>,
    pub params: Option<String>,
    pub delay_ms: Option<i64>,
    pub interval_ms: Option<i64>,
    pub cron: Option<String>,
    pub timezone: Option<String>,
    pub max_iterations: Option<u64>,
    pub max_executions: Option<u64>,
    pub start_at: Option<String>,
    pub end_at: Option<String>,
}

fn parse_time(raw: Option<String>) -> anyhow::Result<Option<DateTime<Utc>>> {
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| anyhow::anyhow!("Invalid RFC 3339 time '{}': {}", s, e))
    })
    .transpose()
}

fn describe(spec: &ScheduleSpec) -> String {
    match spec.kind {
        ScheduleKind::Immediate => "immediate".to_string(),
        ScheduleKind::Delayed => format!("delay {}ms", spec.delay_ms.unwrap_or(0)),
        ScheduleKind::Interval => format!("every {}ms", spec.interval_ms.unwrap_or(0)),
        ScheduleKind::Cron => format!(
            "cron {}{}",
            spec.cron.as_deref().unwrap_or("-"),
            spec.timezone.as_deref().map(|tz| format!(" ({})", tz)).unwrap_or_default()
        ),
    }
}

/// Persist a schedule. A running daemon picks it up on its next restart; use the bridge for live
/// changes.
pub async fn add(opts: AddOptions) -> anyhow::Result<()> {
    let mut spec = match (opts.delay_ms, opts.interval_ms, opts.cron) {
        (None, None, None) => ScheduleSpec::immediate(),
        (Some(ms), None, None) => ScheduleSpec::delayed(ms),
        (None, Some(ms), None) => ScheduleSpec::interval(ms),
        (None, None, Some(expr)) => ScheduleSpec::cron(&expr),
        _ => anyhow::bail!("Use at most one of --delay-ms, --interval-ms or --cron"),
    };
    spec.timezone = opts.timezone;
    spec.max_iterations = opts.max_iterations;
    spec.start_at = parse_time(opts.start_at)?;
    spec.end_at = parse_time(opts.end_at)?;

    let app = open_app().await?;
    let record = app
        .scheduler
        .schedule(ScheduleRequest {
            name: opts.name.unwrap_or_default(),
            task_id: opts.task,
            browser_id: opts.browser,
            spec,
            parameters: parse_json_arg(opts.params)?,
            max_executions: opts.max_executions,
        })
        .await?;
    println!("✓ Scheduled {} ({})", record.id, describe(&record.spec));
    if let Some(next) = record.next_execution_time {
        println!("  next run: {}", next.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    Ok(())
}

async fn restored() -> anyhow::Result<crate::app::Orchestrator> {
    let app = open_app().await?;
    app.scheduler.restore().await?;
    Ok(app)
}

fn print_row(s: &ScheduledTask) {
    let next = s
        .next_execution_time
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{:<10} {:<16} {:<10} {:<7} {:<6} {:<17} {}",
        short_id(&s.id),
        truncate(&s.name, 16),
        short_id(&s.task_id),
        if s.is_active { "yes" } else { "no" },
        s.execution_count,
        next,
        describe(&s.spec)
    );
}

pub async fn list() -> anyhow::Result<()> {
    let app = open_app().await?;
    let mut schedules = app.store.list_schedules().await?;
    schedules.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    if schedules.is_empty() {
        println!("No schedules.");
        return Ok(());
    }
    println!(
        "{:<10} {:<16} {:<10} {:<7} {:<6} {:<17} Rule",
        "ID", "Name", "Task", "Active", "Runs", "Next run"
    );
    println!("{}", "-".repeat(90));
    for s in &schedules {
        print_row(s);
    }
    Ok(())
}

pub async fn pause(id: String) -> anyhow::Result<()> {
    let app = restored().await?;
    app.scheduler.pause(&id).await?;
    println!("✓ Paused schedule {}", id);
    Ok(())
}

pub async fn resume(id: String) -> anyhow::Result<()> {
    let app = restored().await?;
    let record = app.scheduler.resume(&id).await?;
    println!("✓ Resumed schedule {}", id);
    if let Some(next) = record.next_execution_time {
        println!("  next run: {}", next.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    Ok(())
}

pub async fn delete(id: String) -> anyhow::Result<()> {
    let app = restored().await?;
    app.scheduler.delete(&id).await?;
    println!("✓ Deleted schedule {}", id);
    Ok(())
}

/// Fire a schedule once now and wait for the execution.
pub async fn run(id: String) -> anyhow::Result<()> {
    let app = restored().await?;
    let execution_id = app.scheduler.run_now(&id).await?;
    println!("Execution {} started", execution_id);
    let done = app.engine.wait(&execution_id).await?;
    app.shutdown().await;
    println!("Execution {}", done.status);
    if let Some(err) = done.error {
        println!("  error: {}", err);
    }
    Ok(())
}
