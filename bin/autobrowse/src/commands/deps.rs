use autobrowse_core::PackageRequirement;

use super::open_app;
use crate::bridge::MANUAL_TASK_ID;

fn parse_requirements(specs: &[String]) -> anyhow::Result<Vec<PackageRequirement>> {
    specs
        .iter()
        .map(|s| {
            PackageRequirement::parse(s).ok_or_else(|| anyhow::anyhow!("Invalid requirement '{}'", s))
        })
        .collect()
}

pub async fn check(specs: Vec<String>) -> anyhow::Result<()> {
    let requirements = parse_requirements(&specs)?;
    let app = open_app().await?;
    for check in app.deps.check(&requirements).await {
        match check.version {
            Some(v) => println!("✓ {} (cached {})", check.requirement, v),
            None => println!("✗ {} (not cached)", check.requirement),
        }
    }
    Ok(())
}

pub async fn install(specs: Vec<String>, task: Option<String>, force: bool) -> anyhow::Result<()> {
    let mut requirements = parse_requirements(&specs)?;
    if requirements.is_empty() {
        anyhow::bail!("Nothing to install");
    }
    for req in requirements.iter_mut() {
        req.force |= force;
    }
    let app = open_app().await?;
    let task_id = task.as_deref().unwrap_or(MANUAL_TASK_ID);
    let report = app.deps.install_all(&requirements, task_id).await;
    for entry in &report.installed {
        println!("✓ {}@{} ({} bytes)", entry.name, entry.version, entry.size);
    }
    for failure in &report.failed {
        println!("✗ {} [{}] {}", failure.requirement, failure.kind, failure.error);
    }
    if !report.is_success() {
        anyhow::bail!("{} of {} installs failed", report.failed.len(), requirements.len());
    }
    Ok(())
}

pub async fn cleanup(task: Option<String>, evict: bool) -> anyhow::Result<()> {
    let app = open_app().await?;
    match task {
        Some(task_id) => {
            let released = app.deps.cache().release(&task_id).await;
            let removed = app.deps.cleanup(&task_id).await?;
            println!(
                "✓ Released {} cache entries, workspace {}",
                released,
                if removed { "removed" } else { "not present" }
            );
        }
        None => {
            let removed = app.deps.cleanup_all().await?;
            println!("✓ Removed {} install workspaces", removed);
        }
    }
    if evict {
        println!("✓ Evicted {} cache entries", app.deps.cache().evict().await);
    }
    Ok(())
}

pub async fn stats() -> anyhow::Result<()> {
    let app = open_app().await?;
    let stats = app.deps.stats().await;
    println!("Cache:       {}", app.paths.deps_cache_dir().display());
    println!("Entries:     {} ({} referenced)", stats.cache.entries, stats.cache.referenced_entries);
    println!("Total size:  {:.1} MB", stats.cache.total_size as f64 / (1024.0 * 1024.0));
    println!(
        "Limits:      {} entries, {} MB",
        app.config.deps.cache_max_entries, app.config.deps.cache_max_size_mb
    );
    println!("Hit rate:    {:.0}% ({} hits, {} misses)", stats.cache.hit_rate * 100.0, stats.cache.hits, stats.cache.misses);
    println!("Concurrency: {}", stats.max_concurrent);

    let entries = app.deps.cache().entries().await;
    if !entries.is_empty() {
        println!();
        println!("{:<32} {:<12} {:<8} Last used", "Package", "Version", "Uses");
        for e in entries {
            println!(
                "{:<32} {:<12} {:<8} {}",
                e.name,
                e.version,
                e.usage_count,
                e.last_used_at.format("%Y-%m-%d %H:%M")
            );
        }
    }
    Ok(())
}
