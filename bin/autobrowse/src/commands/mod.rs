pub mod browser;
pub mod daemon;
pub mod deps;
pub mod schedule;
pub mod task;

use autobrowse_core::{Config, Paths};

use crate::app::Orchestrator;

/// Open the orchestrator with the user's config.
pub async fn open_app() -> anyhow::Result<Orchestrator> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;
    Ok(Orchestrator::open(paths, config).await?)
}

/// First 8 characters of an id, for tables.
pub fn short_id(id: &str) -> String {
    id.chars().take(8).collect()
}

pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
        out.push('…');
        out
    }
}

pub fn parse_json_arg(raw: Option<String>) -> anyhow::Result<serde_json::Value> {
    match raw {
        None => Ok(serde_json::Value::Null),
        Some(raw) => serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("Invalid JSON argument: {}", e)),
    }
}
