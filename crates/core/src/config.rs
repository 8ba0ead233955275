use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;
use crate::paths::Paths;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserConfig {
    /// Explicit browser binary. When unset the launcher searches well-known locations.
    #[serde(default)]
    pub executable: Option<String>,
    #[serde(default = "default_engine")]
    pub engine: String,
    #[serde(default = "default_true")]
    pub headless: bool,
    #[serde(default = "default_launch_timeout_secs")]
    pub launch_timeout_secs: u64,
    #[serde(default = "default_viewport_width")]
    pub viewport_width: u32,
    #[serde(default = "default_viewport_height")]
    pub viewport_height: u32,
}

fn default_engine() -> String {
    "chrome".to_string()
}

fn default_true() -> bool {
    true
}

fn default_launch_timeout_secs() -> u64 {
    15
}

fn default_viewport_width() -> u32 {
    1280
}

fn default_viewport_height() -> u32 {
    720
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            executable: None,
            engine: default_engine(),
            headless: default_true(),
            launch_timeout_secs: default_launch_timeout_secs(),
            viewport_width: default_viewport_width(),
            viewport_height: default_viewport_height(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepsConfig {
    #[serde(default = "default_package_manager")]
    pub package_manager: String,
    #[serde(default = "default_install_args")]
    pub install_args: Vec<String>,
    #[serde(default = "default_max_concurrent_installs")]
    pub max_concurrent_installs: usize,
    #[serde(default = "default_install_timeout_secs")]
    pub install_timeout_secs: u64,
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,
    #[serde(default = "default_cache_max_size_mb")]
    pub cache_max_size_mb: u64,
    /// Period of the background eviction sweep run by the daemon. 0 disables it.
    #[serde(default = "default_eviction_sweep_secs")]
    pub eviction_sweep_secs: u64,
}

fn default_package_manager() -> String {
    "npm".to_string()
}

fn default_install_args() -> Vec<String> {
    vec![
        "install".to_string(),
        "--no-audit".to_string(),
        "--no-fund".to_string(),
        "--no-package-lock".to_string(),
    ]
}

fn default_max_concurrent_installs() -> usize {
    2
}

fn default_install_timeout_secs() -> u64 {
    120
}

fn default_cache_max_entries() -> usize {
    200
}

fn default_cache_max_size_mb() -> u64 {
    1024
}

fn default_eviction_sweep_secs() -> u64 {
    600
}

impl DepsConfig {
    pub fn cache_max_size_bytes(&self) -> u64 {
        self.cache_max_size_mb.saturating_mul(1024 * 1024)
    }
}

impl Default for DepsConfig {
    fn default() -> Self {
        Self {
            package_manager: default_package_manager(),
            install_args: default_install_args(),
            max_concurrent_installs: default_max_concurrent_installs(),
            install_timeout_secs: default_install_timeout_secs(),
            cache_max_entries: default_cache_max_entries(),
            cache_max_size_mb: default_cache_max_size_mb(),
            eviction_sweep_secs: default_eviction_sweep_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    #[serde(default = "default_max_operations")]
    pub max_operations: u64,
    #[serde(default = "default_script_timeout_secs")]
    pub script_timeout_secs: u64,
    #[serde(default = "default_max_string_size")]
    pub max_string_size: usize,
    #[serde(default = "default_max_collection_size")]
    pub max_array_size: usize,
    #[serde(default = "default_max_collection_size")]
    pub max_map_size: usize,
    #[serde(default = "default_max_call_depth")]
    pub max_call_depth: usize,
    #[serde(default = "default_true")]
    pub result_cache: bool,
}

fn default_max_operations() -> u64 {
    5_000_000
}

fn default_script_timeout_secs() -> u64 {
    300
}

fn default_max_string_size() -> usize {
    4_000_000
}

fn default_max_collection_size() -> usize {
    100_000
}

fn default_max_call_depth() -> usize {
    64
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_operations: default_max_operations(),
            script_timeout_secs: default_script_timeout_secs(),
            max_string_size: default_max_string_size(),
            max_array_size: default_max_collection_size(),
            max_map_size: default_max_collection_size(),
            max_call_depth: default_max_call_depth(),
            result_cache: default_true(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerConfig {
    /// Upper bound on how long the coordinator sleeps when nothing is due.
    #[serde(default = "default_idle_wake_secs")]
    pub idle_wake_secs: u64,
}

fn default_idle_wake_secs() -> u64 {
    30
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            idle_wake_secs: default_idle_wake_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub deps: DepsConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"deps": {"maxConcurrentInstalls": 4}}"#).unwrap();
        assert_eq!(config.deps.max_concurrent_installs, 4);
        assert_eq!(config.deps.install_timeout_secs, 120);
        assert_eq!(config.browser.launch_timeout_secs, 15);
        assert!(config.engine.result_cache);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let paths = Paths::with_base(dir.path().to_path_buf());
        let mut config = Config::default();
        config.browser.headless = false;
        config.save(&paths.config_file()).unwrap();

        let loaded = Config::load_or_default(&paths).unwrap();
        assert!(!loaded.browser.headless);
        assert_eq!(loaded.deps.package_manager, "npm");
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = TempDir::new().unwrap();
        let paths = Paths::with_base(dir.path().join("nothing"));
        let loaded = Config::load_or_default(&paths).unwrap();
        assert_eq!(loaded.deps.cache_max_entries, 200);
        assert_eq!(loaded.deps.cache_max_size_bytes(), 1024 * 1024 * 1024);
    }
}
