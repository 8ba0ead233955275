//! Package manager double that materialises packages without touching the network.

use async_trait::async_trait;
use autobrowse_core::{Error, PackageRequirement, Result};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::installer::PackageManager;
use crate::manifest::installed_package_dir;

#[derive(Default)]
pub struct FakePackageManager {
    delay: Duration,
    failing: Mutex<HashSet<String>>,
    no_manifest: Mutex<HashSet<String>>,
    modules: Mutex<HashMap<String, String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    installs: AtomicUsize,
}

impl FakePackageManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Installs of `name` exit with an error.
    pub fn fail(&self, name: &str) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(name.to_string());
        }
    }

    /// Installs of `name` "succeed" without producing a manifest.
    pub fn skip_manifest(&self, name: &str) {
        if let Ok(mut skip) = self.no_manifest.lock() {
            skip.insert(name.to_string());
        }
    }

    /// Ship `source` as the package's `index.rhai`.
    pub fn with_rhai_module(&self, name: &str, source: &str) {
        if let Ok(mut modules) = self.modules.lock() {
            modules.insert(name.to_string(), source.to_string());
        }
    }

    pub fn install_count(&self) -> usize {
        self.installs.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn contains(set: &Mutex<HashSet<String>>, name: &str) -> bool {
        set.lock().map(|s| s.contains(name)).unwrap_or(false)
    }
}

/// Concrete version a fake install resolves `requirement` to.
fn resolved_version(requirement: &PackageRequirement) -> String {
    match requirement.version.as_deref() {
        Some(v) if semver::Version::parse(v).is_ok() => v.to_string(),
        Some(range) => {
            let trimmed = range.trim_start_matches(|c: char| !c.is_ascii_digit());
            if semver::Version::parse(trimmed).is_ok() {
                trimmed.to_string()
            } else {
                "1.0.0".to_string()
            }
        }
        None => "1.0.0".to_string(),
    }
}

#[async_trait]
impl PackageManager for FakePackageManager {
    fn name(&self) -> &str {
        "fake"
    }

    async fn install(
        &self,
        work_dir: &Path,
        requirement: &PackageRequirement,
        _limit: Duration,
    ) -> Result<()> {
        self.installs.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if Self::contains(&self.failing, &requirement.name) {
            return Err(Error::Dependency(format!(
                "fake install of {} failed",
                requirement
            )));
        }
        if Self::contains(&self.no_manifest, &requirement.name) {
            return Ok(());
        }

        let dir = installed_package_dir(work_dir, &requirement.name);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(
            dir.join("package.json"),
            serde_json::to_string(&serde_json::json!({
                "name": requirement.name,
                "version": resolved_version(requirement),
            }))?,
        )?;
        let module = self
            .modules
            .lock()
            .ok()
            .and_then(|m| m.get(&requirement.name).cloned());
        if let Some(source) = module {
            std::fs::write(dir.join("index.rhai"), source)?;
        }
        Ok(())
    }
}
