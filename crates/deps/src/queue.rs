//! Bounded-concurrency resolution of task package requirements.

use autobrowse_core::paths::sanitize;
use autobrowse_core::{Error, PackageRequirement, Result};
use futures::future::join_all;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, CacheStats, DependencyCache};
use crate::installer::PackageManager;
use crate::manifest::{read_installed_manifest, workspace_manifest};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallFailure {
    pub requirement: PackageRequirement,
    pub error: String,
    pub kind: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallReport {
    pub installed: Vec<CacheEntry>,
    pub failed: Vec<InstallFailure>,
}

impl InstallReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// One-line summary of the failures, for execution errors.
    pub fn failure_summary(&self) -> String {
        self.failed
            .iter()
            .map(|f| format!("{}: {}", f.requirement, f.error))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyCheck {
    pub requirement: PackageRequirement,
    pub installed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub max_concurrent: usize,
    pub active: usize,
    pub waiting: usize,
    pub completed: u64,
    pub failed: u64,
    pub cache: CacheStats,
}

pub struct DependencyInstallQueue {
    cache: Arc<DependencyCache>,
    manager: Arc<dyn PackageManager>,
    permits: Semaphore,
    max_concurrent: usize,
    work_root: PathBuf,
    install_timeout: Duration,
    active: AtomicUsize,
    waiting: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Decrements a gauge when dropped, so cancelled installs don't leak counts.
struct Gauge<'a>(&'a AtomicUsize);

impl<'a> Gauge<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for Gauge<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl DependencyInstallQueue {
    pub fn new(
        cache: Arc<DependencyCache>,
        manager: Arc<dyn PackageManager>,
        work_root: PathBuf,
        max_concurrent: usize,
        install_timeout: Duration,
    ) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            cache,
            manager,
            permits: Semaphore::new(max_concurrent),
            max_concurrent,
            work_root,
            install_timeout,
            active: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn cache(&self) -> &Arc<DependencyCache> {
        &self.cache
    }

    fn task_work_dir(&self, task_id: &str) -> PathBuf {
        self.work_root.join(sanitize(task_id))
    }

    async fn lookup(&self, requirement: &PackageRequirement) -> Option<CacheEntry> {
        match requirement.version.as_deref() {
            Some(v) if semver::Version::parse(v).is_ok() => self.cache.get(&requirement.name, v).await,
            Some(range) => self.cache.find(&requirement.name, range).await,
            None => self.cache.find(&requirement.name, "*").await,
        }
    }

    /// Resolve one requirement for `task_id`, from the cache unless forced.
    pub async fn install(
        &self,
        requirement: &PackageRequirement,
        task_id: &str,
        force: bool,
    ) -> Result<CacheEntry> {
        let force = force || requirement.force;
        if !force {
            if let Some(hit) = self.lookup(requirement).await {
                debug!(package = %requirement, version = %hit.version, "Cache hit");
                return self.cache.put(&hit.path, &hit.name, &hit.version, task_id).await;
            }
        }

        let permit = {
            let _waiting = Gauge::enter(&self.waiting);
            self.permits
                .acquire()
                .await
                .map_err(|_| Error::Dependency("Install queue closed".to_string()))?
        };
        let _active = Gauge::enter(&self.active);

        // Another request may have installed it while we waited
        let result = match (force, self.lookup(requirement).await) {
            (false, Some(hit)) => {
                self.cache
                    .put(&hit.path, &hit.name, &hit.version, task_id)
                    .await
            }
            _ => self.run_install(requirement, task_id, force).await,
        };
        drop(permit);

        match &result {
            Ok(entry) => {
                self.completed.fetch_add(1, Ordering::SeqCst);
                info!(package = %requirement, version = %entry.version, task_id, "Package resolved");
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::SeqCst);
                warn!(package = %requirement, task_id, error = %e, "Package install failed");
            }
        }
        result
    }

    async fn run_install(
        &self,
        requirement: &PackageRequirement,
        task_id: &str,
        force: bool,
    ) -> Result<CacheEntry> {
        let work_dir = self.task_work_dir(task_id).join(sanitize(&requirement.name));
        if work_dir.exists() {
            tokio::fs::remove_dir_all(&work_dir).await?;
        }
        tokio::fs::create_dir_all(&work_dir).await?;
        let manifest = serde_json::to_string_pretty(&workspace_manifest(requirement))?;
        tokio::fs::write(work_dir.join("package.json"), manifest).await?;

        self.manager
            .install(&work_dir, requirement, self.install_timeout)
            .await?;

        let (package_dir, manifest) = read_installed_manifest(&work_dir, requirement)?;
        if force {
            self.cache
                .refresh(&package_dir, &manifest.name, &manifest.version, task_id)
                .await
        } else {
            self.cache
                .put(&package_dir, &manifest.name, &manifest.version, task_id)
                .await
        }
    }

    /// Resolve every requirement; each one fails independently.
    pub async fn install_all(
        &self,
        requirements: &[PackageRequirement],
        task_id: &str,
    ) -> InstallReport {
        let results = join_all(
            requirements
                .iter()
                .map(|req| async move { (req, self.install(req, task_id, req.force).await) }),
        )
        .await;

        let mut report = InstallReport::default();
        for (req, result) in results {
            match result {
                Ok(entry) => report.installed.push(entry),
                Err(e) => report.failed.push(InstallFailure {
                    requirement: req.clone(),
                    kind: e.kind().to_string(),
                    error: e.to_string(),
                }),
            }
        }
        report
    }

    /// Which requirements the cache can already satisfy. Does not count as cache lookups.
    pub async fn check(&self, requirements: &[PackageRequirement]) -> Vec<DependencyCheck> {
        let mut checks = Vec::with_capacity(requirements.len());
        for req in requirements {
            let range = req.version.as_deref().unwrap_or("*");
            let hit = self.cache.peek(&req.name, range).await;
            checks.push(DependencyCheck {
                requirement: req.clone(),
                installed: hit.is_some(),
                version: hit.map(|e| e.version),
            });
        }
        checks
    }

    /// Remove a task's install workspace. The shared cache is untouched.
    pub async fn cleanup(&self, task_id: &str) -> Result<bool> {
        let dir = self.task_work_dir(task_id);
        if !dir.exists() {
            return Ok(false);
        }
        tokio::fs::remove_dir_all(&dir).await?;
        debug!(task_id, "Install workspace removed");
        Ok(true)
    }

    /// Remove every install workspace. Returns how many were removed.
    pub async fn cleanup_all(&self) -> Result<usize> {
        if !self.work_root.exists() {
            return Ok(0);
        }
        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.work_root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let result = if entry.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove workspace"),
            }
        }
        Ok(removed)
    }

    pub async fn stats(&self) -> QueueStats {
        QueueStats {
            max_concurrent: self.max_concurrent,
            active: self.active.load(Ordering::SeqCst),
            waiting: self.waiting.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            cache: self.cache.stats().await,
        }
    }
}
