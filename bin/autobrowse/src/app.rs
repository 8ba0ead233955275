use autobrowse_browser::{BrowserLauncher, BrowserProcessManager, ChromeLauncher};
use autobrowse_core::{Config, Paths, RecordStore, Result};
use autobrowse_deps::{DependencyCache, DependencyInstallQueue, NpmPackageManager, PackageManager};
use autobrowse_engine::TaskExecutionEngine;
use autobrowse_scheduler::TaskScheduler;
use autobrowse_storage::SqliteStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Owns every service and wires them together.
pub struct Orchestrator {
    pub paths: Paths,
    pub config: Config,
    pub store: Arc<dyn RecordStore>,
    pub browsers: BrowserProcessManager,
    pub deps: Arc<DependencyInstallQueue>,
    pub engine: TaskExecutionEngine,
    pub scheduler: TaskScheduler,
}

impl Orchestrator {
    /// Open the on-disk store and the real browser launcher and package manager.
    pub async fn open(paths: Paths, config: Config) -> Result<Self> {
        paths.ensure_dirs()?;
        let store = Arc::new(SqliteStore::open(&paths.database_file())?);
        let launcher = Arc::new(ChromeLauncher::new(config.browser.clone()));
        let packages = Arc::new(NpmPackageManager::new(
            &config.deps.package_manager,
            config.deps.install_args.clone(),
        ));
        Self::assemble(paths, config, store, launcher, packages).await
    }

    pub async fn assemble(
        paths: Paths,
        config: Config,
        store: Arc<dyn RecordStore>,
        launcher: Arc<dyn BrowserLauncher>,
        packages: Arc<dyn PackageManager>,
    ) -> Result<Self> {
        let browsers = BrowserProcessManager::new(store.clone(), launcher, paths.clone());
        // No process or execution survives a restart
        browsers.reset_stale().await?;

        let cache = Arc::new(
            DependencyCache::open(
                paths.deps_cache_dir(),
                config.deps.cache_max_entries,
                config.deps.cache_max_size_bytes(),
            )
            .await?,
        );
        let deps = Arc::new(DependencyInstallQueue::new(
            cache,
            packages,
            paths.deps_work_dir(),
            config.deps.max_concurrent_installs,
            Duration::from_secs(config.deps.install_timeout_secs),
        ));
        let engine = TaskExecutionEngine::new(
            store.clone(),
            browsers.clone(),
            deps.clone(),
            paths.results_dir(),
            config.engine.clone(),
        );
        engine.reset_stale().await?;
        let scheduler = TaskScheduler::new(
            store.clone(),
            Arc::new(engine.clone()),
            Duration::from_secs(config.scheduler.idle_wake_secs.max(1)),
        );

        debug!(base = %paths.base.display(), "Orchestrator assembled");
        Ok(Self {
            paths,
            config,
            store,
            browsers,
            deps,
            engine,
            scheduler,
        })
    }

    /// Restore schedules and start the scheduler loop and the eviction sweep.
    pub async fn start_background(
        &self,
        shutdown: &broadcast::Sender<()>,
    ) -> Result<Vec<JoinHandle<()>>> {
        self.scheduler.restore().await?;
        let mut handles = Vec::new();

        let scheduler = self.scheduler.clone();
        let rx = shutdown.subscribe();
        handles.push(tokio::spawn(async move { scheduler.run_loop(rx).await }));

        if let Some(handle) = self.spawn_eviction_sweep(shutdown.subscribe()) {
            handles.push(handle);
        }
        Ok(handles)
    }

    fn spawn_eviction_sweep(&self, mut shutdown: broadcast::Receiver<()>) -> Option<JoinHandle<()>> {
        let secs = self.config.deps.eviction_sweep_secs;
        if secs == 0 {
            return None;
        }
        let cache = self.deps.cache().clone();
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(secs));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // First tick completes immediately
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let removed = cache.evict().await;
                        if removed > 0 {
                            info!(removed, "Eviction sweep removed cache entries");
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        }))
    }

    pub async fn shutdown(&self) {
        self.browsers.close_all().await;
        info!("All browsers closed");
    }
}
