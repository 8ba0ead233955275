//! Lifecycle of the browser process behind each profile.
//!
//! One in-memory runtime entry per profile tracks the live status and the running process.
//! Status changes are persisted while the runtime table lock is held and then broadcast.

use autobrowse_core::paths::Paths;
use autobrowse_core::{BrowserProfile, BrowserStatus, Error, LaunchConfig, RecordStore, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::classify::classify_launch_failure;
use crate::launcher::{BrowserLauncher, LaunchedBrowser, ProcessControl, ProcessExit};
use crate::page::PageDriver;

/// How long `ensure_running` waits on a concurrent open.
const STARTING_WAIT: Duration = Duration::from_secs(120);

/// Broadcast whenever a profile's status actually changes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    pub profile_id: String,
    pub old: BrowserStatus,
    pub new: BrowserStatus,
    pub at: DateTime<Utc>,
}

struct ActiveBrowser {
    instance: u64,
    pid: Option<u32>,
    page: Arc<dyn PageDriver>,
    control: Box<dyn ProcessControl>,
    watcher: JoinHandle<()>,
}

struct ProfileRuntime {
    status: BrowserStatus,
    last_error: Option<String>,
    active: Option<ActiveBrowser>,
}

impl ProfileRuntime {
    /// No process survives a restart, so a freshly loaded profile is always stopped.
    fn restored(profile: &BrowserProfile) -> Self {
        Self {
            status: match profile.status {
                BrowserStatus::Error => BrowserStatus::Error,
                _ => BrowserStatus::Stopped,
            },
            last_error: profile.last_error.clone(),
            active: None,
        }
    }
}

struct Inner {
    store: Arc<dyn RecordStore>,
    launcher: Arc<dyn BrowserLauncher>,
    paths: Paths,
    runtimes: Mutex<HashMap<String, ProfileRuntime>>,
    events: broadcast::Sender<StatusChange>,
    next_instance: AtomicU64,
}

#[derive(Clone)]
pub struct BrowserProcessManager {
    inner: Arc<Inner>,
}

impl BrowserProcessManager {
    pub fn new(store: Arc<dyn RecordStore>, launcher: Arc<dyn BrowserLauncher>, paths: Paths) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                store,
                launcher,
                paths,
                runtimes: Mutex::new(HashMap::new()),
                events,
                next_instance: AtomicU64::new(1),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.inner.events.subscribe()
    }

    pub async fn create(&self, name: &str, launch: LaunchConfig) -> Result<BrowserProfile> {
        if name.trim().is_empty() {
            return Err(Error::Validation("Profile name must not be empty".to_string()));
        }
        let profile = BrowserProfile::new(name, launch);
        let mut runtimes = self.inner.runtimes.lock().await;
        self.inner.store.save_profile(&profile).await?;
        runtimes.insert(profile.id.clone(), ProfileRuntime::restored(&profile));
        info!(profile_id = %profile.id, name = %profile.name, "Browser profile created");
        Ok(profile)
    }

    /// All stored profiles with their live status.
    pub async fn list(&self) -> Result<Vec<BrowserProfile>> {
        let runtimes = self.inner.runtimes.lock().await;
        let mut profiles = self.inner.store.list_profiles().await?;
        for profile in &mut profiles {
            if let Some(rt) = runtimes.get(&profile.id) {
                profile.status = rt.status;
                profile.last_error = rt.last_error.clone();
            }
        }
        Ok(profiles)
    }

    /// Stored profile with its live status.
    pub async fn get(&self, profile_id: &str) -> Result<BrowserProfile> {
        let status = self.status(profile_id).await?;
        let mut profile = self
            .inner
            .store
            .get_profile(profile_id)
            .await?
            .ok_or_else(|| not_found(profile_id))?;
        profile.status = status;
        Ok(profile)
    }

    /// Persisted non-terminal statuses from a previous process are stale; reset them to stopped.
    pub async fn reset_stale(&self) -> Result<()> {
        for profile in self.inner.store.list_profiles().await? {
            if matches!(
                profile.status,
                BrowserStatus::Running | BrowserStatus::Starting | BrowserStatus::Stopping
            ) {
                debug!(profile_id = %profile.id, status = %profile.status, "Resetting stale status");
                self.inner
                    .store
                    .update_profile_status(&profile.id, BrowserStatus::Stopped, None)
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn open(&self, profile_id: &str) -> Result<()> {
        self.inner.open(profile_id).await
    }

    pub async fn close(&self, profile_id: &str) -> Result<()> {
        self.inner.close(profile_id).await
    }

    /// Live status, written back to the store when the persisted value disagrees.
    pub async fn status(&self, profile_id: &str) -> Result<BrowserStatus> {
        let inner = &self.inner;
        let mut runtimes = inner.runtimes.lock().await;
        let persisted = inner.store.get_profile(profile_id).await?;
        let rt = match (runtimes.entry(profile_id.to_string()), &persisted) {
            (Entry::Occupied(e), _) => e.into_mut(),
            (Entry::Vacant(e), Some(profile)) => e.insert(ProfileRuntime::restored(profile)),
            (Entry::Vacant(_), None) => return Err(not_found(profile_id)),
        };
        if let Some(profile) = persisted {
            if profile.status != rt.status {
                debug!(
                    profile_id,
                    persisted = %profile.status,
                    live = %rt.status,
                    "Reconciling persisted browser status"
                );
                inner.persist_status(profile_id, rt).await;
            }
        }
        Ok(rt.status)
    }

    /// Close any running process, then remove the profile record and its managed data directory.
    pub async fn delete(&self, profile_id: &str) -> Result<()> {
        if let Err(e) = self.inner.close(profile_id).await {
            match e {
                Error::NotFound(_) => {}
                other => warn!(profile_id, error = %other, "Close before delete failed"),
            }
        }

        let mut runtimes = self.inner.runtimes.lock().await;
        let runtime = runtimes.remove(profile_id);
        if let Some(active) = runtime.and_then(|rt| rt.active) {
            active.watcher.abort();
            let mut control = active.control;
            if let Err(e) = control.terminate().await {
                warn!(profile_id, error = %e, "Failed to terminate browser during delete");
            }
        }
        if !self.inner.store.delete_profile(profile_id).await? {
            return Err(not_found(profile_id));
        }
        drop(runtimes);

        let data_dir = self.inner.paths.profile_data_dir(profile_id);
        if data_dir.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(&data_dir).await {
                warn!(profile_id, path = %data_dir.display(), error = %e, "Failed to remove profile data");
            }
        }
        info!(profile_id, "Browser profile deleted");
        Ok(())
    }

    /// Automation page of a running profile.
    pub async fn page(&self, profile_id: &str) -> Result<Arc<dyn PageDriver>> {
        let runtimes = self.inner.runtimes.lock().await;
        match runtimes.get(profile_id) {
            Some(rt) if rt.status == BrowserStatus::Running => match &rt.active {
                Some(active) => Ok(active.page.clone()),
                None => Err(Error::InvalidState(format!(
                    "Browser {} has no active page",
                    profile_id
                ))),
            },
            Some(rt) => Err(Error::InvalidState(format!(
                "Browser {} is {}",
                profile_id, rt.status
            ))),
            None => Err(Error::InvalidState(format!(
                "Browser {} is not running",
                profile_id
            ))),
        }
    }

    pub async fn pid(&self, profile_id: &str) -> Option<u32> {
        let runtimes = self.inner.runtimes.lock().await;
        runtimes
            .get(profile_id)
            .and_then(|rt| rt.active.as_ref())
            .and_then(|a| a.pid)
    }

    /// Open the profile unless it is already running and return its page.
    pub async fn ensure_running(&self, profile_id: &str) -> Result<Arc<dyn PageDriver>> {
        let mut events = self.subscribe();
        match self.status(profile_id).await? {
            BrowserStatus::Running => {}
            BrowserStatus::Starting => {
                wait_for_settled(&mut events, profile_id, STARTING_WAIT).await?
            }
            _ => self.open(profile_id).await?,
        }
        self.page(profile_id).await
    }

    pub async fn close_all(&self) {
        let ids: Vec<String> = {
            let runtimes = self.inner.runtimes.lock().await;
            runtimes
                .iter()
                .filter(|(_, rt)| rt.active.is_some())
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in ids {
            if let Err(e) = self.close(&id).await {
                warn!(profile_id = %id, error = %e, "Failed to close browser");
            }
        }
    }
}

impl Inner {
    async fn runtime<'a>(
        &self,
        runtimes: &'a mut HashMap<String, ProfileRuntime>,
        profile_id: &str,
    ) -> Result<&'a mut ProfileRuntime> {
        match runtimes.entry(profile_id.to_string()) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(e) => {
                let profile = self
                    .store
                    .get_profile(profile_id)
                    .await?
                    .ok_or_else(|| not_found(profile_id))?;
                Ok(e.insert(ProfileRuntime::restored(&profile)))
            }
        }
    }

    async fn persist_status(&self, profile_id: &str, rt: &ProfileRuntime) {
        match self
            .store
            .update_profile_status(profile_id, rt.status, rt.last_error.as_deref())
            .await
        {
            Ok(true) => {}
            Ok(false) => debug!(profile_id, "Profile record gone, status not persisted"),
            Err(e) => warn!(profile_id, error = %e, "Failed to persist browser status"),
        }
    }

    async fn set_status(
        &self,
        profile_id: &str,
        rt: &mut ProfileRuntime,
        new: BrowserStatus,
        last_error: Option<String>,
    ) {
        let old = rt.status;
        rt.status = new;
        rt.last_error = last_error;
        self.persist_status(profile_id, rt).await;
        if old != new {
            debug!(profile_id, %old, %new, "Browser status changed");
            let _ = self.events.send(StatusChange {
                profile_id: profile_id.to_string(),
                old,
                new,
                at: Utc::now(),
            });
        }
    }

    async fn open(self: &Arc<Self>, profile_id: &str) -> Result<()> {
        {
            let mut runtimes = self.runtimes.lock().await;
            let rt = self.runtime(&mut runtimes, profile_id).await?;
            match rt.status {
                BrowserStatus::Running => {
                    warn!(profile_id, "Browser already running");
                    return Ok(());
                }
                BrowserStatus::Starting | BrowserStatus::Stopping => {
                    return Err(Error::InvalidState(format!(
                        "Browser {} is {}",
                        profile_id, rt.status
                    )));
                }
                BrowserStatus::Stopped | BrowserStatus::Error => {}
            }
            self.set_status(profile_id, rt, BrowserStatus::Starting, None)
                .await;
        }

        let launched = match self.store.get_profile(profile_id).await {
            Ok(Some(profile)) => {
                let data_dir = profile
                    .launch
                    .data_dir
                    .as_ref()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| self.paths.profile_data_dir(profile_id));
                self.launcher.launch(&profile, &data_dir).await
            }
            Ok(None) => Err(not_found(profile_id)),
            Err(e) => Err(e),
        };

        let mut runtimes = self.runtimes.lock().await;
        let Some(rt) = runtimes.get_mut(profile_id) else {
            // Deleted while launching
            if let Ok(mut launched) = launched {
                drop(launched.exit);
                if let Err(e) = launched.control.terminate().await {
                    warn!(profile_id, error = %e, "Failed to terminate orphaned browser");
                }
            }
            return Err(not_found(profile_id));
        };

        match launched {
            Ok(launched) => {
                let instance = self.next_instance.fetch_add(1, Ordering::SeqCst);
                let LaunchedBrowser {
                    pid,
                    page,
                    exit,
                    control,
                } = launched;
                let watcher = spawn_exit_watcher(Arc::downgrade(self), profile_id, instance, exit);
                rt.active = Some(ActiveBrowser {
                    instance,
                    pid,
                    page,
                    control,
                    watcher,
                });
                self.set_status(profile_id, rt, BrowserStatus::Running, None)
                    .await;
                info!(profile_id, pid = ?pid, "Browser started");
                Ok(())
            }
            Err(Error::NotFound(msg)) => {
                self.set_status(profile_id, rt, BrowserStatus::Error, Some(msg.clone()))
                    .await;
                Err(Error::NotFound(msg))
            }
            Err(e) => {
                let failure = classify_launch_failure(&e.to_string());
                warn!(profile_id, kind = %failure.kind, error = %e, "Browser failed to start");
                self.set_status(
                    profile_id,
                    rt,
                    BrowserStatus::Error,
                    Some(failure.message.clone()),
                )
                .await;
                Err(Error::Browser(failure.message))
            }
        }
    }

    async fn close(&self, profile_id: &str) -> Result<()> {
        let active = {
            let mut runtimes = self.runtimes.lock().await;
            let rt = self.runtime(&mut runtimes, profile_id).await?;
            match rt.status {
                BrowserStatus::Stopped => {
                    debug!(profile_id, "Browser already stopped");
                    return Ok(());
                }
                BrowserStatus::Starting | BrowserStatus::Stopping => {
                    return Err(Error::InvalidState(format!(
                        "Browser {} is {}",
                        profile_id, rt.status
                    )));
                }
                BrowserStatus::Error => {
                    self.set_status(profile_id, rt, BrowserStatus::Stopped, None)
                        .await;
                    return Ok(());
                }
                BrowserStatus::Running => {}
            }
            let active = rt.active.take();
            // Detach the exit listener before the process goes away
            if let Some(active) = &active {
                active.watcher.abort();
            }
            self.set_status(profile_id, rt, BrowserStatus::Stopping, None)
                .await;
            active
        };

        if let Some(active) = active {
            let mut control = active.control;
            if let Err(e) = control.terminate().await {
                warn!(profile_id, error = %e, "Browser did not terminate cleanly");
            }
        }

        let mut runtimes = self.runtimes.lock().await;
        if let Some(rt) = runtimes.get_mut(profile_id) {
            self.set_status(profile_id, rt, BrowserStatus::Stopped, None)
                .await;
        }
        info!(profile_id, "Browser stopped");
        Ok(())
    }

    async fn handle_external_exit(&self, profile_id: &str, instance: u64, exit: ProcessExit) {
        let mut runtimes = self.runtimes.lock().await;
        let is_current = runtimes.get(profile_id).is_some_and(|rt| {
            rt.status == BrowserStatus::Running
                && rt.active.as_ref().map(|a| a.instance) == Some(instance)
        });
        if !is_current {
            debug!(profile_id, instance, "Ignoring exit of a browser no longer tracked");
            return;
        }

        match self.store.get_profile(profile_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                debug!(profile_id, "Profile deleted, dropping exit event");
                runtimes.remove(profile_id);
                return;
            }
            Err(e) => warn!(profile_id, error = %e, "Could not verify profile record"),
        }

        if let Some(rt) = runtimes.get_mut(profile_id) {
            warn!(profile_id, reason = %exit.reason, code = ?exit.code, "Browser exited unexpectedly");
            rt.active = None;
            self.set_status(profile_id, rt, BrowserStatus::Stopped, Some(exit.reason))
                .await;
        }
    }
}

fn spawn_exit_watcher(
    inner: Weak<Inner>,
    profile_id: &str,
    instance: u64,
    exit: tokio::sync::oneshot::Receiver<ProcessExit>,
) -> JoinHandle<()> {
    let profile_id = profile_id.to_string();
    tokio::spawn(async move {
        let Ok(exit) = exit.await else {
            return;
        };
        if let Some(inner) = inner.upgrade() {
            inner.handle_external_exit(&profile_id, instance, exit).await;
        }
    })
}

async fn wait_for_settled(
    events: &mut broadcast::Receiver<StatusChange>,
    profile_id: &str,
    timeout: Duration,
) -> Result<()> {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(change) if change.profile_id == profile_id => match change.new {
                    BrowserStatus::Running => return Ok(()),
                    BrowserStatus::Error | BrowserStatus::Stopped => {
                        return Err(Error::Browser(format!(
                            "Browser {} failed to start",
                            profile_id
                        )))
                    }
                    _ => {}
                },
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(Error::Browser("Status channel closed".to_string()))
                }
            }
        }
    };
    tokio::time::timeout(timeout, wait).await.map_err(|_| {
        Error::Timeout(format!("Browser {} did not finish starting", profile_id))
    })?
}

fn not_found(profile_id: &str) -> Error {
    Error::NotFound(format!("Browser profile {}", profile_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeLauncher;
    use autobrowse_storage::InMemoryStore;

    fn setup() -> (BrowserProcessManager, Arc<FakeLauncher>, Arc<InMemoryStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let launcher = Arc::new(FakeLauncher::new());
        let manager = BrowserProcessManager::new(
            store.clone(),
            launcher.clone(),
            Paths::with_base(dir.path().to_path_buf()),
        );
        (manager, launcher, store, dir)
    }

    #[tokio::test]
    async fn test_open_and_close_transitions() {
        let (manager, launcher, store, _dir) = setup();
        let profile = manager.create("work", LaunchConfig::default()).await.unwrap();
        let mut events = manager.subscribe();

        manager.open(&profile.id).await.unwrap();
        assert_eq!(manager.status(&profile.id).await.unwrap(), BrowserStatus::Running);
        let stored = store.get_profile(&profile.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BrowserStatus::Running);

        manager.close(&profile.id).await.unwrap();
        assert_eq!(manager.status(&profile.id).await.unwrap(), BrowserStatus::Stopped);
        assert_eq!(launcher.termination_count(), 1);

        let seen: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|c| (c.old, c.new))
            .collect();
        assert_eq!(
            seen,
            vec![
                (BrowserStatus::Stopped, BrowserStatus::Starting),
                (BrowserStatus::Starting, BrowserStatus::Running),
                (BrowserStatus::Running, BrowserStatus::Stopping),
                (BrowserStatus::Stopping, BrowserStatus::Stopped),
            ]
        );
    }

    #[tokio::test]
    async fn test_close_stopped_is_noop() {
        let (manager, launcher, _store, _dir) = setup();
        let profile = manager.create("idle", LaunchConfig::default()).await.unwrap();
        let mut events = manager.subscribe();
        manager.close(&profile.id).await.unwrap();
        assert_eq!(manager.status(&profile.id).await.unwrap(), BrowserStatus::Stopped);
        assert_eq!(launcher.termination_count(), 0);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_open_twice_launches_once() {
        let (manager, launcher, _store, _dir) = setup();
        let profile = manager.create("p", LaunchConfig::default()).await.unwrap();
        manager.open(&profile.id).await.unwrap();
        manager.open(&profile.id).await.unwrap();
        assert_eq!(launcher.launch_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_open_leaves_error() {
        let (manager, launcher, store, _dir) = setup();
        launcher.fail_with("Failed to launch chrome: Permission denied (os error 13)");
        let profile = manager.create("p", LaunchConfig::default()).await.unwrap();

        let err = manager.open(&profile.id).await.unwrap_err();
        assert_eq!(err.kind(), "browser");
        assert!(err.to_string().contains("permissions"));
        assert_eq!(manager.status(&profile.id).await.unwrap(), BrowserStatus::Error);
        let stored = store.get_profile(&profile.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BrowserStatus::Error);
        assert!(stored.last_error.unwrap().contains("Permission denied"));
        assert!(manager.page(&profile.id).await.is_err());
    }

    #[tokio::test]
    async fn test_external_exit_emits_single_stop() {
        let (manager, launcher, store, _dir) = setup();
        let profile = manager.create("p", LaunchConfig::default()).await.unwrap();
        manager.open(&profile.id).await.unwrap();
        let mut events = manager.subscribe();

        assert!(launcher.exit_latest("crashed"));
        let change = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(change.profile_id, profile.id);
        assert_eq!(change.old, BrowserStatus::Running);
        assert_eq!(change.new, BrowserStatus::Stopped);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events.try_recv().is_err());
        let stored = store.get_profile(&profile.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BrowserStatus::Stopped);
    }

    #[tokio::test]
    async fn test_exit_after_close_is_ignored() {
        let (manager, launcher, _store, _dir) = setup();
        let profile = manager.create("p", LaunchConfig::default()).await.unwrap();
        manager.open(&profile.id).await.unwrap();
        manager.close(&profile.id).await.unwrap();
        let mut events = manager.subscribe();

        launcher.exit_latest("late exit");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_exit_for_deleted_record_does_not_resurrect() {
        let (manager, launcher, store, _dir) = setup();
        let profile = manager.create("p", LaunchConfig::default()).await.unwrap();
        manager.open(&profile.id).await.unwrap();
        let mut events = manager.subscribe();

        // Record removed behind the manager's back
        store.delete_profile(&profile.id).await.unwrap();
        launcher.exit_latest("crashed");
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(events.try_recv().is_err());
        assert!(store.get_profile(&profile.id).await.unwrap().is_none());
        assert!(matches!(
            manager.status(&profile.id).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_status_reconciles_and_tolerates_missing_record() {
        let (manager, _launcher, store, _dir) = setup();
        let profile = manager.create("p", LaunchConfig::default()).await.unwrap();
        manager.open(&profile.id).await.unwrap();

        store
            .update_profile_status(&profile.id, BrowserStatus::Stopped, None)
            .await
            .unwrap();
        assert_eq!(manager.status(&profile.id).await.unwrap(), BrowserStatus::Running);
        let stored = store.get_profile(&profile.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BrowserStatus::Running);

        store.delete_profile(&profile.id).await.unwrap();
        assert_eq!(manager.status(&profile.id).await.unwrap(), BrowserStatus::Running);
    }

    #[tokio::test]
    async fn test_delete_closes_and_removes_data() {
        let (manager, launcher, store, dir) = setup();
        let profile = manager.create("p", LaunchConfig::default()).await.unwrap();
        manager.open(&profile.id).await.unwrap();
        let data_dir = Paths::with_base(dir.path().to_path_buf()).profile_data_dir(&profile.id);
        std::fs::create_dir_all(&data_dir).unwrap();

        manager.delete(&profile.id).await.unwrap();
        assert_eq!(launcher.termination_count(), 1);
        assert!(store.get_profile(&profile.id).await.unwrap().is_none());
        assert!(!data_dir.exists());
        assert!(manager.delete(&profile.id).await.is_err());
    }

    #[tokio::test]
    async fn test_ensure_running_opens_once() {
        let (manager, launcher, _store, _dir) = setup();
        let profile = manager.create("p", LaunchConfig::default()).await.unwrap();
        manager.ensure_running(&profile.id).await.unwrap();
        manager.ensure_running(&profile.id).await.unwrap();
        assert_eq!(launcher.launch_count(), 1);
    }

    #[tokio::test]
    async fn test_reset_stale_statuses() {
        let (manager, _launcher, store, _dir) = setup();
        let mut profile = BrowserProfile::new("old", LaunchConfig::default());
        profile.status = BrowserStatus::Running;
        store.save_profile(&profile).await.unwrap();

        manager.reset_stale().await.unwrap();
        let stored = store.get_profile(&profile.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BrowserStatus::Stopped);
    }
}
