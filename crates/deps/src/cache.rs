//! Shared store of installed packages, keyed by `name@version`.
//!
//! Entries are reference-counted by the tasks that use them. Eviction only ever removes
//! entries no task references, least recently used first. The index is rewritten on
//! every mutation while the state lock is held.

use autobrowse_core::paths::sanitize;
use autobrowse_core::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub name: String,
    pub version: String,
    pub path: PathBuf,
    pub size: u64,
    pub cached_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default)]
    pub used_by_tasks: BTreeSet<String>,
}

impl CacheEntry {
    pub fn key(&self) -> String {
        cache_key(&self.name, &self.version)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: usize,
    pub total_size: u64,
    pub referenced_entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

#[derive(Default)]
struct CacheState {
    entries: BTreeMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
}

impl CacheState {
    fn total_size(&self) -> u64 {
        self.entries.values().map(|e| e.size).sum()
    }
}

pub struct DependencyCache {
    root: PathBuf,
    index_path: PathBuf,
    max_entries: usize,
    max_size: u64,
    state: Mutex<CacheState>,
}

pub fn cache_key(name: &str, version: &str) -> String {
    format!("{}@{}", name, version)
}

impl DependencyCache {
    /// Open the cache rooted at `root`, loading `index.json` if present.
    pub async fn open(root: PathBuf, max_entries: usize, max_size: u64) -> Result<Self> {
        std::fs::create_dir_all(&root)?;
        let cache = Self {
            index_path: root.join("index.json"),
            root,
            max_entries,
            max_size,
            state: Mutex::new(CacheState::default()),
        };
        cache.load().await;
        Ok(cache)
    }

    /// Replace in-memory state with the on-disk index. Missing or corrupt index loads empty.
    pub async fn load(&self) {
        let entries = match std::fs::read_to_string(&self.index_path) {
            Ok(content) => match serde_json::from_str::<BTreeMap<String, CacheEntry>>(&content) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(path = %self.index_path.display(), error = %e, "Corrupt cache index, starting empty");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                warn!(path = %self.index_path.display(), error = %e, "Unreadable cache index, starting empty");
                BTreeMap::new()
            }
        };
        debug!(entries = entries.len(), "Dependency cache loaded");
        let mut state = self.state.lock().await;
        state.entries = entries;
    }

    fn save_index(&self, state: &CacheState) -> Result<()> {
        let content = serde_json::to_string_pretty(&state.entries)?;
        let tmp = self.index_path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.index_path)?;
        Ok(())
    }

    fn save_or_warn(&self, state: &CacheState) {
        if let Err(e) = self.save_index(state) {
            warn!(error = %e, "Failed to write cache index");
        }
    }

    fn record_hit(&self, state: &mut CacheState, key: &str) -> Option<CacheEntry> {
        let entry = state.entries.get_mut(key)?;
        entry.last_used_at = Utc::now();
        entry.usage_count += 1;
        let entry = entry.clone();
        state.hits += 1;
        self.save_or_warn(state);
        Some(entry)
    }

    /// Exact lookup. Entries whose storage vanished are dropped and count as misses.
    pub async fn get(&self, name: &str, version: &str) -> Option<CacheEntry> {
        let mut state = self.state.lock().await;
        let key = cache_key(name, version);
        let present = state.entries.get(&key).map(|e| e.path.exists());
        match present {
            Some(true) => self.record_hit(&mut state, &key),
            Some(false) => {
                warn!(package = %key, "Cached package storage missing, dropping entry");
                state.entries.remove(&key);
                state.misses += 1;
                self.save_or_warn(&state);
                None
            }
            None => {
                state.misses += 1;
                None
            }
        }
    }

    /// Highest cached version of `name` satisfying `range`.
    pub async fn find(&self, name: &str, range: &str) -> Option<CacheEntry> {
        let mut state = self.state.lock().await;
        match resolve(&state, name, range) {
            Some(key) => self.record_hit(&mut state, &key),
            None => {
                state.misses += 1;
                None
            }
        }
    }

    /// Like `find`, without touching recency or the hit counters.
    pub async fn peek(&self, name: &str, range: &str) -> Option<CacheEntry> {
        let state = self.state.lock().await;
        resolve(&state, name, range).and_then(|key| state.entries.get(&key).cloned())
    }

    /// Insert a resolved package, or add `task_id` as a user of an existing entry.
    pub async fn put(
        &self,
        source_dir: &Path,
        name: &str,
        version: &str,
        task_id: &str,
    ) -> Result<CacheEntry> {
        self.store(source_dir, name, version, task_id, false).await
    }

    /// Like `put`, but an existing entry's storage is replaced with `source_dir`.
    pub async fn refresh(
        &self,
        source_dir: &Path,
        name: &str,
        version: &str,
        task_id: &str,
    ) -> Result<CacheEntry> {
        self.store(source_dir, name, version, task_id, true).await
    }

    async fn store(
        &self,
        source_dir: &Path,
        name: &str,
        version: &str,
        task_id: &str,
        replace: bool,
    ) -> Result<CacheEntry> {
        let key = cache_key(name, version);
        let mut state = self.state.lock().await;

        if !replace {
            if let Some(entry) = state.entries.get_mut(&key) {
                entry.used_by_tasks.insert(task_id.to_string());
                entry.last_used_at = Utc::now();
                let entry = entry.clone();
                self.save_index(&state)?;
                return Ok(entry);
            }
        }

        let dest = self.root.join(sanitize(&key));
        let size = copy_into(source_dir.to_path_buf(), dest.clone()).await?;

        let now = Utc::now();
        let entry = match state.entries.get_mut(&key) {
            Some(entry) => {
                entry.size = size;
                entry.cached_at = now;
                entry.last_used_at = now;
                entry.used_by_tasks.insert(task_id.to_string());
                entry.clone()
            }
            None => {
                self.evict_locked(&mut state, 1, size);
                let entry = CacheEntry {
                    name: name.to_string(),
                    version: version.to_string(),
                    path: dest,
                    size,
                    cached_at: now,
                    last_used_at: now,
                    usage_count: 0,
                    used_by_tasks: BTreeSet::from([task_id.to_string()]),
                };
                state.entries.insert(key.clone(), entry.clone());
                entry
            }
        };
        self.save_index(&state)?;
        info!(package = %key, size, "Package cached");
        Ok(entry)
    }

    /// Drop `task_id` from every entry. Entries stay until evicted.
    pub async fn release(&self, task_id: &str) -> usize {
        let mut state = self.state.lock().await;
        let mut released = 0;
        for entry in state.entries.values_mut() {
            if entry.used_by_tasks.remove(task_id) {
                released += 1;
            }
        }
        if released > 0 {
            self.save_or_warn(&state);
            debug!(task_id, released, "Released cached packages");
        }
        released
    }

    /// Enforce both bounds. Returns the number of entries removed.
    pub async fn evict(&self) -> usize {
        let mut state = self.state.lock().await;
        let removed = self.evict_locked(&mut state, 0, 0);
        if removed > 0 {
            self.save_or_warn(&state);
        }
        removed
    }

    /// Evict LRU unreferenced entries until `incoming` more entries of `incoming_size` bytes fit.
    fn evict_locked(&self, state: &mut CacheState, incoming: usize, incoming_size: u64) -> usize {
        let mut removed = 0;
        loop {
            let over_count = state.entries.len() + incoming > self.max_entries;
            let over_size = state.total_size() + incoming_size > self.max_size;
            if !over_count && !over_size {
                break;
            }
            let victim = state
                .entries
                .values()
                .filter(|e| e.used_by_tasks.is_empty())
                .min_by_key(|e| e.last_used_at)
                .map(|e| e.key());
            let Some(key) = victim else {
                debug!("Cache over bounds but every entry is referenced");
                break;
            };
            if let Some(entry) = state.entries.remove(&key) {
                remove_storage(&entry);
                info!(package = %key, size = entry.size, "Evicted cached package");
                removed += 1;
            }
        }
        removed
    }

    /// Remove every unreferenced entry. Returns the number removed.
    pub async fn clear(&self) -> usize {
        let mut state = self.state.lock().await;
        let keys: Vec<String> = state
            .entries
            .values()
            .filter(|e| e.used_by_tasks.is_empty())
            .map(|e| e.key())
            .collect();
        for key in &keys {
            if let Some(entry) = state.entries.remove(key) {
                remove_storage(&entry);
            }
        }
        if !keys.is_empty() {
            self.save_or_warn(&state);
        }
        keys.len()
    }

    pub async fn stats(&self) -> CacheStats {
        let state = self.state.lock().await;
        let lookups = state.hits + state.misses;
        CacheStats {
            entries: state.entries.len(),
            total_size: state.total_size(),
            referenced_entries: state
                .entries
                .values()
                .filter(|e| !e.used_by_tasks.is_empty())
                .count(),
            hits: state.hits,
            misses: state.misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                state.hits as f64 / lookups as f64
            },
        }
    }

    pub async fn entries(&self) -> Vec<CacheEntry> {
        self.state.lock().await.entries.values().cloned().collect()
    }
}

/// Parse an npm-style range into a semver requirement. Space-separated comparators are ANDed and
/// a bare version pins exactly that version.
pub fn parse_range(range: &str) -> Option<semver::VersionReq> {
    let range = range.trim();
    if range.is_empty() || range == "latest" || range == "*" {
        return Some(semver::VersionReq::STAR);
    }
    if semver::Version::parse(range).is_ok() {
        return semver::VersionReq::parse(&format!("={}", range)).ok();
    }
    if let Ok(req) = semver::VersionReq::parse(range) {
        return Some(req);
    }
    let joined = range.split_whitespace().collect::<Vec<_>>().join(", ");
    semver::VersionReq::parse(&joined).ok()
}

fn resolve(state: &CacheState, name: &str, range: &str) -> Option<String> {
    match parse_range(range) {
        Some(req) => state
            .entries
            .values()
            .filter(|e| e.name == name && e.path.exists())
            .filter_map(|e| {
                semver::Version::parse(&e.version)
                    .ok()
                    .filter(|v| req.matches(v))
                    .map(|v| (v, e.key()))
            })
            .max_by(|a, b| a.0.cmp(&b.0))
            .map(|(_, key)| key),
        // Not a semver range; only an exact match can satisfy it
        None => Some(cache_key(name, range)).filter(|k| state.entries.contains_key(k)),
    }
}

/// Copy a package directory into cache storage, replacing what was there. Returns its size.
async fn copy_into(source: PathBuf, dest: PathBuf) -> Result<u64> {
    tokio::task::spawn_blocking(move || -> std::io::Result<u64> {
        if dest.exists() {
            std::fs::remove_dir_all(&dest)?;
        }
        copy_dir(&source, &dest)?;
        dir_size(&dest)
    })
    .await
    .map_err(|e| Error::Dependency(format!("Cache copy task failed: {}", e)))?
    .map_err(Error::from)
}

fn remove_storage(entry: &CacheEntry) {
    if entry.path.exists() {
        if let Err(e) = std::fs::remove_dir_all(&entry.path) {
            warn!(path = %entry.path.display(), error = %e, "Failed to remove cached package");
        }
    }
}

fn copy_dir(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn dir_size(path: &Path) -> std::io::Result<u64> {
    let mut total = 0;
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_dir() {
            total += dir_size(&entry.path())?;
        } else {
            total += meta.len();
        }
    }
    Ok(total)
}
