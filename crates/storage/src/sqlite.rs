use async_trait::async_trait;
use autobrowse_core::{
    BrowserProfile, BrowserStatus, Error, Execution, RecordStore, Result, ScheduledTask, Task,
};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

fn storage_err(context: &str, e: rusqlite::Error) -> Error {
    Error::Storage(format!("{}: {}", context, e))
}

/// SQLite-backed record store. Each record is kept as a JSON document next to the handful of
/// columns the engine filters on.
#[derive(Clone)]
pub struct SqliteStore {
    inner: Arc<Mutex<Connection>>,
    #[allow(dead_code)]
    db_path: PathBuf,
}

impl SqliteStore {
    /// Open (or create) the database at the given path.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Storage(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(db_path)
            .map_err(|e| storage_err("Failed to open database", e))?;

        // WAL keeps readers from blocking the scheduler's writes
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();

        let store = Self {
            inner: Arc::new(Mutex::new(conn)),
            db_path: db_path.to_path_buf(),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.inner
            .lock()
            .map_err(|e| Error::Storage(format!("Lock error: {}", e)))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS profiles (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'stopped',
                data TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                data TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                data TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_executions_task ON executions(task_id, created_at);

            CREATE TABLE IF NOT EXISTS schedules (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                is_active INTEGER NOT NULL,
                data TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            ",
        )
        .map_err(|e| storage_err("Failed to init schema", e))?;

        debug!("Record store schema initialized");
        Ok(())
    }

    fn get_doc<T: DeserializeOwned>(&self, table: &str, id: &str) -> Result<Option<T>> {
        let conn = self.conn()?;
        let sql = format!("SELECT data FROM {} WHERE id = ?1", table);
        let data: Option<String> = conn
            .query_row(&sql, params![id], |row| row.get(0))
            .optional()
            .map_err(|e| storage_err("Query error", e))?;
        match data {
            Some(d) => Ok(Some(serde_json::from_str(&d)?)),
            None => Ok(None),
        }
    }

    fn list_docs<T: DeserializeOwned>(&self, sql: &str, args: &[&str]) -> Result<Vec<T>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| storage_err("Prepare error", e))?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), |row| {
                row.get::<_, String>(0)
            })
            .map_err(|e| storage_err("Query error", e))?;

        let mut out = Vec::new();
        for row in rows {
            let data = row.map_err(|e| storage_err("Row error", e))?;
            match serde_json::from_str::<T>(&data) {
                Ok(doc) => out.push(doc),
                Err(e) => warn!(error = %e, "Skipping undecodable record"),
            }
        }
        Ok(out)
    }

    fn delete_doc(&self, table: &str, id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let sql = format!("DELETE FROM {} WHERE id = ?1", table);
        let n = conn
            .execute(&sql, params![id])
            .map_err(|e| storage_err("Delete error", e))?;
        Ok(n > 0)
    }
}

fn to_doc<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn get_profile(&self, id: &str) -> Result<Option<BrowserProfile>> {
        self.get_doc("profiles", id)
    }

    async fn list_profiles(&self) -> Result<Vec<BrowserProfile>> {
        self.list_docs("SELECT data FROM profiles ORDER BY name", &[])
    }

    async fn save_profile(&self, profile: &BrowserProfile) -> Result<()> {
        let data = to_doc(profile)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO profiles (id, name, status, data, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET name = ?2, status = ?3, data = ?4, updated_at = ?5",
            params![
                profile.id,
                profile.name,
                profile.status.as_str(),
                data,
                profile.updated_at.to_rfc3339()
            ],
        )
        .map_err(|e| storage_err("Upsert error", e))?;
        Ok(())
    }

    async fn update_profile_status(
        &self,
        id: &str,
        status: BrowserStatus,
        last_error: Option<&str>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let data: Option<String> = conn
            .query_row("SELECT data FROM profiles WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|e| storage_err("Query error", e))?;
        let Some(data) = data else {
            return Ok(false);
        };

        let mut profile: BrowserProfile = serde_json::from_str(&data)?;
        profile.status = status;
        profile.last_error = last_error.map(|s| s.to_string());
        profile.updated_at = Utc::now();

        let n = conn
            .execute(
                "UPDATE profiles SET status = ?1, data = ?2, updated_at = ?3 WHERE id = ?4",
                params![
                    status.as_str(),
                    to_doc(&profile)?,
                    profile.updated_at.to_rfc3339(),
                    id
                ],
            )
            .map_err(|e| storage_err("Update error", e))?;
        Ok(n > 0)
    }

    async fn delete_profile(&self, id: &str) -> Result<bool> {
        self.delete_doc("profiles", id)
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        self.get_doc("tasks", id)
    }

    async fn list_tasks(&self) -> Result<Vec<Task>> {
        self.list_docs("SELECT data FROM tasks ORDER BY name", &[])
    }

    async fn save_task(&self, task: &Task) -> Result<()> {
        let data = to_doc(task)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO tasks (id, name, data, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET name = ?2, data = ?3, updated_at = ?4",
            params![task.id, task.name, data, task.updated_at.to_rfc3339()],
        )
        .map_err(|e| storage_err("Upsert error", e))?;
        Ok(())
    }

    async fn delete_task(&self, id: &str) -> Result<bool> {
        self.delete_doc("tasks", id)
    }

    async fn get_execution(&self, id: &str) -> Result<Option<Execution>> {
        self.get_doc("executions", id)
    }

    async fn list_executions(&self, task_id: &str) -> Result<Vec<Execution>> {
        self.list_docs(
            "SELECT data FROM executions WHERE task_id = ?1 ORDER BY created_at DESC",
            &[task_id],
        )
    }

    async fn list_unfinished_executions(&self) -> Result<Vec<Execution>> {
        self.list_docs(
            "SELECT data FROM executions WHERE status IN ('pending', 'running') ORDER BY created_at",
            &[],
        )
    }

    async fn save_execution(&self, execution: &Execution) -> Result<()> {
        let data = to_doc(execution)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO executions (id, task_id, status, created_at, data) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET status = ?3, data = ?5",
            params![
                execution.id,
                execution.task_id,
                execution.status.as_str(),
                execution.created_at.to_rfc3339(),
                data
            ],
        )
        .map_err(|e| storage_err("Upsert error", e))?;
        Ok(())
    }

    async fn get_schedule(&self, id: &str) -> Result<Option<ScheduledTask>> {
        self.get_doc("schedules", id)
    }

    async fn list_schedules(&self) -> Result<Vec<ScheduledTask>> {
        self.list_docs("SELECT data FROM schedules ORDER BY updated_at", &[])
    }

    async fn insert_schedule(&self, schedule: &ScheduledTask) -> Result<()> {
        let data = to_doc(schedule)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO schedules (id, task_id, is_active, data, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                schedule.id,
                schedule.task_id,
                schedule.is_active,
                data,
                schedule.updated_at.to_rfc3339()
            ],
        )
        .map_err(|e| storage_err("Insert error", e))?;
        Ok(())
    }

    async fn update_schedule(&self, schedule: &ScheduledTask) -> Result<bool> {
        let data = to_doc(schedule)?;
        let conn = self.conn()?;
        let n = conn
            .execute(
                "UPDATE schedules SET is_active = ?1, data = ?2, updated_at = ?3 WHERE id = ?4",
                params![
                    schedule.is_active,
                    data,
                    schedule.updated_at.to_rfc3339(),
                    schedule.id
                ],
            )
            .map_err(|e| storage_err("Update error", e))?;
        Ok(n > 0)
    }

    async fn delete_schedule(&self, id: &str) -> Result<bool> {
        self.delete_doc("schedules", id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autobrowse_core::{ExecutionStatus, LaunchConfig, ScheduleSpec};
    use serde_json::json;
    use tempfile::TempDir;

    fn test_store() -> (SqliteStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::open(&dir.path().join("records.db")).unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_profile_status_update_and_race() {
        let (store, _dir) = test_store();
        let profile = BrowserProfile::new("shop-a", LaunchConfig::default());
        store.save_profile(&profile).await.unwrap();

        assert!(store
            .update_profile_status(&profile.id, BrowserStatus::Running, None)
            .await
            .unwrap());
        let loaded = store.get_profile(&profile.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, BrowserStatus::Running);

        assert!(store.delete_profile(&profile.id).await.unwrap());
        // Update after delete is a benign no-op
        assert!(!store
            .update_profile_status(&profile.id, BrowserStatus::Stopped, None)
            .await
            .unwrap());
        assert!(store.get_profile(&profile.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_executions_listed_newest_first() {
        let (store, _dir) = test_store();
        let mut first = Execution::pending("t1", "b1", json!({}));
        first.created_at = Utc::now() - chrono::Duration::seconds(10);
        let second = Execution::pending("t1", "b1", json!({"n": 2}));
        let other = Execution::pending("t2", "b1", json!({}));
        store.save_execution(&first).await.unwrap();
        store.save_execution(&second).await.unwrap();
        store.save_execution(&other).await.unwrap();

        let mut done = first.clone();
        done.status = ExecutionStatus::Completed;
        store.save_execution(&done).await.unwrap();

        let list = store.list_executions("t1").await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, second.id);
        assert_eq!(list[1].status, ExecutionStatus::Completed);

        let unfinished: Vec<String> = store
            .list_unfinished_executions()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(unfinished.len(), 2);
        assert!(unfinished.contains(&second.id) && unfinished.contains(&other.id));
    }

    #[tokio::test]
    async fn test_schedule_update_missing_returns_false() {
        let (store, _dir) = test_store();
        let now = Utc::now();
        let schedule = ScheduledTask {
            id: "s1".into(),
            name: "nightly".into(),
            task_id: "t1".into(),
            spec: ScheduleSpec::interval(60_000),
            browser_id: "b1".into(),
            parameters: json!({}),
            is_active: true,
            next_execution_time: Some(now),
            last_execution_time: None,
            execution_count: 0,
            max_executions: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        assert!(!store.update_schedule(&schedule).await.unwrap());
        store.insert_schedule(&schedule).await.unwrap();
        let mut paused = schedule.clone();
        paused.is_active = false;
        assert!(store.update_schedule(&paused).await.unwrap());
        assert!(!store.get_schedule("s1").await.unwrap().unwrap().is_active);
        assert_eq!(store.list_schedules().await.unwrap().len(), 1);
    }
}
