use async_trait::async_trait;
use autobrowse_core::{
    BrowserProfile, BrowserStatus, Execution, RecordStore, Result, ScheduledTask, Task,
};
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Process-local record store, used for ephemeral runs and tests.
#[derive(Default)]
pub struct InMemoryStore {
    profiles: RwLock<HashMap<String, BrowserProfile>>,
    tasks: RwLock<HashMap<String, Task>>,
    executions: RwLock<HashMap<String, Execution>>,
    schedules: RwLock<HashMap<String, ScheduledTask>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn get_profile(&self, id: &str) -> Result<Option<BrowserProfile>> {
        Ok(self.profiles.read().await.get(id).cloned())
    }

    async fn list_profiles(&self) -> Result<Vec<BrowserProfile>> {
        let mut list: Vec<_> = self.profiles.read().await.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(list)
    }

    async fn save_profile(&self, profile: &BrowserProfile) -> Result<()> {
        self.profiles
            .write()
            .await
            .insert(profile.id.clone(), profile.clone());
        Ok(())
    }

    async fn update_profile_status(
        &self,
        id: &str,
        status: BrowserStatus,
        last_error: Option<&str>,
    ) -> Result<bool> {
        let mut profiles = self.profiles.write().await;
        match profiles.get_mut(id) {
            Some(p) => {
                p.status = status;
                p.last_error = last_error.map(|s| s.to_string());
                p.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_profile(&self, id: &str) -> Result<bool> {
        Ok(self.profiles.write().await.remove(id).is_some())
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.tasks.read().await.get(id).cloned())
    }

    async fn list_tasks(&self) -> Result<Vec<Task>> {
        let mut list: Vec<_> = self.tasks.read().await.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(list)
    }

    async fn save_task(&self, task: &Task) -> Result<()> {
        self.tasks.write().await.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn delete_task(&self, id: &str) -> Result<bool> {
        Ok(self.tasks.write().await.remove(id).is_some())
    }

    async fn get_execution(&self, id: &str) -> Result<Option<Execution>> {
        Ok(self.executions.read().await.get(id).cloned())
    }

    async fn list_executions(&self, task_id: &str) -> Result<Vec<Execution>> {
        let mut list: Vec<_> = self
            .executions
            .read()
            .await
            .values()
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(list)
    }

    async fn list_unfinished_executions(&self) -> Result<Vec<Execution>> {
        let mut list: Vec<_> = self
            .executions
            .read()
            .await
            .values()
            .filter(|e| !e.status.is_terminal())
            .cloned()
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(list)
    }

    async fn save_execution(&self, execution: &Execution) -> Result<()> {
        self.executions
            .write()
            .await
            .insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn get_schedule(&self, id: &str) -> Result<Option<ScheduledTask>> {
        Ok(self.schedules.read().await.get(id).cloned())
    }

    async fn list_schedules(&self) -> Result<Vec<ScheduledTask>> {
        let mut list: Vec<_> = self.schedules.read().await.values().cloned().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(list)
    }

    async fn insert_schedule(&self, schedule: &ScheduledTask) -> Result<()> {
        self.schedules
            .write()
            .await
            .insert(schedule.id.clone(), schedule.clone());
        Ok(())
    }

    async fn update_schedule(&self, schedule: &ScheduledTask) -> Result<bool> {
        let mut schedules = self.schedules.write().await;
        match schedules.get_mut(&schedule.id) {
            Some(existing) => {
                *existing = schedule.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_schedule(&self, id: &str) -> Result<bool> {
        Ok(self.schedules.write().await.remove(id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autobrowse_core::LaunchConfig;

    #[tokio::test]
    async fn test_status_update_on_missing_profile() {
        let store = InMemoryStore::new();
        assert!(!store
            .update_profile_status("ghost", BrowserStatus::Running, None)
            .await
            .unwrap());

        let profile = BrowserProfile::new("p", LaunchConfig::default());
        store.save_profile(&profile).await.unwrap();
        assert!(store
            .update_profile_status(&profile.id, BrowserStatus::Error, Some("boom"))
            .await
            .unwrap());
        let loaded = store.get_profile(&profile.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, BrowserStatus::Error);
        assert_eq!(loaded.last_error.as_deref(), Some("boom"));
    }
}
