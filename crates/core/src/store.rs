use async_trait::async_trait;

use crate::error::Result;
use crate::types::{BrowserProfile, BrowserStatus, Execution, ScheduledTask, Task};

/// Narrow record CRUD interface the engine persists through.
///
/// `update_*` methods return `Ok(false)` when the record no longer exists so callers can treat an
/// update racing a delete as benign.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_profile(&self, id: &str) -> Result<Option<BrowserProfile>>;
    async fn list_profiles(&self) -> Result<Vec<BrowserProfile>>;
    async fn save_profile(&self, profile: &BrowserProfile) -> Result<()>;
    async fn update_profile_status(
        &self,
        id: &str,
        status: BrowserStatus,
        last_error: Option<&str>,
    ) -> Result<bool>;
    async fn delete_profile(&self, id: &str) -> Result<bool>;

    async fn get_task(&self, id: &str) -> Result<Option<Task>>;
    async fn list_tasks(&self) -> Result<Vec<Task>>;
    async fn save_task(&self, task: &Task) -> Result<()>;
    async fn delete_task(&self, id: &str) -> Result<bool>;

    async fn get_execution(&self, id: &str) -> Result<Option<Execution>>;
    /// Executions of one task, newest first.
    async fn list_executions(&self, task_id: &str) -> Result<Vec<Execution>>;
    async fn save_execution(&self, execution: &Execution) -> Result<()>;
    /// Executions still `pending` or `running`, oldest first.
    async fn list_unfinished_executions(&self) -> Result<Vec<Execution>>;

    async fn get_schedule(&self, id: &str) -> Result<Option<ScheduledTask>>;
    async fn list_schedules(&self) -> Result<Vec<ScheduledTask>>;
    async fn insert_schedule(&self, schedule: &ScheduledTask) -> Result<()>;
    async fn update_schedule(&self, schedule: &ScheduledTask) -> Result<bool>;
    async fn delete_schedule(&self, id: &str) -> Result<bool>;
}
