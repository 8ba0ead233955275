use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

/// Starts task executions on behalf of a trigger (scheduler, bridge).
///
/// Lives in core so the scheduler can fire tasks without depending on the engine crate.
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    /// Dispatch one execution and return its id. Must return once the execution is accepted,
    /// not when it finishes.
    async fn dispatch(&self, task_id: &str, browser_id: &str, parameters: Value) -> Result<String>;
}
