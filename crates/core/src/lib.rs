pub mod config;
pub mod dispatch;
pub mod error;
pub mod paths;
pub mod store;
pub mod types;

pub use config::Config;
pub use dispatch::TaskDispatcher;
pub use error::{Error, Result};
pub use paths::Paths;
pub use store::RecordStore;
pub use types::{
    BrowserProfile, BrowserStatus, Execution, ExecutionStatus, LaunchConfig, LogEntry, LogLevel,
    PackageRequirement, ParamType, ParameterSpec, Progress, ScheduleKind, ScheduleSpec,
    ScheduledTask, Task, TaskConfig,
};
