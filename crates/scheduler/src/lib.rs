pub mod next_run;
pub mod service;

pub use next_run::{next_run, parse_cron, validate_spec};
pub use service::{ScheduleRequest, SchedulerEvent, TaskScheduler};
