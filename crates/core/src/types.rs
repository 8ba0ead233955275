use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ─── Browser profiles ─────────────────────────────────────────────────────

/// Lifecycle status of a browser profile's process.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BrowserStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl BrowserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrowserStatus::Stopped => "stopped",
            BrowserStatus::Starting => "starting",
            BrowserStatus::Running => "running",
            BrowserStatus::Stopping => "stopping",
            BrowserStatus::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "stopped" => Some(BrowserStatus::Stopped),
            "starting" => Some(BrowserStatus::Starting),
            "running" => Some(BrowserStatus::Running),
            "stopping" => Some(BrowserStatus::Stopping),
            "error" => Some(BrowserStatus::Error),
            _ => None,
        }
    }
}

impl fmt::Display for BrowserStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    /// `scheme://host:port`, e.g. `socks5://127.0.0.1:1080`.
    pub server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FingerprintConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    /// Additional raw command-line switches passed to the browser.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LaunchConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyConfig>,
    #[serde(default)]
    pub fingerprint: FingerprintConfig,
    /// Persistent user-data directory. Defaults to `profiles/<id>` under the base dir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headless: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport: Option<Viewport>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BrowserProfile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub launch: LaunchConfig,
    #[serde(default)]
    pub status: BrowserStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BrowserProfile {
    pub fn new(name: &str, launch: LaunchConfig) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            name: name.to_string(),
            launch,
            status: BrowserStatus::Stopped,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ─── Tasks ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Number => "number",
            ParamType::Integer => "integer",
            ParamType::Boolean => "boolean",
            ParamType::Array => "array",
            ParamType::Object => "object",
        }
    }

    /// Whether a JSON value has this primitive type.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Number => value.is_number(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Array => value.is_array(),
            ParamType::Object => value.is_object(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ParameterSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ParamType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A named external package a task declares it needs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct PackageRequirement {
    pub name: String,
    /// Exact version or semver range. `None` means latest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub force: bool,
}

impl PackageRequirement {
    pub fn new(name: &str, version: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            version: version.map(|v| v.to_string()),
            force: false,
        }
    }

    /// Parse `name`, `name@range`, `@scope/name` or `@scope/name@range`.
    pub fn parse(spec: &str) -> Option<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            return None;
        }
        let split_at = spec
            .char_indices()
            .skip(1)
            .filter(|(_, c)| *c == '@')
            .map(|(i, _)| i)
            .last();
        let (name, version) = match split_at {
            Some(i) => (&spec[..i], Some(&spec[i + 1..])),
            None => (spec, None),
        };
        if name.is_empty() || name == "@" {
            return None;
        }
        let version = version.filter(|v| !v.is_empty());
        Some(Self::new(name, version))
    }
}

impl fmt::Display for PackageRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(v) => write!(f, "{}@{}", self.name, v),
            None => write!(f, "{}", self.name),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskConfig {
    /// Reset cookies, storage, history and viewport after every run.
    #[serde(default)]
    pub restore_browser_state: bool,
    #[serde(default)]
    pub cache_result: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Rhai source. Must define `fn run(params)`.
    pub script: String,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    #[serde(default)]
    pub dependencies: Vec<PackageRequirement>,
    #[serde(default)]
    pub config: TaskConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(name: &str, script: &str) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            name: name.to_string(),
            description: String::new(),
            script: script.to_string(),
            parameters: Vec::new(),
            dependencies: Vec::new(),
            config: TaskConfig::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

// ─── Executions ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Progress {
    pub current: u64,
    pub total: u64,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: String,
    pub task_id: String,
    pub browser_id: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub parameters: Value,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    #[serde(default)]
    pub progress: Option<Progress>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Execution {
    pub fn pending(task_id: &str, browser_id: &str, parameters: Value) -> Self {
        Self {
            id: new_id(),
            task_id: task_id.to_string(),
            browser_id: browser_id.to_string(),
            status: ExecutionStatus::Pending,
            parameters,
            created_at: Utc::now(),
            start_time: None,
            end_time: None,
            logs: Vec::new(),
            progress: None,
            result: None,
            error: None,
        }
    }
}

// ─── Schedules ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleKind {
    Immediate,
    Delayed,
    Interval,
    Cron,
}

impl ScheduleKind {
    pub fn is_single_shot(&self) -> bool {
        matches!(self, ScheduleKind::Immediate | ScheduleKind::Delayed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleSpec {
    #[serde(rename = "type")]
    pub kind: ScheduleKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<i64>,
    /// Stop after this many firings (interval/cron only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    /// IANA timezone for cron evaluation. UTC when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_at: Option<DateTime<Utc>>,
}

impl ScheduleSpec {
    fn base(kind: ScheduleKind) -> Self {
        Self {
            kind,
            delay_ms: None,
            interval_ms: None,
            max_iterations: None,
            cron: None,
            timezone: None,
            start_at: None,
            end_at: None,
        }
    }

    pub fn immediate() -> Self {
        Self::base(ScheduleKind::Immediate)
    }

    pub fn delayed(delay_ms: i64) -> Self {
        Self {
            delay_ms: Some(delay_ms),
            ..Self::base(ScheduleKind::Delayed)
        }
    }

    pub fn interval(interval_ms: i64) -> Self {
        Self {
            interval_ms: Some(interval_ms),
            ..Self::base(ScheduleKind::Interval)
        }
    }

    pub fn cron(expr: &str) -> Self {
        Self {
            cron: Some(expr.to_string()),
            ..Self::base(ScheduleKind::Cron)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTask {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub task_id: String,
    pub spec: ScheduleSpec,
    pub browser_id: String,
    #[serde(default)]
    pub parameters: Value,
    pub is_active: bool,
    #[serde(default)]
    pub next_execution_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_execution_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub execution_count: u64,
    /// Externally imposed cap on total firings, independent of the schedule rule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_executions: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_requirement() {
        let r = PackageRequirement::parse("lodash@^4.17.0").unwrap();
        assert_eq!(r.name, "lodash");
        assert_eq!(r.version.as_deref(), Some("^4.17.0"));

        let r = PackageRequirement::parse("@scope/pkg@1.2.3").unwrap();
        assert_eq!(r.name, "@scope/pkg");
        assert_eq!(r.version.as_deref(), Some("1.2.3"));

        let r = PackageRequirement::parse("@scope/pkg").unwrap();
        assert_eq!(r.name, "@scope/pkg");
        assert!(r.version.is_none());

        assert!(PackageRequirement::parse("  ").is_none());
        assert_eq!(PackageRequirement::parse("dayjs@").unwrap().version, None);
    }

    #[test]
    fn test_param_type_matches() {
        assert!(ParamType::Integer.matches(&json!(3)));
        assert!(!ParamType::Integer.matches(&json!(3.5)));
        assert!(ParamType::Number.matches(&json!(3.5)));
        assert!(ParamType::Object.matches(&json!({"a": 1})));
        assert!(!ParamType::String.matches(&json!(1)));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!ExecutionStatus::Pending.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_schedule_spec_wire_format() {
        let spec: ScheduleSpec =
            serde_json::from_value(json!({"type": "interval", "intervalMs": 5000, "maxIterations": 3}))
                .unwrap();
        assert_eq!(spec.kind, ScheduleKind::Interval);
        assert_eq!(spec.interval_ms, Some(5000));
        assert_eq!(spec.max_iterations, Some(3));
        assert!(ScheduleKind::Delayed.is_single_shot());
    }
}
