use async_trait::async_trait;
use autobrowse_core::{Error, PackageRequirement, Result};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

/// Runs the external package manager inside a prepared workspace.
#[async_trait]
pub trait PackageManager: Send + Sync {
    fn name(&self) -> &str;

    /// Install the workspace's declared dependency. `work_dir` already holds the manifest.
    async fn install(
        &self,
        work_dir: &Path,
        requirement: &PackageRequirement,
        limit: Duration,
    ) -> Result<()>;
}

pub struct NpmPackageManager {
    program: String,
    args: Vec<String>,
}

const MAX_OUTPUT_CHARS: usize = 2000;

impl NpmPackageManager {
    pub fn new(program: &str, args: Vec<String>) -> Self {
        Self {
            program: program.to_string(),
            args,
        }
    }
}

#[async_trait]
impl PackageManager for NpmPackageManager {
    fn name(&self) -> &str {
        &self.program
    }

    async fn install(
        &self,
        work_dir: &Path,
        requirement: &PackageRequirement,
        limit: Duration,
    ) -> Result<()> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(package = %requirement, program = %self.program, "Running package manager");
        // On timeout the output future is dropped, which kills the child
        match timeout(limit, cmd.output()).await {
            Ok(Ok(output)) if output.status.success() => Ok(()),
            Ok(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(Error::Dependency(format!(
                    "{} install of {} failed ({}): {}",
                    self.program,
                    requirement,
                    output.status,
                    truncate(stderr.trim(), MAX_OUTPUT_CHARS)
                )))
            }
            Ok(Err(e)) => Err(Error::Dependency(format!(
                "Failed to run {}: {}",
                self.program, e
            ))),
            Err(_) => Err(Error::Timeout(format!(
                "Installing {} timed out after {} seconds",
                requirement,
                limit.as_secs()
            ))),
        }
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_nonzero_exit_is_dependency_error() {
        let dir = tempfile::tempdir().unwrap();
        let pm = NpmPackageManager::new("sh", vec!["-c".to_string(), "echo boom >&2; exit 3".to_string()]);
        let err = pm
            .install(dir.path(), &PackageRequirement::new("x", None), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "dependency");
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_timeout_kills_install() {
        let dir = tempfile::tempdir().unwrap();
        let pm = NpmPackageManager::new("sh", vec!["-c".to_string(), "sleep 5".to_string()]);
        let started = std::time::Instant::now();
        let err = pm
            .install(dir.path(), &PackageRequirement::new("x", None), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "timeout");
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let dir = tempfile::tempdir().unwrap();
        let pm = NpmPackageManager::new("definitely-not-a-package-manager", vec![]);
        let err = pm
            .install(dir.path(), &PackageRequirement::new("x", None), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to run"));
    }

    #[test]
    fn test_truncate_is_char_safe() {
        assert_eq!(truncate("héllo", 2), "hé...");
        assert_eq!(truncate("ok", 10), "ok");
    }
}
