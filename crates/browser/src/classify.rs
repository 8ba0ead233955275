use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchFailureKind {
    Permission,
    MissingBinary,
    PortConflict,
    Timeout,
    Generic,
}

impl LaunchFailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Permission => "permission",
            Self::MissingBinary => "missing_binary",
            Self::PortConflict => "port_conflict",
            Self::Timeout => "timeout",
            Self::Generic => "generic",
        }
    }

    fn advice(&self) -> &'static str {
        match self {
            Self::Permission => {
                "The browser could not be started due to insufficient permissions. Check that the executable and the profile data directory are accessible to the current user."
            }
            Self::MissingBinary => {
                "The browser executable was not found. Install Chrome or Edge, or set browser.executable in the config."
            }
            Self::PortConflict => {
                "The browser debugging port is already in use. Close other automation sessions and try again."
            }
            Self::Timeout => {
                "The browser did not become ready in time. Increase browser.launchTimeoutSecs or check system load."
            }
            Self::Generic => "The browser failed to start.",
        }
    }
}

impl fmt::Display for LaunchFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified browser start failure with a user-facing message.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchFailure {
    pub kind: LaunchFailureKind,
    pub message: String,
}

pub fn classify_launch_failure(cause: &str) -> LaunchFailure {
    let lower = cause.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));
    // Whole word only, so "report" or "unsupported" do not count
    let mentions_port = lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|word| word == "port" || word == "ports");

    // Timeout first: "not ready after" messages can mention a port
    let kind = if has(&["timed out", "timeout", "not ready after"]) {
        LaunchFailureKind::Timeout
    } else if has(&["permission denied", "eacces", "access is denied"]) {
        LaunchFailureKind::Permission
    } else if mentions_port || has(&["address in use", "address already in use", "eaddrinuse"]) {
        LaunchFailureKind::PortConflict
    } else if has(&["not found", "enoent", "no such file"]) {
        LaunchFailureKind::MissingBinary
    } else {
        LaunchFailureKind::Generic
    };

    LaunchFailure {
        kind,
        message: format!("{} (cause: {})", kind.advice(), cause),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let cases = [
            ("Failed to launch chrome: Permission denied (os error 13)", LaunchFailureKind::Permission),
            ("spawn EACCES", LaunchFailureKind::Permission),
            ("chrome not found. Please install it.", LaunchFailureKind::MissingBinary),
            ("No such file or directory (os error 2)", LaunchFailureKind::MissingBinary),
            ("listen EADDRINUSE 127.0.0.1:9222", LaunchFailureKind::PortConflict),
            ("Timeout: Browser debugging endpoint not ready after 15s", LaunchFailureKind::Timeout),
            ("DevTools port 9222 is taken", LaunchFailureKind::PortConflict),
            ("segfault", LaunchFailureKind::Generic),
        ];
        for (cause, expected) in cases {
            assert_eq!(classify_launch_failure(cause).kind, expected, "{}", cause);
        }
    }

    #[test]
    fn test_port_must_be_a_whole_word() {
        for cause in [
            "unsupported flag --foo",
            "failed to import profile",
            "crash report written to /tmp/x",
        ] {
            assert_eq!(classify_launch_failure(cause).kind, LaunchFailureKind::Generic, "{}", cause);
        }
        assert_eq!(
            classify_launch_failure("remote debugging port: 9222 busy").kind,
            LaunchFailureKind::PortConflict
        );
    }

    #[test]
    fn test_message_carries_cause() {
        let failure = classify_launch_failure("spawn EACCES");
        assert!(failure.message.contains("permissions"));
        assert!(failure.message.ends_with("(cause: spawn EACCES)"));
    }
}
