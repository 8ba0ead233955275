pub mod cdp;
pub mod classify;
pub mod launcher;
pub mod manager;
pub mod page;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use classify::{classify_launch_failure, LaunchFailure, LaunchFailureKind};
pub use launcher::{BrowserLauncher, ChromeLauncher, LaunchedBrowser, ProcessControl, ProcessExit};
pub use manager::{BrowserProcessManager, StatusChange};
pub use page::{CdpPage, PageDriver};
