pub mod cache;
pub mod installer;
pub mod manifest;
pub mod queue;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use cache::{CacheEntry, CacheStats, DependencyCache};
pub use installer::{NpmPackageManager, PackageManager};
pub use queue::{DependencyCheck, DependencyInstallQueue, InstallFailure, InstallReport, QueueStats};
