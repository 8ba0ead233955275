//! Reading `package.json` files of installed packages.

use autobrowse_core::{Error, PackageRequirement, Result};
use serde::Deserialize;
use serde_json::json;
use std::path::{Path, PathBuf};

/// Default file name of a Rhai module shipped at a package root.
const DEFAULT_RHAI_MODULE: &str = "index.rhai";

#[derive(Debug, Clone, Deserialize)]
pub struct PackageManifest {
    pub name: String,
    pub version: String,
    /// Relative path of a Rhai module the package exposes to scripts.
    #[serde(default)]
    pub rhai: Option<String>,
}

/// Directory an installed package lands in under `work_dir`.
pub fn installed_package_dir(work_dir: &Path, name: &str) -> PathBuf {
    let mut dir = work_dir.join("node_modules");
    for part in name.split('/') {
        dir = dir.join(part);
    }
    dir
}

pub fn read_manifest(package_dir: &Path) -> Result<PackageManifest> {
    let path = package_dir.join("package.json");
    let content = std::fs::read_to_string(&path).map_err(|e| {
        Error::Dependency(format!("Cannot read manifest {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Dependency(format!("Invalid manifest {}: {}", path.display(), e))
    })
}

/// Verify that `requirement` was installed into `work_dir` and return its manifest.
pub fn read_installed_manifest(
    work_dir: &Path,
    requirement: &PackageRequirement,
) -> Result<(PathBuf, PackageManifest)> {
    let dir = installed_package_dir(work_dir, &requirement.name);
    let manifest = read_manifest(&dir)?;
    if manifest.name != requirement.name {
        return Err(Error::Dependency(format!(
            "Installed manifest names '{}', expected '{}'",
            manifest.name, requirement.name
        )));
    }
    Ok((dir, manifest))
}

/// The one-dependency manifest written into an install workspace.
pub fn workspace_manifest(requirement: &PackageRequirement) -> serde_json::Value {
    let version = requirement.version.as_deref().unwrap_or("latest");
    json!({
        "name": "autobrowse-install",
        "version": "0.0.0",
        "private": true,
        "dependencies": { requirement.name.clone(): version },
    })
}

/// Rhai module shipped by a cached package, if any.
pub fn rhai_module(package_dir: &Path) -> Option<PathBuf> {
    let declared = read_manifest(package_dir)
        .ok()
        .and_then(|m| m.rhai)
        .map(|rel| package_dir.join(rel));
    declared
        .or_else(|| Some(package_dir.join(DEFAULT_RHAI_MODULE)))
        .filter(|p| p.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_package_dir() {
        let dir = installed_package_dir(Path::new("/w"), "@scope/pkg");
        assert_eq!(dir, PathBuf::from("/w/node_modules/@scope/pkg"));
    }

    #[test]
    fn test_workspace_manifest_declares_one_dependency() {
        let manifest = workspace_manifest(&PackageRequirement::new("lodash", Some("^4.17.0")));
        assert_eq!(manifest["dependencies"], json!({"lodash": "^4.17.0"}));
        let manifest = workspace_manifest(&PackageRequirement::new("dayjs", None));
        assert_eq!(manifest["dependencies"]["dayjs"], "latest");
    }

    #[test]
    fn test_installed_manifest_must_parse_and_match() {
        let dir = tempfile::tempdir().unwrap();
        let req = PackageRequirement::new("left-pad", None);
        assert!(read_installed_manifest(dir.path(), &req).is_err());

        let pkg = installed_package_dir(dir.path(), "left-pad");
        std::fs::create_dir_all(&pkg).unwrap();
        std::fs::write(pkg.join("package.json"), "not json").unwrap();
        assert!(read_installed_manifest(dir.path(), &req).is_err());

        std::fs::write(pkg.join("package.json"), r#"{"name":"left-pad","version":"1.3.0"}"#).unwrap();
        let (path, manifest) = read_installed_manifest(dir.path(), &req).unwrap();
        assert_eq!(path, pkg);
        assert_eq!(manifest.version, "1.3.0");
    }

    #[test]
    fn test_rhai_module_lookup() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("package.json"), r#"{"name":"x","version":"1.0.0"}"#).unwrap();
        assert!(rhai_module(dir.path()).is_none());

        std::fs::write(dir.path().join("index.rhai"), "fn hello() { 1 }").unwrap();
        assert_eq!(rhai_module(dir.path()), Some(dir.path().join("index.rhai")));

        std::fs::create_dir_all(dir.path().join("lib")).unwrap();
        std::fs::write(dir.path().join("lib/mod.rhai"), "").unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"name":"x","version":"1.0.0","rhai":"lib/mod.rhai"}"#,
        )
        .unwrap();
        assert_eq!(rhai_module(dir.path()), Some(dir.path().join("lib/mod.rhai")));
    }
}
