use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
}

impl Paths {
    pub fn new() -> Self {
        if let Some(home) = std::env::var_os("AUTOBROWSE_HOME") {
            return Self {
                base: PathBuf::from(home),
            };
        }
        let base = dirs::home_dir()
            .map(|h| h.join(".autobrowse"))
            .unwrap_or_else(|| PathBuf::from(".autobrowse"));
        Self { base }
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.json")
    }

    pub fn database_file(&self) -> PathBuf {
        self.base.join("autobrowse.db")
    }

    pub fn profiles_dir(&self) -> PathBuf {
        self.base.join("profiles")
    }

    pub fn profile_data_dir(&self, profile_id: &str) -> PathBuf {
        self.profiles_dir().join(sanitize(profile_id))
    }

    pub fn deps_dir(&self) -> PathBuf {
        self.base.join("deps")
    }

    pub fn deps_cache_dir(&self) -> PathBuf {
        self.deps_dir().join("cache")
    }

    pub fn deps_cache_index(&self) -> PathBuf {
        self.deps_cache_dir().join("index.json")
    }

    pub fn deps_work_dir(&self) -> PathBuf {
        self.deps_dir().join("work")
    }

    pub fn results_dir(&self) -> PathBuf {
        self.base.join("results")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base.join("logs")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base)?;
        std::fs::create_dir_all(self.profiles_dir())?;
        std::fs::create_dir_all(self.deps_cache_dir())?;
        std::fs::create_dir_all(self.deps_work_dir())?;
        std::fs::create_dir_all(self.results_dir())?;
        std::fs::create_dir_all(self.logs_dir())?;
        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

/// Make an identifier safe to use as a single path component.
pub fn sanitize(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            ':' | '/' | '\\' | '@' | ' ' => '_',
            c => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_under_base() {
        let paths = Paths::with_base(PathBuf::from("/tmp/ab"));
        assert_eq!(paths.deps_cache_index(), PathBuf::from("/tmp/ab/deps/cache/index.json"));
        assert_eq!(paths.profile_data_dir("p/1"), PathBuf::from("/tmp/ab/profiles/p_1"));
    }

    #[test]
    fn test_sanitize_scoped_package() {
        assert_eq!(sanitize("@scope/pkg"), "_scope_pkg");
    }
}
