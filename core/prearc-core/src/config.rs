//! Configuration loading and storage layout.
//!
//! `PrearcConfig` is read from TOML:
//!
//! ```toml
//! staging_root = "/data/prearchive"
//! cache_root = "/data/cache"
//! legacy_roots = ["/old/xnat/prearchive"]
//! default_prearchive_code = 0
//! separate_pet_mr = false
//!
//! [projects.ALPHA]
//! aliases = ["alpha"]
//! prearchive_code = 4
//! path = "/old/xnat/prearchive/ALPHA"
//! ```
//!
//! Lookup order: explicit path, `$PREARC_CONFIG`, `~/.prearc/config.toml`.
//! A missing file yields defaults rooted under `~/.prearc/`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use fs_err as fs;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PrearcError, Result};
use crate::services::{ProjectDirectory, SitePreferences};

pub const CONFIG_ENV: &str = "PREARC_CONFIG";

/// Returns the default data directory (~/.prearc).
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".prearc"))
        .unwrap_or_else(|| std::env::temp_dir().join("prearc"))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub prearchive_code: Option<i32>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub separate_pet_mr: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrearcConfig {
    pub staging_root: PathBuf,
    pub cache_root: PathBuf,
    #[serde(default)]
    pub legacy_roots: Vec<String>,
    #[serde(default)]
    pub default_prearchive_code: i32,
    #[serde(default)]
    pub separate_pet_mr: bool,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub projects: BTreeMap<String, ProjectConfig>,
}

impl Default for PrearcConfig {
    fn default() -> Self {
        Self::with_root(&default_data_dir())
    }
}

impl PrearcConfig {
    /// Config with staging and cache areas under `root`. Used by tests.
    pub fn with_root(root: &Path) -> Self {
        PrearcConfig {
            staging_root: root.join("prearchive"),
            cache_root: root.join("cache"),
            legacy_roots: Vec::new(),
            default_prearchive_code: 0,
            separate_pet_mr: false,
            timezone: None,
            projects: BTreeMap::new(),
        }
    }

    /// Resolves the config path: explicit, then `$PREARC_CONFIG`, then the default.
    pub fn locate(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        match std::env::var_os(CONFIG_ENV) {
            Some(value) if !value.is_empty() => PathBuf::from(value),
            _ => default_data_dir().join("config.toml"),
        }
    }

    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = Self::locate(explicit);
        if !path.exists() {
            debug!(path = %path.display(), "No prearchive config file, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| PrearcError::io(format!("reading {}", path.display()), e))?;
        toml::from_str(&content).map_err(|e| PrearcError::ConfigMalformed {
            path: path.to_path_buf(),
            details: e.to_string(),
        })
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| PrearcError::ConfigMalformed {
            path: path.to_path_buf(),
            details: e.to_string(),
        })?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| PrearcError::io(format!("creating {}", parent.display()), e))?;
        }
        fs::write(path, content)
            .map_err(|e| PrearcError::io(format!("writing {}", path.display()), e))
    }

    pub fn layout(&self) -> StorageLayout {
        StorageLayout::new(self.staging_root.clone(), self.cache_root.clone())
    }
}

/// Derived paths for prearchive bookkeeping.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    staging_root: PathBuf,
    cache_root: PathBuf,
}

impl StorageLayout {
    pub fn new(staging_root: PathBuf, cache_root: PathBuf) -> Self {
        StorageLayout {
            staging_root,
            cache_root,
        }
    }

    /// Staging under `root/prearchive`, cache under `root/cache`.
    pub fn with_root(root: &Path) -> Self {
        Self::new(root.join("prearchive"), root.join("cache"))
    }

    pub fn staging_root(&self) -> &Path {
        &self.staging_root
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    /// Root of the per-session advisory lock directories.
    pub fn lock_root(&self) -> PathBuf {
        self.cache_root.join("prearc_locks")
    }

    /// SQLite database holding session records.
    pub fn record_db(&self) -> PathBuf {
        self.cache_root.join("prearchive.db")
    }
}

/// [`ProjectDirectory`] and [`SitePreferences`] backed by a [`PrearcConfig`].
///
/// Healed path overrides live in memory; call [`ConfigProjectDirectory::snapshot`]
/// and save it to keep them.
pub struct ConfigProjectDirectory {
    config: RwLock<PrearcConfig>,
}

impl ConfigProjectDirectory {
    pub fn new(config: PrearcConfig) -> Self {
        ConfigProjectDirectory {
            config: RwLock::new(config),
        }
    }

    pub fn snapshot(&self) -> PrearcConfig {
        match self.config.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn read<T>(&self, f: impl FnOnce(&PrearcConfig) -> T) -> T {
        match self.config.read() {
            Ok(guard) => f(&guard),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }
}

impl ProjectDirectory for ConfigProjectDirectory {
    fn path_override(&self, project: &str) -> Option<String> {
        self.read(|c| c.projects.get(project).and_then(|p| p.path.clone()))
    }

    fn set_path_override(&self, project: &str, path: &str) {
        let mut guard = match self.config.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.projects.entry(project.to_string()).or_default().path = Some(path.to_string());
    }

    fn resolve_project(&self, id_or_alias: &str) -> Option<String> {
        self.read(|c| {
            if c.projects.contains_key(id_or_alias) {
                return Some(id_or_alias.to_string());
            }
            c.projects
                .iter()
                .find(|(_, p)| p.aliases.iter().any(|a| a.eq_ignore_ascii_case(id_or_alias)))
                .map(|(id, _)| id.clone())
        })
    }

    fn prearchive_code(&self, project: &str) -> Option<i32> {
        self.read(|c| c.projects.get(project).and_then(|p| p.prearchive_code))
    }

    fn separate_pet_mr(&self, project: &str) -> Option<bool> {
        self.read(|c| c.projects.get(project).and_then(|p| p.separate_pet_mr))
    }
}

impl SitePreferences for ConfigProjectDirectory {
    fn staging_root(&self) -> String {
        self.read(|c| c.staging_root.to_string_lossy().to_string())
    }

    fn legacy_roots(&self) -> Vec<String> {
        self.read(|c| c.legacy_roots.clone())
    }

    fn separate_pet_mr(&self) -> bool {
        self.read(|c| c.separate_pet_mr)
    }

    fn default_prearchive_code(&self) -> i32 {
        self.read(|c| c.default_prearchive_code)
    }

    fn timezone(&self) -> Option<String> {
        self.read(|c| c.timezone.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"
staging_root = "/data/prearchive"
cache_root = "/data/cache"
legacy_roots = ["/old/prearchive"]
default_prearchive_code = 4

[projects.ALPHA]
aliases = ["alpha-study"]
prearchive_code = 5
path = "/old/prearchive/ALPHA"
"#;

    #[test]
    fn parses_projects_and_defaults() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = PrearcConfig::load_from(&path).unwrap();
        assert_eq!(config.staging_root, PathBuf::from("/data/prearchive"));
        assert_eq!(config.default_prearchive_code, 4);
        assert!(!config.separate_pet_mr);
        assert_eq!(config.projects["ALPHA"].prearchive_code, Some(5));
        assert_eq!(config.layout().lock_root(), PathBuf::from("/data/cache/prearc_locks"));
    }

    #[test]
    fn malformed_config_is_reported() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "staging_root = [").unwrap();

        let err = PrearcConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, PrearcError::ConfigMalformed { .. }));
    }

    #[test]
    fn explicit_missing_file_yields_defaults() {
        let temp = tempdir().unwrap();
        let config = PrearcConfig::load(Some(&temp.path().join("absent.toml"))).unwrap();
        assert!(config.projects.is_empty());
    }

    #[test]
    fn save_and_reload() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("nested/config.toml");
        let mut config = PrearcConfig::with_root(temp.path());
        config.projects.insert(
            "BETA".to_string(),
            ProjectConfig {
                prearchive_code: Some(4),
                ..Default::default()
            },
        );
        config.save_to(&path).unwrap();
        assert_eq!(PrearcConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn resolves_ids_and_aliases() {
        let config: PrearcConfig = toml::from_str(SAMPLE).unwrap();
        let directory = ConfigProjectDirectory::new(config);
        assert_eq!(directory.resolve_project("ALPHA").as_deref(), Some("ALPHA"));
        assert_eq!(directory.resolve_project("Alpha-Study").as_deref(), Some("ALPHA"));
        assert_eq!(directory.resolve_project("GAMMA"), None);
        assert_eq!(ProjectDirectory::prearchive_code(&directory, "ALPHA"), Some(5));
        assert_eq!(directory.default_prearchive_code(), 4);
    }

    #[test]
    fn set_path_override_creates_entry() {
        let directory = ConfigProjectDirectory::new(PrearcConfig::with_root(Path::new("/x")));
        directory.set_path_override("NEW", "NEW");
        assert_eq!(directory.path_override("NEW").as_deref(), Some("NEW"));
        assert!(directory.snapshot().projects.contains_key("NEW"));
    }
}
