//! Configuration loaded from `config.toml`.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::database::{DbError, InMemoryDatabase, PackageDatabase, SqliteDatabase};
use crate::paths;
use crate::solver::SolverOptions;

/// Errors loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A configuration file could not be read.
    #[error("Failed to read {path}: {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration file is not valid TOML for its section.
    #[error("Failed to parse {path}: {source}")]
    Parse {
        /// File that failed.
        path: PathBuf,
        /// Underlying TOML error.
        source: toml::de::Error,
    },

    /// A name that is not one of the known choices.
    #[error("unknown {what} '{value}'")]
    Unknown {
        /// Setting being parsed.
        what: &'static str,
        /// The rejected value.
        value: String,
    },
}

/// Everything `config.toml` can set.
///
/// Missing sections fall back to their defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CairnConfig {
    /// `[general]` section.
    pub general: GeneralConfig,
    /// Solver strategy and retry budget.
    pub solver: SolverOptions,
    /// `[system]` section.
    pub system: SystemConfig,
    /// Repositories declared inline.
    pub repositories: Vec<RepositoryConfig>,
    /// Directories holding one `*.toml` repository definition per file.
    pub repos_confdir: Vec<PathBuf>,
}

/// Settings shared by every command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Packages built at once.
    pub concurrency: usize,
    /// Verbose logging.
    pub debug: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            concurrency: num_cpus::get(),
            debug: false,
        }
    }
}

/// Where packages are installed and tracked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Root packages are installed into.
    pub rootfs: PathBuf,
    /// Installed-packages database file.
    pub database_path: PathBuf,
    /// Storage kind of that database.
    pub database_engine: DatabaseEngine,
    /// Downloaded artifacts.
    pub pkgs_cache_path: PathBuf,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            rootfs: PathBuf::from("/"),
            database_path: paths::db_path(),
            database_engine: DatabaseEngine::Sqlite,
            pkgs_cache_path: paths::cache_path(),
        }
    }
}

impl SystemConfig {
    /// Open the installed-packages database.
    pub fn open_database(&self) -> Result<Arc<dyn PackageDatabase>, DbError> {
        self.database_engine.open(&self.database_path)
    }
}

/// Storage behind the installed-packages database.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseEngine {
    /// Lost when the process exits.
    Memory,
    /// Single SQLite file.
    #[default]
    Sqlite,
}

impl DatabaseEngine {
    /// Open a database of this kind; `path` is ignored for memory databases.
    pub fn open(self, path: &Path) -> Result<Arc<dyn PackageDatabase>, DbError> {
        Ok(match self {
            Self::Memory => Arc::new(InMemoryDatabase::new()),
            Self::Sqlite => Arc::new(SqliteDatabase::open_at(path)?),
        })
    }
}

impl fmt::Display for DatabaseEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::Sqlite => write!(f, "sqlite"),
        }
    }
}

impl FromStr for DatabaseEngine {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sqlite" | "boltdb" => Ok(Self::Sqlite),
            other => Err(ConfigError::Unknown {
                what: "database engine",
                value: other.to_string(),
            }),
        }
    }
}

/// How a repository's locations are reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryKind {
    /// Directories on this machine.
    #[default]
    Local,
    /// Base URLs over HTTP(S).
    Http,
}

impl fmt::Display for RepositoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Http => write!(f, "http"),
        }
    }
}

impl FromStr for RepositoryKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" | "disk" => Ok(Self::Local),
            "http" | "https" => Ok(Self::Http),
            other => Err(ConfigError::Unknown {
                what: "repository type",
                value: other.to_string(),
            }),
        }
    }
}

/// Credentials for HTTP repositories.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryAuth {
    /// Bearer token; takes precedence over basic auth.
    pub token: Option<String>,
    /// Basic auth user.
    pub username: Option<String>,
    /// Basic auth password.
    pub password: Option<String>,
}

/// One repository entry, inline or from a `repos_confdir` file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Unique repository name.
    pub name: String,
    /// `local` or `http`.
    #[serde(rename = "type")]
    pub kind: RepositoryKind,
    /// Directories (local) or base URLs (http), tried in order.
    pub urls: Vec<String>,
    /// Disabled repositories are skipped.
    #[serde(default = "default_enable")]
    pub enable: bool,
    /// Lower values are preferred when several repositories carry a package.
    #[serde(default)]
    pub priority: i32,
    /// Credentials sent with HTTP requests.
    #[serde(default)]
    pub auth: Option<RepositoryAuth>,
}

fn default_enable() -> bool {
    true
}

impl CairnConfig {
    /// Load `path` and every repository file under its `repos_confdir`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::read(path)?;
        config.load_repository_dirs();
        Ok(config)
    }

    /// `$CAIRN_CONFIG`, then `~/.cairn/config.toml`, then built-in defaults,
    /// with repository directories merged in.
    pub fn load_default() -> Result<Self, ConfigError> {
        let mut config = Self::read_default()?;
        config.load_repository_dirs();
        Ok(config)
    }

    /// Parse `path` alone, leaving `repos_confdir` unread.
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Like [`CairnConfig::load_default`] without reading `repos_confdir`.
    pub fn read_default() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var("CAIRN_CONFIG") {
            return Self::read(Path::new(&path));
        }
        let path = paths::config_path();
        if path.is_file() {
            return Self::read(&path);
        }
        debug!("No configuration at {}, using defaults", path.display());
        Ok(Self::default())
    }

    /// Enabled repositories, preferred first.
    pub fn enabled_repositories(&self) -> Vec<RepositoryConfig> {
        let mut repos: Vec<_> = self
            .repositories
            .iter()
            .filter(|r| r.enable)
            .cloned()
            .collect();
        repos.sort_by_key(|r| r.priority);
        repos
    }

    /// Append the repositories defined under `repos_confdir`.
    ///
    /// Unreadable directories and invalid or unnamed files are skipped with
    /// a warning.
    pub fn load_repository_dirs(&mut self) {
        for dir in &self.repos_confdir {
            let entries = match fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("Skipping repository directory {}: {e}", dir.display());
                    continue;
                }
            };

            let mut files: Vec<PathBuf> = entries
                .filter_map(Result::ok)
                .map(|e| e.path())
                .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
                .collect();
            files.sort();

            for file in files {
                match read_repository(&file) {
                    Ok(repo) if repo.name.is_empty() => {
                        warn!("Skipping {}: repository has no name", file.display());
                    }
                    Ok(repo) => {
                        debug!("Repository {} from {}", repo.name, file.display());
                        self.repositories.push(repo);
                    }
                    Err(e) => warn!("Skipping {e}"),
                }
            }
        }
    }
}

fn read_repository(path: &Path) -> Result<RepositoryConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
