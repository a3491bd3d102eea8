//! Configuration file loading.
//!
//! The file is JSON:
//!
//! ```json
//! {
//!   "sources": [
//!     {
//!       "name": "work",
//!       "type": "github",
//!       "description": "Work organization",
//!       "clone_directory": "~/src/work",
//!       "config": { "owners": ["my-org"], "token_env": "WORK_GITHUB_TOKEN" }
//!     }
//!   ]
//! }
//! ```
//!
//! Sources are kept in file order. `enabled` defaults to true and the
//! driver-specific `config` object is handed untouched to the driver's
//! constructor.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

const ENV_CONFIG_FILE: &str = "SRCGET_CONFIG";
const CONFIG_DIR_NAME: &str = "srcget";
const CONFIG_FILE_NAME: &str = "config.json";
const DEFAULT_CLONE_ROOT: &str = "src";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid {driver} driver configuration: {message}")]
    InvalidDriverConfig { driver: String, message: String },

    #[error("clone directory for source {source_name} must be absolute: {path}")]
    RelativeCloneDirectory { source_name: String, path: PathBuf },

    #[error("unable to determine home directory")]
    HomeDirNotFound,
}

/// Result type for config operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

/// One configured source.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub driver: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub clone_directory: Option<PathBuf>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub config: serde_json::Value,
}

fn default_enabled() -> bool {
    true
}

impl Config {
    /// Load from `path`, else `$SRCGET_CONFIG`, else
    /// `<config dir>/srcget/config.json`.
    ///
    /// A missing file at the default location is an empty configuration; a
    /// missing file that was named by `--config` or `$SRCGET_CONFIG` is an
    /// error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match locate(path, std::env::var_os(ENV_CONFIG_FILE)) {
            Some(location) => Self::load_from(location),
            None => Ok(Self::default()),
        }
    }

    fn load_from(location: Location) -> Result<Self> {
        let Location { path, required } = location;
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
                log::debug!("No config file at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(source) => return Err(ConfigError::Read { path, source }),
        };

        Self::parse(&text).map_err(|source| ConfigError::Parse { path, source })
    }

    pub fn parse(text: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Whether a source named `name` is configured, enabled or not.
    pub fn mentions(&self, name: &str) -> bool {
        self.sources
            .iter()
            .any(|source| source.name.eq_ignore_ascii_case(name))
    }
}

/// A config file to read, and whether it has to exist.
#[derive(Debug, PartialEq, Eq)]
struct Location {
    path: PathBuf,
    required: bool,
}

fn locate(explicit: Option<&Path>, from_env: Option<OsString>) -> Option<Location> {
    if let Some(path) = explicit {
        return Some(Location {
            path: path.to_path_buf(),
            required: true,
        });
    }
    if let Some(path) = from_env.filter(|path| !path.is_empty()) {
        return Some(Location {
            path: PathBuf::from(path),
            required: true,
        });
    }
    dirs::config_dir().map(|dir| Location {
        path: dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME),
        required: false,
    })
}

/// Where clones for `source_name` go: the configured directory with `~/`
/// expanded, else `~/src/<source_name>`.
pub fn clone_directory(source_name: &str, configured: Option<&Path>) -> Result<PathBuf> {
    let path = match configured {
        Some(path) => expand_home(path)?,
        None => dirs::home_dir()
            .ok_or(ConfigError::HomeDirNotFound)?
            .join(DEFAULT_CLONE_ROOT)
            .join(source_name),
    };

    if !path.is_absolute() {
        return Err(ConfigError::RelativeCloneDirectory {
            source_name: source_name.to_string(),
            path,
        });
    }
    Ok(path)
}

fn expand_home(path: &Path) -> Result<PathBuf> {
    match path.strip_prefix("~") {
        Ok(rest) => Ok(dirs::home_dir()
            .ok_or(ConfigError::HomeDirNotFound)?
            .join(rest)),
        Err(_) => Ok(path.to_path_buf()),
    }
}

/// Deserialize a driver's own configuration, treating `null` as `{}`.
pub fn driver_config<T>(driver: &str, value: &serde_json::Value) -> Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let value = match value {
        serde_json::Value::Null => serde_json::Value::Object(Default::default()),
        other => other.clone(),
    };
    serde_json::from_value(value).map_err(|e| ConfigError::InvalidDriverConfig {
        driver: driver.to_string(),
        message: e.to_string(),
    })
}
