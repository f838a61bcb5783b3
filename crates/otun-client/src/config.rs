//! Agent configuration file.
//!
//! YAML, by default at `~/.otun.yaml`. Every key is optional; values act
//! as defaults beneath explicitly-set CLI flags. A missing file is not an
//! error.

use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

/// Contents of the agent config file.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub server: Option<String>,
    pub token: Option<String>,
    pub subdomain: Option<String>,
    pub debug: Option<bool>,
    pub reconnect: Option<bool>,
    pub max_retries: Option<u32>,
}

/// Loads the config file at `path`, or the default location when `path`
/// is `None`. Returns `Ok(None)` when no file exists.
pub fn load(path: Option<&Path>) -> Result<Option<ConfigFile>, ConfigError> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => match default_path() {
            Some(p) => p,
            None => return Ok(None),
        },
    };

    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(ConfigError::Read { path, source: e }),
    };

    if contents.trim().is_empty() {
        return Ok(None);
    }

    serde_yaml::from_str(&contents)
        .map(Some)
        .map_err(|e| ConfigError::Parse { path, source: e })
}

/// `~/.otun.yaml`, or `None` when the home directory is unknown.
pub fn default_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".otun.yaml"))
}
