//! Locating and reading the pool's TOML config.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::PoolConfig;

const LOCAL_FILE: &str = ".claude-session-pool.toml";
const APP_DIR: &str = "claude-session-pool";

/// Where the active configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Read from this file.
    File(PathBuf),
    /// No file found; built-in defaults.
    Defaults,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Defaults => f.write_str("built-in defaults"),
        }
    }
}

/// Resolves the config file from an ordered list of candidates.
///
/// Candidates are the working directory's `.claude-session-pool.toml`, then
/// `<config dir>/claude-session-pool/config.toml`. An explicit path replaces
/// both.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    candidates: Vec<PathBuf>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Loader over the standard locations.
    #[must_use]
    pub fn new() -> Self {
        let candidates = std::iter::once(PathBuf::from(LOCAL_FILE))
            .chain(dirs::config_dir().map(|dir| dir.join(APP_DIR).join("config.toml")))
            .collect();
        Self { candidates }
    }

    /// Loader that only looks at `path`.
    #[must_use]
    pub fn with_path(path: PathBuf) -> Self {
        Self {
            candidates: vec![path],
        }
    }

    /// Candidate files in priority order.
    #[must_use]
    pub fn search_paths(&self) -> &[PathBuf] {
        &self.candidates
    }

    /// First candidate that exists on disk.
    #[must_use]
    pub fn find_config_file(&self) -> Option<PathBuf> {
        self.candidates.iter().find(|path| path.is_file()).cloned()
    }

    /// Load the configuration, falling back to defaults when no candidate
    /// exists.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a file exists but cannot be read or parsed.
    pub fn load(&self) -> Result<PoolConfig, ConfigError> {
        self.load_with_source().map(|(config, _)| config)
    }

    /// Like [`load`](Self::load), also reporting where the values came from.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a file exists but cannot be read or parsed.
    pub fn load_with_source(&self) -> Result<(PoolConfig, ConfigSource), ConfigError> {
        let Some(path) = self.find_config_file() else {
            tracing::debug!(candidates = self.candidates.len(), "No config file, using defaults");
            return Ok((PoolConfig::default(), ConfigSource::Defaults));
        };

        let config = read_file(&path)?;
        tracing::debug!(path = %path.display(), "Loaded config file");
        Ok((config, ConfigSource::File(path)))
    }
}

fn read_file(path: &Path) -> Result<PoolConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::ParseError {
        path: path.to_path_buf(),
        source,
    })
}

/// Failure to load a config file that exists.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("Failed to read config file {path}: {source}")]
    ReadError {
        /// File that failed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The file is not valid TOML for [`PoolConfig`].
    #[error("Failed to parse config file {path}: {source}")]
    ParseError {
        /// File that failed.
        path: PathBuf,
        /// TOML decoding error.
        source: toml::de::Error,
    },
}
