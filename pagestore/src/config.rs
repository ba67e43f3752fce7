//! Store configuration module.
//!
//! Configuration is plain data with sensible defaults; `from_env` overlays
//! values taken from environment variables.
//!
//! # Environment Variables
//!
//! - `PAGESTORE_POOL_PAGES`: Number of page frames in the pool, 0 for an
//!   unbounded pool that grows on demand (default: `1024`)
//! - `PAGESTORE_SYNC_ON_FLUSH`: Whether `flush` syncs the file, one of
//!   `true`, `false`, `1`, `0` (default: `true`)

/// Store configuration.
///
/// # Post-conditions
///
/// When constructed via `from_env()`:
/// - Every variable that was set has been validated
/// - Every variable that was not set holds its default
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Page frames held by the pool. 0 means unbounded.
    pub pool_pages: usize,
    /// Whether a pool flush also syncs the backing file.
    pub sync_on_flush: bool,
}

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            pool_pages: Self::DEFAULT_POOL_PAGES,
            sync_on_flush: true,
        }
    }
}

impl StoreConfig {
    /// Default pool size in pages (4MB of 4KB pages).
    pub const DEFAULT_POOL_PAGES: usize = 1024;

    const POOL_PAGES_VAR: &'static str = "PAGESTORE_POOL_PAGES";
    const SYNC_ON_FLUSH_VAR: &'static str = "PAGESTORE_SYNC_ON_FLUSH";

    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a configuration from an arbitrary variable source.
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let pool_pages = match lookup(Self::POOL_PAGES_VAR) {
            Some(value) => parse_pool_pages(&value)?,
            None => defaults.pool_pages,
        };
        let sync_on_flush = match lookup(Self::SYNC_ON_FLUSH_VAR) {
            Some(value) => parse_flag(Self::SYNC_ON_FLUSH_VAR, &value)?,
            None => defaults.sync_on_flush,
        };

        Ok(Self {
            pool_pages,
            sync_on_flush,
        })
    }
}

fn parse_pool_pages(value: &str) -> Result<usize, ConfigError> {
    value
        .trim()
        .parse::<usize>()
        .map_err(|_| ConfigError::InvalidValue {
            name: StoreConfig::POOL_PAGES_VAR.to_string(),
            message: format!("'{value}' is not a page count"),
        })
}

fn parse_flag(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            name: name.to_string(),
            message: format!("'{value}' is not one of true, false, 1, 0"),
        }),
    }
}
