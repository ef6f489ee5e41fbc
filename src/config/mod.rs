use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;

/// Configuration errors. Fatal at startup, never retried.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("relay secret is missing or empty (set STATE_TOKEN_SECRET)")]
    MissingSecret,
    #[error("invalid table name '{0}': expected [a-z_][a-z0-9_]*")]
    InvalidTableName(String),
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Operator-supplied secret used for state-token signing and, after key
/// derivation, for record encryption.
#[derive(Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(**redacted**)")
    }
}

/// Complete relay configuration, built once at process start and handed to
/// each component's constructor.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub secret: Secret,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub state_token: StateTokenConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

/// Record store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_tokens_path")]
    pub tokens_path: PathBuf,
    #[serde(default = "default_sessions_path")]
    pub sessions_path: PathBuf,
    /// SQLite busy timeout; also bounds how long a single query may wait on a lock
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_secs: u64,
    /// Total attempts for a write facing lock contention
    #[serde(default = "default_max_write_attempts")]
    pub max_write_attempts: u32,
    /// First retry delay; doubles on every further attempt
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
}

fn default_tokens_path() -> PathBuf {
    PathBuf::from("./data/tokens.db")
}

fn default_sessions_path() -> PathBuf {
    PathBuf::from("./data/sessions.db")
}

fn default_busy_timeout() -> u64 {
    10
}

fn default_max_write_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> u64 {
    100
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            tokens_path: default_tokens_path(),
            sessions_path: default_sessions_path(),
            busy_timeout_secs: default_busy_timeout(),
            max_write_attempts: default_max_write_attempts(),
            initial_backoff_ms: default_initial_backoff(),
        }
    }
}

/// OAuth state-token configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StateTokenConfig {
    #[serde(default = "default_token_window")]
    pub ttl_seconds: u32,
    #[serde(default = "default_token_window")]
    pub max_age_seconds: u32,
}

fn default_token_window() -> u32 {
    300
}

impl Default for StateTokenConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_token_window(),
            max_age_seconds: default_token_window(),
        }
    }
}

/// Session cookie and sweep configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_session_age")]
    pub cookie_max_age_seconds: u64,
    /// Sessions issued longer ago than this are removed by the sweep
    #[serde(default = "default_session_age")]
    pub max_age_seconds: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
}

fn default_session_age() -> u64 {
    3600
}

fn default_sweep_interval() -> u64 {
    600
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_max_age_seconds: default_session_age(),
            max_age_seconds: default_session_age(),
            sweep_interval_seconds: default_sweep_interval(),
        }
    }
}

/// Local object mirror used by the sync gate
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data/objects")
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl RelayConfig {
    /// Overlay environment variables on top of this config.
    pub fn with_env(mut self) -> Self {
        self.apply_env(|name| std::env::var(name).ok());
        self
    }

    /// Build from env vars, falling back to defaults.
    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("STATE_TOKEN_SECRET") {
            self.secret = Secret::new(v);
        }
        if let Some(v) = lookup("TOKEN_DB_PATH") {
            self.storage.tokens_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("SESSION_DB_PATH") {
            self.storage.sessions_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("RELAY_DATA_DIR") {
            self.sync.data_dir = PathBuf::from(v);
        }
        if let Some(n) = lookup("RELAY_SESSION_MAX_AGE_SECONDS").and_then(|v| v.parse().ok()) {
            self.session.max_age_seconds = n;
        }
    }

    /// Returns the secret, or `ConfigError::MissingSecret` if it is blank.
    pub fn secret(&self) -> Result<&Secret, ConfigError> {
        if self.secret.is_blank() {
            return Err(ConfigError::MissingSecret);
        }
        Ok(&self.secret)
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<RelayConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_string(),
        source,
    })?;
    let config: RelayConfig = toml::from_str(&contents)?;
    Ok(config)
}
