use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::SqlRegistryError;
use crate::types::DatabaseType;

pub const DEFAULT_MAX_ACTIVE: u32 = 128;
pub const DEFAULT_MAX_IDLE: u32 = 32;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection settings for one logical database name.
///
/// Unset pool fields (or pool fields set to zero) receive the defaults above when the
/// configuration is registered. Timeouts may be omitted, in which case they default to
/// [`DEFAULT_OP_TIMEOUT`], but an explicit zero timeout is rejected.
///
/// `max_idle` is a floor, not a cap: that many connections (at most `max_active`) are
/// opened when the client is built and kept warm afterwards. Connections above it are
/// closed once idle for `idle_timeout`.
///
/// ```rust
/// use std::time::Duration;
/// use sql_registry::DbConfig;
///
/// let cfg = DbConfig::sqlite("/tmp/app.db")
///     .with_max_active(16)
///     .with_query_timeout(Duration::from_secs(2));
/// assert_eq!(cfg.max_active(), 16);
/// assert_eq!(cfg.exec_timeout(), Duration::from_secs(5));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DbConfig {
    #[serde(default)]
    driver: DatabaseType,
    dsn: String,
    #[serde(default)]
    max_active: Option<u32>,
    #[serde(default)]
    max_idle: Option<u32>,
    #[serde(default, deserialize_with = "duration_opt")]
    idle_timeout: Option<Duration>,
    #[serde(default, deserialize_with = "duration_opt")]
    query_timeout: Option<Duration>,
    #[serde(default, deserialize_with = "duration_opt")]
    exec_timeout: Option<Duration>,
    #[serde(default, deserialize_with = "duration_opt")]
    tran_timeout: Option<Duration>,
}

impl DbConfig {
    #[must_use]
    pub fn new(driver: DatabaseType, dsn: impl Into<String>) -> Self {
        Self {
            driver,
            dsn: dsn.into(),
            max_active: None,
            max_idle: None,
            idle_timeout: None,
            query_timeout: None,
            exec_timeout: None,
            tran_timeout: None,
        }
    }

    #[must_use]
    pub fn sqlite(path: impl Into<String>) -> Self {
        Self::new(DatabaseType::Sqlite, path)
    }

    #[must_use]
    pub fn postgres(dsn: impl Into<String>) -> Self {
        Self::new(DatabaseType::Postgres, dsn)
    }

    #[must_use]
    pub fn with_max_active(mut self, max_active: u32) -> Self {
        self.max_active = Some(max_active);
        self
    }

    #[must_use]
    pub fn with_max_idle(mut self, max_idle: u32) -> Self {
        self.max_idle = Some(max_idle);
        self
    }

    #[must_use]
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = Some(idle_timeout);
        self
    }

    #[must_use]
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_exec_timeout(mut self, timeout: Duration) -> Self {
        self.exec_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_tran_timeout(mut self, timeout: Duration) -> Self {
        self.tran_timeout = Some(timeout);
        self
    }

    /// Set the query, exec and transaction budgets to the same value.
    #[must_use]
    pub fn with_timeouts(self, timeout: Duration) -> Self {
        self.with_query_timeout(timeout)
            .with_exec_timeout(timeout)
            .with_tran_timeout(timeout)
    }

    #[must_use]
    pub fn driver(&self) -> DatabaseType {
        self.driver
    }

    #[must_use]
    pub fn dsn(&self) -> &str {
        &self.dsn
    }

    #[must_use]
    pub fn max_active(&self) -> u32 {
        self.max_active
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_MAX_ACTIVE)
    }

    #[must_use]
    pub fn max_idle(&self) -> u32 {
        self.max_idle.filter(|n| *n > 0).unwrap_or(DEFAULT_MAX_IDLE)
    }

    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
            .filter(|d| !d.is_zero())
            .unwrap_or(DEFAULT_IDLE_TIMEOUT)
    }

    #[must_use]
    pub fn query_timeout(&self) -> Duration {
        self.query_timeout.unwrap_or(DEFAULT_OP_TIMEOUT)
    }

    #[must_use]
    pub fn exec_timeout(&self) -> Duration {
        self.exec_timeout.unwrap_or(DEFAULT_OP_TIMEOUT)
    }

    #[must_use]
    pub fn tran_timeout(&self) -> Duration {
        self.tran_timeout.unwrap_or(DEFAULT_OP_TIMEOUT)
    }

    /// Validate the configuration and fill every unset field with its default.
    ///
    /// # Errors
    /// Returns [`SqlRegistryError::ConfigError`] for an empty connection string or an
    /// explicitly zero timeout.
    pub fn with_defaults(self) -> Result<Self, SqlRegistryError> {
        if self.dsn.trim().is_empty() {
            return Err(SqlRegistryError::ConfigError(
                "connection string must not be empty".into(),
            ));
        }
        for (field, value) in [
            ("query_timeout", self.query_timeout),
            ("exec_timeout", self.exec_timeout),
            ("tran_timeout", self.tran_timeout),
        ] {
            if value.is_some_and(|d| d.is_zero()) {
                return Err(SqlRegistryError::ConfigError(format!(
                    "{field} must be non-zero"
                )));
            }
        }

        Ok(Self {
            max_active: Some(self.max_active()),
            max_idle: Some(self.max_idle()),
            idle_timeout: Some(self.idle_timeout()),
            query_timeout: Some(self.query_timeout()),
            exec_timeout: Some(self.exec_timeout()),
            tran_timeout: Some(self.tran_timeout()),
            ..self
        })
    }
}

/// A set of named database configurations, typically loaded from a file.
///
/// ```toml
/// [databases.debug]
/// driver = "sqlite"
/// dsn = "/var/lib/app/debug.db"
/// query_timeout = "10s"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub databases: BTreeMap<String, DbConfig>,
}

impl RegistryConfig {
    /// # Errors
    /// Returns [`SqlRegistryError::ConfigError`] if the document does not parse.
    pub fn from_toml_str(raw: &str) -> Result<Self, SqlRegistryError> {
        toml::from_str(raw).map_err(|e| SqlRegistryError::ConfigError(format!("invalid toml: {e}")))
    }

    /// # Errors
    /// Returns [`SqlRegistryError::ConfigError`] if the document does not parse.
    pub fn from_json_str(raw: &str) -> Result<Self, SqlRegistryError> {
        serde_json::from_str(raw)
            .map_err(|e| SqlRegistryError::ConfigError(format!("invalid json: {e}")))
    }

    /// Load a `.json` file as JSON and anything else as TOML.
    ///
    /// # Errors
    /// Returns [`SqlRegistryError::ConfigError`] if the file cannot be read or parsed.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, SqlRegistryError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SqlRegistryError::ConfigError(format!("cannot read {}: {e}", path.display()))
        })?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&raw),
            _ => Self::from_toml_str(&raw),
        }
    }
}

/// Durations are either humantime strings ("5s", "1m 30s") or whole seconds.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Text(String),
    Seconds(u64),
}

fn duration_opt<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<RawDuration>::deserialize(deserializer)? {
        None => Ok(None),
        Some(RawDuration::Seconds(secs)) => Ok(Some(Duration::from_secs(secs))),
        Some(RawDuration::Text(text)) => humantime::parse_duration(&text)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}
