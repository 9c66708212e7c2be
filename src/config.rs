//! Configuration handling for database clients.
//!
//! Options arrive either programmatically (`ClientOptions`) or as query
//! parameters appended to the connection URL. Recognized keys are stripped from
//! the URL before it reaches the driver.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

pub const DEFAULT_APPLICATION_NAME: &str = "dbcore";
pub const DEFAULT_NOTIFICATION_CHANNEL: &str = "dbcore_notifications";
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_ROW_BUFFER: usize = 64;
pub const DEFAULT_START_ATTEMPTS: u32 = 1;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 200;

/// Upper bound on concurrent pool/session initializations across all clients.
pub const MAX_PARALLEL_INITS: usize = 3;

// Schema catalog defaults
pub const DEFAULT_INTERNAL_SCHEMA: &str = "dbcore_internal";
pub const DEFAULT_CONNECTION_STATE_TABLE: &str = "connection_state";
pub const DEFAULT_TEMP_SCHEMA_PREFIX: &str = "pg_temp_";
pub const DEFAULT_RESERVED_SCHEMA: &str = "dbcore_command";

/// Per-pool overrides.
///
/// A field left at zero (or unset) keeps the driver default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolOverrides {
    /// Maximum open connections.
    #[serde(default)]
    pub max_open: u32,
    /// Maximum lifetime of a connection.
    #[serde(default, with = "duration_secs")]
    pub max_lifetime: Duration,
    /// Maximum time a connection may sit idle.
    #[serde(default, with = "duration_secs")]
    pub max_idle_time: Duration,
}

impl PoolOverrides {
    /// True when no field is set.
    pub fn is_empty(&self) -> bool {
        self.max_open == 0 && self.max_lifetime.is_zero() && self.max_idle_time.is_zero()
    }

    /// Apply the set fields to a pool builder.
    pub fn apply<DB: sqlx::Database>(
        &self,
        mut options: sqlx::pool::PoolOptions<DB>,
    ) -> sqlx::pool::PoolOptions<DB> {
        if self.max_open > 0 {
            options = options.max_connections(self.max_open);
        }
        if !self.max_lifetime.is_zero() {
            options = options.max_lifetime(self.max_lifetime);
        }
        if !self.max_idle_time.is_zero() {
            options = options.idle_timeout(self.max_idle_time);
        }
        options
    }
}

/// Duration (de)serialization as whole seconds.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

/// Names used when introspecting the server catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaCatalogOptions {
    /// Schema holding the connection state table.
    pub internal_schema: String,
    /// Table listing logical connections with their plugin and schema mode.
    pub connection_state_table: String,
    /// Prefix of per-session temporary schemas.
    pub temp_schema_prefix: String,
    /// Schema excluded from legacy foreign-table discovery.
    pub reserved_schema: String,
}

impl Default for SchemaCatalogOptions {
    fn default() -> Self {
        Self {
            internal_schema: DEFAULT_INTERNAL_SCHEMA.to_string(),
            connection_state_table: DEFAULT_CONNECTION_STATE_TABLE.to_string(),
            temp_schema_prefix: DEFAULT_TEMP_SCHEMA_PREFIX.to_string(),
            reserved_schema: DEFAULT_RESERVED_SCHEMA.to_string(),
        }
    }
}

/// Options supplied when opening a client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// Overrides for the pool serving caller-issued queries.
    pub user_pool: PoolOverrides,
    /// Overrides for the pool serving internal/system queries.
    pub management_pool: PoolOverrides,
    /// Reported to the server as `application_name` (default: "dbcore")
    pub application_name: Option<String>,
    /// Channel subscribed to by notification listeners.
    pub notification_channel: Option<String>,
    /// Pool acquire timeout in seconds (default: 30)
    pub acquire_timeout_secs: Option<u64>,
    /// Capacity of each result's row queue (default: 64)
    pub row_buffer: Option<usize>,
    /// Schemas placed on the management session search path.
    pub search_path: Vec<String>,
    pub catalog: SchemaCatalogOptions,
}

impl ClientOptions {
    /// Pool override keys extracted from URL query parameters.
    const URL_OPTION_KEYS: &'static [&'static str] = &[
        "max_connections",
        "max_lifetime",
        "max_idle_time",
        "management_max_connections",
        "management_max_lifetime",
        "management_max_idle_time",
        "application_name",
    ];

    pub fn application_name_or_default(&self) -> &str {
        self.application_name
            .as_deref()
            .unwrap_or(DEFAULT_APPLICATION_NAME)
    }

    pub fn notification_channel_or_default(&self) -> &str {
        self.notification_channel
            .as_deref()
            .unwrap_or(DEFAULT_NOTIFICATION_CHANNEL)
    }

    pub fn acquire_timeout_or_default(&self) -> Duration {
        Duration::from_secs(
            self.acquire_timeout_secs
                .unwrap_or(DEFAULT_ACQUIRE_TIMEOUT_SECS),
        )
    }

    pub fn row_buffer_or_default(&self) -> usize {
        self.row_buffer.unwrap_or(DEFAULT_ROW_BUFFER).max(1)
    }

    /// Validate options and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.acquire_timeout_secs == Some(0) {
            return Err("acquire_timeout_secs must be greater than 0".to_string());
        }
        if self.notification_channel_or_default().is_empty() {
            return Err("notification_channel cannot be empty".to_string());
        }
        if let Some(bad) = self
            .search_path
            .iter()
            .chain(std::iter::once(&self.catalog.internal_schema))
            .find(|s| !is_plain_identifier(s))
        {
            return Err(format!("'{}' is not a valid schema identifier", bad));
        }
        Ok(())
    }

    /// Split pool options out of a URL connection string.
    ///
    /// Returns the connection string with recognized keys removed. Non-URL
    /// strings are returned unchanged.
    pub fn from_connection_url(connection_string: &str) -> Result<(String, Self), String> {
        let Ok(mut url) = Url::parse(connection_string) else {
            return Ok((connection_string.to_string(), Self::default()));
        };
        if url.query().is_none() {
            return Ok((connection_string.to_string(), Self::default()));
        }

        let mut opts = extract_options(&mut url, Self::URL_OPTION_KEYS);
        let options = Self {
            user_pool: PoolOverrides {
                max_open: parse_opt(&mut opts, "max_connections")?.unwrap_or(0),
                max_lifetime: Duration::from_secs(
                    parse_opt(&mut opts, "max_lifetime")?.unwrap_or(0),
                ),
                max_idle_time: Duration::from_secs(
                    parse_opt(&mut opts, "max_idle_time")?.unwrap_or(0),
                ),
            },
            management_pool: PoolOverrides {
                max_open: parse_opt(&mut opts, "management_max_connections")?.unwrap_or(0),
                max_lifetime: Duration::from_secs(
                    parse_opt(&mut opts, "management_max_lifetime")?.unwrap_or(0),
                ),
                max_idle_time: Duration::from_secs(
                    parse_opt(&mut opts, "management_max_idle_time")?.unwrap_or(0),
                ),
            },
            application_name: opts.remove("application_name"),
            ..Self::default()
        };
        options.validate()?;
        Ok((url.to_string(), options))
    }
}

fn parse_opt<T: std::str::FromStr>(
    opts: &mut HashMap<String, String>,
    key: &str,
) -> Result<Option<T>, String> {
    match opts.remove(key) {
        None => Ok(None),
        Some(v) => v
            .parse()
            .map(Some)
            .map_err(|_| format!("Invalid value for {key}: {v}")),
    }
}

/// Extract recognized options from URL query params, keeping others for the driver.
fn extract_options(url: &mut Url, keys: &[&str]) -> HashMap<String, String> {
    let mut opts = HashMap::new();
    let remaining: Vec<(String, String)> = url
        .query_pairs()
        .filter_map(|(k, v)| {
            let key_lower = k.to_ascii_lowercase();
            if keys.contains(&key_lower.as_str()) {
                opts.insert(key_lower, v.into_owned());
                None
            } else {
                Some((k.into_owned(), v.into_owned()))
            }
        })
        .collect();

    if remaining.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(remaining);
    }
    opts
}

/// Identifier safe to interpolate unquoted (letters, digits, underscore).
pub fn is_plain_identifier(s: &str) -> bool {
    !s.is_empty()
        && !s.starts_with(|c: char| c.is_ascii_digit())
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Command-line configuration for the `dbcore` probe.
#[derive(Debug, Clone, Parser)]
#[command(name = "dbcore", version, about = "Open a database client, inspect its schema and stream query results")]
pub struct Config {
    /// Connection string (postgres://, sqlite://, sqlite3:// or a key=value DSN).
    /// Pool override keys such as max_connections may be appended as query parameters.
    #[arg(short = 'd', long = "database", value_name = "URL", env = "DBCORE_DATABASE")]
    pub database: String,

    /// Statement to execute; repeat for several result sets
    #[arg(short = 'e', long = "execute", value_name = "SQL")]
    pub statements: Vec<String>,

    /// Print schema metadata as JSON
    #[arg(long)]
    pub schema: bool,

    /// Listen for notifications for this many seconds (PostgreSQL only)
    #[arg(long, value_name = "SECS")]
    pub listen: Option<u64>,

    /// Notification channel (default: dbcore_notifications)
    #[arg(long, env = "DBCORE_CHANNEL")]
    pub channel: Option<String>,

    /// Attempts to start each statement; transient failures are retried
    #[arg(long, default_value_t = DEFAULT_START_ATTEMPTS, env = "DBCORE_START_ATTEMPTS")]
    pub start_attempts: u32,

    /// Delay before the first retry in milliseconds, growing linearly
    #[arg(long, default_value_t = DEFAULT_RETRY_BACKOFF_MS, env = "DBCORE_RETRY_BACKOFF_MS")]
    pub retry_backoff_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "DBCORE_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "DBCORE_JSON_LOGS")]
    pub json_logs: bool,
}

impl Config {
    /// Driver connection string and client options for this invocation.
    pub fn client_options(&self) -> Result<(String, ClientOptions), String> {
        let (connection_string, mut options) = ClientOptions::from_connection_url(&self.database)?;
        if self.channel.is_some() {
            options.notification_channel = self.channel.clone();
        }
        options.validate()?;
        Ok((connection_string, options))
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;

    #[test]
    fn test_zero_overrides_change_nothing() {
        let base = PgPoolOptions::new();
        let applied = PoolOverrides::default().apply(PgPoolOptions::new());
        assert!(PoolOverrides::default().is_empty());
        assert_eq!(applied.get_max_connections(), base.get_max_connections());
        assert_eq!(applied.get_max_lifetime(), base.get_max_lifetime());
        assert_eq!(applied.get_idle_timeout(), base.get_idle_timeout());
    }

    #[test]
    fn test_overrides_applied_independently() {
        let overrides = PoolOverrides {
            max_open: 7,
            max_lifetime: Duration::ZERO,
            max_idle_time: Duration::from_secs(45),
        };
        let base = PgPoolOptions::new();
        let applied = overrides.apply(PgPoolOptions::new());
        assert_eq!(applied.get_max_connections(), 7);
        assert_eq!(applied.get_max_lifetime(), base.get_max_lifetime());
        assert_eq!(applied.get_idle_timeout(), Some(Duration::from_secs(45)));
    }

    #[test]
    fn test_from_connection_url_strips_keys() {
        let (url, opts) = ClientOptions::from_connection_url(
            "postgres://u:p@localhost:5432/db?max_connections=4&sslmode=disable&management_max_idle_time=30",
        )
        .unwrap();
        assert_eq!(url, "postgres://u:p@localhost:5432/db?sslmode=disable");
        assert_eq!(opts.user_pool.max_open, 4);
        assert_eq!(
            opts.management_pool.max_idle_time,
            Duration::from_secs(30)
        );
        assert!(opts.user_pool.max_lifetime.is_zero());
    }

    #[test]
    fn test_from_connection_url_rejects_bad_number() {
        let result =
            ClientOptions::from_connection_url("postgres://localhost/db?max_lifetime=soon");
        assert!(result.is_err());
    }

    #[test]
    fn test_non_url_passes_through() {
        let raw = "host=localhost dbname=test";
        let (s, opts) = ClientOptions::from_connection_url(raw).unwrap();
        assert_eq!(s, raw);
        assert!(opts.user_pool.is_empty());
    }

    #[test]
    fn test_validate_rejects_bad_search_path() {
        let opts = ClientOptions {
            search_path: vec!["public; drop".to_string()],
            ..ClientOptions::default()
        };
        assert!(opts.validate().is_err());
        assert!(ClientOptions::default().validate().is_ok());
    }

    #[test]
    fn test_deserialize_overrides() {
        let opts: ClientOptions = serde_json::from_str(
            r#"{"user_pool": {"max_open": 3, "max_lifetime": 60}, "row_buffer": 8}"#,
        )
        .unwrap();
        assert_eq!(opts.user_pool.max_open, 3);
        assert_eq!(opts.user_pool.max_lifetime, Duration::from_secs(60));
        assert!(opts.management_pool.is_empty());
        assert_eq!(opts.row_buffer_or_default(), 8);
    }

    #[test]
    fn test_config_parse() {
        let config = Config::parse_from([
            "dbcore",
            "--database",
            "postgres://localhost/db?max_connections=4",
            "-e",
            "SELECT 1",
            "-e",
            "SELECT 2",
            "--channel",
            "events",
        ]);
        assert_eq!(config.statements.len(), 2);
        assert_eq!(config.start_attempts, DEFAULT_START_ATTEMPTS);

        let (url, options) = config.client_options().unwrap();
        assert_eq!(url, "postgres://localhost/db");
        assert_eq!(options.user_pool.max_open, 4);
        assert_eq!(options.notification_channel_or_default(), "events");
    }
}
