//! Connection-related data models.
//!
//! This module classifies connection strings into backend kinds and prepares
//! them for the underlying driver.

use serde::{Deserialize, Serialize};

const POSTGRES_PREFIXES: &[&str] = &["postgres://", "postgresql://"];
const SQLITE_PREFIX: &str = "sqlite://";
const SQLITE_LEGACY_PREFIX: &str = "sqlite3://";
const MYSQL_PREFIX: &str = "mysql://";

/// Relational engine targeted by a connection string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    PostgreSQL,
    SQLite,
    /// Recognized but not supported for pooling or row decoding.
    MySQL,
    /// No recognized scheme; treated as a raw PostgreSQL driver string.
    Unknown,
}

impl BackendKind {
    /// Classify a connection string by its scheme prefix.
    ///
    /// Prefixes are matched literally, without case folding.
    pub fn classify(connection_string: &str) -> Self {
        if POSTGRES_PREFIXES
            .iter()
            .any(|p| connection_string.starts_with(p))
        {
            Self::PostgreSQL
        } else if connection_string.starts_with(SQLITE_PREFIX)
            || connection_string.starts_with(SQLITE_LEGACY_PREFIX)
        {
            Self::SQLite
        } else if connection_string.starts_with(MYSQL_PREFIX) {
            Self::MySQL
        } else {
            Self::Unknown
        }
    }

    /// Get the display name for this backend.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "PostgreSQL",
            Self::SQLite => "SQLite",
            Self::MySQL => "MySQL",
            Self::Unknown => "unknown",
        }
    }

    /// Backend that actually serves this kind, if any.
    ///
    /// Unknown strings are handed to the default (PostgreSQL) driver.
    pub fn driver_backend(&self) -> Option<Self> {
        match self {
            Self::PostgreSQL | Self::Unknown => Some(Self::PostgreSQL),
            Self::SQLite => Some(Self::SQLite),
            Self::MySQL => None,
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Normalize a connection string for the driver.
///
/// Both `sqlite://` and the legacy `sqlite3://` prefix are stripped, leaving a
/// file path. Everything else passes through unchanged.
pub fn driver_connection_string(connection_string: &str) -> &str {
    connection_string
        .strip_prefix(SQLITE_LEGACY_PREFIX)
        .or_else(|| connection_string.strip_prefix(SQLITE_PREFIX))
        .unwrap_or(connection_string)
}

/// True for postgres/postgresql/sqlite connection strings.
///
/// `mysql://` is classified by [`BackendKind::classify`] but deliberately not
/// accepted here.
pub fn is_connection_string(s: &str) -> bool {
    matches!(
        BackendKind::classify(s),
        BackendKind::PostgreSQL | BackendKind::SQLite
    )
}

/// Get a display-safe version of a connection string (credentials masked).
pub fn masked_connection_string(connection_string: &str) -> String {
    if let Some(scheme_end) = connection_string.find("://").map(|i| i + 3) {
        // Passwords may contain '@', so the host starts after the last one
        let query_start = connection_string[scheme_end..]
            .find('?')
            .map_or(connection_string.len(), |i| scheme_end + i);
        if let Some(at_pos) = connection_string[scheme_end..query_start].rfind('@') {
            let at_pos = scheme_end + at_pos;
            if let Some(colon_pos) = connection_string[scheme_end..at_pos].find(':') {
                let prefix = &connection_string[..scheme_end + colon_pos + 1];
                let suffix = &connection_string[at_pos..];
                return format!("{}****{}", prefix, suffix);
            }
        }
    }
    // Keyword/value form: mask the password=... pair
    if connection_string.contains("password=") {
        return connection_string
            .split_whitespace()
            .map(|kv| {
                if kv.starts_with("password=") {
                    "password=****"
                } else {
                    kv
                }
            })
            .collect::<Vec<_>>()
            .join(" ");
    }
    connection_string.to_string()
}
