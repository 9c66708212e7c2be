//! Query-related data models.
//!
//! This module defines column definitions, streamed row items and query timing.

use crate::error::DbError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use std::sync::OnceLock;
use std::time::Duration;

/// A column in a result projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Name as reported by the backend.
    pub name: String,
    /// Backend type label, e.g. "INT4" or "TEXT".
    pub data_type: String,
    /// Disambiguated name, set only when `name` repeats within the projection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unique_name: Option<String>,
    #[serde(skip)]
    is_scalar: OnceLock<bool>,
}

impl PartialEq for ColumnDef {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.data_type == other.data_type
            && self.unique_name == other.unique_name
    }
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            unique_name: None,
            is_scalar: OnceLock::new(),
        }
    }

    /// Name to key row values by.
    pub fn display_name(&self) -> &str {
        self.unique_name.as_deref().unwrap_or(&self.name)
    }

    /// Whether values in this column are scalars.
    ///
    /// Decided from the first non-null value seen and cached. Later values are
    /// not re-checked. Returns `None` while only nulls have been observed.
    pub fn observe_scalar(&self, value: &JsonValue) -> Option<bool> {
        if let Some(known) = self.is_scalar.get() {
            return Some(*known);
        }
        if value.is_null() {
            return None;
        }
        let scalar = !matches!(value, JsonValue::Array(_) | JsonValue::Object(_));
        Some(*self.is_scalar.get_or_init(|| scalar))
    }

    /// Cached scalar classification, if decided.
    pub fn is_scalar(&self) -> Option<bool> {
        self.is_scalar.get().copied()
    }
}

/// Assign unique names to repeated column names.
///
/// The first occurrence keeps its name; later ones become `name_1`, `name_2`,
/// skipping any suffix already taken by another column.
pub fn assign_unique_names(columns: &mut [ColumnDef]) {
    let mut taken: HashSet<String> = columns.iter().map(|c| c.name.clone()).collect();
    let mut seen: HashSet<String> = HashSet::new();

    for col in columns.iter_mut() {
        if seen.insert(col.name.clone()) {
            continue;
        }
        let mut suffix = 1;
        let unique = loop {
            let candidate = format!("{}_{}", col.name, suffix);
            if !taken.contains(&candidate) {
                break candidate;
            }
            suffix += 1;
        };
        taken.insert(unique.clone());
        col.unique_name = Some(unique);
    }
}

/// One item on a result's row queue: a decoded row or an in-band error.
#[derive(Debug)]
pub enum RowResult {
    Row(Vec<JsonValue>),
    Error(DbError),
}

impl RowResult {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Convert into a standard result.
    pub fn into_result(self) -> Result<Vec<JsonValue>, DbError> {
        match self {
            Self::Row(values) => Ok(values),
            Self::Error(err) => Err(err),
        }
    }
}

/// Timing payload attached to each streamed result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryTiming {
    pub started_at: DateTime<Utc>,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    pub rows_returned: u64,
    /// True when the statement ended with an in-band error.
    pub failed: bool,
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scalar_decided_once() {
        let col = ColumnDef::new("tags", "JSONB");
        assert_eq!(col.is_scalar(), None);
        assert_eq!(col.observe_scalar(&JsonValue::Null), None);
        assert_eq!(col.observe_scalar(&json!("a")), Some(true));
        // A later value of a different shape does not change the decision
        assert_eq!(col.observe_scalar(&json!(["a", "b"])), Some(true));
        assert_eq!(col.is_scalar(), Some(true));
    }

    #[test]
    fn test_scalar_non_scalar_first() {
        let col = ColumnDef::new("doc", "JSON");
        assert_eq!(col.observe_scalar(&json!({"k": 1})), Some(false));
        assert_eq!(col.observe_scalar(&json!(1)), Some(false));
    }

    #[test]
    fn test_assign_unique_names() {
        let mut cols = vec![
            ColumnDef::new("id", "INT4"),
            ColumnDef::new("name", "TEXT"),
            ColumnDef::new("id", "INT4"),
            ColumnDef::new("id_1", "INT4"),
            ColumnDef::new("id", "INT4"),
        ];
        assign_unique_names(&mut cols);
        assert_eq!(cols[0].unique_name, None);
        assert_eq!(cols[1].unique_name, None);
        assert_eq!(cols[2].unique_name.as_deref(), Some("id_2"));
        assert_eq!(cols[3].unique_name, None);
        assert_eq!(cols[4].unique_name.as_deref(), Some("id_3"));
        assert_eq!(cols[2].display_name(), "id_2");
        assert_eq!(cols[1].display_name(), "name");
    }

    #[test]
    fn test_row_result_into_result() {
        assert!(RowResult::Row(vec![json!(1)]).into_result().is_ok());
        let err = RowResult::Error(DbError::internal("boom"));
        assert!(err.is_error());
        assert!(err.into_result().is_err());
    }
}
