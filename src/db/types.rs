//! Row readers: backend-native values to canonical JSON values.
//!
//! # Architecture
//!
//! Type conversion uses a two-phase approach:
//! 1. `TypeCategory` classifies column types into logical categories
//! 2. Backend-specific decoders handle the actual value extraction
//!
//! Each supported backend has one [`RowReader`] implementation. Readers are
//! looked up through a [`RowReaderRegistry`] built at startup and handed to
//! the client, so there is no process-wide reader table.

use crate::error::{DbError, DbResult};
use crate::models::{BackendKind, ColumnDef, assign_unique_names};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueFormat, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Decode, Row, Type, TypeInfo};
use std::collections::HashMap;
use std::sync::Arc;

// =============================================================================
// Raw Rows
// =============================================================================

/// A row as returned by the driver, before decoding.
pub enum RawRow {
    Postgres(PgRow),
    SQLite(SqliteRow),
}

impl std::fmt::Debug for RawRow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let columns = match self {
            RawRow::Postgres(row) => row.len(),
            RawRow::SQLite(row) => row.len(),
        };
        f.debug_struct("RawRow")
            .field("backend", &self.backend())
            .field("columns", &columns)
            .finish_non_exhaustive()
    }
}

impl RawRow {
    pub fn backend(&self) -> BackendKind {
        match self {
            RawRow::Postgres(_) => BackendKind::PostgreSQL,
            RawRow::SQLite(_) => BackendKind::SQLite,
        }
    }

    /// Column definitions for this row's projection, with duplicate names
    /// disambiguated.
    pub fn column_defs(&self) -> Vec<ColumnDef> {
        match self {
            RawRow::Postgres(row) => column_defs(row.columns()),
            RawRow::SQLite(row) => column_defs(row.columns()),
        }
    }
}

/// Build uniquely named column definitions from driver column descriptions.
pub fn column_defs<C: Column>(columns: &[C]) -> Vec<ColumnDef> {
    let mut defs: Vec<ColumnDef> = columns
        .iter()
        .map(|c| ColumnDef::new(c.name(), c.type_info().name()))
        .collect();
    assign_unique_names(&mut defs);
    defs
}

// =============================================================================
// Type Classification
// =============================================================================

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Text,
    Binary,
    Json,
    Uuid,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Unknown,
}

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str, backend: BackendKind) -> TypeCategory {
    let lower = type_name.to_lowercase();

    // Decimal/Numeric - check first as it overlaps with "numeric" in float checks
    if lower.contains("decimal") || lower.contains("numeric") {
        // SQLite's NUMERIC is actually a float
        if backend == BackendKind::SQLite && lower == "numeric" {
            return TypeCategory::Float;
        }
        return TypeCategory::Decimal;
    }

    // Temporal types are only native on PostgreSQL; SQLite stores them as text
    if backend == BackendKind::PostgreSQL {
        match lower.as_str() {
            "date" => return TypeCategory::Date,
            "time" => return TypeCategory::Time,
            "timestamp" => return TypeCategory::Timestamp,
            "timestamptz" => return TypeCategory::TimestampTz,
            _ => {}
        }
    }

    if lower.contains("int") || lower.contains("serial") {
        return TypeCategory::Integer;
    }

    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }

    if lower.contains("float")
        || lower.contains("double")
        || lower == "real"
        || lower == "float4"
        || lower == "float8"
    {
        return TypeCategory::Float;
    }

    if lower == "json" || lower == "jsonb" {
        return TypeCategory::Json;
    }

    if lower == "uuid" {
        return TypeCategory::Uuid;
    }

    if lower.contains("blob") || lower == "bytea" {
        return TypeCategory::Binary;
    }

    if lower == "text" || lower.contains("char") || lower == "name" {
        return TypeCategory::Text;
    }

    TypeCategory::Unknown
}

// =============================================================================
// Decimal Type Support
// =============================================================================

/// Wrapper type for raw NUMERIC values as strings.
/// This preserves the exact database representation.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        <String as Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("numeric") || name.contains("decimal")
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        match value.format() {
            PgValueFormat::Text => Ok(RawDecimal(value.as_str()?.to_string())),
            PgValueFormat::Binary => Ok(RawDecimal(numeric_to_string(value.as_bytes()?)?)),
        }
    }
}

/// Render a binary NUMERIC (base-10000 digit groups) as exact decimal text.
fn numeric_to_string(bytes: &[u8]) -> Result<String, sqlx::error::BoxDynError> {
    use std::fmt::Write as _;

    let read_i16 = |at: usize| -> Result<i16, sqlx::error::BoxDynError> {
        bytes
            .get(at..at + 2)
            .map(|b| i16::from_be_bytes([b[0], b[1]]))
            .ok_or_else(|| "truncated NUMERIC value".into())
    };

    let ndigits = read_i16(0)?.max(0) as usize;
    let weight = read_i16(2)? as i32;
    let sign = read_i16(4)? as u16;
    let dscale = read_i16(6)? as u16 as usize;

    match sign {
        0xC000 => return Ok("NaN".to_string()),
        0xD000 => return Ok("Infinity".to_string()),
        0xF000 => return Ok("-Infinity".to_string()),
        _ => {}
    }

    let digits = (0..ndigits)
        .map(|i| read_i16(8 + i * 2))
        .collect::<Result<Vec<_>, _>>()?;
    let digit = |i: i32| {
        usize::try_from(i)
            .ok()
            .and_then(|i| digits.get(i).copied())
            .unwrap_or(0)
    };

    let mut out = String::new();
    if sign == 0x4000 {
        out.push('-');
    }
    if weight < 0 {
        out.push('0');
    } else {
        for i in 0..=weight {
            if i == 0 {
                write!(out, "{}", digit(0))?;
            } else {
                write!(out, "{:04}", digit(i))?;
            }
        }
    }
    if dscale > 0 {
        let mut frac = String::new();
        let mut i = weight + 1;
        while frac.len() < dscale {
            write!(frac, "{:04}", digit(i))?;
            i += 1;
        }
        frac.truncate(dscale);
        out.push('.');
        out.push_str(&frac);
    }
    Ok(out)
}

// =============================================================================
// Binary Encoding
// =============================================================================

/// Encode binary data as a base64 JSON string.
pub fn encode_binary_value(bytes: &[u8]) -> JsonValue {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    JsonValue::String(STANDARD.encode(bytes))
}

fn float_value(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

// =============================================================================
// Row Readers
// =============================================================================

/// Decodes one backend's rows into canonical values.
pub trait RowReader: Send + Sync + std::fmt::Debug {
    /// Backend whose rows this reader understands.
    fn backend(&self) -> BackendKind;

    /// Decode every column of `row`, in projection order.
    fn read(&self, row: &RawRow) -> DbResult<Vec<JsonValue>>;
}

fn wrong_backend(reader: BackendKind, row: &RawRow) -> DbError {
    DbError::protocol(format!(
        "{} row reader received a {} row",
        reader,
        row.backend()
    ))
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresRowReader;

impl RowReader for PostgresRowReader {
    fn backend(&self) -> BackendKind {
        BackendKind::PostgreSQL
    }

    fn read(&self, row: &RawRow) -> DbResult<Vec<JsonValue>> {
        let RawRow::Postgres(row) = row else {
            return Err(wrong_backend(self.backend(), row));
        };
        row.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let category = categorize_type(col.type_info().name(), BackendKind::PostgreSQL);
                postgres::decode_column(row, idx, category)
            })
            .collect()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteRowReader;

impl RowReader for SqliteRowReader {
    fn backend(&self) -> BackendKind {
        BackendKind::SQLite
    }

    fn read(&self, row: &RawRow) -> DbResult<Vec<JsonValue>> {
        let RawRow::SQLite(row) = row else {
            return Err(wrong_backend(self.backend(), row));
        };
        row.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let type_name = col.type_info().name();
                let category = categorize_type(type_name, BackendKind::SQLite);
                sqlite::decode_column(row, idx, type_name, category)
            })
            .collect()
    }
}

/// Backend kind → row reader lookup.
#[derive(Debug, Clone, Default)]
pub struct RowReaderRegistry {
    readers: HashMap<BackendKind, Arc<dyn RowReader>>,
}

impl RowReaderRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with readers for every supported backend.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(PostgresRowReader));
        registry.register(Arc::new(SqliteRowReader));
        registry
    }

    /// Register (or replace) the reader for its backend.
    pub fn register(&mut self, reader: Arc<dyn RowReader>) {
        self.readers.insert(reader.backend(), reader);
    }

    /// Reader for `kind`, or `None` when the backend has no decoder.
    pub fn reader_for(&self, kind: BackendKind) -> Option<Arc<dyn RowReader>> {
        self.readers.get(&kind).cloned()
    }
}

// =============================================================================
// Backend-Specific Decoders
// =============================================================================

mod postgres {
    use super::*;
    use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

    /// Decode with an `Option<T>` probe, mapping NULL to `JsonValue::Null`.
    fn decode_as<'r, T, F>(row: &'r PgRow, idx: usize, f: F) -> DbResult<JsonValue>
    where
        T: Decode<'r, sqlx::Postgres> + Type<sqlx::Postgres>,
        F: FnOnce(T) -> JsonValue,
    {
        Ok(row
            .try_get::<Option<T>, _>(idx)?
            .map(f)
            .unwrap_or(JsonValue::Null))
    }

    pub fn decode_column(row: &PgRow, idx: usize, category: TypeCategory) -> DbResult<JsonValue> {
        match category {
            TypeCategory::Decimal => decode_as::<RawDecimal, _>(row, idx, |v| JsonValue::String(v.0)),
            TypeCategory::Integer => decode_integer(row, idx),
            TypeCategory::Boolean => decode_as::<bool, _>(row, idx, JsonValue::Bool),
            TypeCategory::Float => decode_float(row, idx),
            TypeCategory::Binary => {
                decode_as::<Vec<u8>, _>(row, idx, |v| encode_binary_value(&v))
            }
            TypeCategory::Json => decode_as::<JsonValue, _>(row, idx, |v| v),
            TypeCategory::Uuid => {
                decode_as::<uuid::Uuid, _>(row, idx, |v| JsonValue::String(v.to_string()))
            }
            TypeCategory::Date => {
                decode_as::<NaiveDate, _>(row, idx, |v| JsonValue::String(v.to_string()))
            }
            TypeCategory::Time => {
                decode_as::<NaiveTime, _>(row, idx, |v| JsonValue::String(v.to_string()))
            }
            TypeCategory::Timestamp => decode_as::<NaiveDateTime, _>(row, idx, |v| {
                JsonValue::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
            }),
            TypeCategory::TimestampTz => {
                decode_as::<DateTime<Utc>, _>(row, idx, |v| JsonValue::String(v.to_rfc3339()))
            }
            TypeCategory::Text => decode_as::<String, _>(row, idx, JsonValue::String),
            TypeCategory::Unknown => decode_unknown(row, idx),
        }
    }

    fn decode_integer(row: &PgRow, idx: usize) -> DbResult<JsonValue> {
        if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            return Ok(v.map(|v| JsonValue::Number(v.into())).unwrap_or(JsonValue::Null));
        }
        if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
            return Ok(v.map(|v| JsonValue::Number(v.into())).unwrap_or(JsonValue::Null));
        }
        decode_as::<i16, _>(row, idx, |v| JsonValue::Number(v.into()))
    }

    fn decode_float(row: &PgRow, idx: usize) -> DbResult<JsonValue> {
        if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
            return Ok(v.map(float_value).unwrap_or(JsonValue::Null));
        }
        decode_as::<f32, _>(row, idx, |v| float_value(v as f64))
    }

    /// Types without a dedicated decoder (enums, arrays, intervals, ...).
    ///
    /// Text-compatible values come through as strings. Otherwise the raw wire
    /// bytes are used: as text when valid UTF-8 (enum labels), else base64.
    fn decode_unknown(row: &PgRow, idx: usize) -> DbResult<JsonValue> {
        use sqlx::ValueRef;

        if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
            return Ok(v.map(JsonValue::String).unwrap_or(JsonValue::Null));
        }
        let raw = row.try_get_raw(idx)?;
        if raw.is_null() {
            return Ok(JsonValue::Null);
        }
        match raw.as_bytes() {
            Ok(bytes) => Ok(match std::str::from_utf8(bytes) {
                Ok(s) => JsonValue::String(s.to_string()),
                Err(_) => encode_binary_value(bytes),
            }),
            Err(e) => Err(DbError::internal(format!(
                "Failed to decode column {}: {}",
                idx, e
            ))),
        }
    }
}

mod sqlite {
    use super::*;

    /// Decode one column. Typed decoding is attempted from the declared type;
    /// when the stored value does not match (SQLite does not enforce column
    /// types), decoding falls back to the value's storage class.
    pub fn decode_column(
        row: &SqliteRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
    ) -> DbResult<JsonValue> {
        let typed = match category {
            TypeCategory::Integer => row
                .try_get::<Option<i64>, _>(idx)
                .map(|v| v.map(|v| JsonValue::Number(v.into()))),
            TypeCategory::Boolean => row
                .try_get::<Option<bool>, _>(idx)
                .map(|v| v.map(JsonValue::Bool)),
            TypeCategory::Float | TypeCategory::Decimal => row
                .try_get::<Option<f64>, _>(idx)
                .map(|v| v.map(float_value)),
            TypeCategory::Binary => row
                .try_get::<Option<Vec<u8>>, _>(idx)
                .map(|v| v.map(|v| encode_binary_value(&v))),
            _ => return decode_dynamic(row, idx, type_name),
        };
        match typed {
            Ok(v) => Ok(v.unwrap_or(JsonValue::Null)),
            Err(_) => decode_dynamic(row, idx, type_name),
        }
    }

    /// Decode by storage class ("INTEGER", "REAL", "TEXT", "BLOB", "NULL").
    fn decode_dynamic(row: &SqliteRow, idx: usize, type_name: &str) -> DbResult<JsonValue> {
        if let Ok(Some(v)) = row.try_get::<Option<String>, _>(idx) {
            if type_name.to_lowercase().contains("json") {
                if let Ok(json) = serde_json::from_str::<JsonValue>(&v) {
                    return Ok(json);
                }
            }
            return Ok(JsonValue::String(v));
        }
        if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(idx) {
            return Ok(JsonValue::Number(v.into()));
        }
        if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
            return Ok(float_value(v));
        }
        if let Ok(Some(v)) = row.try_get::<Option<Vec<u8>>, _>(idx) {
            return Ok(encode_binary_value(&v));
        }
        Ok(JsonValue::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categorize_type_integer() {
        assert_eq!(
            categorize_type("INT4", BackendKind::PostgreSQL),
            TypeCategory::Integer
        );
        assert_eq!(
            categorize_type("INTEGER", BackendKind::SQLite),
            TypeCategory::Integer
        );
        assert_eq!(
            categorize_type("SERIAL", BackendKind::PostgreSQL),
            TypeCategory::Integer
        );
    }

    #[test]
    fn test_categorize_type_decimal() {
        assert_eq!(
            categorize_type("NUMERIC", BackendKind::PostgreSQL),
            TypeCategory::Decimal
        );
        // SQLite NUMERIC is a float
        assert_eq!(
            categorize_type("numeric", BackendKind::SQLite),
            TypeCategory::Float
        );
    }

    #[test]
    fn test_categorize_type_temporal() {
        assert_eq!(
            categorize_type("TIMESTAMPTZ", BackendKind::PostgreSQL),
            TypeCategory::TimestampTz
        );
        assert_eq!(
            categorize_type("DATE", BackendKind::PostgreSQL),
            TypeCategory::Date
        );
        // SQLite has no native date type
        assert_eq!(
            categorize_type("DATE", BackendKind::SQLite),
            TypeCategory::Unknown
        );
    }

    #[test]
    fn test_categorize_type_json_and_text() {
        assert_eq!(
            categorize_type("jsonb", BackendKind::PostgreSQL),
            TypeCategory::Json
        );
        assert_eq!(
            categorize_type("VARCHAR", BackendKind::PostgreSQL),
            TypeCategory::Text
        );
    }

    #[test]
    fn test_registry_lookup() {
        let registry = RowReaderRegistry::standard();
        assert_eq!(
            registry
                .reader_for(BackendKind::PostgreSQL)
                .map(|r| r.backend()),
            Some(BackendKind::PostgreSQL)
        );
        assert_eq!(
            registry.reader_for(BackendKind::SQLite).map(|r| r.backend()),
            Some(BackendKind::SQLite)
        );
        assert!(registry.reader_for(BackendKind::MySQL).is_none());
        assert!(registry.reader_for(BackendKind::Unknown).is_none());
        assert!(RowReaderRegistry::new()
            .reader_for(BackendKind::PostgreSQL)
            .is_none());
    }

    #[test]
    fn test_numeric_to_string() {
        // 123.45: ndigits=2, weight=0, sign=+, dscale=2, digits [123, 4500]
        let bytes = [0, 2, 0, 0, 0, 0, 0, 2, 0, 123, 0x11, 0x94];
        assert_eq!(numeric_to_string(&bytes).unwrap(), "123.45");

        // -0.05: ndigits=1, weight=-1, sign=-, dscale=2, digits [500]
        let bytes = [0, 1, 0xFF, 0xFF, 0x40, 0, 0, 2, 0x01, 0xF4];
        assert_eq!(numeric_to_string(&bytes).unwrap(), "-0.05");

        // 10000: ndigits=1, weight=1, digits [1]
        let bytes = [0, 1, 0, 1, 0, 0, 0, 0, 0, 1];
        assert_eq!(numeric_to_string(&bytes).unwrap(), "10000");

        let nan = [0, 0, 0, 0, 0xC0, 0, 0, 0];
        assert_eq!(numeric_to_string(&nan).unwrap(), "NaN");
        assert!(numeric_to_string(&[0, 1]).is_err());
    }

    #[test]
    fn test_encode_binary_value() {
        assert_eq!(
            encode_binary_value(b"hello world"),
            JsonValue::String("aGVsbG8gd29ybGQ=".to_string())
        );
        assert_eq!(encode_binary_value(&[]), JsonValue::String(String::new()));
    }

    #[tokio::test]
    async fn test_raw_row_debug_and_columns() {
        let pool = sqlx::SqlitePool::connect_lazy("sqlite::memory:").unwrap();
        let row = sqlx::query("SELECT 1 AS id, 'a' AS name, 2 AS id")
            .fetch_one(&pool)
            .await
            .unwrap();
        let row = RawRow::SQLite(row);

        let debug = format!("{:?}", row);
        assert!(debug.contains("SQLite"));
        assert!(debug.contains("columns: 3"));

        let columns = row.column_defs();
        let names: Vec<&str> = columns.iter().map(|c| c.display_name()).collect();
        assert_eq!(names, vec!["id", "name", "id_1"]);
    }
}
