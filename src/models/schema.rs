//! Schema metadata models.
//!
//! Metadata is keyed schema name → table name → table metadata. Connections
//! sharing a backing schema are grouped behind one exemplar.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Column metadata as reported by the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMetadata {
    pub name: String,
    /// Declared type, e.g. "character varying"
    pub data_type: String,
    /// Underlying type name, e.g. "varchar"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub udt_name: Option<String>,
    pub nullable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl ColumnMetadata {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            udt_name: None,
            nullable,
            default_value: None,
            comment: None,
        }
    }

    pub fn with_udt_name(mut self, udt_name: impl Into<String>) -> Self {
        self.udt_name = Some(udt_name.into());
        self
    }

    pub fn with_default(mut self, default_value: impl Into<String>) -> Self {
        self.default_value = Some(default_value.into());
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

/// Table metadata with columns in catalog order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMetadata {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub columns: Vec<ColumnMetadata>,
}

/// One row of the catalog introspection query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogColumnRow {
    pub schema_name: String,
    pub table_name: String,
    pub column_name: String,
    pub column_default: Option<String>,
    pub is_nullable: bool,
    pub data_type: String,
    pub udt_name: Option<String>,
    pub column_comment: Option<String>,
    pub table_comment: Option<String>,
}

/// Schema metadata for every inspected schema.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaMetadata {
    pub schemas: BTreeMap<String, BTreeMap<String, TableMetadata>>,
    /// Name of the session's temporary schema, when one was seen.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temporary_schema: Option<String>,
}

impl SchemaMetadata {
    /// Build metadata from catalog rows.
    ///
    /// The first schema starting with `temp_schema_prefix` is recorded as the
    /// temporary schema; its rows are kept like any other.
    pub fn from_catalog_rows(rows: Vec<CatalogColumnRow>, temp_schema_prefix: Option<&str>) -> Self {
        let mut metadata = Self::default();
        for row in rows {
            if metadata.temporary_schema.is_none()
                && temp_schema_prefix.is_some_and(|p| row.schema_name.starts_with(p))
            {
                metadata.temporary_schema = Some(row.schema_name.clone());
            }

            let table = metadata
                .schemas
                .entry(row.schema_name.clone())
                .or_default()
                .entry(row.table_name.clone())
                .or_insert_with(|| TableMetadata {
                    name: row.table_name.clone(),
                    comment: None,
                    columns: Vec::new(),
                });

            if table.comment.is_none() {
                table.comment = row.table_comment.filter(|c| !c.is_empty());
            }

            let mut column = ColumnMetadata::new(row.column_name, row.data_type, row.is_nullable);
            column.udt_name = row.udt_name;
            column.default_value = row.column_default;
            column.comment = row.column_comment.filter(|c| !c.is_empty());
            table.columns.push(column);
        }
        metadata
    }

    /// Tables for a schema, if present.
    pub fn tables(&self, schema: &str) -> Option<&BTreeMap<String, TableMetadata>> {
        self.schemas.get(schema)
    }

    /// Copy an exemplar schema's tables onto an alias.
    ///
    /// Returns false when the exemplar has no metadata.
    pub fn replicate(&mut self, exemplar: &str, alias: &str) -> bool {
        let Some(tables) = self.schemas.get(exemplar).cloned() else {
            return false;
        };
        self.schemas.insert(alias.to_string(), tables);
        true
    }

    pub fn table_count(&self) -> usize {
        self.schemas.values().map(BTreeMap::len).sum()
    }
}

/// Logical connections grouped by identical backing schema.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaGroups {
    /// Exemplar connection → other connections sharing its schema.
    pub exemplars: BTreeMap<String, BTreeSet<String>>,
    /// Connections whose schema is not shared and must be inspected directly.
    pub standalone: BTreeSet<String>,
}

impl SchemaGroups {
    /// Distinct schemas that actually need introspection.
    pub fn distinct_schemas(&self) -> Vec<String> {
        self.exemplars
            .keys()
            .chain(self.standalone.iter())
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Total number of logical connections covered.
    pub fn connection_count(&self) -> usize {
        self.exemplars.values().map(|a| a.len() + 1).sum::<usize>() + self.standalone.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exemplars.is_empty() && self.standalone.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(schema: &str, table: &str, column: &str) -> CatalogColumnRow {
        CatalogColumnRow {
            schema_name: schema.to_string(),
            table_name: table.to_string(),
            column_name: column.to_string(),
            column_default: None,
            is_nullable: true,
            data_type: "text".to_string(),
            udt_name: Some("text".to_string()),
            column_comment: Some(String::new()),
            table_comment: Some("Instances".to_string()),
        }
    }

    #[test]
    fn test_from_catalog_rows() {
        let rows = vec![
            row("aws", "instance", "id"),
            row("aws", "instance", "region"),
            row("pg_temp_3", "scratch", "x"),
        ];
        let metadata = SchemaMetadata::from_catalog_rows(rows, Some("pg_temp_"));
        let table = &metadata.tables("aws").unwrap()["instance"];
        assert_eq!(table.columns.len(), 2);
        assert_eq!(table.columns[1].name, "region");
        assert_eq!(table.comment.as_deref(), Some("Instances"));
        // Empty comments are dropped
        assert_eq!(table.columns[0].comment, None);
        assert_eq!(metadata.temporary_schema.as_deref(), Some("pg_temp_3"));
        assert_eq!(metadata.table_count(), 2);
    }

    #[test]
    fn test_replicate_copies_tables() {
        let mut metadata =
            SchemaMetadata::from_catalog_rows(vec![row("aws", "instance", "id")], Some("pg_temp_"));
        assert!(metadata.replicate("aws", "aws_prod"));
        assert_eq!(metadata.tables("aws_prod"), metadata.tables("aws"));
        assert!(!metadata.replicate("missing", "alias"));
    }

    #[test]
    fn test_schema_groups_distinct() {
        let mut groups = SchemaGroups::default();
        groups
            .exemplars
            .insert("aws".to_string(), BTreeSet::from(["aws_prod".to_string()]));
        groups.standalone.insert("csv".to_string());
        assert_eq!(groups.distinct_schemas(), vec!["aws", "csv"]);
        assert_eq!(groups.connection_count(), 3);
    }
}
