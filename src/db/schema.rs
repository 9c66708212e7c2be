//! Schema introspection module.
//!
//! Column metadata is read from the catalog in a single query. When the
//! connection-state table is available, logical connections sharing a backing
//! schema are grouped and only one exemplar per group is introspected; its
//! tables are then copied to every alias. Servers without that table get the
//! legacy query, which discovers schemas through foreign-table metadata.
//!
//! # Architecture
//!
//! Query text is built by [`SchemaExtractor`]; rows come from a
//! [`CatalogSource`], implemented for `PgPool` and by test doubles.

use crate::config::SchemaCatalogOptions;
use crate::db::pool::{Client, DbPool};
use crate::error::{DbError, DbResult};
use crate::models::{CatalogColumnRow, SchemaGroups, SchemaMetadata};
use sqlx::{PgPool, Row, SqlitePool};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use tracing::{debug, info};

/// Schema used for SQLite metadata.
pub const SQLITE_SCHEMA: &str = "main";

/// Schema mode of a connection whose schema is fixed at plugin level.
pub const SCHEMA_MODE_STATIC: &str = "static";

/// One row of the connection-state table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStateRow {
    /// Connection name, which is also its schema name.
    pub name: String,
    pub plugin: Option<String>,
    pub schema_mode: String,
}

/// Runs catalog queries and returns typed rows.
pub trait CatalogSource: Send + Sync {
    fn fetch_connection_states(
        &self,
        sql: &str,
    ) -> impl Future<Output = DbResult<Vec<ConnectionStateRow>>> + Send;

    fn fetch_catalog_columns(
        &self,
        sql: &str,
    ) -> impl Future<Output = DbResult<Vec<CatalogColumnRow>>> + Send;
}

impl CatalogSource for PgPool {
    async fn fetch_connection_states(&self, sql: &str) -> DbResult<Vec<ConnectionStateRow>> {
        let rows = sqlx::query(sql).fetch_all(self).await?;
        rows.iter()
            .map(|row| -> DbResult<ConnectionStateRow> {
                Ok(ConnectionStateRow {
                    name: row.try_get("name")?,
                    plugin: row.try_get("plugin")?,
                    schema_mode: row
                        .try_get::<Option<String>, _>("schema_mode")?
                        .unwrap_or_default(),
                })
            })
            .collect()
    }

    async fn fetch_catalog_columns(&self, sql: &str) -> DbResult<Vec<CatalogColumnRow>> {
        let rows = sqlx::query(sql).fetch_all(self).await?;
        rows.iter()
            .map(|row| -> DbResult<CatalogColumnRow> {
                let nullable: String = row.try_get("is_nullable")?;
                Ok(CatalogColumnRow {
                    schema_name: row.try_get("table_schema")?,
                    table_name: row.try_get("table_name")?,
                    column_name: row.try_get("column_name")?,
                    column_default: row.try_get("column_default")?,
                    is_nullable: nullable.eq_ignore_ascii_case("YES"),
                    data_type: row.try_get("data_type")?,
                    udt_name: row.try_get("udt_name")?,
                    column_comment: row.try_get("column_comment")?,
                    table_comment: row.try_get("table_comment")?,
                })
            })
            .collect()
    }
}

/// Group connections by backing schema.
///
/// Static connections of the same plugin share one schema; the first by name
/// becomes the exemplar. Dynamic connections, and connections without a
/// plugin, are introspected on their own.
pub fn group_connections(rows: &[ConnectionStateRow]) -> SchemaGroups {
    let mut by_plugin: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    let mut groups = SchemaGroups::default();

    for row in rows {
        match row.plugin.as_deref() {
            Some(plugin) if !plugin.is_empty() && row.schema_mode == SCHEMA_MODE_STATIC => {
                by_plugin.entry(plugin).or_default().insert(&row.name);
            }
            _ => {
                groups.standalone.insert(row.name.clone());
            }
        }
    }

    for names in by_plugin.values() {
        let mut names = names.iter();
        if let Some(exemplar) = names.next() {
            groups.exemplars.insert(
                exemplar.to_string(),
                names.map(|n| n.to_string()).collect(),
            );
        }
    }
    groups
}

/// Quote a value as a SQL string literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn quote_ident(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

const CATALOG_COLUMNS: &str = r#"
    SELECT
        c.table_name::text AS table_name,
        c.column_name::text AS column_name,
        c.column_default::text AS column_default,
        c.is_nullable::text AS is_nullable,
        c.data_type::text AS data_type,
        c.udt_name::text AS udt_name,
        c.table_schema::text AS table_schema,
        col_description(
            format('%I.%I', c.table_schema, c.table_name)::regclass::oid,
            c.ordinal_position::int
        ) AS column_comment,
        obj_description(
            format('%I.%I', c.table_schema, c.table_name)::regclass::oid,
            'pg_class'
        ) AS table_comment
    FROM information_schema.columns c"#;

const CATALOG_ORDER: &str = "ORDER BY c.table_schema, c.table_name, c.ordinal_position";

const SQLITE_COLUMNS: &str = r#"
    SELECT
        m.name AS table_name,
        p.name AS column_name,
        p.type AS data_type,
        p."notnull" AS not_null,
        p.dflt_value AS column_default
    FROM sqlite_master m
    JOIN pragma_table_info(m.name) p
    WHERE m.type IN ('table', 'view') AND m.name NOT LIKE 'sqlite_%'
    ORDER BY m.name, p.cid
"#;

/// Builds and runs schema metadata queries.
#[derive(Debug, Clone, Default)]
pub struct SchemaExtractor {
    options: SchemaCatalogOptions,
}

impl SchemaExtractor {
    pub fn new(options: SchemaCatalogOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &SchemaCatalogOptions {
        &self.options
    }

    /// Query reading the connection-state table.
    pub fn connection_state_query(&self) -> String {
        format!(
            "SELECT name::text AS name, plugin::text AS plugin, schema_mode::text AS schema_mode \
             FROM {}.{} ORDER BY name",
            quote_ident(&self.options.internal_schema),
            quote_ident(&self.options.connection_state_table),
        )
    }

    fn temp_schema_predicate(&self) -> String {
        let prefix = &self.options.temp_schema_prefix;
        format!(
            "LEFT(c.table_schema::text, {}) = {}",
            prefix.chars().count(),
            quote_literal(prefix)
        )
    }

    /// Introspection query restricted to `schemas` and temporary schemas.
    pub fn grouped_query(&self, schemas: &[String]) -> String {
        let filter = if schemas.is_empty() {
            self.temp_schema_predicate()
        } else {
            let list = schemas
                .iter()
                .map(|s| quote_literal(s))
                .collect::<Vec<_>>()
                .join(", ");
            format!(
                "c.table_schema IN ({}) OR {}",
                list,
                self.temp_schema_predicate()
            )
        };
        format!("{}\n    WHERE {}\n    {}", CATALOG_COLUMNS, filter, CATALOG_ORDER)
    }

    /// Introspection query for servers without the connection-state table.
    pub fn legacy_query(&self) -> String {
        format!(
            "WITH distinct_schema AS (\n    \
                 SELECT DISTINCT foreign_table_schema::text AS schema_name\n    \
                 FROM information_schema.foreign_tables\n    \
                 WHERE foreign_table_schema <> {}\n)\
             {}\n    \
             WHERE c.table_schema IN (SELECT schema_name FROM distinct_schema) OR {}\n    {}",
            quote_literal(&self.options.reserved_schema),
            CATALOG_COLUMNS,
            self.temp_schema_predicate(),
            CATALOG_ORDER
        )
    }

    /// Read connection grouping, or `None` when the server has no
    /// connection-state table.
    pub async fn load_schema_groups<S: CatalogSource>(
        &self,
        source: &S,
    ) -> DbResult<Option<SchemaGroups>> {
        match source
            .fetch_connection_states(&self.connection_state_query())
            .await
        {
            Ok(rows) => {
                let groups = group_connections(&rows);
                debug!(
                    connections = groups.connection_count(),
                    distinct = groups.distinct_schemas().len(),
                    "Loaded schema groups"
                );
                Ok(Some(groups))
            }
            Err(e) if e.is_undefined_table() => {
                debug!("Connection-state table missing, using legacy schema query");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Extract metadata, introspecting each distinct schema once when
    /// `groups` is given.
    pub async fn extract_schema<S: CatalogSource>(
        &self,
        source: &S,
        groups: Option<&SchemaGroups>,
    ) -> DbResult<SchemaMetadata> {
        let Some(groups) = groups else {
            let rows = source.fetch_catalog_columns(&self.legacy_query()).await?;
            let metadata =
                SchemaMetadata::from_catalog_rows(rows, Some(&self.options.temp_schema_prefix));
            info!(tables = metadata.table_count(), "Extracted schema (legacy)");
            return Ok(metadata);
        };

        let schemas = groups.distinct_schemas();
        let rows = source
            .fetch_catalog_columns(&self.grouped_query(&schemas))
            .await?;
        let mut metadata =
            SchemaMetadata::from_catalog_rows(rows, Some(&self.options.temp_schema_prefix));

        for (exemplar, aliases) in &groups.exemplars {
            for alias in aliases {
                if !metadata.replicate(exemplar, alias) {
                    debug!(exemplar = %exemplar, alias = %alias, "Exemplar schema has no tables");
                }
            }
        }

        info!(
            schemas = schemas.len(),
            connections = groups.connection_count(),
            tables = metadata.table_count(),
            "Extracted schema"
        );
        Ok(metadata)
    }

    /// Load groups, then extract; falls back to the legacy query when the
    /// connection-state table is missing.
    pub async fn extract<S: CatalogSource>(&self, source: &S) -> DbResult<SchemaMetadata> {
        let groups = self.load_schema_groups(source).await?;
        self.extract_schema(source, groups.as_ref()).await
    }

    /// Extract metadata through `pool`.
    pub async fn extract_from_pool(&self, pool: &DbPool) -> DbResult<SchemaMetadata> {
        match pool {
            DbPool::Postgres(p) => self.extract(p).await,
            DbPool::SQLite(p) => sqlite::extract(p).await,
        }
    }
}

mod sqlite {
    use super::*;

    pub async fn extract(pool: &SqlitePool) -> DbResult<SchemaMetadata> {
        let rows = sqlx::query(SQLITE_COLUMNS).fetch_all(pool).await?;
        let rows = rows
            .iter()
            .map(|row| -> DbResult<CatalogColumnRow> {
                let not_null: i64 = row.try_get("not_null")?;
                Ok(CatalogColumnRow {
                    schema_name: SQLITE_SCHEMA.to_string(),
                    table_name: row.try_get("table_name")?,
                    column_name: row.try_get("column_name")?,
                    column_default: row.try_get("column_default")?,
                    is_nullable: not_null == 0,
                    data_type: row
                        .try_get::<Option<String>, _>("data_type")?
                        .unwrap_or_default(),
                    udt_name: None,
                    column_comment: None,
                    table_comment: None,
                })
            })
            .collect::<DbResult<Vec<_>>>()?;

        let metadata = SchemaMetadata::from_catalog_rows(rows, None);
        debug!(tables = metadata.table_count(), "Extracted SQLite schema");
        Ok(metadata)
    }
}

impl Client {
    /// Schema metadata read through the management pool.
    pub async fn schema_metadata(&self) -> DbResult<SchemaMetadata> {
        if self.is_closed() {
            return Err(DbError::connection("Client is closed", "Reopen the client"));
        }
        SchemaExtractor::new(self.options().catalog.clone())
            .extract_from_pool(self.management_pool())
            .await
    }
}
