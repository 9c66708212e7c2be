//! Data models for the database core.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod query;
pub mod schema;

// Re-export commonly used types
pub use connection::{
    BackendKind, driver_connection_string, is_connection_string, masked_connection_string,
};
pub use query::{ColumnDef, QueryTiming, RowResult, assign_unique_names};
pub use schema::{
    CatalogColumnRow, ColumnMetadata, SchemaGroups, SchemaMetadata, TableMetadata,
};
