//! dbcore: backend-agnostic database access core.
//!
//! Opens PostgreSQL and SQLite targets behind a [`Client`] with separate user
//! and management pools, decodes rows into JSON values, streams results with
//! consumer acknowledgement, extracts schema metadata and listens for server
//! notifications.

pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use config::{ClientOptions, PoolOverrides};
pub use db::{Client, ResultStreamer, RowReaderRegistry};
pub use error::{DbError, DbResult};
