//! Database access layer.
//!
//! This module provides:
//! - Client with user and management connection pools
//! - Row readers decoding backend values into JSON
//! - Statement execution with streamed results
//! - Schema metadata extraction
//! - Change-notification listening
//! - Database dispatch macros for reducing code duplication

#[macro_use]
pub mod macros;
pub mod executor;
pub mod listener;
pub mod pool;
pub mod schema;
pub mod streamer;
pub mod types;

pub use executor::{ExecuteOnce, QueryExecutor, QueryStarter, RetryingStarter, StartedQuery};
pub use listener::{ListenerPhase, Notification, NotificationListener, NotificationSource};
pub use pool::{Client, DbPool};
pub use schema::{CatalogSource, ConnectionStateRow, SchemaExtractor};
pub use streamer::{QueryResult, ResultStreamer, ResultWriter};
pub use types::{PostgresRowReader, RawRow, RowReader, RowReaderRegistry, SqliteRowReader};
