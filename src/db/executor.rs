//! Query execution engine.
//!
//! Statements are started through a [`QueryStarter`], which callers can swap
//! (for example for [`RetryingStarter`]) without touching anything else on the
//! [`Client`]. Each statement becomes one [`QueryResult`] published through a
//! [`ResultStreamer`]; rows are decoded by the client's row reader and pushed
//! while the consumer drains them.

use crate::db::pool::{Client, DbPool};
use crate::db::streamer::{QueryResult, ResultStreamer, ResultWriter};
use crate::db::types::{RawRow, RowReader};
use crate::error::DbResult;
use crate::models::QueryTiming;
use chrono::Utc;
use futures_util::future::BoxFuture;
use futures_util::stream::{self, BoxStream};
use futures_util::{FutureExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Rows still to be read from a started statement.
pub type RowStream<'a> = BoxStream<'a, DbResult<RawRow>>;

/// A statement that has been accepted by the server.
pub struct StartedQuery<'a> {
    /// First row, read eagerly so start errors surface before streaming.
    pub first: Option<RawRow>,
    pub rest: RowStream<'a>,
}

impl std::fmt::Debug for StartedQuery<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartedQuery")
            .field("has_first", &self.first.is_some())
            .finish_non_exhaustive()
    }
}

/// Starts a statement on a pool.
pub trait QueryStarter: Send + Sync + std::fmt::Debug {
    fn start<'a>(&'a self, pool: &'a DbPool, sql: &'a str)
    -> BoxFuture<'a, DbResult<StartedQuery<'a>>>;
}

/// Start `sql` once and read its first row.
pub async fn start_once<'a>(pool: &'a DbPool, sql: &'a str) -> DbResult<StartedQuery<'a>> {
    let mut rows = pool.fetch(sql);
    let first = rows.next().await.transpose()?;
    Ok(StartedQuery { first, rest: rows })
}

/// Default starter: a single attempt.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExecuteOnce;

impl QueryStarter for ExecuteOnce {
    fn start<'a>(
        &'a self,
        pool: &'a DbPool,
        sql: &'a str,
    ) -> BoxFuture<'a, DbResult<StartedQuery<'a>>> {
        start_once(pool, sql).boxed()
    }
}

/// Retries start failures that are transient (connection loss, timeouts).
///
/// Only the start is retried; once rows flow, errors are delivered in-band.
#[derive(Debug, Clone)]
pub struct RetryingStarter<S = ExecuteOnce> {
    inner: S,
    max_attempts: u32,
    backoff: Duration,
}

impl RetryingStarter {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self::wrap(ExecuteOnce, max_attempts, backoff)
    }
}

impl<S: QueryStarter> RetryingStarter<S> {
    pub fn wrap(inner: S, max_attempts: u32, backoff: Duration) -> Self {
        Self {
            inner,
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }
}

impl<S: QueryStarter> QueryStarter for RetryingStarter<S> {
    fn start<'a>(
        &'a self,
        pool: &'a DbPool,
        sql: &'a str,
    ) -> BoxFuture<'a, DbResult<StartedQuery<'a>>> {
        async move {
            let mut attempt = 1;
            loop {
                match self.inner.start(pool, sql).await {
                    Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                        warn!(
                            attempt,
                            max_attempts = self.max_attempts,
                            error = %e,
                            "Query start failed, retrying"
                        );
                        tokio::time::sleep(self.backoff * attempt).await;
                        attempt += 1;
                    }
                    other => return other,
                }
            }
        }
        .boxed()
    }
}

/// Query executor that streams statement results.
#[derive(Debug, Clone)]
pub struct QueryExecutor {
    row_buffer: usize,
}

impl QueryExecutor {
    /// `row_buffer` bounds how many decoded rows may wait for the consumer.
    pub fn new(row_buffer: usize) -> Self {
        Self {
            row_buffer: row_buffer.max(1),
        }
    }

    /// Execute `statements` in order, one published result per statement.
    ///
    /// The streamer is closed when this returns. A statement that fails to
    /// start ends execution with that error; failures while reading rows are
    /// delivered in-band and execution continues with the next statement.
    pub async fn execute_statements(
        &self,
        client: &Client,
        statements: &[String],
        streamer: &ResultStreamer<QueryTiming>,
    ) -> DbResult<()> {
        let outcome = self.run(client, statements, streamer).await;
        streamer.close();
        outcome
    }

    async fn run(
        &self,
        client: &Client,
        statements: &[String],
        streamer: &ResultStreamer<QueryTiming>,
    ) -> DbResult<()> {
        let reader = client.row_reader()?;
        for sql in statements {
            self.execute_one(client, Arc::clone(&reader), sql, streamer)
                .await?;
        }
        Ok(())
    }

    async fn execute_one(
        &self,
        client: &Client,
        reader: Arc<dyn RowReader>,
        sql: &str,
        streamer: &ResultStreamer<QueryTiming>,
    ) -> DbResult<()> {
        let started_at = Utc::now();
        let start = Instant::now();
        debug!(sql = %sql, "Executing statement");

        let started = client
            .query_starter()
            .start(client.user_pool(), sql)
            .await?;

        // Without a first row the projection comes from describing the statement
        let columns = match started.first.as_ref() {
            Some(row) => row.column_defs(),
            None => match client.user_pool().describe_columns(sql).await {
                Ok(columns) => columns,
                Err(e) => {
                    // Statements the driver cannot prepare still ran; publish them bare
                    warn!(error = %e, "Could not describe statement columns");
                    Vec::new()
                }
            },
        };
        let (mut writer, result) = QueryResult::channel(columns, self.row_buffer);

        let produce = async move {
            let (rows_returned, failed) = stream_rows(started, reader.as_ref(), &mut writer).await;
            let timing = QueryTiming {
                started_at,
                duration: start.elapsed(),
                rows_returned,
                failed,
            };
            debug!(
                rows = rows_returned,
                failed,
                duration_ms = timing.duration.as_millis() as u64,
                "Statement finished"
            );
            writer.close(timing)
        };

        let (published, produced) = tokio::join!(streamer.publish(result), produce);
        produced?;
        published
    }
}

/// Push every row of `started` through `writer`.
///
/// Returns the number of rows delivered and whether an in-band error ended the
/// statement.
async fn stream_rows(
    started: StartedQuery<'_>,
    reader: &dyn RowReader,
    writer: &mut ResultWriter<QueryTiming>,
) -> (u64, bool) {
    let StartedQuery { first, rest } = started;
    let mut rows = stream::iter(first.map(Ok)).chain(rest);
    let mut delivered = 0u64;

    while let Some(row) = rows.next().await {
        match row.and_then(|r| reader.read(&r)) {
            Ok(values) => {
                if let Err(e) = writer.stream_row(values).await {
                    debug!(error = %e, "Consumer stopped reading rows");
                    return (delivered, false);
                }
                delivered += 1;
            }
            Err(e) => {
                warn!(error = %e, rows = delivered, "Row read failed");
                let _ = writer.stream_error(e).await;
                return (delivered, true);
            }
        }
    }
    (delivered, false)
}

impl Client {
    /// Execute `statements` on the user pool, streaming results.
    pub async fn execute(
        &self,
        statements: &[String],
        streamer: &ResultStreamer<QueryTiming>,
    ) -> DbResult<()> {
        QueryExecutor::new(self.options().row_buffer_or_default())
            .execute_statements(self, statements, streamer)
            .await
    }
}
