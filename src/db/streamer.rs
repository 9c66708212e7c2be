//! Result streaming with one-result-in-flight backpressure.
//!
//! A producer publishes one [`QueryResult`] at a time through a
//! [`ResultStreamer`] and is held in [`ResultStreamer::publish`] until the
//! consumer has drained that result and called
//! [`ResultStreamer::acknowledge`]. Rows of a single result travel on their
//! own bounded queue, written through the paired [`ResultWriter`].
//!
//! The streamer is single-producer/single-consumer. Acknowledging exactly once
//! per drained result is a caller contract; violations are reported as
//! [`DbError::Protocol`] where they can be detected.

use crate::error::{DbError, DbResult};
use crate::models::{ColumnDef, RowResult};
use serde_json::Value as JsonValue;
use std::sync::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};
use tracing::debug;

/// One logical result set: columns, a row queue and a timing payload.
#[derive(Debug)]
pub struct QueryResult<T> {
    pub columns: Vec<ColumnDef>,
    rows: mpsc::Receiver<RowResult>,
    timing: Option<oneshot::Receiver<T>>,
}

impl<T> QueryResult<T> {
    /// Create a result and the writer that feeds it.
    ///
    /// `capacity` bounds how many rows may be queued ahead of the consumer.
    pub fn channel(columns: Vec<ColumnDef>, capacity: usize) -> (ResultWriter<T>, Self) {
        let (row_tx, row_rx) = mpsc::channel(capacity.max(1));
        let (timing_tx, timing_rx) = oneshot::channel();
        (
            ResultWriter {
                rows: Some(row_tx),
                timing: Some(timing_tx),
            },
            Self {
                columns,
                rows: row_rx,
                timing: Some(timing_rx),
            },
        )
    }

    /// Next row or in-band error; `None` once the writer has closed.
    pub async fn next_row(&mut self) -> Option<RowResult> {
        self.rows.recv().await
    }

    /// Drain every remaining row.
    pub async fn drain(&mut self) -> Vec<RowResult> {
        let mut rows = Vec::new();
        while let Some(row) = self.rows.recv().await {
            rows.push(row);
        }
        rows
    }

    /// Timing payload, available once the writer has closed.
    ///
    /// Returns `None` if the writer was dropped without closing, or when
    /// called a second time.
    pub async fn timing(&mut self) -> Option<T> {
        match self.timing.take() {
            Some(rx) => rx.await.ok(),
            None => None,
        }
    }
}

/// Producer half of a [`QueryResult`].
#[derive(Debug)]
pub struct ResultWriter<T> {
    rows: Option<mpsc::Sender<RowResult>>,
    timing: Option<oneshot::Sender<T>>,
}

impl<T> ResultWriter<T> {
    /// Push a decoded row.
    pub async fn stream_row(&mut self, values: Vec<JsonValue>) -> DbResult<()> {
        self.send(RowResult::Row(values)).await
    }

    /// Push an error in-band, after any rows already sent.
    pub async fn stream_error(&mut self, err: DbError) -> DbResult<()> {
        self.send(RowResult::Error(err)).await
    }

    async fn send(&mut self, item: RowResult) -> DbResult<()> {
        let Some(rows) = &self.rows else {
            return Err(DbError::protocol("row sent after the result was closed"));
        };
        rows.send(item)
            .await
            .map_err(|_| DbError::cancelled("row delivery: consumer dropped the result"))
    }

    /// Signal end-of-rows and publish the timing payload.
    pub fn close(&mut self, timing: T) -> DbResult<()> {
        if self.rows.take().is_none() {
            return Err(DbError::protocol("result closed twice"));
        }
        if let Some(tx) = self.timing.take() {
            // Consumer may already have dropped the result
            let _ = tx.send(timing);
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.rows.is_none()
    }
}

/// Capacity-one handoff of results with consumer acknowledgement.
#[derive(Debug)]
pub struct ResultStreamer<T> {
    results_tx: Mutex<Option<mpsc::Sender<QueryResult<T>>>>,
    results_rx: AsyncMutex<mpsc::Receiver<QueryResult<T>>>,
    /// Set while a published result awaits acknowledgement.
    pending_ack: Mutex<Option<oneshot::Sender<()>>>,
}

impl<T> Default for ResultStreamer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ResultStreamer<T> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            results_tx: Mutex::new(Some(tx)),
            results_rx: AsyncMutex::new(rx),
            pending_ack: Mutex::new(None),
        }
    }

    /// Publish a result and wait until the consumer acknowledges it.
    pub async fn publish(&self, result: QueryResult<T>) -> DbResult<()> {
        let tx = self
            .results_tx
            .lock()
            .map_err(|_| DbError::internal("result streamer lock poisoned"))?
            .clone()
            .ok_or_else(|| DbError::protocol("publish on a closed result streamer"))?;

        let (ack_tx, ack_rx) = oneshot::channel();
        {
            let mut pending = self
                .pending_ack
                .lock()
                .map_err(|_| DbError::internal("result streamer lock poisoned"))?;
            if pending.is_some() {
                return Err(DbError::protocol(
                    "publish while the previous result is still in flight",
                ));
            }
            *pending = Some(ack_tx);
        }

        // Cleared again if this future is dropped before the acknowledgement
        let mut guard = PendingGuard {
            streamer: self,
            armed: true,
        };

        if tx.send(result).await.is_err() {
            return Err(DbError::cancelled("publish: consumer went away"));
        }
        debug!("Result published, waiting for acknowledgement");

        let acked = ack_rx.await;
        guard.armed = false;
        acked.map_err(|_| DbError::cancelled("publish: acknowledgement dropped"))
    }

    /// Acknowledge that the in-flight result has been fully drained.
    ///
    /// Fails with [`DbError::Protocol`] when no result is in flight; a stray
    /// acknowledgement is never saved up for a later publish.
    pub fn acknowledge(&self) -> DbResult<()> {
        let pending = self
            .pending_ack
            .lock()
            .map_err(|_| DbError::internal("result streamer lock poisoned"))?
            .take();
        match pending {
            Some(ack) => {
                let _ = ack.send(());
                Ok(())
            }
            None => Err(DbError::protocol("acknowledge without an in-flight result")),
        }
    }

    /// Next published result; `None` after [`close`](Self::close) once the
    /// queue is empty.
    pub async fn next_result(&self) -> Option<QueryResult<T>> {
        self.results_rx.lock().await.recv().await
    }

    /// Signal that no further results will be published.
    ///
    /// A publish still waiting for its acknowledgement is released with
    /// [`DbError::Cancelled`], so a consumer that gives up can close the
    /// streamer to unblock the producer.
    pub fn close(&self) {
        if let Ok(mut tx) = self.results_tx.lock() {
            tx.take();
        }
        self.clear_pending();
    }

    /// True while a published result awaits acknowledgement.
    pub fn is_in_flight(&self) -> bool {
        self.pending_ack
            .lock()
            .map(|pending| pending.is_some())
            .unwrap_or(false)
    }

    fn clear_pending(&self) {
        if let Ok(mut pending) = self.pending_ack.lock() {
            pending.take();
        }
    }
}

/// Clears the in-flight slot when a publish ends without its acknowledgement.
struct PendingGuard<'a, T> {
    streamer: &'a ResultStreamer<T>,
    armed: bool,
}

impl<T> Drop for PendingGuard<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            self.streamer.clear_pending();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_test::{assert_pending, assert_ready_ok};

    fn result(n: i64) -> (ResultWriter<u32>, QueryResult<u32>) {
        QueryResult::channel(vec![ColumnDef::new(format!("c{n}"), "INT8")], 4)
    }

    #[tokio::test]
    async fn test_rows_then_timing() {
        let (mut writer, mut result) = result(0);
        writer.stream_row(vec![json!(1)]).await.unwrap();
        writer.stream_error(DbError::internal("bad row")).await.unwrap();
        writer.close(7).unwrap();

        let rows = result.drain().await;
        assert_eq!(rows.len(), 2);
        assert!(!rows[0].is_error());
        assert!(rows[1].is_error());
        assert_eq!(result.timing().await, Some(7));
        assert_eq!(result.timing().await, None);
    }

    #[tokio::test]
    async fn test_send_after_close_rejected() {
        let (mut writer, _result) = result(0);
        writer.close(0).unwrap();
        assert!(writer.is_closed());
        let err = writer.stream_row(vec![json!(1)]).await.unwrap_err();
        assert!(matches!(err, DbError::Protocol { .. }));
        assert!(matches!(writer.close(0), Err(DbError::Protocol { .. })));
    }

    #[tokio::test]
    async fn test_send_after_consumer_drop_is_cancelled() {
        let (mut writer, result) = result(0);
        drop(result);
        let err = writer.stream_row(vec![json!(1)]).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_acknowledge_without_publish() {
        let streamer = ResultStreamer::<u32>::new();
        assert!(matches!(
            streamer.acknowledge(),
            Err(DbError::Protocol { .. })
        ));
        assert!(!streamer.is_in_flight());
    }

    #[tokio::test]
    async fn test_publish_after_close() {
        let streamer = ResultStreamer::<u32>::new();
        streamer.close();
        let (_w, r) = result(0);
        assert!(matches!(
            streamer.publish(r).await,
            Err(DbError::Protocol { .. })
        ));
        assert!(streamer.next_result().await.is_none());
    }

    #[tokio::test]
    async fn test_second_publish_waits_for_acknowledge() {
        let streamer = Arc::new(ResultStreamer::<u32>::new());
        let (mut w1, r1) = result(1);
        w1.close(1).unwrap();

        let producer = {
            let streamer = Arc::clone(&streamer);
            tokio::spawn(async move {
                streamer.publish(r1).await.unwrap();
                let (mut w2, r2) = result(2);
                w2.close(2).unwrap();
                streamer.publish(r2).await.unwrap();
            })
        };

        let mut first = streamer.next_result().await.unwrap();
        assert_eq!(first.columns[0].name, "c1");
        first.drain().await;

        // Producer is parked in the first publish until acknowledged
        assert!(
            timeout(Duration::from_millis(50), streamer.next_result())
                .await
                .is_err()
        );
        assert!(streamer.is_in_flight());

        streamer.acknowledge().unwrap();
        let second = streamer.next_result().await.unwrap();
        assert_eq!(second.columns[0].name, "c2");
        streamer.acknowledge().unwrap();
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_pending_until_acknowledged() {
        let streamer = ResultStreamer::<u32>::new();
        let (_w, r) = result(1);
        let mut publish = tokio_test::task::spawn(streamer.publish(r));

        assert_pending!(publish.poll());
        let _first = streamer.next_result().await.unwrap();
        assert_pending!(publish.poll());

        streamer.acknowledge().unwrap();
        assert!(publish.is_woken());
        assert_ready_ok!(publish.poll());
    }

    #[tokio::test]
    async fn test_double_acknowledge_does_not_release_later_publish() {
        let streamer = Arc::new(ResultStreamer::<u32>::new());
        let (_w1, r1) = result(1);

        let publisher = {
            let streamer = Arc::clone(&streamer);
            tokio::spawn(async move { streamer.publish(r1).await })
        };
        let _first = streamer.next_result().await.unwrap();
        streamer.acknowledge().unwrap();
        publisher.await.unwrap().unwrap();

        // Extra acknowledgement with nothing in flight is rejected
        assert!(streamer.acknowledge().is_err());

        // The next publish still blocks until its own acknowledgement
        let (_w2, r2) = result(2);
        let publisher = {
            let streamer = Arc::clone(&streamer);
            tokio::spawn(async move { streamer.publish(r2).await })
        };
        let _second = streamer.next_result().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!publisher.is_finished());

        streamer.acknowledge().unwrap();
        publisher.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_abandoned_publish_frees_the_slot() {
        let streamer = Arc::new(ResultStreamer::<u32>::new());
        let (_w1, r1) = result(1);

        // Publisher gives up before the consumer acknowledges
        assert!(
            timeout(Duration::from_millis(20), streamer.publish(r1))
                .await
                .is_err()
        );
        assert!(!streamer.is_in_flight());
        let _first = streamer.next_result().await.unwrap();
        assert!(matches!(
            streamer.acknowledge(),
            Err(DbError::Protocol { .. })
        ));

        let (_w2, r2) = result(2);
        let publisher = {
            let streamer = Arc::clone(&streamer);
            tokio::spawn(async move { streamer.publish(r2).await })
        };
        let second = streamer.next_result().await.unwrap();
        assert_eq!(second.columns[0].name, "c2");
        assert!(streamer.is_in_flight());
        streamer.acknowledge().unwrap();
        publisher.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_close_releases_waiting_publish() {
        let streamer = Arc::new(ResultStreamer::<u32>::new());
        let (_w, r) = result(1);
        let publisher = {
            let streamer = Arc::clone(&streamer);
            tokio::spawn(async move { streamer.publish(r).await })
        };

        let _first = streamer.next_result().await.unwrap();
        streamer.close();
        let err = publisher.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert!(!streamer.is_in_flight());
        assert!(streamer.next_result().await.is_none());
    }
}
