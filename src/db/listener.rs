//! Server change-notification listener.
//!
//! A [`NotificationListener`] owns one dedicated connection subscribed to a
//! notification channel and runs a single background task that waits for
//! notifications. Until a callback is registered, notifications are buffered
//! in arrival order; registering a callback replays the buffer and from then
//! on every notification goes straight to the callback.
//!
//! The listener is fail-stop: any wait error other than cancellation is
//! logged and ends the task. Reconnection belongs to the caller.

use crate::error::{DbError, DbResult};
use sqlx::postgres::{PgListener, PgNotification};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A notification received from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: String,
    /// Opaque payload, passed through unmodified.
    pub payload: String,
    pub process_id: u32,
}

impl From<PgNotification> for Notification {
    fn from(n: PgNotification) -> Self {
        Self {
            channel: n.channel().to_string(),
            payload: n.payload().to_string(),
            process_id: n.process_id(),
        }
    }
}

/// A connection that can subscribe to and wait for notifications.
pub trait NotificationSource: Send + 'static {
    /// Subscribe to `channel`.
    fn listen(&mut self, channel: &str) -> impl Future<Output = DbResult<()>> + Send;

    /// Wait for the next notification.
    fn recv(&mut self) -> impl Future<Output = DbResult<Notification>> + Send;

    /// Close the underlying connection.
    fn close(self) -> impl Future<Output = ()> + Send
    where
        Self: Sized;
}

impl NotificationSource for PgListener {
    async fn listen(&mut self, channel: &str) -> DbResult<()> {
        PgListener::listen(self, channel).await?;
        Ok(())
    }

    async fn recv(&mut self) -> DbResult<Notification> {
        // try_recv reports a lost connection as None instead of silently
        // reconnecting, which would drop notifications sent in between.
        match self.try_recv().await? {
            Some(notification) => Ok(notification.into()),
            None => Err(DbError::connection(
                "Notification connection lost",
                "Create a new listener to resume receiving notifications",
            )),
        }
    }

    async fn close(mut self) {
        if let Err(e) = self.unlisten_all().await {
            debug!(error = %e, "UNLISTEN failed while closing listener");
        }
    }
}

/// Observable listener phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerPhase {
    /// Subscribed, nothing received, no callback.
    Idle,
    /// Notifications accumulating, no callback.
    Buffering,
    /// Callback registered.
    Delivering,
    /// Background task has ended.
    Stopped,
}

type Callback = Box<dyn FnMut(Notification) + Send>;

#[derive(Default)]
struct ListenerState {
    buffer: VecDeque<Notification>,
    callback: Option<Callback>,
    stopped: bool,
}

impl ListenerState {
    fn deliver(&mut self, notification: Notification) {
        match self.callback.as_mut() {
            Some(callback) => callback(notification),
            None => self.buffer.push_back(notification),
        }
    }
}

pub struct NotificationListener {
    channel: String,
    state: Arc<Mutex<ListenerState>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for NotificationListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationListener")
            .field("channel", &self.channel)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl NotificationListener {
    /// Subscribe `source` to `channel` and start the background wait task.
    ///
    /// The task runs under a child of `parent`, so cancelling `parent` stops
    /// the listener as well.
    pub async fn new<S: NotificationSource>(
        source: Option<S>,
        channel: &str,
        parent: &CancellationToken,
    ) -> DbResult<Self> {
        let Some(mut source) = source else {
            return Err(DbError::invalid_input(
                "A notification listener requires a connection",
            ));
        };
        if channel.is_empty() {
            source.close().await;
            return Err(DbError::invalid_input(
                "Notification channel cannot be empty",
            ));
        }

        if let Err(e) = source.listen(channel).await {
            source.close().await;
            return Err(e);
        }
        info!(channel = %channel, "Listening for notifications");

        let state = Arc::new(Mutex::new(ListenerState::default()));
        let cancel = parent.child_token();
        let task = tokio::spawn(Self::wait_loop(
            source,
            Arc::clone(&state),
            cancel.clone(),
            channel.to_string(),
        ));

        Ok(Self {
            channel: channel.to_string(),
            state,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    async fn wait_loop<S: NotificationSource>(
        mut source: S,
        state: Arc<Mutex<ListenerState>>,
        cancel: CancellationToken,
        channel: String,
    ) {
        loop {
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(DbError::cancelled("notification wait")),
                received = source.recv() => received,
            };

            match received {
                Ok(notification) => {
                    debug!(channel = %notification.channel, "Notification received");
                    match state.lock() {
                        Ok(mut state) => state.deliver(notification),
                        Err(_) => {
                            warn!(channel = %channel, "Listener state poisoned, stopping");
                            break;
                        }
                    }
                }
                Err(e) if e.is_cancelled() => {
                    debug!(channel = %channel, "Notification listener cancelled");
                    break;
                }
                Err(e) => {
                    warn!(channel = %channel, error = %e, "Notification wait failed, listener stopped");
                    break;
                }
            }
        }

        source.close().await;
        if let Ok(mut state) = state.lock() {
            state.stopped = true;
        }
    }

    /// Register (or replace) the delivery callback.
    ///
    /// Buffered notifications are replayed through the callback in arrival
    /// order before this returns. The callback runs under the listener's lock
    /// and must not call back into the listener.
    pub fn register_callback<F>(&self, callback: F) -> DbResult<()>
    where
        F: FnMut(Notification) + Send + 'static,
    {
        let mut state = self
            .state
            .lock()
            .map_err(|_| DbError::internal("listener state poisoned"))?;
        let mut callback: Callback = Box::new(callback);
        let replayed = state.buffer.len();
        for notification in state.buffer.drain(..) {
            callback(notification);
        }
        state.callback = Some(callback);
        if replayed > 0 {
            debug!(channel = %self.channel, replayed, "Replayed buffered notifications");
        }
        Ok(())
    }

    /// Number of notifications waiting for a callback.
    pub fn buffered_len(&self) -> usize {
        self.state.lock().map(|s| s.buffer.len()).unwrap_or(0)
    }

    pub fn phase(&self) -> ListenerPhase {
        let Ok(state) = self.state.lock() else {
            return ListenerPhase::Stopped;
        };
        if state.stopped {
            ListenerPhase::Stopped
        } else if state.callback.is_some() {
            ListenerPhase::Delivering
        } else if state.buffer.is_empty() {
            ListenerPhase::Idle
        } else {
            ListenerPhase::Buffering
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Cancel the wait task and close the connection.
    ///
    /// Safe to call more than once.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(channel = %self.channel, error = %e, "Listener task ended abnormally");
            }
            info!(channel = %self.channel, "Notification listener stopped");
        }
    }
}

impl Drop for NotificationListener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
