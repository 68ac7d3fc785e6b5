//! Idle timeout (RFC 9000 Section 10.1).
//!
//! One timer per connection. Every rearm aborts the previous task before
//! spawning the next, so at most one expiry is pending. The timer holds the
//! connection weakly; a dropped connection simply never fires.

use std::sync::Weak;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

use super::Connection;

pub(crate) struct IdleTimer {
    timeout: Duration,
    connection: Weak<Connection>,
    task: Mutex<Option<JoinHandle<()>>>,
    deadline: Mutex<Option<Instant>>,
}

impl IdleTimer {
    pub(crate) fn new(timeout: Duration, connection: Weak<Connection>) -> Self {
        Self {
            timeout,
            connection,
            task: Mutex::new(None),
            deadline: Mutex::new(None),
        }
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Restart the countdown. Without a tokio runtime there is no timer.
    pub(crate) fn rearm(&self) {
        let Ok(runtime) = Handle::try_current() else {
            trace!("no runtime, idle timer not armed");
            return;
        };
        let connection = self.connection.clone();
        let deadline = Instant::now() + self.timeout;
        *self.deadline.lock() = Some(deadline);

        let mut task = self.task.lock();
        if let Some(previous) = task.take() {
            previous.abort();
        }
        *task = Some(runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(connection) = connection.upgrade() {
                connection.on_idle_timeout();
            }
        }));
    }

    /// Whether the latest deadline has passed. An expiry that raced with a
    /// rearm sees a fresh deadline and must not close the connection.
    pub(crate) fn expired(&self) -> bool {
        self.deadline
            .lock()
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    pub(crate) fn cancel(&self) {
        *self.deadline.lock() = None;
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for IdleTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
