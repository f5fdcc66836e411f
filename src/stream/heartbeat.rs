//! Server-driven keep-alive timer.
//!
//! The scheduler owns at most one recurring tokio task. The task only invokes
//! the supplied callback; it never touches connection state or the transport
//! directly.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

use crate::stream::client::StreamClientError;

/// Recurring keep-alive timer tied to a single connection.
#[derive(Debug, Default)]
pub struct HeartbeatScheduler {
    task: Option<JoinHandle<()>>,
    interval: Option<Duration>,
}

impl HeartbeatScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts invoking `send` every `interval_ms` milliseconds.
    ///
    /// The first call happens one full interval after arming. Any previously
    /// armed timer is cancelled first. A non-positive interval is rejected and
    /// leaves the current timer untouched.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn arm<F>(&mut self, interval_ms: i64, mut send: F) -> Result<(), StreamClientError>
    where
        F: FnMut() + Send + 'static,
    {
        if interval_ms <= 0 {
            return Err(StreamClientError::Configuration(format!(
                "heartbeat interval must be a positive number of milliseconds, got {interval_ms}"
            )));
        }

        self.disarm();

        let period = Duration::from_millis(interval_ms as u64);
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                send();
            }
        });

        debug!(event = "heartbeat_armed", interval_ms);
        self.task = Some(task);
        self.interval = Some(period);
        Ok(())
    }

    /// Cancels the timer. Calling this while disarmed is a no-op.
    pub fn disarm(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!(event = "heartbeat_disarmed");
        }
        self.interval = None;
    }

    pub fn is_armed(&self) -> bool {
        self.task.is_some()
    }

    /// Interval of the currently armed timer.
    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }
}

impl Drop for HeartbeatScheduler {
    fn drop(&mut self) {
        self.disarm();
    }
}
