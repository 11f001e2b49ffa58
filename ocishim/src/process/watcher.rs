//! Exit watching seam.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ocishim_shared::errors::ShimResult;
use ocishim_shared::status::UNKNOWN_EXIT_CODE;

use super::ProcessRecord;
use crate::util::{self, Reap};

/// Turns process exits into completions of their records.
///
/// Records only ever talk to this trait, so the notification-based monitor
/// and the polling fallback are interchangeable.
#[async_trait]
pub trait ExitWatcher: Send + Sync {
    /// Start watching a record. Failures degrade the record to Stopped.
    fn watch(&self, record: &Arc<ProcessRecord>);

    /// Stop watching a record. Unknown records are ignored.
    fn unwatch(&self, record: &ProcessRecord);

    /// Resolve with the record's exit code once the process is gone.
    async fn wait(&self, record: &ProcessRecord) -> ShimResult<u32>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Watcher that registers nothing and polls liveness while someone waits.
#[derive(Debug, Clone)]
pub struct PollingWatcher {
    interval: Duration,
}

impl PollingWatcher {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Reap a child nobody tracks any more once it exits.
    ///
    /// Needs a tokio runtime; without one the child is left to whoever
    /// reaps orphans.
    fn reap_later(&self, pid: u32) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(pid = pid, error = %e, "No async runtime available, process will not be reaped");
                return;
            }
        };
        let interval = self.interval;
        handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match util::reap(pid) {
                    Reap::Running => continue,
                    Reap::Exited(code) => {
                        tracing::trace!(pid = pid, exit_code = code, "Reaped unwatched process");
                        return;
                    }
                    Reap::NotChild => return,
                }
            }
        });
    }

    /// One liveness check; completes the record when the process is gone.
    fn poll_once(&self, record: &ProcessRecord) -> Option<u32> {
        if let Some(code) = record.exit_code() {
            return Some(code);
        }
        match util::reap(record.pid()) {
            Reap::Exited(code) => {
                record.complete(code);
            }
            Reap::Running => return None,
            Reap::NotChild => {
                if record.is_same_process() {
                    return None;
                }
                record.complete(UNKNOWN_EXIT_CODE);
            }
        }
        record.exit_code()
    }
}

#[async_trait]
impl ExitWatcher for PollingWatcher {
    fn watch(&self, record: &Arc<ProcessRecord>) {
        tracing::trace!(process_id = %record.id(), pid = record.pid(), "Polling watcher: nothing to register");
    }

    fn unwatch(&self, record: &ProcessRecord) {
        if record.exit_code().is_some() {
            return;
        }
        match util::reap(record.pid()) {
            Reap::Exited(code) => {
                record.complete(code);
            }
            Reap::NotChild => {}
            Reap::Running => self.reap_later(record.pid()),
        }
    }

    async fn wait(&self, record: &ProcessRecord) -> ShimResult<u32> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Some(code) = self.poll_once(record) {
                return Ok(code);
            }
        }
    }

    fn name(&self) -> &'static str {
        "poll"
    }
}
