//! Periodic refresh worker
//!
//! Background jobs that fire on a fixed interval (upstream healthcheck
//! probes, database reloads) share this abstraction: a [`Refresher`] does
//! one unit of work, and a [`RefreshWorker`] drives it on a schedule with
//! a per-run timeout, reporting failures to the error collector.
//!
//! The first run fires immediately when the worker starts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::errcoll::ErrorCollector;
use crate::error::{DnsError, DnsResult};

/// One unit of periodic work
#[async_trait]
pub trait Refresher: Send + Sync {
    /// Perform one refresh
    async fn refresh(&self) -> DnsResult<()>;
}

/// Worker that drives a [`Refresher`] on an interval
pub struct RefreshWorker {
    name: String,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl RefreshWorker {
    /// Start a worker
    ///
    /// Each run is bounded by `timeout`; failures and timeouts go to
    /// `errcoll` tagged with `name` and do not stop the schedule.
    pub fn start(
        name: impl Into<String>,
        interval: Duration,
        timeout: Duration,
        refresher: Arc<dyn Refresher>,
        errcoll: Arc<dyn ErrorCollector>,
    ) -> Self {
        let name = name.into();
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let run = tokio::time::timeout(timeout, refresher.refresh()).await;
                        match run {
                            Ok(Ok(())) => {}
                            Ok(Err(err)) => errcoll.collect(&task_name, &err),
                            Err(_) => errcoll.collect(
                                &task_name,
                                &DnsError::timeout("refresh", timeout),
                            ),
                        }
                    }
                    _ = stop_rx.changed() => {
                        debug!(name = task_name, "refresh worker stopping");
                        break;
                    }
                }
            }
        });

        Self {
            name,
            stop_tx,
            handle,
        }
    }

    /// The worker's name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop the worker and wait for its task to finish
    pub async fn shutdown(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.handle.await;
    }
}
