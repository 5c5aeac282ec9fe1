//! Timer and on-demand refresh signals
//!
//! A [`ScheduledTrigger`] runs one tokio task. On every tick it asks the
//! orchestrator to refresh whatever is stale, without waiting for the
//! refresh to finish; a tick that lands while a refresh is still running
//! is a no-op for that kind. [`ScheduledTrigger::force`] queues a forced
//! refresh and returns at once.

use super::RefreshOrchestrator;
use crate::config::{DatasetKind, NetinfoConfig};
use crate::error::{NetinfoError, NetinfoResult};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Timer configuration
#[derive(Debug, Clone)]
pub struct TriggerSchedule {
    /// Period between staleness checks
    pub tick: Duration,
    /// Kinds checked on every tick
    pub kinds: Vec<DatasetKind>,
}

impl TriggerSchedule {
    pub fn from_config(config: &NetinfoConfig) -> Self {
        Self {
            tick: config.schedule_tick(),
            kinds: DatasetKind::all().to_vec(),
        }
    }
}

/// Returned by [`ScheduledTrigger::force`] once the request is queued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TriggerAck {
    pub kind: DatasetKind,
    pub acknowledged: bool,
}

pub struct ScheduledTrigger {
    tx: mpsc::UnboundedSender<DatasetKind>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ScheduledTrigger {
    /// Start the trigger task on the current tokio runtime
    pub fn spawn(orchestrator: Arc<RefreshOrchestrator>, schedule: TriggerSchedule) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_trigger(orchestrator, schedule, rx, cancel.clone()));
        Self {
            tx,
            cancel,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Queue a forced refresh of `kind`
    pub fn force(&self, kind: DatasetKind) -> NetinfoResult<TriggerAck> {
        self.tx
            .send(kind)
            .map_err(|_| NetinfoError::storage("refresh trigger is not running"))?;
        Ok(TriggerAck {
            kind,
            acknowledged: true,
        })
    }

    /// Stop the timer; refreshes already running finish on their own
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("refresh trigger task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for ScheduledTrigger {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_trigger(
    orchestrator: Arc<RefreshOrchestrator>,
    schedule: TriggerSchedule,
    mut rx: mpsc::UnboundedReceiver<DatasetKind>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(schedule.tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(
        "refresh trigger started, checking every {}s",
        schedule.tick.as_secs()
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                for kind in &schedule.kinds {
                    if orchestrator.ensure_fresh_background(*kind) {
                        debug!("scheduled {} refresh started", kind);
                    }
                }
            }
            Some(kind) = rx.recv() => {
                let orchestrator = orchestrator.clone();
                tokio::task::spawn_blocking(move || {
                    match orchestrator.force_refresh(kind) {
                        Ok(report) => info!("forced {} refresh done: {:?}", kind, report.outcome),
                        Err(e) => warn!("forced {} refresh failed: {}", kind, e),
                    }
                });
            }
        }
    }

    info!("refresh trigger stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refresh::tests::{orchestrator_with, FakeFetcher};
    use std::sync::atomic::Ordering;
    use std::time::Instant;

    async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timer_loads_stale_datasets() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(FakeFetcher::new());
        let orchestrator = orchestrator_with(dir.path(), fetcher.clone(), |_| {});

        let trigger = ScheduledTrigger::spawn(
            orchestrator.clone(),
            TriggerSchedule {
                tick: Duration::from_millis(50),
                kinds: vec![DatasetKind::Routing, DatasetKind::AsNames],
            },
        );

        let loaded = wait_for(|| {
            let current = orchestrator.current();
            current.routing.is_some() && current.as_names.is_some()
        })
        .await;
        assert!(loaded);
        trigger.shutdown().await;

        // fresh data is not downloaded again on later ticks
        assert_eq!(fetcher.routing_downloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_force_returns_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(FakeFetcher::new());
        *fetcher.names_delay.lock().unwrap() = Duration::from_millis(300);
        let orchestrator = orchestrator_with(dir.path(), fetcher.clone(), |_| {});

        let trigger = ScheduledTrigger::spawn(
            orchestrator.clone(),
            TriggerSchedule {
                tick: Duration::from_secs(3600),
                kinds: vec![],
            },
        );

        let started = Instant::now();
        let ack = trigger.force(DatasetKind::AsNames).unwrap();
        assert!(ack.acknowledged);
        assert!(started.elapsed() < Duration::from_millis(200));

        assert!(wait_for(|| orchestrator.current().as_names.is_some()).await);
        assert_eq!(fetcher.names_calls.load(Ordering::SeqCst), 1);
        trigger.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_force_after_shutdown_fails() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(FakeFetcher::new());
        let orchestrator = orchestrator_with(dir.path(), fetcher, |_| {});

        let trigger = ScheduledTrigger::spawn(
            orchestrator,
            TriggerSchedule {
                tick: Duration::from_secs(3600),
                kinds: vec![],
            },
        );
        trigger.shutdown().await;
        assert!(trigger.force(DatasetKind::Geo).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_background_refresh_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(FakeFetcher::new());
        let orchestrator = orchestrator_with(dir.path(), fetcher.clone(), |_| {});

        let trigger = ScheduledTrigger::spawn(
            orchestrator.clone(),
            TriggerSchedule {
                tick: Duration::from_millis(50),
                kinds: vec![DatasetKind::Geo],
            },
        );
        assert!(wait_for(|| fetcher.geo_calls.load(Ordering::SeqCst) >= 1).await);
        // several more ticks land inside the retry backoff
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.shutdown().await;
        assert!(orchestrator.current().geo.is_none());
        assert_eq!(fetcher.geo_calls.load(Ordering::SeqCst), 1);
    }
}
