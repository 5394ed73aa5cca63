//! Periodic redelivery of queued samples.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use geotrack_core::{Clock, RetryDecision, RetryPolicy};
use serde::Serialize;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

use crate::delivery::{DeliveryClient, DeliveryOutcome};
use crate::queue::RetryQueueStore;

/// Default period between passes.
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(30);

/// Counters for one pass over the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessReport {
    pub attempted: usize,
    pub delivered: usize,
    pub retried: usize,
    pub expired: usize,
    pub exhausted: usize,
    pub invalid: usize,
    pub remaining: usize,
}

pub struct QueueProcessor {
    queue: Arc<RetryQueueStore>,
    delivery: Arc<DeliveryClient>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    period: Duration,
    pass: AsyncMutex<()>,
    timer: Mutex<Option<watch::Sender<bool>>>,
}

impl QueueProcessor {
    pub fn new(
        queue: Arc<RetryQueueStore>,
        delivery: Arc<DeliveryClient>,
        clock: Arc<dyn Clock>,
        policy: RetryPolicy,
        period: Duration,
    ) -> Self {
        Self {
            queue,
            delivery,
            clock,
            policy,
            period,
            pass: AsyncMutex::new(()),
            timer: Mutex::new(None),
        }
    }

    /// Starts the periodic timer; the first pass runs one period from now.
    /// Restarting replaces the running timer.
    pub fn start(self: &Arc<Self>) {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = interval_at(Instant::now() + this.period, this.period);
            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    _ = tick.tick() => {
                        let report = this.run_once().await;
                        if report.attempted > 0 || report.remaining > 0 {
                            debug!("queue pass: {report:?}");
                        }
                    }
                }
            }
        });

        if let Some(old_tx) = self.slot().replace(stop_tx) {
            let _ = old_tx.send(true);
        }
        info!("queue processor started (every {:?})", self.period);
    }

    /// Clears the timer. No-op when not started. A pass already in progress
    /// runs to completion and commits its results.
    pub fn stop(&self) {
        if let Some(stop_tx) = self.slot().take() {
            let _ = stop_tx.send(true);
            info!("queue processor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.slot().is_some()
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<watch::Sender<bool>>> {
        self.timer.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// One pass, oldest entry first. Attempts are sequential; overlapping
    /// calls wait for the pass in progress.
    pub async fn run_once(&self) -> ProcessReport {
        let _pass = self.pass.lock().await;
        let mut report = ProcessReport::default();

        let entries = self.queue.dequeue_all();
        if entries.is_empty() {
            return report;
        }
        let now = self.clock.now_ms();

        let mut removed: HashSet<String> = HashSet::new();
        let mut updated = Vec::new();

        for mut entry in entries {
            match self.policy.decide(&entry, now) {
                RetryDecision::Expired => {
                    debug!("dropping stale queued sample {}", entry.id);
                    report.expired += 1;
                    removed.insert(entry.id);
                }
                RetryDecision::Exhausted => {
                    debug!("dropping queued sample {} after {} retries", entry.id, entry.retry_count);
                    report.exhausted += 1;
                    removed.insert(entry.id);
                }
                RetryDecision::Attempt => {
                    report.attempted += 1;
                    match self.delivery.deliver(&entry.sample).await {
                        DeliveryOutcome::Delivered => {
                            report.delivered += 1;
                            removed.insert(entry.id);
                        }
                        DeliveryOutcome::Invalid(_) => {
                            report.invalid += 1;
                            removed.insert(entry.id);
                        }
                        DeliveryOutcome::Failed => {
                            entry.retry_count += 1;
                            report.retried += 1;
                            updated.push(entry);
                        }
                    }
                }
            }
        }

        if let Err(e) = self.queue.commit(&removed, &updated) {
            warn!("failed to persist queue pass: {e}");
        }
        report.remaining = self.queue.size();
        report
    }
}
