//! Keeps the controller in step with app foreground/background transitions.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info};

use crate::session::TrackingSessionController;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppLifecycle {
    Foreground,
    Background,
}

/// Background task reacting to [`AppLifecycle`] events and polling the
/// controller's state every `poll`.
pub struct LifecycleSynchronizer {
    stop_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl LifecycleSynchronizer {
    pub fn spawn(
        controller: Arc<TrackingSessionController>,
        mut events: mpsc::Receiver<AppLifecycle>,
        poll: Duration,
    ) -> Self {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut tick = interval_at(Instant::now() + poll, poll);
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    event = events.recv() => match event {
                        Some(AppLifecycle::Foreground) => {
                            debug!("app entered foreground");
                            controller.reconcile().await;
                        }
                        Some(AppLifecycle::Background) => {
                            debug!("app entered background; tracking continues");
                        }
                        None => break,
                    },
                    _ = tick.tick() => controller.refresh_status().await,
                }
            }
            info!("lifecycle synchronizer stopped");
        });
        Self {
            stop_tx,
            handle: Some(handle),
        }
    }

    /// Stops the task and waits for it to finish.
    pub async fn stop(mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for LifecycleSynchronizer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
