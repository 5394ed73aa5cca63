//! Periodic position sampling for one tracked user at a time.

use std::sync::Arc;

use futures::future::BoxFuture;
use geotrack_core::{LocationSample, Position};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::permission::{request_permissions, PermissionGate};
use crate::provider::{LocationProvider, ProviderError, WatchOptions};

/// Callback invoked, one at a time, for every new sample.
pub type SampleHandler = Arc<dyn Fn(LocationSample) -> BoxFuture<'static, ()> + Send + Sync>;

/// Invoked once when the provider ends a watch on its own. Not invoked on
/// [`LocationSampler::stop`] or when a new session replaces the watch.
pub type WatchEndHandler = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("location permission not granted")]
    PermissionDenied,
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("sampler is not running")]
    NotRunning,
}

struct ActiveWatch {
    user_id: String,
    handler: SampleHandler,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ActiveWatch {
    fn is_live(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Deliveries still in flight are dropped with the task.
    fn shutdown(self) {
        let _ = self.stop_tx.send(true);
        self.handle.abort();
    }
}

pub struct LocationSampler {
    provider: Arc<dyn LocationProvider>,
    permissions: Arc<dyn PermissionGate>,
    options: WatchOptions,
    active: Mutex<Option<ActiveWatch>>,
}

impl LocationSampler {
    pub fn new(
        provider: Arc<dyn LocationProvider>,
        permissions: Arc<dyn PermissionGate>,
        options: WatchOptions,
    ) -> Self {
        Self {
            provider,
            permissions,
            options,
            active: Mutex::new(None),
        }
    }

    /// Starts sampling for `user_id`. Any previous session is stopped first,
    /// so the old handler never sees another sample.
    pub async fn start(&self, user_id: &str, on_sample: SampleHandler) -> Result<(), SamplerError> {
        self.start_watch(user_id, on_sample, None).await
    }

    /// Like [`start`](Self::start), and calls `on_end` if the provider stops
    /// delivering fixes before the session is stopped.
    pub async fn start_with_end_hook(
        &self,
        user_id: &str,
        on_sample: SampleHandler,
        on_end: WatchEndHandler,
    ) -> Result<(), SamplerError> {
        self.start_watch(user_id, on_sample, Some(on_end)).await
    }

    async fn start_watch(
        &self,
        user_id: &str,
        on_sample: SampleHandler,
        on_end: Option<WatchEndHandler>,
    ) -> Result<(), SamplerError> {
        let mut active = self.active.lock().await;
        if let Some(prev) = active.take() {
            info!("replacing sampling session for user '{}'", prev.user_id);
            prev.shutdown();
        }

        if !request_permissions(self.permissions.as_ref()).await {
            return Err(SamplerError::PermissionDenied);
        }

        let positions = self.provider.watch(self.options)?;
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run_watch(
            user_id.to_string(),
            positions,
            stop_rx,
            on_sample.clone(),
            on_end,
        ));

        info!(
            "sampling started for user '{}' (every {:?}, >= {}m)",
            user_id, self.options.interval, self.options.min_distance_m
        );
        *active = Some(ActiveWatch {
            user_id: user_id.to_string(),
            handler: on_sample,
            stop_tx,
            handle,
        });
        Ok(())
    }

    /// Stops sampling. No-op when not started.
    pub async fn stop(&self) {
        if let Some(prev) = self.active.lock().await.take() {
            info!("sampling stopped for user '{}'", prev.user_id);
            prev.shutdown();
        }
    }

    /// False once the watch has ended, even if `stop` was never called.
    pub async fn is_running(&self) -> bool {
        self.active.lock().await.as_ref().is_some_and(ActiveWatch::is_live)
    }

    pub async fn active_user(&self) -> Option<String> {
        self.active
            .lock()
            .await
            .as_ref()
            .filter(|a| a.is_live())
            .map(|a| a.user_id.clone())
    }

    /// Takes one fix right now and passes it to the active handler.
    pub async fn force_sample(&self) -> Result<(), SamplerError> {
        let (user_id, handler) = {
            let active = self.active.lock().await;
            let a = active
                .as_ref()
                .filter(|a| a.is_live())
                .ok_or(SamplerError::NotRunning)?;
            (a.user_id.clone(), a.handler.clone())
        };
        let pos = self.provider.current_position().await?;
        handler(pos.into_sample(user_id)).await;
        Ok(())
    }
}

async fn run_watch(
    user_id: String,
    mut positions: mpsc::Receiver<Position>,
    mut stop_rx: watch::Receiver<bool>,
    handler: SampleHandler,
    on_end: Option<WatchEndHandler>,
) {
    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            next = positions.recv() => match next {
                Some(pos) => handler(pos.into_sample(user_id.as_str())).await,
                None => {
                    warn!("location provider ended the watch for user '{user_id}'");
                    if let Some(on_end) = &on_end {
                        on_end().await;
                    }
                    break;
                }
            },
        }
    }
}
