//! Tracking session lifecycle: one tracked identity at a time, persisted
//! across restarts.

use std::sync::Arc;

use futures::future::BoxFuture;
use geotrack_core::{Clock, EpochMs, LocationSample, Position, TrackingSessionState};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::background::BackgroundTaskScheduler;
use crate::config::{RetryConfig, TrackerConfig};
use crate::delivery::{DeliveryClient, DeliveryOutcome, LocationTransport};
use crate::kv::{get_json, set_json, KeyValueStore, StoreError};
use crate::permission::PermissionGate;
use crate::processor::{ProcessReport, QueueProcessor};
use crate::provider::LocationProvider;
use crate::queue::RetryQueueStore;
use crate::sampler::{LocationSampler, SampleHandler, SamplerError, WatchEndHandler};

/// Storage key for [`TrackingSessionState`].
pub const SESSION_KEY: &str = "tracking_state";

const PERMISSION_DENIED_MSG: &str = "location permission denied";
const DELIVERY_FAILED_MSG: &str = "location delivery failed; queued for retry";
const WATCH_ENDED_MSG: &str = "location updates ended; tracking stopped";

#[derive(Debug, Error)]
pub enum TrackingError {
    #[error("user id must not be empty")]
    EmptyUserId,
    #[error("location permission denied")]
    PermissionDenied,
    #[error(transparent)]
    Sampler(#[from] SamplerError),
}

/// Read-only view published to UI observers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingStatus {
    pub is_tracking: bool,
    pub has_permissions: bool,
    pub user_id: Option<String>,
    pub current_location: Option<Position>,
    pub error: Option<String>,
    pub last_update: Option<EpochMs>,
    pub queue_size: usize,
}

/// Persists [`TrackingSessionState`] under [`SESSION_KEY`].
pub struct SessionStateStore {
    kv: Arc<dyn KeyValueStore>,
}

impl SessionStateStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    pub fn try_load(&self) -> Result<Option<TrackingSessionState>, StoreError> {
        get_json(self.kv.as_ref(), SESSION_KEY)
    }

    /// Unreadable state counts as "not tracking".
    pub fn load(&self) -> TrackingSessionState {
        match self.try_load() {
            Ok(state) => state.unwrap_or_default(),
            Err(e) => {
                warn!("session state unreadable, assuming inactive: {e}");
                TrackingSessionState::default()
            }
        }
    }

    pub fn save(&self, state: &TrackingSessionState) {
        if let Err(e) = set_json(self.kv.as_ref(), SESSION_KEY, state) {
            warn!("failed to persist session state: {e}");
        }
    }
}

/// Everything the controller drives, injected so tests can swap any part.
pub struct TrackerDeps {
    pub kv: Arc<dyn KeyValueStore>,
    pub clock: Arc<dyn Clock>,
    pub sampler: Arc<LocationSampler>,
    pub delivery: Arc<DeliveryClient>,
    pub queue: Arc<RetryQueueStore>,
    pub processor: Arc<QueueProcessor>,
    pub background: Option<Arc<dyn BackgroundTaskScheduler>>,
    pub send_retry: RetryConfig,
}

impl TrackerDeps {
    /// Wires the pipeline from configuration and the platform seams.
    pub fn assemble(
        cfg: &TrackerConfig,
        kv: Arc<dyn KeyValueStore>,
        provider: Arc<dyn LocationProvider>,
        permissions: Arc<dyn PermissionGate>,
        transport: Arc<dyn LocationTransport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let delivery = Arc::new(DeliveryClient::new(transport, cfg.api.request_timeout()));
        let queue = Arc::new(RetryQueueStore::new(kv.clone(), clock.clone(), cfg.queue.capacity));
        let sampler = Arc::new(LocationSampler::new(
            provider,
            permissions,
            cfg.sampling.watch_options(),
        ));
        let processor = Arc::new(QueueProcessor::new(
            queue.clone(),
            delivery.clone(),
            clock.clone(),
            cfg.queue.policy(),
            cfg.queue.process_interval(),
        ));
        Self {
            kv,
            clock,
            sampler,
            delivery,
            queue,
            processor,
            background: None,
            send_retry: cfg.retry.clone(),
        }
    }

    pub fn with_background(mut self, scheduler: Arc<dyn BackgroundTaskScheduler>) -> Self {
        self.background = Some(scheduler);
        self
    }
}

/// Two states: stopped, or tracking one user. The in-memory user id is the
/// authority while the process runs; the persisted copy is written on every
/// transition and read back at startup.
pub struct TrackingSessionController {
    clock: Arc<dyn Clock>,
    sampler: Arc<LocationSampler>,
    delivery: Arc<DeliveryClient>,
    queue: Arc<RetryQueueStore>,
    processor: Arc<QueueProcessor>,
    background: Option<Arc<dyn BackgroundTaskScheduler>>,
    send_retry: RetryConfig,
    state_store: Arc<SessionStateStore>,
    current: Arc<Mutex<Option<String>>>,
    status: Arc<watch::Sender<TrackingStatus>>,
}

impl TrackingSessionController {
    /// Builds the controller without touching persisted state.
    pub fn new(deps: TrackerDeps) -> Self {
        let (status, _) = watch::channel(TrackingStatus {
            queue_size: deps.queue.size(),
            ..TrackingStatus::default()
        });
        Self {
            clock: deps.clock,
            sampler: deps.sampler,
            delivery: deps.delivery,
            queue: deps.queue,
            processor: deps.processor,
            background: deps.background,
            send_retry: deps.send_retry,
            state_store: Arc::new(SessionStateStore::new(deps.kv)),
            current: Arc::new(Mutex::new(None)),
            status: Arc::new(status),
        }
    }

    /// Builds the controller and resumes any session persisted as active.
    pub async fn open(deps: TrackerDeps) -> Self {
        let controller = Self::new(deps);
        controller.resume().await;
        controller
    }

    /// Restarts tracking for the persisted user, if the persisted state says
    /// tracking was active. Returns whether tracking is now running.
    pub async fn resume(&self) -> bool {
        let persisted = self.state_store.load();
        let Some(user_id) = persisted.resumable_user() else {
            return false;
        };
        info!("resuming persisted tracking session for user '{user_id}'");
        match self.start(user_id).await {
            Ok(()) => true,
            Err(e) => {
                warn!("could not resume tracking for user '{user_id}': {e}");
                false
            }
        }
    }

    /// Starts tracking `user_id`, stopping any session for another user first.
    pub async fn start(&self, user_id: &str) -> Result<(), TrackingError> {
        if user_id.is_empty() {
            return Err(TrackingError::EmptyUserId);
        }

        let mut current = self.current.lock().await;
        if let Some(prev) = current.as_deref() {
            if prev == user_id && self.sampler.is_running().await {
                debug!("already tracking user '{user_id}'");
                return Ok(());
            }
            info!("stopping session for user '{prev}' before starting '{user_id}'");
            self.halt().await;
            *current = None;
        }

        // The sampler asks the permission gate before it watches.
        let started = self
            .sampler
            .start_with_end_hook(user_id, self.sample_handler(), self.watch_end_hook(user_id))
            .await;
        if let Err(e) = started {
            self.state_store
                .save(&TrackingSessionState::inactive(self.clock.now_ms()));
            let denied = matches!(e, SamplerError::PermissionDenied);
            let msg = if denied {
                PERMISSION_DENIED_MSG.to_string()
            } else {
                e.to_string()
            };
            self.status.send_modify(|s| {
                s.is_tracking = false;
                s.has_permissions = !denied;
                s.user_id = None;
                s.error = Some(msg);
            });
            return Err(if denied {
                TrackingError::PermissionDenied
            } else {
                e.into()
            });
        }

        self.processor.start();
        if let Some(bg) = &self.background {
            if let Err(e) = bg.register(user_id).await {
                warn!("background task registration failed, continuing in foreground: {e:#}");
            }
        }

        self.state_store
            .save(&TrackingSessionState::active(user_id, self.clock.now_ms()));
        *current = Some(user_id.to_string());

        let queue_size = self.queue.size();
        self.status.send_modify(|s| {
            s.is_tracking = true;
            s.has_permissions = true;
            s.user_id = Some(user_id.to_string());
            s.error = None;
            s.queue_size = queue_size;
        });
        info!("tracking started for user '{user_id}'");
        Ok(())
    }

    /// Stops tracking and persists the stopped state. Idempotent.
    pub async fn stop(&self) {
        let mut current = self.current.lock().await;
        self.halt().await;
        if let Some(user_id) = current.take() {
            info!("tracking stopped for user '{user_id}'");
        }
        self.state_store
            .save(&TrackingSessionState::inactive(self.clock.now_ms()));
        self.status.send_modify(|s| {
            s.is_tracking = false;
            s.user_id = None;
        });
    }

    /// Takes one sample outside the periodic cadence. False when not
    /// tracking or the provider had no fix.
    pub async fn force_update(&self) -> bool {
        if self.current.lock().await.is_none() {
            return false;
        }
        match self.sampler.force_sample().await {
            Ok(()) => true,
            Err(e) => {
                warn!("forced location update failed: {e}");
                let msg = e.to_string();
                self.status.send_modify(|s| s.error = Some(msg));
                false
            }
        }
    }

    /// Reconciles in-memory state with the persisted state (another process
    /// may have started or stopped tracking), then forces a fresh sample if
    /// tracking.
    pub async fn reconcile(&self) {
        let in_memory = self.current_user().await;
        match self.state_store.try_load() {
            Ok(persisted) => {
                let persisted_user = persisted
                    .as_ref()
                    .and_then(|s| s.resumable_user())
                    .map(str::to_string);
                match (persisted_user, in_memory) {
                    (Some(p), Some(m)) if p == m => {}
                    (Some(p), _) => {
                        info!("persisted session for user '{p}' differs from memory; restarting");
                        if let Err(e) = self.start(&p).await {
                            warn!("could not reconcile session for user '{p}': {e}");
                        }
                    }
                    (None, Some(m)) => {
                        info!("persisted state is inactive; stopping session for user '{m}'");
                        self.stop().await;
                    }
                    (None, None) => {}
                }
            }
            Err(e) => warn!("skipping reconcile, session state unreadable: {e}"),
        }

        if self.current_user().await.is_some() {
            self.force_update().await;
        }
        self.refresh_status().await;
    }

    /// Re-derives the observable status from the controller's state.
    pub async fn refresh_status(&self) {
        let user = self.current_user().await;
        let queue_size = self.queue.size();
        self.status.send_if_modified(|s| {
            let is_tracking = user.is_some();
            if s.is_tracking == is_tracking && s.user_id == user && s.queue_size == queue_size {
                return false;
            }
            s.is_tracking = is_tracking;
            s.user_id = user;
            s.queue_size = queue_size;
            true
        });
    }

    /// Sends `sample` with the configured retry budget and backoff, queueing
    /// it for the processor if every attempt fails. Returns whether it was
    /// delivered.
    pub async fn send_sample(&self, sample: LocationSample) -> bool {
        let delivered = self
            .delivery
            .send_with_retry(
                &sample,
                self.send_retry.send_max_retries,
                self.send_retry.base_delay(),
            )
            .await;
        if delivered {
            return true;
        }
        match self.queue.enqueue(sample) {
            Ok(entry) => debug!("queued sample {} for redelivery", entry.id),
            Err(e) => warn!("could not queue undelivered sample: {e}"),
        }
        let queue_size = self.queue.size();
        self.status.send_modify(|s| s.queue_size = queue_size);
        false
    }

    /// Runs one redelivery pass right away.
    pub async fn flush(&self) -> ProcessReport {
        let report = self.processor.run_once().await;
        let remaining = report.remaining;
        self.status.send_modify(|s| s.queue_size = remaining);
        report
    }

    pub async fn current_user(&self) -> Option<String> {
        self.current.lock().await.clone()
    }

    pub fn is_processing(&self) -> bool {
        self.processor.is_running()
    }

    pub fn status(&self) -> TrackingStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TrackingStatus> {
        self.status.subscribe()
    }

    /// Session layer hook: token used for subsequent deliveries.
    pub fn set_auth_token(&self, token: impl Into<String>) {
        self.delivery.set_auth_token(token);
    }

    pub fn clear_auth_token(&self) {
        self.delivery.clear_auth_token();
    }

    async fn halt(&self) {
        self.sampler.stop().await;
        self.processor.stop();
        if let Some(bg) = &self.background {
            if let Err(e) = bg.unregister().await {
                warn!("background task unregistration failed: {e:#}");
            }
        }
    }

    /// Ends the session when the provider stops delivering fixes, so the
    /// persisted state never claims tracking without a registered watch.
    fn watch_end_hook(&self, user_id: &str) -> WatchEndHandler {
        let user_id = user_id.to_string();
        let current = self.current.clone();
        let processor = self.processor.clone();
        let background = self.background.clone();
        let state_store = self.state_store.clone();
        let clock = self.clock.clone();
        let status = self.status.clone();
        Arc::new(move || -> BoxFuture<'static, ()> {
            let user_id = user_id.clone();
            let current = current.clone();
            let processor = processor.clone();
            let background = background.clone();
            let state_store = state_store.clone();
            let clock = clock.clone();
            let status = status.clone();
            Box::pin(async move {
                let mut current = current.lock().await;
                if current.as_deref() != Some(user_id.as_str()) {
                    return;
                }
                warn!("location updates ended for user '{user_id}'; stopping session");
                processor.stop();
                if let Some(bg) = &background {
                    if let Err(e) = bg.unregister().await {
                        warn!("background task unregistration failed: {e:#}");
                    }
                }
                state_store.save(&TrackingSessionState::inactive(clock.now_ms()));
                *current = None;
                status.send_modify(|s| {
                    s.is_tracking = false;
                    s.user_id = None;
                    s.error = Some(WATCH_ENDED_MSG.to_string());
                });
            })
        })
    }

    fn sample_handler(&self) -> SampleHandler {
        let delivery = self.delivery.clone();
        let queue = self.queue.clone();
        let status = self.status.clone();
        Arc::new(move |sample: LocationSample| -> BoxFuture<'static, ()> {
            let delivery = delivery.clone();
            let queue = queue.clone();
            let status = status.clone();
            Box::pin(async move { handle_sample(&delivery, &queue, &status, sample).await })
        })
    }
}

/// Send now; on failure queue for the processor. Invalid samples are dropped.
async fn handle_sample(
    delivery: &DeliveryClient,
    queue: &RetryQueueStore,
    status: &watch::Sender<TrackingStatus>,
    sample: LocationSample,
) {
    let outcome = delivery.deliver(&sample).await;
    if let DeliveryOutcome::Invalid(_) = outcome {
        return;
    }

    let position = sample.position();
    let observed_at = sample.timestamp;
    let error = match outcome {
        DeliveryOutcome::Delivered => None,
        _ => match queue.enqueue(sample) {
            Ok(entry) => {
                debug!("queued sample {} for redelivery", entry.id);
                Some(DELIVERY_FAILED_MSG.to_string())
            }
            Err(e) => {
                warn!("could not queue undelivered sample: {e}");
                Some(format!("location delivery failed: {e}"))
            }
        },
    };

    let queue_size = queue.size();
    status.send_modify(|s| {
        s.current_location = Some(position);
        s.last_update = Some(observed_at);
        s.error = error;
        s.queue_size = queue_size;
    });
}
