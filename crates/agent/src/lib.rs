//! Location tracking pipeline: sampling, delivery, the persisted retry queue
//! and the session controller that ties them together.

pub mod background;
pub mod config;
pub mod delivery;
pub mod kv;
pub mod lifecycle;
pub mod permission;
pub mod processor;
pub mod provider;
pub mod queue;
pub mod sampler;
pub mod session;

pub use background::BackgroundTaskScheduler;
pub use config::TrackerConfig;
pub use delivery::{DeliveryClient, DeliveryOutcome, HttpTransport, LocationTransport, TransportError};
pub use kv::{KeyValueStore, MemoryKvStore, SqliteKvStore, StoreError};
pub use lifecycle::{AppLifecycle, LifecycleSynchronizer};
pub use permission::{request_permissions, PermissionGate, StaticPermissionGate};
pub use processor::{ProcessReport, QueueProcessor};
pub use provider::{FixedProvider, LocationProvider, ProviderError, ReplayProvider, WatchOptions};
pub use queue::{QueueError, RetryQueueStore};
pub use sampler::{LocationSampler, SampleHandler, SamplerError, WatchEndHandler};
pub use session::{
    SessionStateStore, TrackerDeps, TrackingError, TrackingSessionController, TrackingStatus,
};
