//! Optional OS background-execution adapter.
//!
//! The pipeline is correct without it: when no scheduler is configured, or
//! registration fails, tracking runs on the in-process timers only.

use async_trait::async_trait;

#[async_trait]
pub trait BackgroundTaskScheduler: Send + Sync {
    /// Asks the platform to keep location updates flowing for `user_id`
    /// while the app is backgrounded.
    async fn register(&self, user_id: &str) -> anyhow::Result<()>;

    async fn unregister(&self) -> anyhow::Result<()>;
}
