//! Location permission acquisition.

use async_trait::async_trait;
use tracing::{info, warn};

/// Platform permission primitives. Denial is a normal answer, not an error.
#[async_trait]
pub trait PermissionGate: Send + Sync {
    async fn request_foreground(&self) -> bool;

    /// Whether the platform asks for background location separately.
    fn requires_background_grant(&self) -> bool {
        false
    }

    async fn request_background(&self) -> bool {
        true
    }
}

/// Requests foreground permission and, where the platform needs it, the
/// background grant too. True only when everything was granted.
pub async fn request_permissions(gate: &dyn PermissionGate) -> bool {
    if !gate.request_foreground().await {
        warn!("foreground location permission denied");
        return false;
    }
    if gate.requires_background_grant() && !gate.request_background().await {
        warn!("background location permission denied");
        return false;
    }
    info!("location permissions granted");
    true
}

/// Answers from configuration instead of an OS dialog.
#[derive(Debug, Clone, Copy)]
pub struct StaticPermissionGate {
    foreground: bool,
    background: Option<bool>,
}

impl StaticPermissionGate {
    /// Grants everything; no separate background grant.
    pub fn granted() -> Self {
        Self {
            foreground: true,
            background: None,
        }
    }

    pub fn denied() -> Self {
        Self {
            foreground: false,
            background: None,
        }
    }

    /// Grants foreground; `background` answers the separate background request.
    pub fn with_background(background: bool) -> Self {
        Self {
            foreground: true,
            background: Some(background),
        }
    }
}

#[async_trait]
impl PermissionGate for StaticPermissionGate {
    async fn request_foreground(&self) -> bool {
        self.foreground
    }

    fn requires_background_grant(&self) -> bool {
        self.background.is_some()
    }

    async fn request_background(&self) -> bool {
        self.background.unwrap_or(true)
    }
}
