//! Shared "current device code" value
//!
//! Written once by the bootstrap step after device authorization completes,
//! read by the telemetry publisher on every tick. Cloning the handle shares
//! the same slot.

use std::sync::Arc;

use tokio::sync::RwLock;

/// Reference-counted, lock-guarded device code slot
#[derive(Debug, Clone, Default)]
pub struct DeviceCode {
    inner: Arc<RwLock<Option<String>>>,
}

impl DeviceCode {
    /// Create an empty slot
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a slot holding an initial code
    #[must_use]
    pub fn with_code(code: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Some(code.into()))),
        }
    }

    /// Replace the current code
    pub async fn set(&self, code: impl Into<String>) {
        *self.inner.write().await = Some(code.into());
    }

    /// Clear the current code
    pub async fn clear(&self) {
        *self.inner.write().await = None;
    }

    /// Snapshot of the current code
    pub async fn get(&self) -> Option<String> {
        self.inner.read().await.clone()
    }
}
