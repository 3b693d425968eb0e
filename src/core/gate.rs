//! Single-flight admission control
//!
//! The model runtime is neither reentrant nor parallel, so at most one
//! inference runs in the whole process. Requests that arrive while it is busy
//! are turned away at once; nothing is queued.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Returned when another inference holds the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("server is busy")]
pub struct GateBusy;

/// Process-wide gate with one permit. Clones share the same permit.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    permits: Arc<Semaphore>,
}

/// Proof of admission. The gate reopens when this is dropped, on every exit path.
#[derive(Debug)]
pub struct InferencePermit {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionGate {
    pub fn new() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(1)),
        }
    }

    /// Take the gate without waiting
    pub fn try_acquire(&self) -> Result<InferencePermit, GateBusy> {
        self.permits
            .clone()
            .try_acquire_owned()
            .map(|permit| InferencePermit { _permit: permit })
            .map_err(|_| GateBusy)
    }

    pub fn is_busy(&self) -> bool {
        self.permits.available_permits() == 0
    }
}

impl Default for AdmissionGate {
    fn default() -> Self {
        Self::new()
    }
}
