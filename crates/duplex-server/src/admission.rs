//! Capacity admission: a bounded pool of connection slots.
//!
//! A slot is acquired during the handshake with a bounded wait and held by
//! the connection for its whole life. [`AdmissionSlot`] releases on drop, and
//! an explicit [`AdmissionSlot::release`] makes the drop a no-op, so every
//! exit path returns the slot exactly once.

use std::sync::Arc;
use std::time::Duration;

use duplex_core::CapacitySnapshot;
use metrics::gauge;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::metrics::ADMISSION_SLOTS_ACTIVE;

/// Counted slot pool with `active <= max`.
#[derive(Debug)]
pub struct AdmissionController {
    semaphore: Arc<Semaphore>,
    max: usize,
}

impl AdmissionController {
    /// Create a pool with `max` slots.
    pub fn new(max: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max)),
            max,
        }
    }

    /// Acquire a slot, waiting at most `timeout`.
    ///
    /// On timeout returns the snapshot observed at that moment; no slot is held.
    pub async fn acquire(&self, timeout: Duration) -> Result<AdmissionSlot, CapacitySnapshot> {
        if timeout.is_zero() {
            return self.try_acquire().ok_or_else(|| self.snapshot());
        }
        let acquire = Arc::clone(&self.semaphore).acquire_owned();
        match tokio::time::timeout(timeout, acquire).await {
            Ok(Ok(permit)) => Ok(self.slot(permit)),
            Ok(Err(_)) | Err(_) => Err(self.snapshot()),
        }
    }

    /// Acquire a slot without waiting.
    pub fn try_acquire(&self) -> Option<AdmissionSlot> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .ok()
            .map(|permit| self.slot(permit))
    }

    /// Current `active`/`max`/`available`.
    pub fn snapshot(&self) -> CapacitySnapshot {
        let available = self.semaphore.available_permits().min(self.max);
        CapacitySnapshot::new(self.max - available, self.max)
    }

    /// Configured slot count.
    pub fn max(&self) -> usize {
        self.max
    }

    fn slot(&self, permit: OwnedSemaphorePermit) -> AdmissionSlot {
        let snapshot = self.snapshot();
        gauge!(ADMISSION_SLOTS_ACTIVE).set(snapshot.active as f64);
        debug!(active = snapshot.active, max = snapshot.max, "admission slot acquired");
        AdmissionSlot {
            permit: Some(permit),
            semaphore: Arc::clone(&self.semaphore),
            max: self.max,
        }
    }
}

/// A held admission slot.
#[derive(Debug)]
pub struct AdmissionSlot {
    permit: Option<OwnedSemaphorePermit>,
    semaphore: Arc<Semaphore>,
    max: usize,
}

impl AdmissionSlot {
    /// Return the slot to the pool. Returns `false` if it was already released.
    pub fn release(&mut self) -> bool {
        let Some(permit) = self.permit.take() else {
            return false;
        };
        drop(permit);
        let available = self.semaphore.available_permits().min(self.max);
        gauge!(ADMISSION_SLOTS_ACTIVE).set((self.max - available) as f64);
        debug!(active = self.max - available, max = self.max, "admission slot released");
        true
    }

    /// Whether the slot is still held.
    pub fn is_held(&self) -> bool {
        self.permit.is_some()
    }
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        let _ = self.release();
    }
}
