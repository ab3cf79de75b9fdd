//! Injection Registry
//!
//! Tracks which containers currently have an injection in flight so that a
//! container is never handed to two relay sessions at once.
//!
//! Membership is held through an [`InjectionClaim`]: the entry exists exactly
//! as long as the claim is alive and is removed when the claim is dropped,
//! whether the attempt failed early, the relay session ended, or the task
//! panicked.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// Thread-safe set of container ids undergoing injection
#[derive(Debug, Clone, Default)]
pub struct InjectionRegistry {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl InjectionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically check-and-insert a container id.
    ///
    /// Returns `None` if the container is already being injected.
    pub fn claim(&self, container_id: &str) -> Option<InjectionClaim> {
        if !self.inner.lock().insert(container_id.to_string()) {
            return None;
        }

        Some(InjectionClaim {
            registry: self.clone(),
            container_id: container_id.to_string(),
            claimed_at: Utc::now(),
        })
    }

    /// Check if a container is currently tracked
    pub fn contains(&self, container_id: &str) -> bool {
        self.inner.lock().contains(container_id)
    }

    /// Number of tracked containers
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Check if no container is tracked
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    fn release(&self, container_id: &str) {
        self.inner.lock().remove(container_id);
    }
}

/// Exclusive right to inject into one container; releases the entry on drop
#[derive(Debug)]
pub struct InjectionClaim {
    registry: InjectionRegistry,
    container_id: String,
    claimed_at: DateTime<Utc>,
}

impl InjectionClaim {
    /// Container this claim covers
    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    /// When the claim was taken
    pub fn claimed_at(&self) -> DateTime<Utc> {
        self.claimed_at
    }
}

impl Drop for InjectionClaim {
    fn drop(&mut self) {
        self.registry.release(&self.container_id);
        tracing::debug!(container_id = %self.container_id, "Injection registry entry released");
    }
}
