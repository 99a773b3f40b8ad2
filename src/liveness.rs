//! Liveness capabilities for backends
//!
//! The dispatcher asks a backend whether it is eligible on every selection
//! attempt. The answer comes from a [`LivenessCheck`] implementation, so the
//! selection logic stays the same whether backends are probed or not.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// Answers whether a backend may currently receive traffic.
///
/// Implementations must be cheap and non-blocking: `is_alive` is called while
/// the dispatcher scans for the next backend.
pub trait LivenessCheck: Send + Sync + fmt::Debug {
    fn is_alive(&self) -> bool;
}

/// Baseline liveness: the backend is always eligible
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysAlive;

impl LivenessCheck for AlwaysAlive {
    fn is_alive(&self) -> bool {
        true
    }
}

/// Liveness flag written by the active health checker
///
/// Starts out alive so traffic flows before the first probe completes.
#[derive(Debug)]
pub struct ProbedLiveness {
    alive: AtomicBool,
}

impl ProbedLiveness {
    pub fn new() -> Self {
        Self {
            alive: AtomicBool::new(true),
        }
    }

    /// Record the outcome of the latest health transition
    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Release);
    }
}

impl Default for ProbedLiveness {
    fn default() -> Self {
        Self::new()
    }
}

impl LivenessCheck for ProbedLiveness {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_always_alive() {
        assert!(AlwaysAlive.is_alive());
    }

    #[test]
    fn test_probed_liveness_starts_alive() {
        let liveness = ProbedLiveness::new();
        assert!(liveness.is_alive());
    }

    #[test]
    fn test_probed_liveness_transitions() {
        let liveness = ProbedLiveness::default();

        liveness.set_alive(false);
        assert!(!liveness.is_alive());

        liveness.set_alive(true);
        assert!(liveness.is_alive());
    }
}
