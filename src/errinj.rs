//! Error-injection hooks for tests.
//!
//! Injection points are plain atomics compiled into the crate; they
//! cost one relaxed load when disabled. Tests flip them to force rare
//! interleavings that are otherwise timing-dependent.
//!
//! Each index carries its own registry, so a test arming an injection
//! never stalls lookups on unrelated indexes running in parallel.

use std::sync::atomic::{AtomicBool, Ordering};

/// Per-index error-injection registry.
#[derive(Debug, Default)]
pub struct ErrInj {
    point_iter_wait: AtomicBool,
}

impl ErrInj {
    /// When set, a point lookup parks after its disk scan until the
    /// index's mem-list version changes, then the injection disables
    /// itself. Forces the restart path deterministically.
    pub fn point_iter_wait(&self) -> bool {
        self.point_iter_wait.load(Ordering::Acquire)
    }

    /// Arm or disarm [`ErrInj::point_iter_wait`].
    pub fn set_point_iter_wait(&self, armed: bool) {
        self.point_iter_wait.store(armed, Ordering::Release);
    }
}
