//! Production implementation of PilotContext using the system monotonic clock.

use crate::PilotContext;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Production context backed by `Instant`.
///
/// This is the "real" implementation used on the vehicle.
pub struct SystemContext {
    /// Start time for monotonic duration calculations
    start: Instant,
}

impl SystemContext {
    /// Creates a new SystemContext.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Creates an Arc-wrapped context for sharing between components.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for SystemContext {
    fn default() -> Self {
        Self::new()
    }
}

impl PilotContext for SystemContext {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    fn seed(&self) -> u64 {
        // Production is not seeded
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_context_time_is_monotonic() {
        let ctx = SystemContext::new();
        let t1 = ctx.now();
        std::thread::sleep(Duration::from_millis(5));
        let t2 = ctx.now();

        assert!(t2 > t1);
        assert!(t2 - t1 >= Duration::from_millis(5));
    }

    #[test]
    fn test_system_context_seed() {
        let ctx = SystemContext::new();
        assert_eq!(ctx.seed(), 0);
    }
}
