//! Core environment context trait for Pilot components.

use std::time::Duration;

/// The central interface for time.
///
/// This trait abstracts the "real world" clock so that the tracker, planner
/// and runtime can run in both production and simulation.
///
/// # Implementations
///
/// - **Production**: `SystemContext` - wraps `std::time::Instant`
/// - **Simulation**: `pilot_sim::SimContext` - manually advanced virtual clock
///
/// The trait is object safe; planners hold it as `Arc<dyn PilotContext>`.
pub trait PilotContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    ///
    /// In simulation, this is the virtual clock time.
    fn now(&self) -> Duration;

    /// Returns the context's seed (for logging/debugging).
    ///
    /// In production, returns 0 (not seeded).
    /// In simulation, returns the master seed.
    fn seed(&self) -> u64;

    /// Convenience: `now()` as fractional seconds.
    fn now_secs(&self) -> f64 {
        self.now().as_secs_f64()
    }
}
