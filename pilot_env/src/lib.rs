//! Pilot Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" time abstraction that lets the Pilot
//! decision-and-control core run against either the **wall clock**
//! (production) or a **virtual clock** (deterministic simulation).
//!
//! # Core Concept
//!
//! The core never reads `Instant::now()` directly. Every component that
//! needs time (track aging, planning deadlines) asks a [`PilotContext`].
//! In simulation the clock only moves when the harness advances it, so a
//! run is fully reproducible from its seed.
//!
//! # Example
//!
//! ```
//! use pilot_env::{Deadline, PilotContext, SystemContext};
//! use std::time::Duration;
//!
//! let ctx = SystemContext::new();
//! let deadline = Deadline::within(&ctx, Duration::from_millis(50));
//! assert!(!deadline.expired());
//! ```

mod context;
mod deadline;
mod system_impl;

pub use context::PilotContext;
pub use deadline::Deadline;
pub use system_impl::SystemContext;
