//! Pilot Deterministic Closed-Loop Simulation Harness
//!
//! This crate provides the "Matrix" - a controlled road world in which the
//! full Pilot stack drives deterministically.
//!
//! # Core Principle: One Seed, One Run
//!
//! All sources of non-determinism are intercepted and controlled:
//! - **Time**: Virtual clock advances only when the runner steps physics
//! - **Noise**: Sensor noise and dropouts come from a ChaCha8 stream
//! - **Randomness**: All entropy derived from a single 64-bit seed
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     ScenarioRunner                          │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │ SimContext (Virtual Clock, master seed)               │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! │       │                                                     │
//! │  ┌────▼──────────────────────────────┐                      │
//! │  │  PilotAgent                        │                      │
//! │  │  tracker → planner → behavior →    │                      │
//! │  │  controller                        │                      │
//! │  └────▲──────────────────────┬────────┘                      │
//! │       │ sensor batches, map  │ control command              │
//! │  ┌────┴──────────────────────▼────────┐                      │
//! │  │            Oracle                   │                      │
//! │  │  (Ground Truth Physics + Sensors)   │                      │
//! │  └─────────────────────────────────────┘                      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use pilot_sim::{ScenarioId, ScenarioRunner};
//!
//! let result = ScenarioRunner::new(42).run(ScenarioId::LeadBrake)?;
//! assert!(result.passed);
//! ```

mod context;
mod error;
mod oracle;
pub mod runner;
pub mod scenarios;

pub use context::SimContext;
pub use error::SimError;
pub use oracle::{
    box_clearance, class_dimensions, Actor, ActorScript, EgoVehicle, LightScript, Oracle, Road, SensorModel,
    EGO_DIMENSIONS,
};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use scenarios::{ActorSpec, Scenario, ScenarioId};
