//! Configuration root, algorithm selectors, and vehicle limits.
//!
//! Every component owns a config struct with sensible defaults (see the
//! component modules). `PilotConfig` groups them so a whole stack can be
//! loaded from one JSON document, with missing fields falling back to
//! their defaults.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::pilot_behavior::BehaviorConfig;
use crate::pilot_control::ControllerConfig;
use crate::pilot_planning::PlannerConfig;
use crate::pilot_tracking::TrackerConfig;

/// Errors raised while building or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown {kind}: '{value}'")]
    UnknownVariant { kind: &'static str, value: String },

    #[error("unsupported configuration: {0}")]
    Unsupported(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Reject non-finite or non-positive values.
pub(crate) fn require_positive(name: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!("{name} must be positive, got {value}")))
    }
}

/// Reject non-finite or negative values.
pub(crate) fn require_non_negative(name: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!("{name} must be non-negative, got {value}")))
    }
}

pub(crate) fn require_unit_interval(name: &str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!("{name} must lie in [0, 1], got {value}")))
    }
}

fn normalize_token(s: &str) -> String {
    s.trim().to_ascii_lowercase().replace('_', "-")
}

/// Generates `Display`/`FromStr` for a selector enum from one spelling table.
macro_rules! selector {
    ($ty:ident, $kind:literal, { $($variant:ident => $name:literal $(| $alias:literal)*),+ $(,)? }) => {
        impl $ty {
            pub fn all() -> &'static [$ty] {
                &[$($ty::$variant),+]
            }

            pub fn name(&self) -> &'static str {
                match self {
                    $($ty::$variant => $name),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.name())
            }
        }

        impl FromStr for $ty {
            type Err = ConfigError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match normalize_token(s).as_str() {
                    $($name $(| $alias)* => Ok($ty::$variant),)+
                    _ => Err(ConfigError::UnknownVariant {
                        kind: $kind,
                        value: s.to_string(),
                    }),
                }
            }
        }
    };
}

/// State estimator used by the tracker. Only `Ekf` is implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrackingMethod {
    #[default]
    Ekf,
    Ukf,
    Particle,
}

selector!(TrackingMethod, "tracking method", {
    Ekf => "ekf",
    Ukf => "ukf",
    Particle => "particle",
});

/// Detection-to-track assignment strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AssociationMethod {
    #[default]
    Greedy,
    Hungarian,
}

selector!(AssociationMethod, "association method", {
    Greedy => "greedy" | "nearest-neighbor",
    Hungarian => "hungarian",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PlanningAlgorithm {
    #[default]
    #[serde(rename = "astar")]
    AStar,
    #[serde(rename = "hybrid-astar")]
    HybridAStar,
    #[serde(rename = "rrt")]
    Rrt,
    #[serde(rename = "rrt-star")]
    RrtStar,
    #[serde(rename = "frenet")]
    Frenet,
}

selector!(PlanningAlgorithm, "planning algorithm", {
    AStar => "astar" | "a-star",
    HybridAStar => "hybrid-astar" | "hybrid-a-star" | "hybrid",
    Rrt => "rrt",
    RrtStar => "rrt-star" | "rrtstar",
    Frenet => "frenet",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControlAlgorithm {
    #[default]
    PurePursuit,
    Stanley,
    Pid,
    Lqr,
    Mpc,
}

selector!(ControlAlgorithm, "control algorithm", {
    PurePursuit => "pure-pursuit" | "purepursuit",
    Stanley => "stanley",
    Pid => "pid",
    Lqr => "lqr",
    Mpc => "mpc",
});

/// Physical limits of the ego vehicle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VehicleConfig {
    /// Distance between axles (m)
    pub wheelbase: f64,

    /// Largest road-wheel angle (rad)
    pub max_steering_angle: f64,

    /// m/s²
    pub max_acceleration: f64,

    /// Positive magnitude, m/s²
    pub max_deceleration: f64,

    /// Comfort bound used by the velocity profile (m/s²)
    pub max_lateral_acceleration: f64,

    /// m/s
    pub max_speed: f64,
}

impl Default for VehicleConfig {
    fn default() -> Self {
        Self {
            wheelbase: 2.7,
            max_steering_angle: 0.61,
            max_acceleration: 3.5,
            max_deceleration: 6.0,
            max_lateral_acceleration: 3.0,
            max_speed: 30.0,
        }
    }
}

impl VehicleConfig {
    /// Tightest curvature the steering can produce (1/m).
    pub fn max_curvature(&self) -> f64 {
        self.max_steering_angle.tan() / self.wheelbase
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("vehicle.wheelbase", self.wheelbase)?;
        require_positive("vehicle.max_steering_angle", self.max_steering_angle)?;
        if self.max_steering_angle >= std::f64::consts::FRAC_PI_2 {
            return Err(ConfigError::Invalid(
                "vehicle.max_steering_angle must be below π/2".to_string(),
            ));
        }
        require_positive("vehicle.max_acceleration", self.max_acceleration)?;
        require_positive("vehicle.max_deceleration", self.max_deceleration)?;
        require_positive("vehicle.max_lateral_acceleration", self.max_lateral_acceleration)?;
        require_positive("vehicle.max_speed", self.max_speed)
    }
}

/// Configuration for the whole decision-and-control stack.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PilotConfig {
    pub vehicle: VehicleConfig,
    pub tracker: TrackerConfig,
    pub planner: PlannerConfig,
    pub behavior: BehaviorConfig,
    pub controller: ControllerConfig,
    pub runtime: RuntimeConfig,
}

/// Scheduling knobs for the per-tick pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Re-plan at least every N ticks even if nothing changed
    pub replan_interval_ticks: u32,

    /// Distance ahead of the ego the planning goal is placed (m)
    pub planning_horizon: f64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            replan_interval_ticks: 5,
            planning_horizon: 40.0,
        }
    }
}

impl PilotConfig {
    /// Parse a (possibly partial) JSON document and validate it.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: PilotConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.vehicle.validate()?;
        self.tracker.validate()?;
        self.planner.validate()?;
        self.behavior.validate()?;
        self.controller.validate()?;
        if self.runtime.replan_interval_ticks == 0 {
            return Err(ConfigError::Invalid(
                "runtime.replan_interval_ticks must be at least 1".to_string(),
            ));
        }
        require_positive("runtime.planning_horizon", self.runtime.planning_horizon)
    }
}
