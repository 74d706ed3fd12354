// src/motion/mod.rs - Motion layer: dispatch, limits, planner and
// kinematics ports

pub mod dispatcher;
pub mod kinematics;
pub mod limits;
pub mod planner;

pub use dispatcher::{MotionDispatcher, ProbeOutcome};
pub use kinematics::{CartesianKinematics, Kinematics};
pub use limits::LimitsGuard;
pub use planner::{Planner, QueuedMove, SimPlanner};

use thiserror::Error;

use crate::gcode::modal::CoolantState;
use crate::persistence::StoreError;

/// Per-move context handed to the dispatcher alongside the target.
#[derive(Debug, Clone, Default)]
pub struct MotionRequest {
    /// mm/min, or 1/min while `inverse_time` is set.
    pub feed_rate: f32,
    pub is_rapid: bool,
    pub is_system_motion: bool,
    pub no_feed_override: bool,
    pub inverse_time: bool,
    pub is_jog: bool,
    /// Set when the caller has already validated the target against the
    /// travel envelope (arc segments, tool-change waypoints).
    pub limits_checked: bool,
    pub coolant: CoolantState,
    pub line_number: i32,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MotionError {
    #[error("soft limit: {axis} axis target {target} outside travel")]
    SoftLimit { axis: char, target: f32 },
    #[error("planner rejected the move")]
    PlannerRejected,
    #[error("probe pin is not configured")]
    ProbeNotConfigured,
    #[error("probe already triggered before the cycle started")]
    ProbeFailInitial,
    #[error("probe cycle ended without contact")]
    ProbeFailContact,
    #[error("tool {0} has no configured dock")]
    UnknownTool(u8),
    #[error("tool change failed: {0}")]
    ToolChangeFailed(String),
    #[error("system reset during motion")]
    Reset,
}

impl From<StoreError> for MotionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UnknownTool(tool) => MotionError::UnknownTool(tool),
            other => MotionError::ToolChangeFailed(other.to_string()),
        }
    }
}
