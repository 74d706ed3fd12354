// src/motion/limits.rs - Soft travel limits

use std::sync::Arc;

use crate::config::MachineConfig;
use crate::system::{MachineState, SystemState};
use crate::{Position, N_AXIS, X_AXIS, Y_AXIS, Z_AXIS};

/// Validates targets against the homed travel envelope. During a tool change
/// the non-Z span switches to the dock travel allowance; the pen work area
/// optionally tightens X/Y further.
#[derive(Clone)]
pub struct LimitsGuard {
    config: Arc<MachineConfig>,
    system: Arc<SystemState>,
}

impl LimitsGuard {
    pub fn new(config: Arc<MachineConfig>, system: Arc<SystemState>) -> Self {
        LimitsGuard { config, system }
    }

    /// Travel span for `axis`. The homed boundary never moves; a tool change
    /// only substitutes the dock span for the normal one on X and Y.
    fn travel(&self, axis: usize) -> f32 {
        let cfg = self.config.axes.axis(axis);
        if self.system.tool_change_active() && axis != Z_AXIS {
            cfg.tool_change_travel
        } else {
            cfg.max_travel
        }
    }

    /// Most-positive reachable machine coordinate for `axis`.
    pub fn max_position(&self, axis: usize) -> f32 {
        let cfg = self.config.axes.axis(axis);
        if cfg.positive_direction {
            cfg.home_mpos
        } else {
            cfg.home_mpos + self.travel(axis)
        }
    }

    /// Most-negative reachable machine coordinate for `axis`.
    pub fn min_position(&self, axis: usize) -> f32 {
        let cfg = self.config.axes.axis(axis);
        if cfg.positive_direction {
            cfg.home_mpos - self.travel(axis)
        } else {
            cfg.home_mpos
        }
    }

    fn work_area_active(&self) -> bool {
        self.config.work_area.is_some()
            && self.system.work_area_enabled()
            && !self.system.tool_change_active()
            && self.system.state() != MachineState::Cycle
    }

    /// Returns the first violating axis and its target coordinate, or `None`
    /// when the whole target is inside the envelope. Exact boundary values
    /// are accepted.
    pub fn check(&self, target: &Position) -> Option<(usize, f32)> {
        let work_area = if self.work_area_active() {
            self.config.work_area.as_ref()
        } else {
            None
        };
        for axis in 0..N_AXIS {
            let coord = target[axis];
            let (min, max) = match (work_area, axis) {
                (Some(area), X_AXIS) => (area.min_x, area.max_x),
                (Some(area), Y_AXIS) => (area.min_y, area.max_y),
                _ => (self.min_position(axis), self.max_position(axis)),
            };
            if coord > max || coord < min {
                return Some((axis, coord));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkAreaConfig;

    fn guard(config: MachineConfig) -> (LimitsGuard, Arc<SystemState>) {
        let system = Arc::new(SystemState::new());
        (LimitsGuard::new(Arc::new(config), system.clone()), system)
    }

    #[test]
    fn positive_homing_envelope_is_negative_space() {
        let (guard, _) = guard(MachineConfig::default());
        // home_mpos 0, max_travel 300, homed positive
        assert_eq!(guard.max_position(X_AXIS), 0.0);
        assert_eq!(guard.min_position(X_AXIS), -300.0);
        assert_eq!(guard.check(&[-150.0, -150.0, -150.0]), None);
        assert_eq!(guard.check(&[0.0, 0.0, 0.0]), None);
        assert_eq!(guard.check(&[-300.0, 0.0, 0.0]), None);
        assert_eq!(guard.check(&[0.1, 0.0, 0.0]), Some((X_AXIS, 0.1)));
        assert_eq!(guard.check(&[-300.1, 0.0, 0.0]), Some((X_AXIS, -300.1)));
    }

    #[test]
    fn negative_homing_envelope_is_positive_space() {
        let mut config = MachineConfig::default();
        config.axes.x.positive_direction = false;
        let (guard, _) = guard(config);
        assert_eq!(guard.max_position(X_AXIS), 300.0);
        assert_eq!(guard.min_position(X_AXIS), 0.0);
        assert_eq!(guard.check(&[150.0, -10.0, -10.0]), None);
        assert_eq!(guard.check(&[-0.1, -10.0, -10.0]), Some((X_AXIS, -0.1)));
    }

    #[test]
    fn tool_change_swaps_the_travel_span_on_xy() {
        let mut config = MachineConfig::default();
        config.axes.x.tool_change_travel = 500.0;
        let (guard, system) = guard(config);
        assert_eq!(guard.check(&[-400.0, 0.0, 0.0]), Some((X_AXIS, -400.0)));
        system.set_tool_change_active(true);
        // the dock span replaces max_travel; the homed boundary stays put
        assert_eq!(guard.check(&[-400.0, 0.0, 0.0]), None);
        assert_eq!(guard.check(&[100.0, 0.0, 0.0]), Some((X_AXIS, 100.0)));
        // y uses its own dock span, default 200
        assert_eq!(guard.check(&[0.0, -250.0, 0.0]), Some((Y_AXIS, -250.0)));
        // z keeps the homed travel
        assert_eq!(guard.check(&[0.0, 0.0, -250.0]), None);
    }

    #[test]
    fn work_area_tightens_xy_when_enabled_outside_cycle() {
        let mut config = MachineConfig::default();
        config.work_area = Some(WorkAreaConfig {
            enabled: true,
            min_x: -100.0,
            max_x: -10.0,
            min_y: -100.0,
            max_y: -10.0,
        });
        let (guard, system) = guard(config);
        let target = [-5.0, -50.0, 0.0];
        // disabled: only machine travel applies
        assert_eq!(guard.check(&target), None);
        system.set_work_area_enabled(true);
        assert_eq!(guard.check(&target), Some((X_AXIS, -5.0)));
        // mid-cycle the work area is ignored
        system.set_state(MachineState::Cycle);
        assert_eq!(guard.check(&target), None);
        system.set_state(MachineState::Idle);
        // tool change also bypasses it
        system.set_tool_change_active(true);
        assert_eq!(guard.check(&target), None);
    }
}
