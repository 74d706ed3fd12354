// src/motion/kinematics.rs - Kinematics port

use crate::Position;

use super::limits::LimitsGuard;

/// Machine-geometry port: bounds checking and the cartesian-to-motor
/// transform live behind this trait so the dispatcher stays
/// geometry-agnostic.
pub trait Kinematics: Send {
    /// First axis whose target coordinate falls outside the reachable
    /// envelope, or `None` when the target is fine.
    fn out_of_bounds(&self, target: &Position) -> Option<(usize, f32)>;

    /// Whole-arc bounds check, run once before subdivision so individual
    /// segments can skip per-segment validation. Checks the endpoint plus
    /// every in-plane extreme (cardinal angle) the sweep passes through.
    /// `angular_travel` is signed, CCW positive, from `start_angle`.
    fn invalid_arc(
        &self,
        target: &Position,
        center: [f32; 2],
        radius: f32,
        plane: (usize, usize, usize),
        start_angle: f32,
        angular_travel: f32,
    ) -> Option<(usize, f32)>;

    /// Cartesian target to motor-space target.
    fn transform(&self, target: &Position) -> Position;
}

/// Straight-through cartesian machine gated by the soft-limit guard.
pub struct CartesianKinematics {
    limits: LimitsGuard,
}

impl CartesianKinematics {
    pub fn new(limits: LimitsGuard) -> Self {
        CartesianKinematics { limits }
    }

    pub fn limits(&self) -> &LimitsGuard {
        &self.limits
    }
}

impl Kinematics for CartesianKinematics {
    fn out_of_bounds(&self, target: &Position) -> Option<(usize, f32)> {
        self.limits.check(target)
    }

    fn invalid_arc(
        &self,
        target: &Position,
        center: [f32; 2],
        radius: f32,
        plane: (usize, usize, usize),
        start_angle: f32,
        angular_travel: f32,
    ) -> Option<(usize, f32)> {
        if let Some(violation) = self.limits.check(target) {
            return Some(violation);
        }
        let (axis_0, axis_1, _) = plane;
        let mut extreme = *target;
        for quadrant in 0..4 {
            let cardinal = quadrant as f32 * std::f32::consts::FRAC_PI_2;
            if !sweep_crosses(start_angle, angular_travel, cardinal) {
                continue;
            }
            let (sin, cos) = cardinal.sin_cos();
            extreme[axis_0] = center[0] + radius * cos;
            extreme[axis_1] = center[1] + radius * sin;
            if let Some(violation) = self.limits.check(&extreme) {
                return Some(violation);
            }
            extreme[axis_0] = target[axis_0];
            extreme[axis_1] = target[axis_1];
        }
        None
    }

    fn transform(&self, target: &Position) -> Position {
        *target
    }
}

/// Whether `cardinal` (mod 2pi) lies inside the swept interval starting at
/// `start` with signed CCW `travel`.
fn sweep_crosses(start: f32, travel: f32, cardinal: f32) -> bool {
    const TAU: f32 = 2.0 * std::f32::consts::PI;
    const EPS: f32 = 1e-5;
    for k in -2..=2 {
        let delta = cardinal + k as f32 * TAU - start;
        if travel >= 0.0 {
            if delta >= -EPS && delta <= travel + EPS {
                return true;
            }
        } else if delta <= EPS && delta >= travel - EPS {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MachineConfig;
    use crate::system::SystemState;
    use crate::{X_AXIS, Y_AXIS, Z_AXIS};
    use std::f32::consts::PI;
    use std::sync::Arc;

    fn kinematics() -> CartesianKinematics {
        let config = Arc::new(MachineConfig::default());
        let system = Arc::new(SystemState::new());
        CartesianKinematics::new(LimitsGuard::new(config, system))
    }

    #[test]
    fn identity_transform() {
        let k = kinematics();
        assert_eq!(k.transform(&[-1.0, -2.0, -3.0]), [-1.0, -2.0, -3.0]);
    }

    #[test]
    fn arc_sweep_extremes_are_checked() {
        let k = kinematics();
        let plane = (X_AXIS, Y_AXIS, Z_AXIS);
        // envelope is [-300, 0] on every axis; half circle from (0,0) to
        // (-10,0) around (-5,0): the CW sweep dips to (-5,-5) and is fine
        let cw = k.invalid_arc(&[-10.0, 0.0, 0.0], [-5.0, 0.0], 5.0, plane, 0.0, -PI);
        assert_eq!(cw, None);
        // the CCW sweep crests at (-5,+5), outside the envelope
        let ccw = k.invalid_arc(&[-10.0, 0.0, 0.0], [-5.0, 0.0], 5.0, plane, 0.0, PI);
        assert_eq!(ccw.map(|v| v.0), Some(Y_AXIS));
    }

    #[test]
    fn full_turns_check_every_cardinal() {
        let k = kinematics();
        let plane = (X_AXIS, Y_AXIS, Z_AXIS);
        // two CW turns from/to (0,-10) around (-5,-10) touch x = 0 exactly;
        // boundary values are accepted
        let snug = k.invalid_arc(
            &[0.0, -10.0, 0.0],
            [-5.0, -10.0],
            5.0,
            plane,
            0.0,
            -4.0 * PI,
        );
        assert_eq!(snug, None);
        // a full circle around (-4,-10) with radius 5.5 swings out to
        // x = +1.5 even though the endpoint is in bounds
        let wide = k.invalid_arc(
            &[-4.0, -4.5, 0.0],
            [-4.0, -10.0],
            5.5,
            plane,
            PI,
            -2.0 * PI,
        );
        assert_eq!(wide, Some((X_AXIS, 1.5)));
    }
}
