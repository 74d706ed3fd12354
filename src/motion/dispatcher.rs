// src/motion/dispatcher.rs - Motion dispatch: linear, arc, dwell, probe,
// and the automated pen-change sequence
//
// Every public operation here is all-or-nothing from the caller's view:
// targets are validated before anything is queued, and wait loops re-check
// the abort flag on every iteration.

use std::f32::consts::PI;
use std::sync::Arc;
use std::time::Duration;

use crate::config::MachineConfig;
use crate::persistence::ToolTable;
use crate::system::{AlarmKind, MachineState, ProbePin, SystemState};
use crate::{Position, AXIS_NAMES, X_AXIS, Y_AXIS, Z_AXIS};

use super::kinematics::Kinematics;
use super::planner::Planner;
use super::{MotionError, MotionRequest};

/// Arcs whose angular travel is below this are treated as full circles.
const ARC_ANGULAR_TRAVEL_EPSILON: f32 = 5e-7;

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub succeeded: bool,
    /// Realtime position when the cycle ended; the contact point on success.
    pub contact: Position,
}

pub struct MotionDispatcher {
    config: Arc<MachineConfig>,
    system: Arc<SystemState>,
    planner: Box<dyn Planner>,
    kinematics: Box<dyn Kinematics>,
    tools: Box<dyn ToolTable>,
    probe: Box<dyn ProbePin>,
    loaded_tool: u8,
}

impl MotionDispatcher {
    pub fn new(
        config: Arc<MachineConfig>,
        system: Arc<SystemState>,
        planner: Box<dyn Planner>,
        kinematics: Box<dyn Kinematics>,
        tools: Box<dyn ToolTable>,
        probe: Box<dyn ProbePin>,
    ) -> Self {
        MotionDispatcher {
            config,
            system,
            planner,
            kinematics,
            tools,
            probe,
            loaded_tool: 0,
        }
    }

    pub fn loaded_tool(&self) -> u8 {
        self.loaded_tool
    }

    pub fn planner_position(&self) -> Position {
        self.planner.position()
    }

    /// Block until everything queued has been executed.
    pub async fn synchronize(&mut self) -> Result<(), MotionError> {
        if self.planner.synchronize(&self.system).await {
            Ok(())
        } else {
            Err(MotionError::Reset)
        }
    }

    /// Queue one straight move. Returns `Ok(false)` when the move was
    /// dropped without error (check mode, cancelled jog); `position` is
    /// advanced only on `Ok(true)`.
    pub async fn linear_move(
        &mut self,
        target: Position,
        request: &MotionRequest,
        position: &mut Position,
    ) -> Result<bool, MotionError> {
        if !request.limits_checked {
            if let Some((axis, coord)) = self.kinematics.out_of_bounds(&target) {
                if request.is_jog {
                    // jog overruns are reported, not alarmed
                    return Err(MotionError::SoftLimit {
                        axis: AXIS_NAMES[axis],
                        target: coord,
                    });
                }
                return Err(self.controlled_stop(axis, coord).await);
            }
        }
        let submitted = self.queue_move(target, request).await?;
        if submitted {
            *position = target;
        }
        Ok(submitted)
    }

    /// Jog entry point: same motion as `linear_move`, but a pending jog
    /// cancellation drops the move and reports completion.
    pub async fn jog_move(
        &mut self,
        target: Position,
        request: &MotionRequest,
        position: &mut Position,
    ) -> Result<bool, MotionError> {
        let mut jog = request.clone();
        jog.is_jog = true;
        if let Some((axis, coord)) = self.kinematics.out_of_bounds(&target) {
            return Err(MotionError::SoftLimit {
                axis: AXIS_NAMES[axis],
                target: coord,
            });
        }
        jog.limits_checked = true;
        self.linear_move(target, &jog, position).await
    }

    async fn queue_move(
        &mut self,
        target: Position,
        request: &MotionRequest,
    ) -> Result<bool, MotionError> {
        if self.system.state() == MachineState::CheckMode {
            return Ok(false);
        }
        while !self.planner.buffer_has_room() {
            if self.system.is_abort() {
                return Err(MotionError::Reset);
            }
            // stand in for the realtime side draining a slot
            self.planner.step();
            tokio::task::yield_now().await;
        }
        if request.is_jog && self.system.take_jog_cancel() {
            tracing::debug!("jog cancelled before it was queued");
            return Ok(false);
        }
        let motor_target = self.kinematics.transform(&target);
        if !self.planner.enqueue(motor_target, request) {
            return Err(MotionError::PlannerRejected);
        }
        Ok(true)
    }

    /// Subdivide an arc into chords within the configured tolerance and
    /// queue them. `offset` is the center offset from the current position
    /// in the active plane; `rotations` adds full turns (P word).
    #[allow(clippy::too_many_arguments)]
    pub async fn arc_move(
        &mut self,
        target: Position,
        request: &mut MotionRequest,
        position: &mut Position,
        offset: Position,
        radius: f32,
        plane: (usize, usize, usize),
        clockwise: bool,
        rotations: u32,
    ) -> Result<(), MotionError> {
        let (axis_0, axis_1, axis_linear) = plane;
        let center = [position[axis_0] + offset[axis_0], position[axis_1] + offset[axis_1]];

        // radius vector from center to current position, and to the target
        let mut r_axis = [-offset[axis_0], -offset[axis_1]];
        let rt_axis = [target[axis_0] - center[0], target[axis_1] - center[1]];

        let mut angular_travel = (r_axis[0] * rt_axis[1] - r_axis[1] * rt_axis[0])
            .atan2(r_axis[0] * rt_axis[0] + r_axis[1] * rt_axis[1]);
        if clockwise {
            if angular_travel >= -ARC_ANGULAR_TRAVEL_EPSILON {
                angular_travel -= 2.0 * PI;
            }
        } else if angular_travel <= ARC_ANGULAR_TRAVEL_EPSILON {
            angular_travel += 2.0 * PI;
        }
        if rotations > 1 {
            let extra = (rotations - 1) as f32 * 2.0 * PI;
            if clockwise {
                angular_travel -= extra;
            } else {
                angular_travel += extra;
            }
        }

        if !request.limits_checked {
            let start_angle = r_axis[1].atan2(r_axis[0]);
            if let Some((axis, coord)) = self.kinematics.invalid_arc(
                &target,
                center,
                radius,
                plane,
                start_angle,
                angular_travel,
            ) {
                return Err(self.controlled_stop(axis, coord).await);
            }
        }

        let tolerance = self.config.arc_tolerance;
        let segments = ((0.5 * angular_travel * radius).abs()
            / (tolerance * (2.0 * radius - tolerance)).sqrt())
        .floor() as u32;

        if segments > 0 {
            // inverse time: the F word covered the whole arc, each segment
            // takes 1/segments of it
            if request.inverse_time {
                request.feed_rate *= segments as f32;
                request.inverse_time = false;
            }
            let theta_per_segment = angular_travel / segments as f32;
            let linear_per_segment = (target[axis_linear] - position[axis_linear]) / segments as f32;

            // third-order small-angle approximation of sin/cos, resynced to
            // an exact computation every arc_correction segments
            let mut cos_t = 2.0 - theta_per_segment * theta_per_segment;
            let sin_t = theta_per_segment * 0.166_666_67 * (cos_t + 4.0);
            cos_t *= 0.5;

            let correction = self.config.arc_correction.max(1);
            let mut count = 0u32;
            let mut chord = *position;
            let segment_request = MotionRequest {
                limits_checked: true,
                ..request.clone()
            };

            for i in 1..segments {
                if count < correction {
                    let r1 = r_axis[0] * sin_t + r_axis[1] * cos_t;
                    r_axis[0] = r_axis[0] * cos_t - r_axis[1] * sin_t;
                    r_axis[1] = r1;
                    count += 1;
                } else {
                    let angle = i as f32 * theta_per_segment;
                    let (sin_i, cos_i) = angle.sin_cos();
                    r_axis[0] = -offset[axis_0] * cos_i + offset[axis_1] * sin_i;
                    r_axis[1] = -offset[axis_0] * sin_i - offset[axis_1] * cos_i;
                    count = 0;
                }
                chord[axis_0] = center[0] + r_axis[0];
                chord[axis_1] = center[1] + r_axis[1];
                chord[axis_linear] += linear_per_segment;
                self.queue_move(chord, &segment_request).await?;
                *position = chord;
                if self.system.is_abort() {
                    return Err(MotionError::Reset);
                }
            }
        }
        // the final chord lands exactly on the programmed target
        let final_request = MotionRequest {
            limits_checked: true,
            ..request.clone()
        };
        if self.queue_move(target, &final_request).await? {
            *position = target;
        }
        Ok(())
    }

    /// G4: drain the queue, then wait out the delay cooperatively.
    pub async fn dwell(&mut self, milliseconds: u32) -> Result<(), MotionError> {
        if milliseconds == 0 || self.system.state() == MachineState::CheckMode {
            return Ok(());
        }
        self.synchronize().await?;
        let deadline = tokio::time::Instant::now() + Duration::from_millis(milliseconds as u64);
        loop {
            if self.system.is_abort() {
                return Err(MotionError::Reset);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(());
            }
            tokio::time::sleep((deadline - now).min(Duration::from_millis(10))).await;
        }
    }

    /// G38.x probe cycle. The straight or oscillating descent is selected
    /// by configuration. On success `position` holds the contact point; on
    /// a tolerated miss (`no_error`) it holds wherever the motion ended.
    pub async fn probe_cycle(
        &mut self,
        target: Position,
        request: &MotionRequest,
        away: bool,
        no_error: bool,
        position: &mut Position,
    ) -> Result<ProbeOutcome, MotionError> {
        if !self.probe.exists() {
            return Err(MotionError::ProbeNotConfigured);
        }
        if self.system.state() == MachineState::CheckMode {
            return Ok(ProbeOutcome {
                succeeded: false,
                contact: *position,
            });
        }
        if !request.limits_checked {
            if let Some((axis, coord)) = self.kinematics.out_of_bounds(&target) {
                return Err(self.controlled_stop(axis, coord).await);
            }
        }
        self.synchronize().await?;
        self.probe.set_direction(away);
        if self.config.probe.check_mode_start && self.probe.tripped() {
            self.system.raise_alarm(AlarmKind::ProbeFailInitial);
            return Err(MotionError::ProbeFailInitial);
        }

        let tripped = if self.config.probe.oscillate {
            self.oscillating_descent(target, request, position).await?
        } else {
            self.queue_move(target, request).await?;
            self.poll_until_trip().await?
        };

        let contact = self.planner.position();
        self.planner.reset();
        *position = contact;

        if !tripped && !no_error {
            self.system.raise_alarm(AlarmKind::ProbeFailContact);
            return Err(MotionError::ProbeFailContact);
        }
        Ok(ProbeOutcome {
            succeeded: tripped,
            contact,
        })
    }

    /// Zig-zag descent for locating a pen tip: Z steps down while X swings
    /// either side of the start position.
    async fn oscillating_descent(
        &mut self,
        target: Position,
        request: &MotionRequest,
        position: &mut Position,
    ) -> Result<bool, MotionError> {
        let steps = self.config.probe.oscillation_steps.max(1);
        let amplitude = self.config.probe.oscillation_amplitude;
        let start = *position;
        let z_per_step = (target[Z_AXIS] - start[Z_AXIS]) / steps as f32;
        let swing_request = MotionRequest {
            feed_rate: self.config.probe.oscillation_feed,
            ..request.clone()
        };
        for i in 1..=steps {
            let mut swing = start;
            swing[X_AXIS] = start[X_AXIS] + if i % 2 == 1 { amplitude } else { -amplitude };
            swing[Z_AXIS] = start[Z_AXIS] + z_per_step * i as f32;
            self.queue_move(swing, &swing_request).await?;
            *position = swing;
            if self.poll_until_trip().await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn poll_until_trip(&mut self) -> Result<bool, MotionError> {
        loop {
            if self.system.is_abort() {
                return Err(MotionError::Reset);
            }
            if self.probe.tripped() {
                return Ok(true);
            }
            let drained = self.planner.step();
            tokio::task::yield_now().await;
            if self.probe.tripped() {
                return Ok(true);
            }
            if drained {
                return Ok(false);
            }
        }
    }

    /// M6: park the current pen and fetch the requested one. The travel
    /// envelope switches to the dock span while the sequence runs and is
    /// restored no matter how it ends.
    pub async fn change_tool(
        &mut self,
        next_tool: u8,
        line_number: i32,
        position: &mut Position,
    ) -> Result<(), MotionError> {
        self.synchronize().await?;
        self.system.set_tool_change_active(true);
        let result = self.run_tool_change(next_tool, line_number, position).await;
        self.system.set_tool_change_active(false);
        if result.is_ok() {
            self.synchronize().await?;
        }
        result
    }

    async fn run_tool_change(
        &mut self,
        next_tool: u8,
        line_number: i32,
        position: &mut Position,
    ) -> Result<(), MotionError> {
        let change = self.config.tool_change.clone();
        // resolve the target dock before anything moves; an unknown tool
        // must not strand the loaded pen
        if next_tool != 0 {
            self.tools.dock_position(next_tool)?;
        }
        let mut request = MotionRequest {
            feed_rate: change.default_feed,
            no_feed_override: true,
            is_system_motion: true,
            limits_checked: true,
            line_number,
            ..MotionRequest::default()
        };

        // everything clears the table at safe height first
        let mut target = *position;
        target[Z_AXIS] = change.safe_z;
        self.waypoint(target, &request, position).await?;

        let loaded = self.loaded_tool;
        if loaded != 0 && (next_tool == loaded || next_tool == 0) {
            self.drop_tool(loaded, &mut request, position).await?;
        } else if loaded == 0 && next_tool != 0 {
            self.pick_tool(next_tool, &mut request, position).await?;
        } else if loaded != 0 && next_tool != 0 {
            self.drop_tool(loaded, &mut request, position).await?;
            request.feed_rate = change.approach_feed;
            self.pick_tool(next_tool, &mut request, position).await?;
        }

        tracing::info!(tool = self.loaded_tool, "tool change complete");
        Ok(())
    }

    /// Park `tool` in its dock. The loaded-tool record flips to "empty"
    /// only once the pen is fully released.
    async fn drop_tool(
        &mut self,
        tool: u8,
        request: &mut MotionRequest,
        position: &mut Position,
    ) -> Result<(), MotionError> {
        let change = self.config.tool_change.clone();
        let dock = self.tools.dock_position(tool)?;
        tracing::debug!(tool, "docking pen");
        request.feed_rate = change.approach_feed;
        self.synchronize().await?;

        let mut target = *position;
        target[Z_AXIS] = change.raised_z;
        self.waypoint(target, request, position).await?;
        target[Y_AXIS] = dock[Y_AXIS];
        self.waypoint(target, request, position).await?;
        target[X_AXIS] = change.entry_x;
        self.waypoint(target, request, position).await?;

        request.feed_rate = change.precise_feed;
        target[X_AXIS] = change.seat_x;
        self.waypoint(target, request, position).await?;
        target[Z_AXIS] = dock[Z_AXIS];
        self.waypoint(target, request, position).await?;
        target[X_AXIS] = dock[X_AXIS];
        self.waypoint(target, request, position).await?;
        target[Z_AXIS] = change.raised_z;
        self.waypoint(target, request, position).await?;
        target[X_AXIS] = change.entry_x;
        self.waypoint(target, request, position).await?;

        self.synchronize().await?;
        self.loaded_tool = 0;
        self.tools.set_occupied(tool, true);
        Ok(())
    }

    /// Collect `tool` from its dock; mirror of `drop_tool`.
    async fn pick_tool(
        &mut self,
        tool: u8,
        request: &mut MotionRequest,
        position: &mut Position,
    ) -> Result<(), MotionError> {
        let change = self.config.tool_change.clone();
        let dock = self.tools.dock_position(tool)?;
        tracing::debug!(tool, "collecting pen");
        request.feed_rate = change.approach_feed;
        self.synchronize().await?;

        let mut target = *position;
        target[Z_AXIS] = change.raised_z;
        self.waypoint(target, request, position).await?;
        target[Y_AXIS] = dock[Y_AXIS];
        self.waypoint(target, request, position).await?;
        target[X_AXIS] = change.entry_x;
        self.waypoint(target, request, position).await?;

        request.feed_rate = change.precise_feed;
        target[X_AXIS] = dock[X_AXIS];
        self.waypoint(target, request, position).await?;
        target[Z_AXIS] = dock[Z_AXIS];
        self.waypoint(target, request, position).await?;
        target[X_AXIS] = change.seat_x;
        self.waypoint(target, request, position).await?;
        target[Z_AXIS] = change.safe_z;
        self.waypoint(target, request, position).await?;
        target[X_AXIS] = change.entry_x;
        self.waypoint(target, request, position).await?;

        self.synchronize().await?;
        self.loaded_tool = tool;
        self.tools.set_occupied(tool, false);
        Ok(())
    }

    async fn waypoint(
        &mut self,
        target: Position,
        request: &MotionRequest,
        position: &mut Position,
    ) -> Result<(), MotionError> {
        self.linear_move(target, request, position).await?;
        Ok(())
    }

    /// Override changes take effect on queued motion, so the queue must
    /// drain first.
    pub async fn override_update(&mut self) -> Result<(), MotionError> {
        self.synchronize().await
    }

    /// Soft-limit controlled stop: finish what is in flight, hold until the
    /// machine is stationary, then alarm.
    async fn controlled_stop(&mut self, axis: usize, coord: f32) -> MotionError {
        tracing::warn!(
            axis = %AXIS_NAMES[axis],
            target = coord,
            "target outside travel, stopping"
        );
        if !self.planner.synchronize(&self.system).await {
            return MotionError::Reset;
        }
        if self.system.state() == MachineState::Cycle {
            self.system.request_feed_hold();
            loop {
                if self.system.is_abort() {
                    return MotionError::Reset;
                }
                if self.planner.step() {
                    break;
                }
                tokio::task::yield_now().await;
            }
            self.system.clear_feed_hold();
        }
        self.system.raise_alarm(AlarmKind::SoftLimit);
        MotionError::SoftLimit {
            axis: AXIS_NAMES[axis],
            target: coord,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motion::kinematics::CartesianKinematics;
    use crate::motion::limits::LimitsGuard;
    use crate::motion::planner::SimPlanner;
    use crate::persistence::{StoreError, ToolDock, ToolRack};
    use crate::system::SimProbe;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn dispatcher(config: MachineConfig) -> (MotionDispatcher, SimPlanner, Arc<SystemState>) {
        let config = Arc::new(config);
        let system = Arc::new(SystemState::new());
        let planner = SimPlanner::new(16);
        let kinematics =
            CartesianKinematics::new(LimitsGuard::new(config.clone(), system.clone()));
        let mut rack = ToolRack::new();
        rack.insert(
            1,
            ToolDock {
                x: -460.0,
                y: -100.0,
                z: -50.0,
                occupied: true,
            },
        );
        rack.insert(
            2,
            ToolDock {
                x: -460.0,
                y: -150.0,
                z: -50.0,
                occupied: true,
            },
        );
        let probe = SimProbe::new(config.probe.configured);
        let d = MotionDispatcher::new(
            config,
            system.clone(),
            Box::new(planner.clone()),
            Box::new(kinematics),
            Box::new(rack),
            Box::new(probe),
        );
        (d, planner, system)
    }

    #[tokio::test]
    async fn in_bounds_move_is_queued() {
        let (mut d, planner, _) = dispatcher(MachineConfig::default());
        let mut position = [0.0f32; 3];
        let request = MotionRequest {
            feed_rate: 500.0,
            ..MotionRequest::default()
        };
        let submitted = d
            .linear_move([-10.0, -10.0, 0.0], &request, &mut position)
            .await
            .unwrap();
        assert!(submitted);
        assert_eq!(position, [-10.0, -10.0, 0.0]);
        assert_eq!(planner.history().len(), 1);
        assert_eq!(planner.history()[0].feed_rate, 500.0);
    }

    #[tokio::test]
    async fn out_of_bounds_move_alarms() {
        let (mut d, planner, system) = dispatcher(MachineConfig::default());
        let mut position = [0.0f32; 3];
        let request = MotionRequest::default();
        let err = d
            .linear_move([10.0, 0.0, 0.0], &request, &mut position)
            .await
            .unwrap_err();
        assert!(matches!(err, MotionError::SoftLimit { axis: 'X', .. }));
        assert_eq!(system.alarm(), Some(AlarmKind::SoftLimit));
        assert!(planner.history().is_empty());
        assert_eq!(position, [0.0, 0.0, 0.0]);
    }

    #[tokio::test]
    async fn jog_soft_limit_does_not_alarm() {
        let (mut d, _, system) = dispatcher(MachineConfig::default());
        let mut position = [0.0f32; 3];
        let request = MotionRequest {
            feed_rate: 1000.0,
            ..MotionRequest::default()
        };
        let err = d
            .jog_move([10.0, 0.0, 0.0], &request, &mut position)
            .await
            .unwrap_err();
        assert!(matches!(err, MotionError::SoftLimit { .. }));
        assert_eq!(system.alarm(), None);
    }

    #[tokio::test]
    async fn cancelled_jog_is_dropped_quietly() {
        let (mut d, planner, system) = dispatcher(MachineConfig::default());
        let mut position = [0.0f32; 3];
        system.request_jog_cancel();
        let request = MotionRequest {
            feed_rate: 1000.0,
            ..MotionRequest::default()
        };
        let submitted = d
            .jog_move([-10.0, 0.0, 0.0], &request, &mut position)
            .await
            .unwrap();
        assert!(!submitted);
        assert!(planner.history().is_empty());
        assert_eq!(position, [0.0, 0.0, 0.0]);
    }

    #[tokio::test]
    async fn arc_segments_stay_on_radius() {
        let (mut d, planner, _) = dispatcher(MachineConfig::default());
        // CW half circle from (0,0) to (-10,0), center (-5,0), radius 5,
        // dipping through (-5,-5)
        let mut position = [0.0f32; 3];
        let mut request = MotionRequest {
            feed_rate: 200.0,
            ..MotionRequest::default()
        };
        d.arc_move(
            [-10.0, 0.0, 0.0],
            &mut request,
            &mut position,
            [-5.0, 0.0, 0.0],
            5.0,
            (X_AXIS, Y_AXIS, Z_AXIS),
            true,
            0,
        )
        .await
        .unwrap();
        let history = planner.history();
        assert!(history.len() > 4, "arc was not subdivided: {}", history.len());
        for segment in &history {
            let dx = segment.target[X_AXIS] + 5.0;
            let dy = segment.target[Y_AXIS];
            let radius = (dx * dx + dy * dy).sqrt();
            assert!((radius - 5.0).abs() < 0.01, "chord left the arc: {radius}");
        }
        let last = &history[history.len() - 1];
        assert_eq!(last.target, [-10.0, 0.0, 0.0]);
        assert_eq!(position, [-10.0, 0.0, 0.0]);
    }

    #[tokio::test]
    async fn inverse_time_feed_scales_with_segments() {
        let (mut d, planner, _) = dispatcher(MachineConfig::default());
        let mut position = [0.0f32; 3];
        let mut request = MotionRequest {
            feed_rate: 2.0,
            inverse_time: true,
            ..MotionRequest::default()
        };
        d.arc_move(
            [-10.0, 0.0, 0.0],
            &mut request,
            &mut position,
            [-5.0, 0.0, 0.0],
            5.0,
            (X_AXIS, Y_AXIS, Z_AXIS),
            true,
            0,
        )
        .await
        .unwrap();
        let history = planner.history();
        let segments = history.len() as f32;
        assert!(!request.inverse_time);
        // every segment carries the multiplied feed
        assert!((history[0].feed_rate - 2.0 * segments).abs() < 1.0);
    }

    #[tokio::test]
    async fn probe_requires_configuration() {
        let (mut d, _, _) = dispatcher(MachineConfig::default());
        let mut position = [0.0f32; 3];
        let request = MotionRequest::default();
        let err = d
            .probe_cycle([0.0, 0.0, -10.0], &request, false, false, &mut position)
            .await
            .unwrap_err();
        assert_eq!(err, MotionError::ProbeNotConfigured);
    }

    #[tokio::test]
    async fn tool_swap_updates_loaded_tool_and_occupancy() {
        let (mut d, planner, _) = dispatcher(MachineConfig::default());
        let mut position = [0.0f32; 3];
        d.change_tool(1, 0, &mut position).await.unwrap();
        assert_eq!(d.loaded_tool(), 1);
        d.change_tool(2, 0, &mut position).await.unwrap();
        assert_eq!(d.loaded_tool(), 2);
        // drop 1 then pick 2: dock Y of both pens appears in the sequence
        let ys: Vec<f32> = planner.history().iter().map(|m| m.target[Y_AXIS]).collect();
        assert!(ys.contains(&-100.0));
        assert!(ys.contains(&-150.0));
        d.change_tool(0, 0, &mut position).await.unwrap();
        assert_eq!(d.loaded_tool(), 0);
    }

    #[tokio::test]
    async fn tool_change_with_unknown_dock_fails_cleanly() {
        let (mut d, _, system) = dispatcher(MachineConfig::default());
        let mut position = [0.0f32; 3];
        let err = d.change_tool(5, 0, &mut position).await.unwrap_err();
        assert_eq!(err, MotionError::UnknownTool(5));
        assert!(!system.tool_change_active());
        assert_eq!(d.loaded_tool(), 0);
    }

    /// Rack whose dock lookup for one tool fails once its allowance runs out.
    #[derive(Clone)]
    struct FlakyRack {
        docks: Arc<Mutex<ToolRack>>,
        failing_tool: u8,
        lookups_left: Arc<AtomicU32>,
    }

    impl ToolTable for FlakyRack {
        fn dock_position(&self, tool: u8) -> Result<Position, StoreError> {
            if tool == self.failing_tool {
                let left = self.lookups_left.load(Ordering::SeqCst);
                if left == 0 {
                    return Err(StoreError::UnknownTool(tool));
                }
                self.lookups_left.store(left - 1, Ordering::SeqCst);
            }
            self.docks.lock().unwrap().dock_position(tool)
        }

        fn set_occupied(&mut self, tool: u8, occupied: bool) {
            self.docks.lock().unwrap().set_occupied(tool, occupied);
        }

        fn is_occupied(&self, tool: u8) -> bool {
            self.docks.lock().unwrap().is_occupied(tool)
        }
    }

    #[tokio::test]
    async fn pick_failure_after_a_drop_leaves_the_pen_docked() {
        let config = Arc::new(MachineConfig::default());
        let system = Arc::new(SystemState::new());
        let planner = SimPlanner::new(16);
        let kinematics =
            CartesianKinematics::new(LimitsGuard::new(config.clone(), system.clone()));
        let mut rack = ToolRack::new();
        rack.insert(1, ToolDock { x: -460.0, y: -100.0, z: -50.0, occupied: true });
        rack.insert(2, ToolDock { x: -460.0, y: -150.0, z: -50.0, occupied: true });
        // tool 2 resolves for the up-front check, then vanishes before the pick
        let flaky = FlakyRack {
            docks: Arc::new(Mutex::new(rack)),
            failing_tool: 2,
            lookups_left: Arc::new(AtomicU32::new(1)),
        };
        let mut d = MotionDispatcher::new(
            config,
            system.clone(),
            Box::new(planner.clone()),
            Box::new(kinematics),
            Box::new(flaky.clone()),
            Box::new(SimProbe::new(false)),
        );
        let mut position = [0.0f32; 3];
        d.change_tool(1, 0, &mut position).await.unwrap();
        assert_eq!(d.loaded_tool(), 1);
        let err = d.change_tool(2, 0, &mut position).await.unwrap_err();
        assert_eq!(err, MotionError::UnknownTool(2));
        // the first pen was parked before the failure, nothing is stranded
        assert_eq!(d.loaded_tool(), 0);
        assert!(flaky.is_occupied(1));
        assert!(!system.tool_change_active());
    }
}
