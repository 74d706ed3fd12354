// tests/pipeline.rs - End-to-end runs through parser, dispatcher, and planner

use std::sync::Arc;

use plotter_rs::config::MachineConfig;
use plotter_rs::gcode::{GcodeError, GcodeParser};
use plotter_rs::motion::{
    CartesianKinematics, LimitsGuard, MotionDispatcher, MotionError, SimPlanner,
};
use plotter_rs::persistence::{MemoryCoordStore, ToolDock, ToolRack};
use plotter_rs::system::{AlarmKind, EventBus, SimOutputs, SimProbe, SystemState};
use plotter_rs::{X_AXIS, Y_AXIS, Z_AXIS};

fn host(config: MachineConfig) -> (GcodeParser, SimPlanner, Arc<SystemState>) {
    let config = Arc::new(config);
    let system = Arc::new(SystemState::new());
    let planner = SimPlanner::new(32);
    let kinematics = CartesianKinematics::new(LimitsGuard::new(config.clone(), system.clone()));
    let mut rack = ToolRack::new();
    for tool in 1..=3u8 {
        rack.insert(
            tool,
            ToolDock {
                x: -460.0,
                y: -50.0 * tool as f32,
                z: -50.0,
                occupied: true,
            },
        );
    }
    let probe = SimProbe::new(config.probe.configured);
    let dispatcher = MotionDispatcher::new(
        config.clone(),
        system.clone(),
        Box::new(planner.clone()),
        Box::new(kinematics),
        Box::new(rack),
        Box::new(probe),
    );
    let parser = GcodeParser::new(
        config,
        system.clone(),
        dispatcher,
        Box::new(MemoryCoordStore::new()),
        Box::new(SimOutputs::default()),
        EventBus::new(),
    );
    (parser, planner, system)
}

#[tokio::test]
async fn a_small_drawing_program_runs_to_completion() {
    let (mut parser, planner, system) = host(MachineConfig::default());
    let program = [
        "G21 G90 G17",
        "G10 L2 P1 X-200 Y-200",
        "G0 X0 Y0",        // work origin, machine (-200, -200)
        "G1 Z-2 F500",     // pen down
        "G1 X10 F1200",    // edge
        "G3 X20 Y10 J10",  // quarter turn
        "G1 Y20",
        "G0 Z0",
        "M2",
    ];
    for line in program {
        parser.execute_line(line).await.unwrap();
    }
    assert_eq!(system.alarm(), None);
    let history = planner.history();
    // the arc became many short segments
    assert!(history.len() > program.len());
    // final XY in machine coordinates
    let last = history.last().unwrap();
    assert_eq!(last.target[Z_AXIS], 0.0);
    // after M2 the work origin is still G54
    let wpos = parser.state().work_position();
    assert!((wpos[X_AXIS] - 20.0).abs() < 1e-3);
    assert!((wpos[Y_AXIS] - 20.0).abs() < 1e-3);
}

#[tokio::test]
async fn arc_feeds_scale_with_inverse_time() {
    let (mut parser, planner, _) = host(MachineConfig::default());
    parser.execute_line("G93").await.unwrap();
    // whole move in 1/2 minutes: the planner feed carries the segment count
    parser.execute_line("G2 X-10 Y0 I-5 F2").await.unwrap();
    let history = planner.history();
    assert!(history.len() > 1);
    let expected = 2.0 * history.len() as f32;
    assert!((history[0].feed_rate - expected).abs() < 1e-3);
}

#[tokio::test]
async fn soft_limits_stop_a_program_mid_stream() {
    let (mut parser, planner, system) = host(MachineConfig::default());
    parser.execute_line("G1 X-50 F1000").await.unwrap();
    let queued_before = planner.history().len();
    let err = parser.execute_line("G1 X-400 F1000").await.unwrap_err();
    assert!(matches!(err, GcodeError::Motion(MotionError::SoftLimit { .. })));
    assert_eq!(system.alarm(), Some(AlarmKind::SoftLimit));
    assert_eq!(planner.history().len(), queued_before);
    // parser position still matches the machine
    assert_eq!(parser.state().position[X_AXIS], -50.0);
}

#[tokio::test]
async fn pen_swap_moves_through_both_docks() {
    let (mut parser, planner, system) = host(MachineConfig::default());
    parser.execute_line("M6 T1").await.unwrap();
    parser.execute_line("M6 T3").await.unwrap();
    assert_eq!(parser.dispatcher().loaded_tool(), 3);
    assert_eq!(system.alarm(), None);
    let ys: Vec<f32> = planner.history().iter().map(|m| m.target[Y_AXIS]).collect();
    // dock rows for tool 1 and tool 3 both appear in the second change
    assert!(ys.contains(&-50.0));
    assert!(ys.contains(&-150.0));
    // dock excursions go past the normal envelope
    assert!(planner
        .history()
        .iter()
        .any(|m| m.target[X_AXIS] < -400.0));
}

#[tokio::test]
async fn unloading_returns_the_pen() {
    let (mut parser, _, _) = host(MachineConfig::default());
    parser.execute_line("M6 T2").await.unwrap();
    parser.execute_line("M6 T0").await.unwrap();
    assert_eq!(parser.dispatcher().loaded_tool(), 0);
}

#[tokio::test]
async fn jog_cancel_is_not_an_error() {
    let (mut parser, planner, system) = host(MachineConfig::default());
    system.request_jog_cancel();
    parser.execute_line("$J=X-20 F1000").await.unwrap();
    assert!(planner.history().is_empty());
    // the cancel is consumed; the next jog runs
    parser.execute_line("$J=X-20 F1000").await.unwrap();
    assert_eq!(planner.history().len(), 1);
}

#[tokio::test]
async fn dwell_waits_between_moves() {
    let (mut parser, planner, _) = host(MachineConfig::default());
    let started = tokio::time::Instant::now();
    parser.execute_line("G1 X-1 F1000").await.unwrap();
    parser.execute_line("G4 P0.05").await.unwrap();
    parser.execute_line("G1 X-2 F1000").await.unwrap();
    assert!(started.elapsed().as_millis() >= 50);
    assert_eq!(planner.history().len(), 2);
}

#[tokio::test]
async fn work_offsets_round_trip_through_two_systems() {
    let (mut parser, planner, _) = host(MachineConfig::default());
    parser.execute_line("G10 L2 P1 X-100 Y-100").await.unwrap();
    parser.execute_line("G10 L2 P2 X-200 Y-200").await.unwrap();
    parser.execute_line("G54 G0 X10 Y10").await.unwrap();
    parser.execute_line("G55 G0 X10 Y10").await.unwrap();
    let history = planner.history();
    assert_eq!(history[history.len() - 2].target[X_AXIS], -90.0);
    assert_eq!(history[history.len() - 1].target[X_AXIS], -190.0);
}

#[tokio::test]
async fn abort_surfaces_as_reset() {
    let (mut parser, _, system) = host(MachineConfig::default());
    system.request_abort();
    let err = parser.execute_line("G4 P10").await.unwrap_err();
    assert_eq!(err, GcodeError::Reset);
}
