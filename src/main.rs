// src/main.rs - Interactive host for the plotter g-code pipeline

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use plotter_rs::config::MachineConfig;
use plotter_rs::gcode::GcodeParser;
use plotter_rs::motion::{CartesianKinematics, LimitsGuard, MotionDispatcher, SimPlanner};
use plotter_rs::persistence::{MemoryCoordStore, ToolRack};
use plotter_rs::system::{EventBus, MachineState, SimProbe, SimOutputs, SystemState};
use plotter_rs::AXIS_NAMES;

#[derive(Parser, Debug)]
#[command(name = "plotter-host", about = "Line-at-a-time g-code host for a pen plotter")]
struct Args {
    /// Machine configuration file
    #[arg(short, long, default_value = "machine.toml")]
    config: PathBuf,

    /// Tool rack definition file
    #[arg(short, long)]
    tools: Option<PathBuf>,

    /// Validate incoming g-code without moving anything
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();

    let config = if args.config.exists() {
        MachineConfig::load(&args.config)?
    } else {
        tracing::warn!(path = %args.config.display(), "config not found, using defaults");
        MachineConfig::default()
    };
    tracing::info!(machine = %config.machine_name, "starting");

    let rack = match &args.tools {
        Some(path) => {
            let rack = ToolRack::load(path)?;
            tracing::info!(tools = rack.len(), "tool rack loaded");
            rack
        }
        None => ToolRack::new(),
    };

    let config = Arc::new(config);
    let system = Arc::new(SystemState::new());
    if let Some(area) = &config.work_area {
        system.set_work_area_enabled(area.enabled);
    }
    if args.check {
        system.set_state(MachineState::CheckMode);
        tracing::info!("check mode: lines are validated, not executed");
    }

    let planner = SimPlanner::new(32);
    let kinematics = CartesianKinematics::new(LimitsGuard::new(config.clone(), system.clone()));
    let probe = SimProbe::new(config.probe.configured);
    let dispatcher = MotionDispatcher::new(
        config.clone(),
        system.clone(),
        Box::new(planner),
        Box::new(kinematics),
        Box::new(rack),
        Box::new(probe),
    );
    let mut parser = GcodeParser::new(
        config,
        system.clone(),
        dispatcher,
        Box::new(MemoryCoordStore::new()),
        Box::new(SimOutputs::default()),
        EventBus::new(),
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            println!("ok");
            continue;
        }
        if trimmed == "?" {
            print_status(&system, &parser);
            continue;
        }
        match parser.execute_line(trimmed).await {
            Ok(()) => println!("ok"),
            Err(err) => println!("error: {err}"),
        }
    }

    Ok(())
}

fn print_status(system: &SystemState, parser: &GcodeParser) {
    let wpos = parser.state().work_position();
    let mut report = format!("<{}|WPos:", system.state().label());
    for (axis, name) in AXIS_NAMES.iter().enumerate() {
        if axis > 0 {
            report.push(',');
        }
        report.push_str(&format!("{}{:.3}", name, wpos[axis]));
    }
    if let Some(alarm) = system.alarm() {
        report.push_str(&format!("|Alarm:{alarm:?}"));
    }
    report.push('>');
    println!("{report}");
}
