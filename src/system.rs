// src/system.rs - State shared with the realtime side, events, output ports

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Mutex;

use tokio::sync::broadcast;

use crate::gcode::modal::{CoolantState, CoordIndex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Idle,
    Cycle,
    Hold,
    Jog,
    Alarm,
    CheckMode,
}

impl MachineState {
    fn from_u8(raw: u8) -> MachineState {
        match raw {
            1 => MachineState::Cycle,
            2 => MachineState::Hold,
            3 => MachineState::Jog,
            4 => MachineState::Alarm,
            5 => MachineState::CheckMode,
            _ => MachineState::Idle,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            MachineState::Idle => "Idle",
            MachineState::Cycle => "Run",
            MachineState::Hold => "Hold",
            MachineState::Jog => "Jog",
            MachineState::Alarm => "Alarm",
            MachineState::CheckMode => "Check",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmKind {
    SoftLimit,
    HardLimit,
    ProbeFailInitial,
    ProbeFailContact,
}

/// Flags and state shared between the parser task and the realtime side.
/// All fields are atomics or behind a mutex so both sides may touch them.
#[derive(Debug)]
pub struct SystemState {
    state: AtomicU8,
    abort: AtomicBool,
    feed_hold: AtomicBool,
    jog_cancel: AtomicBool,
    tool_change_active: AtomicBool,
    work_area_enabled: AtomicBool,
    alarm: Mutex<Option<AlarmKind>>,
}

impl SystemState {
    pub fn new() -> Self {
        SystemState {
            state: AtomicU8::new(0),
            abort: AtomicBool::new(false),
            feed_hold: AtomicBool::new(false),
            jog_cancel: AtomicBool::new(false),
            tool_change_active: AtomicBool::new(false),
            work_area_enabled: AtomicBool::new(false),
            alarm: Mutex::new(None),
        }
    }

    pub fn state(&self) -> MachineState {
        MachineState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: MachineState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_abort(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::Release);
    }

    pub fn clear_abort(&self) {
        self.abort.store(false, Ordering::Release);
    }

    pub fn request_feed_hold(&self) {
        self.feed_hold.store(true, Ordering::Release);
        if self.state() == MachineState::Cycle {
            self.set_state(MachineState::Hold);
        }
    }

    pub fn clear_feed_hold(&self) {
        self.feed_hold.store(false, Ordering::Release);
    }

    pub fn feed_hold_requested(&self) -> bool {
        self.feed_hold.load(Ordering::Acquire)
    }

    pub fn request_jog_cancel(&self) {
        self.jog_cancel.store(true, Ordering::Release);
    }

    /// Reads and clears the jog-cancel flag.
    pub fn take_jog_cancel(&self) -> bool {
        self.jog_cancel.swap(false, Ordering::AcqRel)
    }

    pub fn tool_change_active(&self) -> bool {
        self.tool_change_active.load(Ordering::Acquire)
    }

    pub fn set_tool_change_active(&self, active: bool) {
        self.tool_change_active.store(active, Ordering::Release);
    }

    pub fn work_area_enabled(&self) -> bool {
        self.work_area_enabled.load(Ordering::Acquire)
    }

    pub fn set_work_area_enabled(&self, enabled: bool) {
        self.work_area_enabled.store(enabled, Ordering::Release);
    }

    pub fn alarm(&self) -> Option<AlarmKind> {
        match self.alarm.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn raise_alarm(&self, kind: AlarmKind) {
        tracing::error!(?kind, "alarm raised");
        match self.alarm.lock() {
            Ok(mut guard) => *guard = Some(kind),
            Err(poisoned) => *poisoned.into_inner() = Some(kind),
        }
        self.set_state(MachineState::Alarm);
    }

    pub fn clear_alarm(&self) {
        match self.alarm.lock() {
            Ok(mut guard) => *guard = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
        if self.state() == MachineState::Alarm {
            self.set_state(MachineState::Idle);
        }
    }
}

impl Default for SystemState {
    fn default() -> Self {
        SystemState::new()
    }
}

/// Events published when committed state changes; consumed by status
/// reporting so it can refresh its cached offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    /// The effective work coordinate offset changed.
    WcoChanged,
    /// A stored coordinate slot or offset was written.
    CoordChanged(CoordIndex),
    /// Override-control or coolant state changed.
    OverrideChanged,
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StateEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        EventBus { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.tx.subscribe()
    }

    /// Fire-and-forget: a bus with no subscribers is not an error.
    pub fn publish(&self, event: StateEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new()
    }
}

/// Auxiliary outputs driven by M62-M68 and the coolant words.
pub trait UserOutputs: Send {
    /// Returns false if the pin does not exist.
    fn set_digital(&mut self, pin: u8, on: bool) -> bool;
    /// `percent` is pre-clamped to 0..=100. Returns false if the pin does
    /// not exist.
    fn set_analog(&mut self, pin: u8, percent: f32) -> bool;
    fn set_coolant(&mut self, state: CoolantState);
}

pub const MAX_USER_DIGITAL_PIN: u8 = 8;
pub const MAX_USER_ANALOG_PIN: u8 = 4;

/// In-memory outputs for the simulator and tests.
#[derive(Debug, Default)]
pub struct SimOutputs {
    pub digital: [bool; MAX_USER_DIGITAL_PIN as usize],
    pub analog: [f32; MAX_USER_ANALOG_PIN as usize],
    pub coolant: CoolantState,
}

impl UserOutputs for SimOutputs {
    fn set_digital(&mut self, pin: u8, on: bool) -> bool {
        match self.digital.get_mut(pin as usize) {
            Some(slot) => {
                *slot = on;
                true
            }
            None => false,
        }
    }

    fn set_analog(&mut self, pin: u8, percent: f32) -> bool {
        match self.analog.get_mut(pin as usize) {
            Some(slot) => {
                *slot = percent;
                true
            }
            None => false,
        }
    }

    fn set_coolant(&mut self, state: CoolantState) {
        self.coolant = state;
    }
}

/// Probe input port. Direction is latched before the probing move starts.
pub trait ProbePin: Send {
    fn exists(&self) -> bool;
    /// `away` inverts the trip sense for G38.4/G38.5.
    fn set_direction(&mut self, away: bool);
    fn tripped(&self) -> bool;
}

/// Simulated probe whose trigger is shared with the test driving it.
#[derive(Debug)]
pub struct SimProbe {
    configured: bool,
    away: bool,
    triggered: std::sync::Arc<AtomicBool>,
}

impl SimProbe {
    pub fn new(configured: bool) -> Self {
        SimProbe {
            configured,
            away: false,
            triggered: std::sync::Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shared handle the test side uses to trip the probe.
    pub fn trigger_handle(&self) -> std::sync::Arc<AtomicBool> {
        self.triggered.clone()
    }
}

impl ProbePin for SimProbe {
    fn exists(&self) -> bool {
        self.configured
    }

    fn set_direction(&mut self, away: bool) {
        self.away = away;
    }

    fn tripped(&self) -> bool {
        self.triggered.load(Ordering::Acquire) != self.away
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_hold_transitions_cycle_to_hold() {
        let system = SystemState::new();
        system.set_state(MachineState::Cycle);
        system.request_feed_hold();
        assert_eq!(system.state(), MachineState::Hold);
        assert!(system.feed_hold_requested());
    }

    #[test]
    fn alarm_forces_alarm_state() {
        let system = SystemState::new();
        system.raise_alarm(AlarmKind::SoftLimit);
        assert_eq!(system.state(), MachineState::Alarm);
        assert_eq!(system.alarm(), Some(AlarmKind::SoftLimit));
        system.clear_alarm();
        assert_eq!(system.state(), MachineState::Idle);
        assert_eq!(system.alarm(), None);
    }

    #[test]
    fn jog_cancel_is_taken_once() {
        let system = SystemState::new();
        system.request_jog_cancel();
        assert!(system.take_jog_cancel());
        assert!(!system.take_jog_cancel());
    }

    #[test]
    fn sim_probe_away_inverts_sense() {
        let mut probe = SimProbe::new(true);
        assert!(!probe.tripped());
        probe.set_direction(true);
        assert!(probe.tripped());
        probe.trigger_handle().store(true, Ordering::Release);
        assert!(!probe.tripped());
    }
}
