// src/gcode/modal.rs - Modal state, word enums, and the transient block
//
// Every enum here mirrors one RS274/NGC modal group. A block may carry at
// most one member of each group; the bitmask in `ModalGroup` enforces that
// during the word scan.

use crate::{Position, N_AXIS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MotionMode {
    Seek,
    #[default]
    Linear,
    CwArc,
    CcwArc,
    ProbeToward,
    ProbeTowardNoError,
    ProbeAway,
    ProbeAwayNoError,
    /// G80: axis words are an error until a motion mode is restored.
    None,
}

impl MotionMode {
    pub fn is_probe(self) -> bool {
        matches!(
            self,
            MotionMode::ProbeToward
                | MotionMode::ProbeTowardNoError
                | MotionMode::ProbeAway
                | MotionMode::ProbeAwayNoError
        )
    }

    pub fn is_arc(self) -> bool {
        matches!(self, MotionMode::CwArc | MotionMode::CcwArc)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeedRateMode {
    /// G93
    InverseTime,
    /// G94
    #[default]
    UnitsPerMin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Units {
    /// G20
    Inches,
    /// G21
    #[default]
    Mm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistanceMode {
    /// G90
    #[default]
    Absolute,
    /// G91
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Plane {
    /// G17
    #[default]
    Xy,
    /// G18
    Zx,
    /// G19
    Yz,
}

impl Plane {
    /// (first plane axis, second plane axis, off-plane linear axis)
    pub fn axes(self) -> (usize, usize, usize) {
        match self {
            Plane::Xy => (crate::X_AXIS, crate::Y_AXIS, crate::Z_AXIS),
            Plane::Zx => (crate::Z_AXIS, crate::X_AXIS, crate::Y_AXIS),
            Plane::Yz => (crate::Y_AXIS, crate::Z_AXIS, crate::X_AXIS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolLengthMode {
    #[default]
    Cancel,
    /// G43.1
    EnableDynamic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProgramFlow {
    #[default]
    Running,
    /// M0
    Paused,
    /// M2
    CompletedM2,
    /// M30
    CompletedM30,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverrideMode {
    #[default]
    Disabled,
    /// M56
    ParkingMotion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolChangeMode {
    #[default]
    Disabled,
    /// M6
    Enable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoControl {
    #[default]
    None,
    /// M62
    DigitalOnSync,
    /// M63
    DigitalOffSync,
    /// M64
    DigitalOnImmediate,
    /// M65
    DigitalOffImmediate,
    /// M67
    SetAnalogSync,
    /// M68
    SetAnalogImmediate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CoolantState {
    pub mist: bool,
    pub flood: bool,
}

/// Coolant word as scanned; folded into `CoolantState` at commit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoolantWord {
    MistOn,
    MistOff,
    FloodOn,
    FloodOff,
    AllOff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NonModal {
    #[default]
    NoAction,
    /// G4
    Dwell,
    /// G10
    SetCoordinateData,
    /// G28
    GoHome0,
    /// G28.1
    SetHome0,
    /// G30
    GoHome1,
    /// G30.1
    SetHome1,
    /// G53
    AbsoluteOverride,
    /// G92
    SetCoordinateOffset,
    /// G92.1
    ResetCoordinateOffset,
}

/// Which command in the block owns the axis words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AxisCommand {
    #[default]
    None,
    NonModal,
    MotionMode,
    ToolLengthOffset,
}

/// Slots in the coordinate table plus the non-persistent offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordIndex {
    G54,
    G55,
    G56,
    G57,
    G58,
    G59,
    G28,
    G30,
    G92,
    Tlo,
}

impl CoordIndex {
    pub const WORK_SYSTEMS: usize = 6;
    /// Slots backed by the persistent coordinate store.
    pub const STORED: usize = 8;

    pub fn work(index: usize) -> Option<CoordIndex> {
        match index {
            0 => Some(CoordIndex::G54),
            1 => Some(CoordIndex::G55),
            2 => Some(CoordIndex::G56),
            3 => Some(CoordIndex::G57),
            4 => Some(CoordIndex::G58),
            5 => Some(CoordIndex::G59),
            _ => None,
        }
    }

    pub fn slot(self) -> Option<usize> {
        match self {
            CoordIndex::G54 => Some(0),
            CoordIndex::G55 => Some(1),
            CoordIndex::G56 => Some(2),
            CoordIndex::G57 => Some(3),
            CoordIndex::G58 => Some(4),
            CoordIndex::G59 => Some(5),
            CoordIndex::G28 => Some(6),
            CoordIndex::G30 => Some(7),
            CoordIndex::G92 | CoordIndex::Tlo => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            CoordIndex::G54 => "G54",
            CoordIndex::G55 => "G55",
            CoordIndex::G56 => "G56",
            CoordIndex::G57 => "G57",
            CoordIndex::G58 => "G58",
            CoordIndex::G59 => "G59",
            CoordIndex::G28 => "G28",
            CoordIndex::G30 => "G30",
            CoordIndex::G92 => "G92",
            CoordIndex::Tlo => "TLO",
        }
    }
}

/// Modal group identifiers. `mask()` gives the conflict-detection bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModalGroup {
    NonModal,
    Motion,
    Plane,
    Distance,
    ArcDistance,
    FeedRate,
    Units,
    CutterComp,
    ToolLength,
    CoordSystem,
    ControlMode,
    Stopping,
    Spindle,
    ToolChange,
    Coolant,
    OverrideCtrl,
    IoControl,
    WorkArea,
}

impl ModalGroup {
    pub fn mask(self) -> u32 {
        1 << (self as u32)
    }
}

/// Value-word letters tracked by the scan-phase "seen" bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Word {
    E,
    F,
    I,
    J,
    K,
    L,
    N,
    P,
    Q,
    R,
    T,
    U,
    X,
    Y,
    Z,
}

impl Word {
    pub fn mask(self) -> u32 {
        1 << (self as u32)
    }
}

/// The full set of modal settings that survive across lines.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModalState {
    pub motion: MotionMode,
    pub feed_rate: FeedRateMode,
    pub units: Units,
    pub distance: DistanceMode,
    pub plane: Plane,
    pub tool_length: ToolLengthMode,
    pub coord_select: CoordIndex,
    pub program_flow: ProgramFlow,
    pub coolant: CoolantState,
    pub override_ctrl: OverrideMode,
    pub tool_change: ToolChangeMode,
    pub io_control: IoControl,
}

impl Default for CoordIndex {
    fn default() -> Self {
        CoordIndex::G54
    }
}

/// Numeric payloads collected during the word scan.
#[derive(Debug, Clone, Default)]
pub struct BlockValues {
    pub xyz: Position,
    pub ijk: Position,
    pub f: f32,
    pub r: f32,
    pub p: f32,
    pub q: f32,
    pub e: u8,
    pub l: u8,
    pub n: i32,
    pub t: u8,
}

/// Transient per-line block: seeded from the committed modal state, mutated
/// during scan and validation, and only folded back in on success.
#[derive(Debug, Clone)]
pub struct ParsedBlock {
    pub non_modal: NonModal,
    pub modal: ModalState,
    pub values: BlockValues,
    pub coolant: Option<CoolantWord>,
    pub work_area: Option<bool>,
}

impl ParsedBlock {
    pub fn new(modal: ModalState) -> Self {
        ParsedBlock {
            non_modal: NonModal::NoAction,
            modal,
            values: BlockValues::default(),
            coolant: None,
            work_area: None,
        }
    }
}

/// Parser state that persists between lines. `position` is the parser's view
/// of the machine position, resynced from the planner at realtime boundaries.
#[derive(Debug, Clone, PartialEq)]
pub struct ParserState {
    pub modal: ModalState,
    pub feed_rate: f32,
    pub tool: u8,
    pub prev_tool: u8,
    pub line_number: i32,
    pub position: Position,
    /// Active work coordinate system, cached from the store.
    pub coord_system: Position,
    /// G92 offset.
    pub coord_offset: Position,
    pub tool_length_offset: f32,
}

impl Default for ParserState {
    fn default() -> Self {
        ParserState {
            modal: ModalState::default(),
            feed_rate: 0.0,
            tool: 0,
            prev_tool: 0,
            line_number: 0,
            position: [0.0; N_AXIS],
            coord_system: [0.0; N_AXIS],
            coord_offset: [0.0; N_AXIS],
            tool_length_offset: 0.0,
        }
    }
}

impl ParserState {
    /// Work position: `MPos - WCS - G92`, with the tool length offset
    /// removed from Z.
    pub fn work_position(&self) -> Position {
        let mut wpos = [0.0; N_AXIS];
        for axis in 0..N_AXIS {
            wpos[axis] = self.position[axis] - self.coord_system[axis] - self.coord_offset[axis];
        }
        wpos[crate::Z_AXIS] -= self.tool_length_offset;
        wpos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modal_group_masks_are_distinct() {
        let groups = [
            ModalGroup::NonModal,
            ModalGroup::Motion,
            ModalGroup::Plane,
            ModalGroup::Distance,
            ModalGroup::FeedRate,
            ModalGroup::Units,
            ModalGroup::ToolLength,
            ModalGroup::CoordSystem,
            ModalGroup::Stopping,
            ModalGroup::ToolChange,
            ModalGroup::Coolant,
            ModalGroup::IoControl,
            ModalGroup::WorkArea,
        ];
        let mut seen = 0u32;
        for group in groups {
            assert_eq!(seen & group.mask(), 0);
            seen |= group.mask();
        }
    }

    #[test]
    fn default_modal_state_matches_power_on() {
        let modal = ModalState::default();
        assert_eq!(modal.motion, MotionMode::Linear);
        assert_eq!(modal.distance, DistanceMode::Absolute);
        assert_eq!(modal.units, Units::Mm);
        assert_eq!(modal.plane, Plane::Xy);
        assert_eq!(modal.feed_rate, FeedRateMode::UnitsPerMin);
        assert_eq!(modal.coord_select, CoordIndex::G54);
    }

    #[test]
    fn plane_axes_permutations() {
        assert_eq!(Plane::Xy.axes(), (0, 1, 2));
        assert_eq!(Plane::Zx.axes(), (2, 0, 1));
        assert_eq!(Plane::Yz.axes(), (1, 2, 0));
    }

    #[test]
    fn work_position_subtracts_all_offsets() {
        let state = ParserState {
            position: [10.0, 20.0, -5.0],
            coord_system: [1.0, 2.0, 3.0],
            coord_offset: [0.5, 0.0, 0.0],
            tool_length_offset: -1.5,
            ..ParserState::default()
        };
        let wpos = state.work_position();
        assert_eq!(wpos, [8.5, 18.0, -6.5]);
    }
}
