// src/gcode/parser.rs - Line-level g-code parser and executor
//
// A line goes through three phases: word scan, cross-validation, commit.
// The first two phases touch only the transient block, so any error leaves
// the committed parser state exactly as it was. The commit phase folds the
// block into the modal state and hands motion to the dispatcher in the
// execution order the words imply, not the order they appeared.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::MachineConfig;
use crate::motion::{MotionDispatcher, MotionError, MotionRequest};
use crate::persistence::CoordStore;
use crate::system::{
    EventBus, MachineState, StateEvent, SystemState, UserOutputs, MAX_USER_ANALOG_PIN,
    MAX_USER_DIGITAL_PIN,
};
use crate::{Position, MM_PER_INCH, N_AXIS, X_AXIS, Y_AXIS, Z_AXIS};

use super::modal::{
    AxisCommand, CoolantWord, CoordIndex, DistanceMode, FeedRateMode, IoControl, ModalGroup,
    MotionMode, NonModal, OverrideMode, ParsedBlock, ParserState, Plane, ProgramFlow,
    ToolChangeMode, ToolLengthMode, Units, Word,
};
use super::words;
use super::GcodeError;

const MAX_LINE_NUMBER: i32 = 10_000_000;
/// Sentinel for "no probe offset requested" on the G38 P word.
const PROBE_NO_OFFSET: f32 = f32::MAX;

/// Scan-phase bookkeeping that never outlives the line.
#[derive(Debug, Default)]
struct Scan {
    axis_command: AxisCommand,
    axis_words: u8,
    ijk_words: u8,
    command_words: u32,
    value_words: u32,
    /// G38.6-G38.9: probe targets are raw machine coordinates.
    machine_frame_probe: bool,
    jog: bool,
    params: Vec<(u32, f32)>,
}

impl Scan {
    fn claim_group(&mut self, group: ModalGroup) -> Result<(), GcodeError> {
        let mask = group.mask();
        if self.command_words & mask != 0 {
            return Err(GcodeError::ModalGroupViolation);
        }
        self.command_words |= mask;
        Ok(())
    }

    fn claim_axis(&mut self, command: AxisCommand) -> Result<(), GcodeError> {
        if self.axis_command != AxisCommand::None && self.axis_command != command {
            return Err(GcodeError::AxisCommandConflict);
        }
        self.axis_command = command;
        Ok(())
    }

    fn group_seen(&self, group: ModalGroup) -> bool {
        self.command_words & group.mask() != 0
    }

    fn word_seen(&self, word: Word) -> bool {
        self.value_words & word.mask() != 0
    }

    fn take_word(&mut self, word: Word) -> Result<(), GcodeError> {
        let mask = word.mask();
        if self.value_words & mask != 0 {
            return Err(GcodeError::WordRepeated);
        }
        self.value_words |= mask;
        Ok(())
    }

    fn clear_word(&mut self, word: Word) {
        self.value_words &= !word.mask();
    }
}

pub struct GcodeParser {
    config: Arc<MachineConfig>,
    system: Arc<SystemState>,
    dispatcher: MotionDispatcher,
    coords: Box<dyn CoordStore>,
    outputs: Box<dyn UserOutputs>,
    events: EventBus,
    state: ParserState,
    params: HashMap<u32, f32>,
}

impl GcodeParser {
    pub fn new(
        config: Arc<MachineConfig>,
        system: Arc<SystemState>,
        dispatcher: MotionDispatcher,
        coords: Box<dyn CoordStore>,
        outputs: Box<dyn UserOutputs>,
        events: EventBus,
    ) -> Self {
        let mut state = ParserState::default();
        state.coord_system = coords.get(CoordIndex::G54);
        GcodeParser {
            config,
            system,
            dispatcher,
            coords,
            outputs,
            events,
            state,
            params: HashMap::new(),
        }
    }

    pub fn state(&self) -> &ParserState {
        &self.state
    }

    pub fn dispatcher(&self) -> &MotionDispatcher {
        &self.dispatcher
    }

    pub fn coord(&self, index: CoordIndex) -> Position {
        self.coords.get(index)
    }

    pub fn param(&self, id: u32) -> Option<f32> {
        self.params.get(&id).copied()
    }

    /// Resync the parser's idea of position from the realtime side. Needed
    /// after anything that moves the machine outside the parser's view.
    pub fn sync_position(&mut self) {
        self.state.position = self.dispatcher.planner_position();
    }

    /// Parse, validate, and execute one command line. An `Err` from the
    /// scan or validation phases means nothing was committed.
    pub async fn execute_line(&mut self, line: &str) -> Result<(), GcodeError> {
        let normalized = words::normalize(line);
        for message in &normalized.messages {
            tracing::info!(message = %message, "operator message");
        }

        let mut scan = Scan::default();
        let mut block = ParsedBlock::new(self.state.modal.clone());
        let text = normalized.text.as_bytes();
        let mut pos = 0;

        if text.first() == Some(&b'$') {
            if normalized.text.starts_with("$J=") {
                scan.jog = true;
                pos = 3;
            } else {
                return Err(GcodeError::UnsupportedCommand);
            }
        }

        // ---- phase 1: word scan ------------------------------------------
        while pos < text.len() {
            let letter = text[pos];
            if letter == b'#' {
                pos += 1;
                scan_param(text, &mut pos, &mut scan)?;
                continue;
            }
            if !letter.is_ascii_uppercase() {
                return Err(GcodeError::ExpectedCommandLetter);
            }
            pos += 1;
            let value = words::read_number(text, &mut pos).ok_or(GcodeError::BadNumberFormat)?;
            match letter {
                b'G' => self.scan_g(&mut block, &mut scan, value)?,
                b'M' => self.scan_m(&mut block, &mut scan, value)?,
                _ => scan_value_word(&mut block, &mut scan, letter, value)?,
            }
        }

        // ---- phase 2: cross-validation -----------------------------------

        // [line number]
        if scan.word_seen(Word::N) && block.values.n > MAX_LINE_NUMBER {
            return Err(GcodeError::InvalidLineNumber);
        }

        if scan.jog {
            // jogs accept only units, distance, and G53; motion is always a
            // straight feed move regardless of the modal state
            let allowed = ModalGroup::Units.mask()
                | ModalGroup::Distance.mask()
                | ModalGroup::NonModal.mask();
            if scan.command_words & !allowed != 0 {
                return Err(GcodeError::InvalidJogCommand);
            }
            if !matches!(block.non_modal, NonModal::NoAction | NonModal::AbsoluteOverride) {
                return Err(GcodeError::InvalidJogCommand);
            }
            if scan.axis_words == 0 {
                return Err(GcodeError::InvalidJogCommand);
            }
            if !scan.word_seen(Word::F) || block.values.f == 0.0 {
                return Err(GcodeError::UndefinedFeedRate);
            }
            block.modal.motion = MotionMode::Linear;
            block.modal.feed_rate = FeedRateMode::UnitsPerMin;
            scan.axis_command = AxisCommand::MotionMode;
        }

        // [feed rate]
        if scan.word_seen(Word::F) {
            if block.modal.units == Units::Inches {
                block.values.f *= MM_PER_INCH;
            }
        } else if block.modal.feed_rate == FeedRateMode::UnitsPerMin {
            block.values.f = self.state.feed_rate;
        }
        // inverse time leaves a missing F at zero; motion validation below
        // rejects it for anything that actually feeds

        // [M56 P0 disables the override]
        if scan.group_seen(ModalGroup::OverrideCtrl) && scan.word_seen(Word::P) {
            if block.values.p == 0.0 {
                block.modal.override_ctrl = OverrideMode::Disabled;
            }
            scan.clear_word(Word::P);
        }

        // [dwell]
        if block.non_modal == NonModal::Dwell {
            if !scan.word_seen(Word::P) {
                return Err(GcodeError::ValueWordMissing);
            }
            scan.clear_word(Word::P);
        }

        // [io control]
        match block.modal.io_control {
            IoControl::DigitalOnSync
            | IoControl::DigitalOffSync
            | IoControl::DigitalOnImmediate
            | IoControl::DigitalOffImmediate => {
                if !scan.word_seen(Word::P) {
                    return Err(GcodeError::ValueWordMissing);
                }
                scan.clear_word(Word::P);
            }
            IoControl::SetAnalogSync | IoControl::SetAnalogImmediate => {
                if !scan.word_seen(Word::E) || !scan.word_seen(Word::Q) {
                    return Err(GcodeError::ValueWordMissing);
                }
                scan.clear_word(Word::E);
                scan.clear_word(Word::Q);
            }
            IoControl::None => {}
        }

        // [unit conversion for axis words]
        if block.modal.units == Units::Inches {
            for axis in 0..N_AXIS {
                if scan.axis_words & (1 << axis) != 0 {
                    block.values.xyz[axis] *= MM_PER_INCH;
                }
            }
        }

        // [tool length offset]
        if scan.axis_command == AxisCommand::ToolLengthOffset
            && block.modal.tool_length == ToolLengthMode::EnableDynamic
            && scan.axis_words != (1 << Z_AXIS)
        {
            return Err(GcodeError::G43DynamicAxisError);
        }

        // [tool change]
        if block.modal.tool_change == ToolChangeMode::Enable {
            if !scan.word_seen(Word::T) {
                return Err(GcodeError::ToolChangeRequiresToolNumber);
            }
            if block.values.t > self.config.tool_change.max_tools {
                return Err(GcodeError::UnsupportedToolNumber);
            }
        }

        // [coordinate system select]
        let mut block_coord_system = self.state.coord_system;
        if scan.group_seen(ModalGroup::CoordSystem)
            && self.state.modal.coord_select != block.modal.coord_select
        {
            block_coord_system = self.coords.get(block.modal.coord_select);
        }

        // [non-modal preconversion and target construction]
        let mut g10_data: Option<(CoordIndex, Position)> = None;
        let mut home_position: Option<Position> = None;
        match block.non_modal {
            NonModal::SetCoordinateData => {
                if scan.axis_words == 0 {
                    return Err(GcodeError::NoAxisWords);
                }
                if !scan.word_seen(Word::L) || !scan.word_seen(Word::P) {
                    return Err(GcodeError::ValueWordMissing);
                }
                if block.values.p != block.values.p.trunc() {
                    return Err(GcodeError::CommandValueNotInteger);
                }
                let p_int = block.values.p as usize;
                if p_int > CoordIndex::WORK_SYSTEMS {
                    return Err(GcodeError::UnsupportedCoordSystem);
                }
                let index = if p_int > 0 {
                    CoordIndex::work(p_int - 1).ok_or(GcodeError::UnsupportedCoordSystem)?
                } else {
                    block.modal.coord_select
                };
                let mut data = self.coords.get(index);
                match block.values.l {
                    20 => {
                        for axis in 0..N_AXIS {
                            if scan.axis_words & (1 << axis) != 0 {
                                data[axis] = self.state.position[axis]
                                    - self.state.coord_offset[axis]
                                    - block.values.xyz[axis];
                                if axis == Z_AXIS {
                                    data[axis] -= self.state.tool_length_offset;
                                }
                            }
                        }
                    }
                    2 => {
                        for axis in 0..N_AXIS {
                            if scan.axis_words & (1 << axis) != 0 {
                                data[axis] = block.values.xyz[axis];
                            }
                        }
                    }
                    _ => return Err(GcodeError::UnsupportedCommand),
                }
                scan.clear_word(Word::L);
                scan.clear_word(Word::P);
                g10_data = Some((index, data));
            }
            NonModal::SetCoordinateOffset => {
                if scan.axis_words == 0 {
                    return Err(GcodeError::NoAxisWords);
                }
                // rewrite the axis words into the offset that makes the
                // current position read as the given value
                for axis in 0..N_AXIS {
                    if scan.axis_words & (1 << axis) != 0 {
                        block.values.xyz[axis] = self.state.position[axis]
                            - block_coord_system[axis]
                            - block.values.xyz[axis];
                        if axis == Z_AXIS {
                            block.values.xyz[axis] -= self.state.tool_length_offset;
                        }
                    } else {
                        block.values.xyz[axis] = self.state.coord_offset[axis];
                    }
                }
            }
            _ => {
                // absolute machine target for whatever motion owns the words
                if scan.axis_command != AxisCommand::ToolLengthOffset && scan.axis_words != 0 {
                    for axis in 0..N_AXIS {
                        if scan.axis_words & (1 << axis) == 0 {
                            block.values.xyz[axis] = self.state.position[axis];
                        } else if block.non_modal != NonModal::AbsoluteOverride
                            && !scan.machine_frame_probe
                        {
                            if block.modal.distance == DistanceMode::Absolute {
                                block.values.xyz[axis] +=
                                    block_coord_system[axis] + self.state.coord_offset[axis];
                                if axis == Z_AXIS {
                                    block.values.xyz[axis] += self.state.tool_length_offset;
                                }
                            } else {
                                block.values.xyz[axis] += self.state.position[axis];
                            }
                        }
                    }
                }
                match block.non_modal {
                    NonModal::GoHome0 | NonModal::GoHome1 => {
                        let index = if block.non_modal == NonModal::GoHome0 {
                            CoordIndex::G28
                        } else {
                            CoordIndex::G30
                        };
                        let mut home = self.coords.get(index);
                        if scan.axis_words != 0 {
                            // only the worded axes go home
                            for axis in 0..N_AXIS {
                                if scan.axis_words & (1 << axis) == 0 {
                                    home[axis] = self.state.position[axis];
                                }
                            }
                        } else {
                            scan.axis_command = AxisCommand::None;
                        }
                        home_position = Some(home);
                    }
                    NonModal::AbsoluteOverride => {
                        if !matches!(block.modal.motion, MotionMode::Seek | MotionMode::Linear) {
                            return Err(GcodeError::G53InvalidMotionMode);
                        }
                    }
                    _ => {}
                }
            }
        }

        // [motion modes]
        // bare axis words imply the sticky motion mode
        if scan.axis_words != 0 && scan.axis_command == AxisCommand::None {
            scan.axis_command = AxisCommand::MotionMode;
        }
        let mut arc_rotations = 0u32;
        if block.modal.motion == MotionMode::None {
            if scan.axis_words != 0 && scan.axis_command != AxisCommand::NonModal {
                return Err(GcodeError::AxisWordsExist);
            }
        } else if scan.axis_command == AxisCommand::MotionMode {
            if scan.axis_words == 0
                && matches!(block.modal.motion, MotionMode::Seek | MotionMode::Linear)
            {
                // a bare G0/G1 just sets the mode
                scan.axis_command = AxisCommand::None;
            } else if block.modal.motion == MotionMode::Seek {
                // rapids ignore the feed rate
            } else {
                if block.values.f <= 0.0 {
                    return Err(GcodeError::UndefinedFeedRate);
                }
                match block.modal.motion {
                    MotionMode::CwArc | MotionMode::CcwArc => {
                        arc_rotations = self.validate_arc(&mut block, &mut scan)?;
                    }
                    mode if mode.is_probe() => {
                        if scan.axis_words == 0 {
                            return Err(GcodeError::NoAxisWords);
                        }
                        if block.values.xyz == self.state.position {
                            return Err(GcodeError::InvalidTarget);
                        }
                        if scan.word_seen(Word::P) {
                            // the offset applies to exactly one probed axis
                            if scan.axis_words.count_ones() != 1 {
                                return Err(GcodeError::UnusedWords);
                            }
                            scan.clear_word(Word::P);
                        } else {
                            block.values.p = PROBE_NO_OFFSET;
                        }
                    }
                    _ => {}
                }
            }
        }

        // [unused words]
        let mut leftovers = scan.value_words;
        leftovers &= !(Word::N.mask() | Word::F.mask() | Word::U.mask());
        if !scan.jog {
            leftovers &= !Word::T.mask();
        }
        if scan.axis_command != AxisCommand::None {
            leftovers &= !(Word::X.mask() | Word::Y.mask() | Word::Z.mask());
        }
        if leftovers != 0 {
            return Err(GcodeError::UnusedWords);
        }

        // ---- phase 3: commit ---------------------------------------------
        self.commit(block, scan, block_coord_system, g10_data, home_position, arc_rotations)
            .await
    }

    /// Arc cross-validation: radius format derives the center from the
    /// chord, center format checks the two radii agree.
    fn validate_arc(
        &self,
        block: &mut ParsedBlock,
        scan: &mut Scan,
    ) -> Result<u32, GcodeError> {
        let (axis_0, axis_1, _) = block.modal.plane.axes();
        let plane_bits = (1u8 << axis_0) | (1 << axis_1);
        if scan.axis_words & plane_bits == 0 {
            return Err(GcodeError::NoAxisWordsInPlane);
        }
        let mut rotations = 0u32;
        if scan.word_seen(Word::P) {
            if block.values.p != block.values.p.trunc() {
                return Err(GcodeError::CommandValueNotInteger);
            }
            rotations = block.values.p as u32;
            scan.clear_word(Word::P);
        }

        if scan.word_seen(Word::R) {
            scan.clear_word(Word::R);
            if block.modal.units == Units::Inches {
                block.values.r *= MM_PER_INCH;
            }
            let x = block.values.xyz[axis_0] - self.state.position[axis_0];
            let y = block.values.xyz[axis_1] - self.state.position[axis_1];
            if x == 0.0 && y == 0.0 {
                // radius format cannot express a full circle
                return Err(GcodeError::InvalidTarget);
            }
            let r = block.values.r;
            let mut h_x2_div_d = 4.0 * r * r - x * x - y * y;
            if h_x2_div_d < 0.0 {
                return Err(GcodeError::ArcRadiusError);
            }
            h_x2_div_d = -h_x2_div_d.sqrt() / (x * x + y * y).sqrt();
            if block.modal.motion == MotionMode::CcwArc {
                h_x2_div_d = -h_x2_div_d;
            }
            // negative R selects the arc longer than a half circle
            if r < 0.0 {
                h_x2_div_d = -h_x2_div_d;
                block.values.r = -r;
            }
            block.values.ijk[axis_0] = 0.5 * (x - y * h_x2_div_d);
            block.values.ijk[axis_1] = 0.5 * (y + x * h_x2_div_d);
        } else {
            if scan.ijk_words & plane_bits == 0 {
                return Err(GcodeError::NoOffsetsInPlane);
            }
            scan.clear_word(Word::I);
            scan.clear_word(Word::J);
            scan.clear_word(Word::K);
            if block.modal.units == Units::Inches {
                for axis in 0..N_AXIS {
                    block.values.ijk[axis] *= MM_PER_INCH;
                }
            }
            let i = block.values.ijk[axis_0];
            let j = block.values.ijk[axis_1];
            block.values.r = (i * i + j * j).sqrt();
            let x = block.values.xyz[axis_0] - self.state.position[axis_0] - i;
            let y = block.values.xyz[axis_1] - self.state.position[axis_1] - j;
            let delta_r = ((x * x + y * y).sqrt() - block.values.r).abs();
            if delta_r > 0.005 {
                if delta_r > 0.5 {
                    return Err(GcodeError::InvalidTarget);
                }
                if delta_r > 0.001 * block.values.r {
                    return Err(GcodeError::InvalidTarget);
                }
            }
        }
        Ok(rotations)
    }

    async fn commit(
        &mut self,
        block: ParsedBlock,
        scan: Scan,
        block_coord_system: Position,
        g10_data: Option<(CoordIndex, Position)>,
        home_position: Option<Position>,
        arc_rotations: u32,
    ) -> Result<(), GcodeError> {
        let check_mode = self.system.state() == MachineState::CheckMode;

        // parameter assignments are part of the atomic commit
        for (id, value) in &scan.params {
            self.params.insert(*id, *value);
        }

        // [tool change runs first; nothing else applies if it fails]
        let tool_word = scan.word_seen(Word::T);
        if block.modal.tool_change == ToolChangeMode::Enable && !check_mode {
            let next_tool = block.values.t;
            tracing::info!(from = self.state.prev_tool, to = next_tool, "tool change");
            self.state.tool = next_tool;
            match self
                .dispatcher
                .change_tool(next_tool, block.values.n, &mut self.state.position)
                .await
            {
                Ok(()) => {
                    self.state.prev_tool = next_tool;
                }
                Err(err) => {
                    tracing::error!(error = %err, "tool change failed");
                    self.state.tool = self.state.prev_tool;
                    self.sync_position();
                    return match err {
                        MotionError::Reset => Err(GcodeError::Reset),
                        _ => Err(GcodeError::ToolChangeFailed),
                    };
                }
            }
        } else if tool_word && !scan.jog {
            self.state.tool = block.values.t;
        }

        // [jog lines bypass the modal commit entirely]
        if scan.jog {
            let request = MotionRequest {
                feed_rate: block.values.f,
                line_number: block.values.n,
                coolant: self.state.modal.coolant,
                is_jog: true,
                ..MotionRequest::default()
            };
            self.dispatcher
                .jog_move(block.values.xyz, &request, &mut self.state.position)
                .await?;
            return Ok(());
        }

        self.state.line_number = block.values.n;
        self.state.modal.feed_rate = block.modal.feed_rate;
        self.state.feed_rate = block.values.f;
        let mut request = MotionRequest {
            feed_rate: block.values.f,
            inverse_time: block.modal.feed_rate == FeedRateMode::InverseTime,
            line_number: block.values.n,
            ..MotionRequest::default()
        };

        // [work area toggle]
        if let Some(enable) = block.work_area {
            self.system.set_work_area_enabled(enable);
            tracing::debug!(enable, "work area envelope toggled");
        }

        // [coolant]
        if let Some(word) = block.coolant {
            let mut coolant = self.state.modal.coolant;
            match word {
                CoolantWord::MistOn => coolant.mist = true,
                CoolantWord::MistOff => coolant.mist = false,
                CoolantWord::FloodOn => coolant.flood = true,
                CoolantWord::FloodOff => coolant.flood = false,
                CoolantWord::AllOff => {
                    coolant.mist = false;
                    coolant.flood = false;
                }
            }
            self.state.modal.coolant = coolant;
            if !check_mode {
                self.dispatcher.synchronize().await?;
                self.outputs.set_coolant(coolant);
            }
        }
        request.coolant = self.state.modal.coolant;

        // [io control]
        if block.modal.io_control != IoControl::None {
            if !check_mode {
                self.run_io_control(
                    block.modal.io_control,
                    block.values.p,
                    block.values.e,
                    block.values.q,
                )
                .await?;
            }
        }

        // [override control]
        if self.state.modal.override_ctrl != block.modal.override_ctrl {
            self.state.modal.override_ctrl = block.modal.override_ctrl;
            self.dispatcher.override_update().await?;
            self.events.publish(StateEvent::OverrideChanged);
        }

        // [dwell]
        if block.non_modal == NonModal::Dwell {
            self.dispatcher.dwell((block.values.p * 1000.0) as u32).await?;
        }

        // [plane / units / distance]
        self.state.modal.plane = block.modal.plane;
        self.state.modal.units = block.modal.units;
        self.state.modal.distance = block.modal.distance;

        // [tool length offset]
        if scan.axis_command == AxisCommand::ToolLengthOffset {
            self.state.modal.tool_length = block.modal.tool_length;
            let offset = match block.modal.tool_length {
                ToolLengthMode::Cancel => 0.0,
                ToolLengthMode::EnableDynamic => block.values.xyz[Z_AXIS],
            };
            if self.state.tool_length_offset != offset {
                self.state.tool_length_offset = offset;
                self.events.publish(StateEvent::CoordChanged(CoordIndex::Tlo));
                self.events.publish(StateEvent::WcoChanged);
            }
        }

        // [coordinate system select]
        if self.state.modal.coord_select != block.modal.coord_select {
            self.state.modal.coord_select = block.modal.coord_select;
            self.state.coord_system = block_coord_system;
            self.events.publish(StateEvent::WcoChanged);
        }

        // [non-modal actions]
        match block.non_modal {
            NonModal::SetCoordinateData => {
                if let Some((index, data)) = g10_data {
                    self.coords.set(index, data);
                    self.events.publish(StateEvent::CoordChanged(index));
                    if self.state.modal.coord_select == index {
                        self.state.coord_system = data;
                        self.events.publish(StateEvent::WcoChanged);
                    }
                }
            }
            NonModal::GoHome0 | NonModal::GoHome1 => {
                request.is_rapid = true;
                request.is_system_motion = true;
                if scan.axis_command != AxisCommand::None {
                    // intermediate stop at the worded position
                    self.dispatcher
                        .linear_move(block.values.xyz, &request, &mut self.state.position)
                        .await?;
                    self.state.position = block.values.xyz;
                }
                if let Some(home) = home_position {
                    self.dispatcher
                        .linear_move(home, &request, &mut self.state.position)
                        .await?;
                    self.state.position = home;
                }
            }
            NonModal::SetHome0 => {
                self.coords.set(CoordIndex::G28, self.state.position);
                self.events.publish(StateEvent::CoordChanged(CoordIndex::G28));
            }
            NonModal::SetHome1 => {
                self.coords.set(CoordIndex::G30, self.state.position);
                self.events.publish(StateEvent::CoordChanged(CoordIndex::G30));
            }
            NonModal::SetCoordinateOffset => {
                self.state.coord_offset = block.values.xyz;
                self.events.publish(StateEvent::CoordChanged(CoordIndex::G92));
                self.events.publish(StateEvent::WcoChanged);
            }
            NonModal::ResetCoordinateOffset => {
                self.state.coord_offset = [0.0; N_AXIS];
                self.events.publish(StateEvent::CoordChanged(CoordIndex::G92));
                self.events.publish(StateEvent::WcoChanged);
            }
            _ => {}
        }

        // [motion]
        self.state.modal.motion = block.modal.motion;
        if self.state.modal.motion != MotionMode::None
            && scan.axis_command == AxisCommand::MotionMode
        {
            match self.state.modal.motion {
                MotionMode::Seek => {
                    request.is_rapid = true;
                    self.dispatcher
                        .linear_move(block.values.xyz, &request, &mut self.state.position)
                        .await?;
                    self.state.position = block.values.xyz;
                }
                MotionMode::Linear => {
                    self.dispatcher
                        .linear_move(block.values.xyz, &request, &mut self.state.position)
                        .await?;
                    self.state.position = block.values.xyz;
                }
                MotionMode::CwArc | MotionMode::CcwArc => {
                    let clockwise = self.state.modal.motion == MotionMode::CwArc;
                    self.dispatcher
                        .arc_move(
                            block.values.xyz,
                            &mut request,
                            &mut self.state.position,
                            block.values.ijk,
                            block.values.r,
                            self.state.modal.plane.axes(),
                            clockwise,
                            arc_rotations,
                        )
                        .await?;
                    self.state.position = block.values.xyz;
                }
                mode if mode.is_probe() => {
                    let away =
                        matches!(mode, MotionMode::ProbeAway | MotionMode::ProbeAwayNoError);
                    let no_error = matches!(
                        mode,
                        MotionMode::ProbeTowardNoError | MotionMode::ProbeAwayNoError
                    );
                    request.no_feed_override = true;
                    let outcome = self
                        .dispatcher
                        .probe_cycle(
                            block.values.xyz,
                            &request,
                            away,
                            no_error,
                            &mut self.state.position,
                        )
                        .await?;
                    if outcome.succeeded && block.values.p != PROBE_NO_OFFSET {
                        // shift the active work offset so the contact point
                        // reads as the P value on the probed axis
                        let index = self.state.modal.coord_select;
                        let mut data = self.coords.get(index);
                        for axis in 0..N_AXIS {
                            if scan.axis_words & (1 << axis) != 0 {
                                data[axis] = outcome.contact[axis]
                                    - self.state.coord_offset[axis]
                                    - block.values.p;
                            }
                        }
                        self.coords.set(index, data);
                        self.state.coord_system = data;
                        self.events.publish(StateEvent::CoordChanged(index));
                        self.events.publish(StateEvent::WcoChanged);
                    }
                    self.sync_position();
                }
                _ => {}
            }
            if self.system.is_abort() {
                return Err(GcodeError::Reset);
            }
        }

        // [program flow]
        match block.modal.program_flow {
            ProgramFlow::Running => {}
            ProgramFlow::Paused => {
                self.dispatcher.synchronize().await?;
                if !check_mode {
                    // lift the pen to the safe height while paused
                    let mut park = self.state.position;
                    park[Z_AXIS] = self.config.tool_change.safe_z;
                    let park_request = MotionRequest {
                        feed_rate: self.config.axes.z.max_rate,
                        is_rapid: true,
                        is_system_motion: true,
                        line_number: block.values.n,
                        ..MotionRequest::default()
                    };
                    self.dispatcher
                        .linear_move(park, &park_request, &mut self.state.position)
                        .await?;
                    self.dispatcher.synchronize().await?;
                    self.system.request_feed_hold();
                    tracing::info!("program paused");
                }
            }
            ProgramFlow::CompletedM2 | ProgramFlow::CompletedM30 => {
                self.dispatcher.synchronize().await?;
                let g54 = self.coords.get(CoordIndex::G54);
                let wco_changed = self.state.modal.coord_select != CoordIndex::G54
                    || self.state.coord_system != g54;
                // partial modal reset; units, tool, and G92 survive
                self.state.modal.motion = MotionMode::Linear;
                self.state.modal.plane = Plane::Xy;
                self.state.modal.distance = DistanceMode::Absolute;
                self.state.modal.feed_rate = FeedRateMode::UnitsPerMin;
                self.state.modal.coord_select = CoordIndex::G54;
                self.state.modal.coolant = Default::default();
                self.state.modal.override_ctrl = OverrideMode::Disabled;
                self.state.coord_system = g54;
                if !check_mode {
                    self.outputs.set_coolant(self.state.modal.coolant);
                }
                if wco_changed {
                    self.events.publish(StateEvent::WcoChanged);
                }
                tracing::info!("program end");
            }
        }
        Ok(())
    }

    async fn run_io_control(
        &mut self,
        io: IoControl,
        p: f32,
        e: u8,
        q: f32,
    ) -> Result<(), GcodeError> {
        match io {
            IoControl::DigitalOnSync
            | IoControl::DigitalOffSync
            | IoControl::DigitalOnImmediate
            | IoControl::DigitalOffImmediate => {
                if p >= MAX_USER_DIGITAL_PIN as f32 {
                    return Err(GcodeError::PParamMaxExceeded);
                }
                if matches!(io, IoControl::DigitalOnSync | IoControl::DigitalOffSync) {
                    self.dispatcher.synchronize().await?;
                }
                let on = matches!(io, IoControl::DigitalOnSync | IoControl::DigitalOnImmediate);
                if !self.outputs.set_digital(p as u8, on) {
                    return Err(GcodeError::PParamMaxExceeded);
                }
            }
            IoControl::SetAnalogSync | IoControl::SetAnalogImmediate => {
                if e >= MAX_USER_ANALOG_PIN {
                    return Err(GcodeError::PParamMaxExceeded);
                }
                if io == IoControl::SetAnalogSync {
                    self.dispatcher.synchronize().await?;
                }
                if !self.outputs.set_analog(e, q.clamp(0.0, 100.0)) {
                    return Err(GcodeError::PParamMaxExceeded);
                }
            }
            IoControl::None => {}
        }
        Ok(())
    }

    fn scan_g(
        &self,
        block: &mut ParsedBlock,
        scan: &mut Scan,
        value: f32,
    ) -> Result<(), GcodeError> {
        if value < 0.0 {
            return Err(GcodeError::UnsupportedCommand);
        }
        let (int_value, mantissa) = words::split_command(value);
        match (int_value, mantissa) {
            (0, 0) => {
                scan.claim_axis(AxisCommand::MotionMode)?;
                block.modal.motion = MotionMode::Seek;
                scan.claim_group(ModalGroup::Motion)?;
            }
            (1, 0) => {
                scan.claim_axis(AxisCommand::MotionMode)?;
                block.modal.motion = MotionMode::Linear;
                scan.claim_group(ModalGroup::Motion)?;
            }
            (2, 0) => {
                scan.claim_axis(AxisCommand::MotionMode)?;
                block.modal.motion = MotionMode::CwArc;
                scan.claim_group(ModalGroup::Motion)?;
            }
            (3, 0) => {
                scan.claim_axis(AxisCommand::MotionMode)?;
                block.modal.motion = MotionMode::CcwArc;
                scan.claim_group(ModalGroup::Motion)?;
            }
            (4, 0) => {
                block.non_modal = NonModal::Dwell;
                scan.claim_group(ModalGroup::NonModal)?;
            }
            (10, 0) => {
                scan.claim_axis(AxisCommand::NonModal)?;
                block.non_modal = NonModal::SetCoordinateData;
                scan.claim_group(ModalGroup::NonModal)?;
            }
            (17, 0) => {
                block.modal.plane = Plane::Xy;
                scan.claim_group(ModalGroup::Plane)?;
            }
            (18, 0) => {
                block.modal.plane = Plane::Zx;
                scan.claim_group(ModalGroup::Plane)?;
            }
            (19, 0) => {
                block.modal.plane = Plane::Yz;
                scan.claim_group(ModalGroup::Plane)?;
            }
            (20, 0) => {
                block.modal.units = Units::Inches;
                scan.claim_group(ModalGroup::Units)?;
            }
            (21, 0) => {
                block.modal.units = Units::Mm;
                scan.claim_group(ModalGroup::Units)?;
            }
            (28, 0) => {
                scan.claim_axis(AxisCommand::NonModal)?;
                block.non_modal = NonModal::GoHome0;
                scan.claim_group(ModalGroup::NonModal)?;
            }
            (28, 10) => {
                block.non_modal = NonModal::SetHome0;
                scan.claim_group(ModalGroup::NonModal)?;
            }
            (30, 0) => {
                scan.claim_axis(AxisCommand::NonModal)?;
                block.non_modal = NonModal::GoHome1;
                scan.claim_group(ModalGroup::NonModal)?;
            }
            (30, 10) => {
                block.non_modal = NonModal::SetHome1;
                scan.claim_group(ModalGroup::NonModal)?;
            }
            (38, m @ (20 | 30 | 40 | 50 | 60 | 70 | 80 | 90)) => {
                if !self.config.probe.configured {
                    return Err(GcodeError::UnsupportedCommand);
                }
                scan.claim_axis(AxisCommand::MotionMode)?;
                let mut sub = m;
                if sub >= 60 {
                    scan.machine_frame_probe = true;
                    sub -= 40;
                }
                block.modal.motion = match sub {
                    20 => MotionMode::ProbeToward,
                    30 => MotionMode::ProbeTowardNoError,
                    40 => MotionMode::ProbeAway,
                    _ => MotionMode::ProbeAwayNoError,
                };
                scan.claim_group(ModalGroup::Motion)?;
            }
            (40, 0) => {
                // cutter compensation is permanently off; accept the cancel
                scan.claim_group(ModalGroup::CutterComp)?;
            }
            (43, 10) => {
                scan.claim_axis(AxisCommand::ToolLengthOffset)?;
                block.modal.tool_length = ToolLengthMode::EnableDynamic;
                scan.claim_group(ModalGroup::ToolLength)?;
            }
            (49, 0) => {
                scan.claim_axis(AxisCommand::ToolLengthOffset)?;
                block.modal.tool_length = ToolLengthMode::Cancel;
                scan.claim_group(ModalGroup::ToolLength)?;
            }
            (53, 0) => {
                block.non_modal = NonModal::AbsoluteOverride;
                scan.claim_group(ModalGroup::NonModal)?;
            }
            (54..=59, 0) => {
                block.modal.coord_select = CoordIndex::work((int_value - 54) as usize)
                    .ok_or(GcodeError::UnsupportedCoordSystem)?;
                scan.claim_group(ModalGroup::CoordSystem)?;
            }
            (61, 0) => {
                // exact path is the only control mode
                scan.claim_group(ModalGroup::ControlMode)?;
            }
            (80, 0) => {
                block.modal.motion = MotionMode::None;
                scan.claim_group(ModalGroup::Motion)?;
            }
            (90, 0) => {
                block.modal.distance = DistanceMode::Absolute;
                scan.claim_group(ModalGroup::Distance)?;
            }
            (91, 0) => {
                block.modal.distance = DistanceMode::Incremental;
                scan.claim_group(ModalGroup::Distance)?;
            }
            (91, 10) => {
                // G91.1: incremental arc offsets, the only mode supported
                scan.claim_group(ModalGroup::ArcDistance)?;
            }
            (92, 0) => {
                scan.claim_axis(AxisCommand::NonModal)?;
                block.non_modal = NonModal::SetCoordinateOffset;
                scan.claim_group(ModalGroup::NonModal)?;
            }
            (92, 10) => {
                block.non_modal = NonModal::ResetCoordinateOffset;
                scan.claim_group(ModalGroup::NonModal)?;
            }
            (93, 0) => {
                block.modal.feed_rate = FeedRateMode::InverseTime;
                scan.claim_group(ModalGroup::FeedRate)?;
            }
            (94, 0) => {
                block.modal.feed_rate = FeedRateMode::UnitsPerMin;
                scan.claim_group(ModalGroup::FeedRate)?;
            }
            _ => return Err(GcodeError::UnsupportedCommand),
        }
        Ok(())
    }

    fn scan_m(
        &self,
        block: &mut ParsedBlock,
        scan: &mut Scan,
        value: f32,
    ) -> Result<(), GcodeError> {
        if value < 0.0 {
            return Err(GcodeError::UnsupportedCommand);
        }
        let (int_value, mantissa) = words::split_command(value);
        if mantissa != 0 {
            return Err(GcodeError::UnsupportedCommand);
        }
        match int_value {
            0 => {
                block.modal.program_flow = ProgramFlow::Paused;
                scan.claim_group(ModalGroup::Stopping)?;
            }
            1 => {
                // optional stop: no stop switch installed, carry on
                scan.claim_group(ModalGroup::Stopping)?;
            }
            2 => {
                block.modal.program_flow = ProgramFlow::CompletedM2;
                scan.claim_group(ModalGroup::Stopping)?;
            }
            30 => {
                block.modal.program_flow = ProgramFlow::CompletedM30;
                scan.claim_group(ModalGroup::Stopping)?;
            }
            3 | 4 | 5 => {
                // no spindle on a plotter; accepted so program headers pass
                scan.claim_group(ModalGroup::Spindle)?;
            }
            6 => {
                block.modal.tool_change = ToolChangeMode::Enable;
                scan.claim_group(ModalGroup::ToolChange)?;
            }
            7 => {
                block.coolant = Some(CoolantWord::MistOn);
                scan.claim_group(ModalGroup::Coolant)?;
            }
            8 => {
                block.coolant = Some(CoolantWord::FloodOn);
                scan.claim_group(ModalGroup::Coolant)?;
            }
            9 => {
                block.coolant = Some(CoolantWord::AllOff);
                scan.claim_group(ModalGroup::Coolant)?;
            }
            56 => {
                if !self.config.enable_parking_override {
                    return Err(GcodeError::UnsupportedCommand);
                }
                block.modal.override_ctrl = OverrideMode::ParkingMotion;
                scan.claim_group(ModalGroup::OverrideCtrl)?;
            }
            62 => {
                block.modal.io_control = IoControl::DigitalOnSync;
                scan.claim_group(ModalGroup::IoControl)?;
            }
            63 => {
                block.modal.io_control = IoControl::DigitalOffSync;
                scan.claim_group(ModalGroup::IoControl)?;
            }
            64 => {
                block.modal.io_control = IoControl::DigitalOnImmediate;
                scan.claim_group(ModalGroup::IoControl)?;
            }
            65 => {
                block.modal.io_control = IoControl::DigitalOffImmediate;
                scan.claim_group(ModalGroup::IoControl)?;
            }
            67 => {
                block.modal.io_control = IoControl::SetAnalogSync;
                scan.claim_group(ModalGroup::IoControl)?;
            }
            68 => {
                block.modal.io_control = IoControl::SetAnalogImmediate;
                scan.claim_group(ModalGroup::IoControl)?;
            }
            160 => {
                block.work_area = Some(true);
                scan.claim_group(ModalGroup::WorkArea)?;
            }
            161 => {
                block.work_area = Some(false);
                scan.claim_group(ModalGroup::WorkArea)?;
            }
            _ => return Err(GcodeError::UnsupportedCommand),
        }
        Ok(())
    }
}

/// `#id=value` parameter assignment, staged until the commit phase.
fn scan_param(text: &[u8], pos: &mut usize, scan: &mut Scan) -> Result<(), GcodeError> {
    let id = words::read_number(text, pos).ok_or(GcodeError::BadNumberFormat)?;
    if id < 0.0 || id != id.trunc() {
        return Err(GcodeError::BadNumberFormat);
    }
    if text.get(*pos) != Some(&b'=') {
        return Err(GcodeError::BadNumberFormat);
    }
    *pos += 1;
    let value = words::read_number(text, pos).ok_or(GcodeError::BadNumberFormat)?;
    scan.params.push((id as u32, value));
    Ok(())
}

fn scan_value_word(
    block: &mut ParsedBlock,
    scan: &mut Scan,
    letter: u8,
    value: f32,
) -> Result<(), GcodeError> {
    let word = match letter {
        b'E' => Word::E,
        b'F' => Word::F,
        b'I' => Word::I,
        b'J' => Word::J,
        b'K' => Word::K,
        b'L' => Word::L,
        b'N' => Word::N,
        b'P' => Word::P,
        b'Q' => Word::Q,
        b'R' => Word::R,
        b'T' => Word::T,
        b'U' => Word::U,
        b'X' => Word::X,
        b'Y' => Word::Y,
        b'Z' => Word::Z,
        _ => return Err(GcodeError::UnsupportedCommand),
    };
    if value < 0.0
        && matches!(word, Word::E | Word::F | Word::L | Word::N | Word::P | Word::T)
    {
        return Err(GcodeError::NegativeValue);
    }
    scan.take_word(word)?;
    match word {
        Word::E => block.values.e = value as u8,
        Word::F => block.values.f = value,
        Word::I => {
            scan.ijk_words |= 1 << X_AXIS;
            block.values.ijk[X_AXIS] = value;
        }
        Word::J => {
            scan.ijk_words |= 1 << Y_AXIS;
            block.values.ijk[Y_AXIS] = value;
        }
        Word::K => {
            scan.ijk_words |= 1 << Z_AXIS;
            block.values.ijk[Z_AXIS] = value;
        }
        Word::L => block.values.l = value as u8,
        Word::N => {
            if value != value.trunc() {
                return Err(GcodeError::BadNumberFormat);
            }
            block.values.n = value as i32;
        }
        Word::P => block.values.p = value,
        Word::Q => block.values.q = value,
        Word::R => block.values.r = value,
        Word::T => {
            if value != value.trunc() {
                return Err(GcodeError::CommandValueNotInteger);
            }
            block.values.t = value as u8;
        }
        // U is reserved by some senders; parsed and dropped
        Word::U => {}
        Word::X => {
            scan.axis_words |= 1 << X_AXIS;
            block.values.xyz[X_AXIS] = value;
        }
        Word::Y => {
            scan.axis_words |= 1 << Y_AXIS;
            block.values.xyz[Y_AXIS] = value;
        }
        Word::Z => {
            scan.axis_words |= 1 << Z_AXIS;
            block.values.xyz[Z_AXIS] = value;
        }
    }
    Ok(())
}
