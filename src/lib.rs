//! G-code execution pipeline for a CNC pen-plotter motion controller.
//!
//! Raw command lines are normalized, parsed against a persistent modal state,
//! validated as a whole (no line is ever partially applied), and dispatched to
//! the motion layer as linear moves, arcs, dwells, probe cycles, or automated
//! pen-change sequences. Travel is gated by a soft-limit guard that accounts
//! for the tool-change envelope and an optional work-area envelope.

pub mod config;
pub mod gcode;
pub mod motion;
pub mod persistence;
pub mod system;

pub const N_AXIS: usize = 3;
pub const X_AXIS: usize = 0;
pub const Y_AXIS: usize = 1;
pub const Z_AXIS: usize = 2;
pub const AXIS_NAMES: [char; N_AXIS] = ['X', 'Y', 'Z'];

/// Absolute machine-frame coordinates in millimeters.
pub type Position = [f32; N_AXIS];

pub const MM_PER_INCH: f32 = 25.4;
