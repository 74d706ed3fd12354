// src/gcode/mod.rs - Line-level g-code interpreter

pub mod modal;
pub mod parser;
pub mod words;


pub use parser::GcodeParser;

use thiserror::Error;

use crate::motion::MotionError;

/// Everything that can make a line fail. Parse and validation errors leave
/// the committed state untouched; execution errors surface from the motion
/// layer after a partial commit.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GcodeError {
    #[error("expected a command letter")]
    ExpectedCommandLetter,
    #[error("bad number format")]
    BadNumberFormat,
    #[error("word value cannot be negative")]
    NegativeValue,
    #[error("word repeated in block")]
    WordRepeated,
    #[error("two commands from the same modal group in one block")]
    ModalGroupViolation,
    #[error("two commands competing for the axis words")]
    AxisCommandConflict,
    #[error("unsupported or invalid g-code command")]
    UnsupportedCommand,
    #[error("command value is not an integer")]
    CommandValueNotInteger,
    #[error("line number out of range")]
    InvalidLineNumber,
    #[error("feed rate is undefined")]
    UndefinedFeedRate,
    #[error("a required value word is missing")]
    ValueWordMissing,
    #[error("no axis words in block")]
    NoAxisWords,
    #[error("no axis words in the active plane")]
    NoAxisWordsInPlane,
    #[error("no arc offsets in the active plane")]
    NoOffsetsInPlane,
    #[error("axis words are not allowed in this block")]
    AxisWordsExist,
    #[error("invalid arc radius")]
    ArcRadiusError,
    #[error("invalid motion target")]
    InvalidTarget,
    #[error("unused value words in block")]
    UnusedWords,
    #[error("G43.1 takes exactly one Z axis word")]
    G43DynamicAxisError,
    #[error("unsupported coordinate system")]
    UnsupportedCoordSystem,
    #[error("G53 requires G0 or G1")]
    G53InvalidMotionMode,
    #[error("invalid jog command")]
    InvalidJogCommand,
    #[error("tool change requires a T word")]
    ToolChangeRequiresToolNumber,
    #[error("tool number exceeds the rack size")]
    UnsupportedToolNumber,
    #[error("tool change failed")]
    ToolChangeFailed,
    #[error("P value exceeds the allowed maximum")]
    PParamMaxExceeded,
    #[error("system reset during block execution")]
    Reset,
    #[error("motion error: {0}")]
    Motion(MotionError),
}

impl From<MotionError> for GcodeError {
    fn from(err: MotionError) -> Self {
        match err {
            MotionError::Reset => GcodeError::Reset,
            other => GcodeError::Motion(other),
        }
    }
}
