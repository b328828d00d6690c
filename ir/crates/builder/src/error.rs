use strum::Display;
use thiserror::Error;

use crate::cfg::{
    BasicBlockRef,
    InstrRef,
};

pub type Result<T, E = BuilderError> = std::result::Result<T, E>;

/// Contract violations reported by the [`Builder`][`crate::cfg::Builder`].
///
/// Every check runs before the function is touched, so an `Err` never leaves a
/// partially built instruction behind.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum BuilderError {
    #[error("type mismatch: expected {expected}, found {actual}")]
    TypeMismatch { expected: String, actual: String },
    #[error("expected {expected} argument(s), got {actual}")]
    ArityMismatch { expected: usize, actual: usize },
    #[error("unsupported operator code {0}")]
    UnsupportedOp(u32),
    #[error("basic block {0:?} already has a terminator")]
    AlreadySealed(BasicBlockRef),
    #[error("invalid builder state: {0}")]
    InvalidState(StateViolation),
    #[error("phi {phi:?} already has an incoming value for {predecessor:?}")]
    DuplicatePredecessor {
        phi: InstrRef,
        predecessor: BasicBlockRef,
    },
    #[error("field {field} is out of bounds for a struct with {count} field(s)")]
    FieldOutOfBounds { field: u32, count: usize },
}

impl From<StateViolation> for BuilderError {
    fn from(violation: StateViolation) -> Self {
        Self::InvalidState(violation)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Display)]
pub enum StateViolation {
    #[strum(serialize = "no insert point is set")]
    NoInsertPoint,
    #[strum(serialize = "unknown function")]
    UnknownFunction,
    #[strum(serialize = "unknown basic block")]
    UnknownBlock,
    #[strum(serialize = "unknown instruction")]
    UnknownInstr,
    #[strum(serialize = "value does not belong to this function")]
    UnknownValue,
    #[strum(serialize = "parameter index out of range")]
    UnknownParam,
    #[strum(serialize = "instruction is not a phi")]
    NotAPhi,
    #[strum(serialize = "phis must precede all other instructions of a block")]
    LatePhi,
    #[strum(serialize = "cannot insert an instruction in front of a phi")]
    NonPhiBeforePhi,
    #[strum(serialize = "terminators can only be appended at the end of a block")]
    TerminatorNotAtEnd,
    #[strum(serialize = "the control flow graph has been finalized")]
    CfgFinalized,
}
