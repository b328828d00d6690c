use std::hash::BuildHasherDefault;

use derive_more::From;
pub use error::{
    BuilderError,
    Result,
    StateViolation,
};
pub use function::Function;
pub use instruction::{
    Instr,
    InstrKind,
};
pub use module::{
    FunctionRef,
    Module,
};
pub use phi::PhiResolver;
use rustc_hash::FxHasher;
pub use ty::{
    Type,
    TypeData,
    Types,
};

use crate::cfg::{
    ConstRef,
    InstrRef,
    ParamRef,
};

pub mod cfg;
pub mod error;
pub mod function;
pub mod instruction;
pub mod interp;
pub mod module;
pub mod phi;
pub mod ty;
pub mod verifier;


pub(crate) type FxIndexMap<K, V> = indexmap::IndexMap<K, V, BuildHasherDefault<FxHasher>>;
pub(crate) type FxIndexSet<T> = indexmap::IndexSet<T, BuildHasherDefault<FxHasher>>;

/// Handle to anything that can be used as an operand.
///
/// Values are immutable once created. Their identity is the arena key,
/// never the textual symbol.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, From)]
pub enum Value {
    Instr(InstrRef),
    Const(ConstRef),
    Param(ParamRef),
}

impl Value {
    pub fn display<'a>(&self, function: &'a Function) -> ValueDisplay<'a> {
        ValueDisplay(function, *self)
    }

    pub fn as_instr(&self) -> Option<InstrRef> {
        match self {
            Value::Instr(instr) => Some(*instr),
            _ => None,
        }
    }
}

pub struct ValueDisplay<'a>(&'a Function, Value);

impl std::fmt::Display for ValueDisplay<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cfg = &self.0.cfg;
        match self.1 {
            Value::Instr(instr) => match cfg.instructions.get(instr) {
                Some(instr) => write!(f, "{}", instr),
                None => write!(f, "<dangling>"),
            },
            Value::Const(constant) => match cfg.constants.get(constant) {
                Some(constant) => write!(f, "{}", constant),
                None => write!(f, "<dangling>"),
            },
            Value::Param(param) => match cfg.params.get(param) {
                Some(param) => write!(f, "{}", param),
                None => write!(f, "<dangling>"),
            },
        }
    }
}
