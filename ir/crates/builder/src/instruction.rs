use std::fmt::{
    Display,
    Formatter,
};

use smallvec::{
    smallvec,
    SmallVec,
};
use strum::{
    Display,
    EnumIter,
    EnumString,
    EnumTryAs,
    FromRepr,
};

use crate::{
    cfg::{
        BasicBlockRef,
        InstrRef,
    },
    error::{
        BuilderError,
        Result,
    },
    Function,
    FunctionRef,
    FxIndexMap,
    Module,
    Type,
    Value,
};

/// An instruction in a basic block.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Instr {
    pub id: InstrRef,
    pub defined_in: BasicBlockRef,
    pub ty: Type,
    pub kind: InstrKind,
    /// Unique symbol for debugging purposes.
    pub symbol: String,
}

impl Display for Instr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.symbol)
    }
}

impl Instr {
    pub fn new(ty: Type, kind: InstrKind, bb: BasicBlockRef, id: InstrRef, symbol: String) -> Self {
        Self {
            id,
            defined_in: bb,
            ty,
            kind,
            symbol,
        }
    }

    pub fn value(&self) -> Value {
        Value::Instr(self.id)
    }

    pub fn is_terminator(&self) -> bool {
        self.kind.is_terminator()
    }

    pub fn is_phi(&self) -> bool {
        matches!(self.kind, InstrKind::Phi(_))
    }

    /// Returns the values this instruction consumes.
    pub fn used(&self) -> SmallVec<[Value; 2]> {
        match &self.kind {
            InstrKind::Alloca(_) => smallvec![],
            InstrKind::Store(instr) => smallvec![instr.value, instr.dest],
            InstrKind::Load(instr) => smallvec![instr.source],
            InstrKind::Bin(instr) => smallvec![instr.lhs, instr.rhs],
            InstrKind::Cmp(instr) => smallvec![instr.lhs, instr.rhs],
            InstrKind::Phi(instr) => instr.incoming.values().copied().collect(),
            InstrKind::ElementPtr(instr) => smallvec![instr.ptr, instr.index],
            InstrKind::StructElementPtr(instr) => smallvec![instr.ptr],
            InstrKind::IntToPtr(instr) => smallvec![instr.value],
            InstrKind::Cast(instr) => smallvec![instr.value],
            InstrKind::Call(instr) => instr.args.iter().copied().collect(),
            InstrKind::Ret(term) => term.value.into_iter().collect(),
            InstrKind::Br(_) => smallvec![],
            InstrKind::CondBr(term) => smallvec![term.cond],
        }
    }

    pub fn display<'a>(&'a self, module: &'a Module, function: &'a Function) -> InstrDisplay<'a> {
        InstrDisplay {
            module,
            function,
            instr: self,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, EnumTryAs)]
pub enum InstrKind {
    Alloca(AllocaInstr),
    Store(StoreInstr),
    Load(LoadInstr),
    Bin(BinOpInstr),
    Cmp(CmpInstr),
    Phi(PhiInstr),
    ElementPtr(ElementPtrInstr),
    StructElementPtr(StructElementPtrInstr),
    IntToPtr(IntToPtrInstr),
    Cast(CastInstr),
    Call(CallInstr),
    Ret(RetTerm),
    Br(BranchTerm),
    CondBr(CondBranchTerm),
}

impl InstrKind {
    pub const fn is_terminator(&self) -> bool {
        matches!(self, Self::Ret(_) | Self::Br(_) | Self::CondBr(_))
    }

    /// Blocks control may transfer to after this instruction.
    pub fn successors(&self) -> SmallVec<[BasicBlockRef; 2]> {
        match self {
            Self::Br(term) => smallvec![term.target],
            Self::CondBr(term) => SmallVec::from_buf(term.targets()),
            _ => smallvec![],
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AllocaInstr {
    pub ty: Type,
    pub num_elements: u32,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct StoreInstr {
    pub dest: Value,
    pub value: Value,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LoadInstr {
    pub source: Value,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BinOpInstr {
    pub op: BinOp,
    pub lhs: Value,
    pub rhs: Value,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CmpInstr {
    pub op: CmpOp,
    pub lhs: Value,
    pub rhs: Value,
}

/// Incoming values keyed by the predecessor control arrives from, in insertion order.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct PhiInstr {
    pub incoming: FxIndexMap<BasicBlockRef, Value>,
}

impl PhiInstr {
    pub fn operandless() -> Self {
        Self::default()
    }

    pub fn incoming_for(&self, predecessor: BasicBlockRef) -> Option<Value> {
        self.incoming.get(&predecessor).copied()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ElementPtrInstr {
    pub ptr: Value,
    pub index: Value,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct StructElementPtrInstr {
    pub ptr: Value,
    pub field: u32,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct IntToPtrInstr {
    pub value: Value,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CastInstr {
    pub kind: CastKind,
    pub value: Value,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CallInstr {
    pub callee: FunctionRef,
    pub args: SmallVec<[Value; 4]>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RetTerm {
    pub value: Option<Value>,
}

impl RetTerm {
    pub const fn new(value: Value) -> Self {
        Self { value: Some(value) }
    }

    pub const fn empty() -> Self {
        Self { value: None }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BranchTerm {
    pub target: BasicBlockRef,
}

impl BranchTerm {
    pub const fn new(target: BasicBlockRef) -> Self {
        Self { target }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CondBranchTerm {
    pub cond: Value,
    pub true_target: BasicBlockRef,
    pub false_target: BasicBlockRef,
}

impl CondBranchTerm {
    pub const fn new(cond: Value, true_target: BasicBlockRef, false_target: BasicBlockRef) -> Self {
        Self {
            cond,
            true_target,
            false_target,
        }
    }

    pub fn targets(&self) -> [BasicBlockRef; 2] {
        [self.true_target, self.false_target]
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Display, EnumString, EnumIter, FromRepr)]
#[strum(serialize_all = "lowercase")]
#[repr(u32)]
pub enum BinOp {
    Add = 0,
    Sub,
    Mul,
    UDiv,
    SDiv,
    URem,
    SRem,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
}

impl BinOp {
    /// Decodes a raw operator tag.
    pub fn from_code(code: u32) -> Result<Self> {
        Self::from_repr(code).ok_or(BuilderError::UnsupportedOp(code))
    }

    pub const fn code(self) -> u32 {
        self as u32
    }
}

/// Integer comparison predicates.
///
/// The discriminants are the predicate codes of the wrapped compiler library.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Display, EnumString, EnumIter, FromRepr)]
#[strum(serialize_all = "lowercase")]
#[repr(u32)]
pub enum CmpOp {
    Eq = 32,
    Ne,
    Ugt,
    Uge,
    Ult,
    Ule,
    Sgt,
    Sge,
    Slt,
    Sle,
}

impl CmpOp {
    pub fn from_code(code: u32) -> Result<Self> {
        Self::from_repr(code).ok_or(BuilderError::UnsupportedOp(code))
    }

    pub const fn code(self) -> u32 {
        self as u32
    }

    pub const fn is_signed(self) -> bool {
        matches!(self, Self::Sgt | Self::Sge | Self::Slt | Self::Sle)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum CastKind {
    Trunc,
    ZExt,
    SExt,
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum Const {
    Int(Type, i64),
    Null(Type),
}

impl Const {
    pub fn ty(&self) -> Type {
        match self {
            Const::Int(ty, _) | Const::Null(ty) => *ty,
        }
    }
}

impl Display for Const {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(_, value) => write!(f, "{}", value),
            Self::Null(_) => write!(f, "null"),
        }
    }
}

pub struct InstrDisplay<'a> {
    module: &'a Module,
    function: &'a Function,
    instr: &'a Instr,
}

impl InstrDisplay<'_> {
    fn ty(&self, ty: Type) -> impl Display + '_ {
        self.module.types.display(ty)
    }

    fn name(&self, value: Value) -> impl Display + '_ {
        value.display(self.function)
    }

    /// Writes `value` prefixed with its type.
    fn operand(&self, f: &mut Formatter<'_>, value: Value) -> std::fmt::Result {
        match self.function.value_ty(value) {
            Some(ty) => write!(f, "{} {}", self.ty(ty), self.name(value)),
            None => write!(f, "{}", self.name(value)),
        }
    }

    fn block(&self, bb: BasicBlockRef) -> &str {
        self.function
            .cfg
            .basic_blocks
            .get(bb)
            .map_or("<unknown>", |bb| bb.symbol.as_str())
    }
}

impl Display for InstrDisplay<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let instr = self.instr;
        let produces_value = !instr.is_terminator() && !self.module.types.is_void(instr.ty);
        if produces_value {
            write!(f, "{} = ", instr)?;
        }
        match &instr.kind {
            InstrKind::Alloca(alloca) => {
                write!(f, "alloca {}", self.ty(alloca.ty))?;
                if alloca.num_elements != 1 {
                    write!(f, ", {}", alloca.num_elements)?;
                }
            }
            InstrKind::Store(store) => {
                write!(f, "store ")?;
                self.operand(f, store.value)?;
                write!(f, ", ")?;
                self.operand(f, store.dest)?;
            }
            InstrKind::Load(load) => {
                write!(f, "load {}, ", self.ty(instr.ty))?;
                self.operand(f, load.source)?;
            }
            InstrKind::Bin(bin) => {
                write!(
                    f,
                    "{} {} {}, {}",
                    bin.op,
                    self.ty(instr.ty),
                    self.name(bin.lhs),
                    self.name(bin.rhs)
                )?;
            }
            InstrKind::Cmp(cmp) => {
                write!(f, "icmp {} ", cmp.op)?;
                self.operand(f, cmp.lhs)?;
                write!(f, ", {}", self.name(cmp.rhs))?;
            }
            InstrKind::Phi(phi) => {
                write!(f, "phi {}", self.ty(instr.ty))?;
                for (index, (bb, value)) in phi.incoming.iter().enumerate() {
                    if index > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, " [{}, {}]", self.name(*value), self.block(*bb))?;
                }
            }
            InstrKind::ElementPtr(gep) => {
                write!(f, "gep ")?;
                self.operand(f, gep.ptr)?;
                write!(f, ", ")?;
                self.operand(f, gep.index)?;
            }
            InstrKind::StructElementPtr(gep) => {
                write!(f, "struct_gep ")?;
                self.operand(f, gep.ptr)?;
                write!(f, ", {}", gep.field)?;
            }
            InstrKind::IntToPtr(cast) => {
                write!(f, "inttoptr ")?;
                self.operand(f, cast.value)?;
                write!(f, " to {}", self.ty(instr.ty))?;
            }
            InstrKind::Cast(cast) => {
                write!(f, "{} ", cast.kind)?;
                self.operand(f, cast.value)?;
                write!(f, " to {}", self.ty(instr.ty))?;
            }
            InstrKind::Call(call) => {
                let callee = self
                    .module
                    .functions
                    .get(call.callee)
                    .map_or("<unknown>", |callee| callee.name.as_str());
                write!(f, "call {} @{}(", self.ty(instr.ty), callee)?;
                for (index, arg) in call.args.iter().enumerate() {
                    if index > 0 {
                        write!(f, ", ")?;
                    }
                    self.operand(f, *arg)?;
                }
                write!(f, ")")?;
            }
            InstrKind::Ret(ret) => match ret.value {
                Some(value) => {
                    write!(f, "ret ")?;
                    self.operand(f, value)?;
                }
                None => write!(f, "ret void")?,
            },
            InstrKind::Br(br) => {
                write!(f, "br {}", self.block(br.target))?;
            }
            InstrKind::CondBr(br) => {
                write!(f, "condbr ")?;
                self.operand(f, br.cond)?;
                write!(
                    f,
                    ", {}, {}",
                    self.block(br.true_target),
                    self.block(br.false_target)
                )?;
            }
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn should_decode_every_bin_op_code() {
        for op in BinOp::iter() {
            assert_eq!(BinOp::from_code(op.code()), Ok(op));
        }
        assert_eq!(
            BinOp::from_code(BinOp::AShr.code() + 1),
            Err(BuilderError::UnsupportedOp(13))
        );
    }

    #[test]
    fn should_decode_library_predicate_codes() {
        assert_eq!(CmpOp::from_code(32), Ok(CmpOp::Eq));
        assert_eq!(CmpOp::from_code(36), Ok(CmpOp::Ult));
        assert_eq!(CmpOp::from_code(41), Ok(CmpOp::Sle));
        assert_eq!(CmpOp::from_code(0), Err(BuilderError::UnsupportedOp(0)));
        assert_eq!(CmpOp::from_code(42), Err(BuilderError::UnsupportedOp(42)));
    }

    #[test]
    fn should_parse_operator_mnemonics() {
        assert_eq!("lshr".parse::<BinOp>(), Ok(BinOp::LShr));
        assert_eq!("sge".parse::<CmpOp>(), Ok(CmpOp::Sge));
        assert_eq!(BinOp::UDiv.to_string(), "udiv");
        assert_eq!(CastKind::SExt.to_string(), "sext");
    }
}
