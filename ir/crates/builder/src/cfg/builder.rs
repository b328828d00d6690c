use tracing::trace;

use crate::{
    cfg::{
        BasicBlockRef,
        InstrRef,
        KeySpace,
    },
    error::{
        BuilderError,
        Result,
        StateViolation,
    },
    instruction::{
        AllocaInstr,
        BinOp,
        BinOpInstr,
        BranchTerm,
        CallInstr,
        CastInstr,
        CastKind,
        CmpInstr,
        CmpOp,
        CondBranchTerm,
        ElementPtrInstr,
        IntToPtrInstr,
        LoadInstr,
        PhiInstr,
        RetTerm,
        StoreInstr,
        StructElementPtrInstr,
    },
    Function,
    FunctionRef,
    InstrKind,
    Module,
    Type,
    Value,
};

/// Where the next instruction goes.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum InsertPoint {
    /// After the last non-terminator instruction of the block.
    End(BasicBlockRef),
    /// Directly in front of the given instruction.
    Before(InstrRef),
}

/// A resolved [`InsertPoint`].
#[derive(Debug, Copy, Clone)]
struct Cursor {
    bb: BasicBlockRef,
    position: usize,
    at_end: bool,
}

/// Appends type-checked instructions at a movable insertion point.
///
/// The builder borrows the [`Module`] but owns nothing inside it, so it can be dropped
/// and recreated at any time. All checks run before the function is modified: an
/// operation that returns `Err` leaves the function untouched.
#[derive(Debug)]
pub struct Builder<'module> {
    module: &'module mut Module,
    function: FunctionRef,
    insert_point: Option<InsertPoint>,
}

impl<'module> Builder<'module> {
    pub fn new(module: &'module mut Module, function: FunctionRef) -> Self {
        Self {
            module,
            function,
            insert_point: None,
        }
    }

    pub fn function_ref(&self) -> FunctionRef {
        self.function
    }

    /// # Panics
    ///
    /// If the builder's function has been removed from the module.
    pub fn create_block(&mut self, symbol: impl Into<String>) -> BasicBlockRef {
        let (function, keys) = self.func_and_keys();
        function.cfg.new_basic_block(keys, symbol.into())
    }

    /// Positions the cursor at the end of `bb`.
    ///
    /// Sealed blocks are accepted here; appending to them fails later with
    /// [`BuilderError::AlreadySealed`].
    pub fn set_insert_point(&mut self, bb: BasicBlockRef) -> Result<()> {
        if !self.func()?.cfg.basic_blocks.contains_key(bb) {
            return Err(StateViolation::UnknownBlock.into());
        }
        self.insert_point = Some(InsertPoint::End(bb));
        Ok(())
    }

    /// Positions the cursor directly in front of `instr`, which must not be a terminator.
    pub fn set_insert_point_before(&mut self, instr: InstrRef) -> Result<()> {
        let instr = self
            .func()?
            .cfg
            .instructions
            .get(instr)
            .ok_or(StateViolation::UnknownInstr)?;
        if instr.is_terminator() {
            return Err(StateViolation::TerminatorNotAtEnd.into());
        }
        self.insert_point = Some(InsertPoint::Before(instr.id));
        Ok(())
    }

    pub fn clear_insert_point(&mut self) {
        self.insert_point = None;
    }

    pub fn insert_point(&self) -> Option<InsertPoint> {
        self.insert_point
    }

    /// The block the cursor currently points into.
    pub fn insert_block(&self) -> Option<BasicBlockRef> {
        match self.insert_point? {
            InsertPoint::End(bb) => Some(bb),
            InsertPoint::Before(instr) => self
                .module
                .functions
                .get(self.function)?
                .cfg
                .instructions
                .get(instr)
                .map(|instr| instr.defined_in),
        }
    }

    pub fn const_int(&mut self, ty: Type, value: i64) -> Result<Value> {
        let Module {
            types,
            functions,
            keys,
        } = &mut *self.module;
        functions
            .get_mut(self.function)
            .ok_or(StateViolation::UnknownFunction)?
            .const_int(keys, types, ty, value)
    }

    pub fn const_bool(&mut self, value: bool) -> Result<Value> {
        let bool = self.module.types.bool();
        self.const_int(bool, value as i64)
    }

    pub fn const_null(&mut self, ty: Type) -> Result<Value> {
        let Module {
            types,
            functions,
            keys,
        } = &mut *self.module;
        functions
            .get_mut(self.function)
            .ok_or(StateViolation::UnknownFunction)?
            .const_null(keys, types, ty)
    }

    pub fn param(&self, index: usize) -> Result<Value> {
        self.func()?
            .param(index)
            .ok_or(StateViolation::UnknownParam.into())
    }

    pub fn create_binary_op(&mut self, op: BinOp, lhs: Value, rhs: Value) -> Result<Value> {
        let cursor = self.cursor()?;
        let ty = self.ty_of(lhs)?;
        self.expect_int(ty)?;
        self.expect_ty(ty, self.ty_of(rhs)?)?;
        self.insert(cursor, ty, InstrKind::Bin(BinOpInstr { op, lhs, rhs }))
    }

    /// Like [`Builder::create_binary_op`], but takes a raw operator tag.
    pub fn create_binary_op_by_code(&mut self, code: u32, lhs: Value, rhs: Value) -> Result<Value> {
        self.create_binary_op(BinOp::from_code(code)?, lhs, rhs)
    }

    pub fn create_add(&mut self, lhs: Value, rhs: Value) -> Result<Value> {
        self.create_binary_op(BinOp::Add, lhs, rhs)
    }

    pub fn create_sub(&mut self, lhs: Value, rhs: Value) -> Result<Value> {
        self.create_binary_op(BinOp::Sub, lhs, rhs)
    }

    pub fn create_mul(&mut self, lhs: Value, rhs: Value) -> Result<Value> {
        self.create_binary_op(BinOp::Mul, lhs, rhs)
    }

    /// Compares two integers or two pointers. The result is a `bool`.
    pub fn create_compare(&mut self, op: CmpOp, lhs: Value, rhs: Value) -> Result<Value> {
        let cursor = self.cursor()?;
        let ty = self.ty_of(lhs)?;
        if !self.module.types.is_int(ty) && !self.module.types.is_ptr(ty) {
            return Err(self.mismatch("an integer or pointer type", ty));
        }
        self.expect_ty(ty, self.ty_of(rhs)?)?;
        let bool = self.module.types.bool();
        self.insert(cursor, bool, InstrKind::Cmp(CmpInstr { op, lhs, rhs }))
    }

    pub fn create_compare_by_code(&mut self, code: u32, lhs: Value, rhs: Value) -> Result<Value> {
        self.create_compare(CmpOp::from_code(code)?, lhs, rhs)
    }

    pub fn create_icmp_eq(&mut self, lhs: Value, rhs: Value) -> Result<Value> {
        self.create_compare(CmpOp::Eq, lhs, rhs)
    }

    pub fn create_icmp_ult(&mut self, lhs: Value, rhs: Value) -> Result<Value> {
        self.create_compare(CmpOp::Ult, lhs, rhs)
    }

    /// Creates a phi without incoming values.
    ///
    /// Phis must head their block: creating one after a non-phi instruction fails.
    pub fn create_phi(&mut self, ty: Type) -> Result<InstrRef> {
        let cursor = self.cursor()?;
        if self.func()?.is_cfg_finalized() {
            return Err(StateViolation::CfgFinalized.into());
        }
        self.expect_sized(ty)?;
        let phi = self.insert_instr(cursor, ty, InstrKind::Phi(PhiInstr::operandless()))?;
        self.func_mut().phis_mut().track(phi);
        Ok(phi)
    }

    /// Records that `phi` takes `value` when control arrives from `predecessor`.
    pub fn add_incoming(
        &mut self,
        phi: InstrRef,
        value: Value,
        predecessor: BasicBlockRef,
    ) -> Result<()> {
        let function = self.func()?;
        if function.is_cfg_finalized() {
            return Err(StateViolation::CfgFinalized.into());
        }
        let instr = function
            .cfg
            .instructions
            .get(phi)
            .ok_or(StateViolation::UnknownInstr)?;
        let phi_instr = instr
            .kind
            .try_as_phi_ref()
            .ok_or(StateViolation::NotAPhi)?;
        if !function.cfg.basic_blocks.contains_key(predecessor) {
            return Err(StateViolation::UnknownBlock.into());
        }
        self.expect_ty(instr.ty, self.ty_of(value)?)?;
        if phi_instr.incoming.contains_key(&predecessor) {
            return Err(BuilderError::DuplicatePredecessor { phi, predecessor });
        }
        trace!("Adding incoming value to phi {}", instr.symbol);
        if let Some(phi_instr) = self.func_mut().cfg.instructions[phi]
            .kind
            .try_as_phi_mut()
        {
            phi_instr.incoming.insert(predecessor, value);
        }
        Ok(())
    }

    /// Seals the current block with a return.
    ///
    /// `value` must match the function's return type; `None` is only valid for void functions.
    /// A void function returns with `None`, never with a void-typed value.
    pub fn create_return(&mut self, value: Option<Value>) -> Result<InstrRef> {
        let cursor = self.cursor()?;
        let ret_ty = self.func()?.ret_ty;
        match value {
            Some(value) => {
                let ty = self.ty_of(value)?;
                if self.module.types.is_void(ty) {
                    return Err(self.mismatch("a non-void value", ty));
                }
                self.expect_ty(ret_ty, ty)?;
            }
            None => {
                let void = self.module.types.void();
                self.expect_ty(ret_ty, void)?;
            }
        }
        let term = value.map_or_else(RetTerm::empty, RetTerm::new);
        self.terminate(cursor, InstrKind::Ret(term))
    }

    pub fn create_branch(&mut self, target: BasicBlockRef) -> Result<InstrRef> {
        let cursor = self.cursor()?;
        self.expect_block(target)?;
        self.terminate(cursor, InstrKind::Br(BranchTerm::new(target)))
    }

    pub fn create_conditional_branch(
        &mut self,
        cond: Value,
        true_target: BasicBlockRef,
        false_target: BasicBlockRef,
    ) -> Result<InstrRef> {
        let cursor = self.cursor()?;
        let cond_ty = self.ty_of(cond)?;
        if !self.module.types.is_bool(cond_ty) {
            return Err(self.mismatch("bool", cond_ty));
        }
        self.expect_block(true_target)?;
        self.expect_block(false_target)?;
        self.terminate(
            cursor,
            InstrKind::CondBr(CondBranchTerm::new(cond, true_target, false_target)),
        )
    }

    /// Reserves stack storage for `num_elements` contiguous values of `ty`.
    pub fn create_alloca(&mut self, ty: Type, num_elements: u32) -> Result<Value> {
        let cursor = self.cursor()?;
        self.expect_sized(ty)?;
        let ptr = self.module.types.ptr(ty);
        self.insert(
            cursor,
            ptr,
            InstrKind::Alloca(AllocaInstr { ty, num_elements }),
        )
    }

    pub fn create_load(&mut self, source: Value) -> Result<Value> {
        let cursor = self.cursor()?;
        let pointee = self.expect_ptr(self.ty_of(source)?)?;
        self.expect_sized(pointee)?;
        self.insert(cursor, pointee, InstrKind::Load(LoadInstr { source }))
    }

    pub fn create_store(&mut self, value: Value, dest: Value) -> Result<Value> {
        let cursor = self.cursor()?;
        let pointee = self.expect_ptr(self.ty_of(dest)?)?;
        self.expect_sized(pointee)?;
        self.expect_ty(pointee, self.ty_of(value)?)?;
        let void = self.module.types.void();
        self.insert(cursor, void, InstrKind::Store(StoreInstr { dest, value }))
    }

    /// Offsets `ptr` by `index` elements of its pointee type.
    pub fn create_element_pointer(&mut self, ptr: Value, index: Value) -> Result<Value> {
        let cursor = self.cursor()?;
        let ptr_ty = self.ty_of(ptr)?;
        self.expect_ptr(ptr_ty)?;
        self.expect_int(self.ty_of(index)?)?;
        self.insert(
            cursor,
            ptr_ty,
            InstrKind::ElementPtr(ElementPtrInstr { ptr, index }),
        )
    }

    /// Computes the address of field `field` of the struct `ptr` points to.
    pub fn create_struct_element_pointer(&mut self, ptr: Value, field: u32) -> Result<Value> {
        let cursor = self.cursor()?;
        let pointee = self.expect_ptr(self.ty_of(ptr)?)?;
        let Some(fields) = self.module.types.struct_fields(pointee) else {
            return Err(self.mismatch("a pointer to a struct", self.ty_of(ptr)?));
        };
        let field_ty = *fields
            .get(field as usize)
            .ok_or(BuilderError::FieldOutOfBounds {
                field,
                count: fields.len(),
            })?;
        let field_ptr = self.module.types.ptr(field_ty);
        self.insert(
            cursor,
            field_ptr,
            InstrKind::StructElementPtr(StructElementPtrInstr { ptr, field }),
        )
    }

    /// Reinterprets an integer as a pointer. Range and alignment are not checked.
    pub fn create_int_to_pointer(&mut self, value: Value, target: Type) -> Result<Value> {
        let cursor = self.cursor()?;
        self.expect_int(self.ty_of(value)?)?;
        self.expect_ptr(target)?;
        self.insert(cursor, target, InstrKind::IntToPtr(IntToPtrInstr { value }))
    }

    /// Truncates or extends an integer to the width of `target`.
    ///
    /// `is_signed` selects sign over zero extension and is irrelevant when narrowing.
    /// Casting to the same width emits nothing and returns `value` itself.
    pub fn create_int_cast(&mut self, value: Value, target: Type, is_signed: bool) -> Result<Value> {
        let cursor = self.cursor()?;
        let from = self.expect_int(self.ty_of(value)?)?;
        let to = self.expect_int(target)?;
        let kind = match from.cmp(&to) {
            std::cmp::Ordering::Equal => return Ok(value),
            std::cmp::Ordering::Greater => CastKind::Trunc,
            std::cmp::Ordering::Less if is_signed => CastKind::SExt,
            std::cmp::Ordering::Less => CastKind::ZExt,
        };
        self.insert(cursor, target, InstrKind::Cast(CastInstr { kind, value }))
    }

    pub fn create_call(&mut self, callee: FunctionRef, args: &[Value]) -> Result<Value> {
        let cursor = self.cursor()?;
        let callee_ty = self
            .module
            .functions
            .get(callee)
            .ok_or(StateViolation::UnknownFunction)?
            .ty;
        let Some((param_tys, ret_ty)) = self.module.types.signature(callee_ty) else {
            return Err(self.mismatch("a function type", callee_ty));
        };
        if param_tys.len() != args.len() {
            return Err(BuilderError::ArityMismatch {
                expected: param_tys.len(),
                actual: args.len(),
            });
        }
        for (param_ty, arg) in param_tys.iter().zip(args) {
            self.expect_ty(*param_ty, self.ty_of(*arg)?)?;
        }
        self.insert(
            cursor,
            ret_ty,
            InstrKind::Call(CallInstr {
                callee,
                args: args.iter().copied().collect(),
            }),
        )
    }

    fn func(&self) -> Result<&Function> {
        self.module
            .functions
            .get(self.function)
            .ok_or(StateViolation::UnknownFunction.into())
    }

    /// Only called after [`Builder::cursor`] or [`Builder::func`] proved the function exists.
    fn func_mut(&mut self) -> &mut Function {
        &mut self.module.functions[self.function]
    }

    /// Same precondition as [`Builder::func_mut`].
    fn func_and_keys(&mut self) -> (&mut Function, &mut KeySpace) {
        let module = &mut *self.module;
        (&mut module.functions[self.function], &mut module.keys)
    }

    fn cursor(&self) -> Result<Cursor> {
        let function = self.func()?;
        let insert_point = self.insert_point.ok_or(StateViolation::NoInsertPoint)?;
        let (bb, position, at_end) = match insert_point {
            InsertPoint::End(bb) => {
                let block = function
                    .cfg
                    .basic_blocks
                    .get(bb)
                    .ok_or(StateViolation::UnknownBlock)?;
                (bb, block.instructions.len(), true)
            }
            InsertPoint::Before(instr) => {
                let bb = function
                    .cfg
                    .instructions
                    .get(instr)
                    .ok_or(StateViolation::UnknownInstr)?
                    .defined_in;
                let position = function.cfg.basic_blocks[bb]
                    .position_of(instr)
                    .ok_or(StateViolation::UnknownInstr)?;
                (bb, position, false)
            }
        };
        if function.cfg.basic_blocks[bb].is_sealed() {
            return Err(BuilderError::AlreadySealed(bb));
        }
        Ok(Cursor {
            bb,
            position,
            at_end,
        })
    }

    fn insert(&mut self, cursor: Cursor, ty: Type, kind: InstrKind) -> Result<Value> {
        self.insert_instr(cursor, ty, kind).map(Value::Instr)
    }

    fn insert_instr(&mut self, cursor: Cursor, ty: Type, kind: InstrKind) -> Result<InstrRef> {
        let phi_count = self.func()?.cfg.phi_count(cursor.bb);
        let is_phi = matches!(kind, InstrKind::Phi(_));
        if is_phi && cursor.position > phi_count {
            return Err(StateViolation::LatePhi.into());
        }
        if !is_phi && cursor.position < phi_count {
            return Err(StateViolation::NonPhiBeforePhi.into());
        }
        let (function, keys) = self.func_and_keys();
        Ok(function
            .cfg
            .insert_instruction(keys, cursor.bb, cursor.position, ty, kind))
    }

    fn terminate(&mut self, cursor: Cursor, kind: InstrKind) -> Result<InstrRef> {
        if !cursor.at_end {
            return Err(StateViolation::TerminatorNotAtEnd.into());
        }
        let void = self.module.types.void();
        let (function, keys) = self.func_and_keys();
        Ok(function.cfg.set_terminator(keys, cursor.bb, void, kind))
    }

    fn ty_of(&self, value: Value) -> Result<Type> {
        self.func()?
            .value_ty(value)
            .ok_or(StateViolation::UnknownValue.into())
    }

    fn expect_block(&self, bb: BasicBlockRef) -> Result<()> {
        if self.func()?.cfg.basic_blocks.contains_key(bb) {
            Ok(())
        } else {
            Err(StateViolation::UnknownBlock.into())
        }
    }

    fn expect_ty(&self, expected: Type, actual: Type) -> Result<()> {
        if expected == actual {
            Ok(())
        } else {
            Err(BuilderError::TypeMismatch {
                expected: self.module.types.display(expected).to_string(),
                actual: self.module.types.display(actual).to_string(),
            })
        }
    }

    /// Returns the bit width of `ty`.
    fn expect_int(&self, ty: Type) -> Result<u32> {
        self.module
            .types
            .int_bits(ty)
            .ok_or_else(|| self.mismatch("an integer type", ty))
    }

    /// Returns the pointee of `ty`.
    fn expect_ptr(&self, ty: Type) -> Result<Type> {
        self.module
            .types
            .pointee(ty)
            .ok_or_else(|| self.mismatch("a pointer type", ty))
    }

    fn expect_sized(&self, ty: Type) -> Result<()> {
        if self.module.types.is_sized(ty) {
            Ok(())
        } else {
            Err(self.mismatch("a sized type", ty))
        }
    }

    fn mismatch(&self, expected: &str, actual: Type) -> BuilderError {
        BuilderError::TypeMismatch {
            expected: expected.to_string(),
            actual: self.module.types.display(actual).to_string(),
        }
    }
}
