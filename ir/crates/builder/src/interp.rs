//! A reference interpreter for built functions.
//!
//! Values are held as `u64` bit patterns, masked to the width of their type.
//! Memory is a single byte-addressed stack that starts above address zero, so
//! dereferencing null always faults.

use anyhow::{
    anyhow,
    bail,
    Result,
};
use rustc_hash::FxHashMap;
use tracing::{
    debug,
    trace,
};

use crate::{
    cfg::BasicBlockRef,
    instruction::{
        BinOp,
        CastKind,
        CmpOp,
        Const,
        Instr,
    },
    Function,
    FunctionRef,
    InstrKind,
    Module,
    Type,
    Value,
};

const STACK_BASE: u64 = 0x1000;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct InterpreterConfig {
    /// Upper bound on executed instructions per [`Interpreter::run`], terminators included.
    pub max_steps: u64,
    pub max_call_depth: usize,
    /// Stack size in bytes.
    pub stack_size: usize,
}

impl InterpreterConfig {
    pub const fn new(max_steps: u64, max_call_depth: usize, stack_size: usize) -> Self {
        Self {
            max_steps,
            max_call_depth,
            stack_size,
        }
    }

    pub const fn small() -> Self {
        Self::new(10_000, 16, 4 * 1024)
    }

    pub const fn large() -> Self {
        Self::new(100_000_000, 4096, 16 * 1024 * 1024)
    }
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self::new(1_000_000, 256, 64 * 1024)
    }
}

type Frame = FxHashMap<Value, u64>;

pub struct Interpreter<'module> {
    module: &'module Module,
    config: InterpreterConfig,
    memory: Vec<u8>,
    /// Address of the first free stack byte.
    stack_top: u64,
    steps: u64,
    depth: usize,
}

impl<'module> Interpreter<'module> {
    pub fn new(module: &'module Module, config: InterpreterConfig) -> Self {
        Self {
            module,
            config,
            memory: vec![0; config.stack_size],
            stack_top: STACK_BASE,
            steps: 0,
            depth: 0,
        }
    }

    /// Runs `function` with `arguments` and returns its result, or `None` for void functions.
    pub fn run(&mut self, function: FunctionRef, arguments: &[u64]) -> Result<Option<u64>> {
        self.steps = 0;
        self.depth = 0;
        self.stack_top = STACK_BASE;
        self.memory.fill(0);
        let result = self.call(function, arguments)?;
        debug!("Finished after {} step(s) with result {:?}", self.steps, result);
        Ok(result)
    }

    fn call(&mut self, function_ref: FunctionRef, arguments: &[u64]) -> Result<Option<u64>> {
        let module = self.module;
        let function = module
            .functions
            .get(function_ref)
            .ok_or_else(|| anyhow!("Function not found"))?;
        if function.params.len() != arguments.len() {
            bail!(
                "Invalid number of arguments for {}. Expected {}, got {}",
                function.name,
                function.params.len(),
                arguments.len()
            );
        }
        if self.depth >= self.config.max_call_depth {
            bail!(
                "Call depth limit of {} exceeded in {}",
                self.config.max_call_depth,
                function.name
            );
        }
        debug!("Calling {} with arguments {:?}", function.name, arguments);
        let mut frame = Frame::default();
        for (param, argument) in function.params.iter().zip(arguments) {
            let ty = function.cfg.params[*param].ty;
            frame.insert(Value::Param(*param), self.truncate(*argument, ty));
        }
        let saved_stack_top = self.stack_top;
        self.depth += 1;
        let result = self.execute(function, &mut frame);
        self.depth -= 1;
        self.stack_top = saved_stack_top;
        result
    }

    fn execute(&mut self, function: &'module Function, frame: &mut Frame) -> Result<Option<u64>> {
        let mut bb_ref = function
            .cfg
            .entry_block()
            .ok_or_else(|| anyhow!("{} has no basic blocks", function.name))?;
        let mut came_from: Option<BasicBlockRef> = None;
        loop {
            let bb = &function.cfg.basic_blocks[bb_ref];
            trace!("Entering {} of {}", bb, function.name);
            let phi_count = function.cfg.phi_count(bb_ref);
            // Phis read their operands before any of them is written.
            let mut phi_values = Vec::with_capacity(phi_count);
            for instr_ref in bb.instructions().take(phi_count) {
                self.step()?;
                let instr = &function.cfg.instructions[instr_ref];
                let pred = came_from
                    .ok_or_else(|| anyhow!("Phi {} reached without a predecessor", instr))?;
                let incoming = instr
                    .kind
                    .try_as_phi_ref()
                    .and_then(|phi| phi.incoming_for(pred))
                    .ok_or_else(|| {
                        anyhow!(
                            "Phi {} has no incoming value for {}",
                            instr,
                            function.cfg.basic_blocks[pred]
                        )
                    })?;
                phi_values.push((instr_ref, self.eval(function, frame, incoming)?));
            }
            for (phi, value) in phi_values {
                frame.insert(Value::Instr(phi), value);
            }
            for instr_ref in bb.instructions().skip(phi_count) {
                self.step()?;
                let instr = &function.cfg.instructions[instr_ref];
                if let Some(value) = self.exec_instr(function, frame, instr)? {
                    frame.insert(instr.value(), value);
                }
            }
            let terminator = bb
                .terminator()
                .ok_or_else(|| anyhow!("Missing terminator in {} of {}", bb, function.name))?;
            self.step()?;
            let next = match &function.cfg.instructions[terminator].kind {
                InstrKind::Ret(ret) => {
                    return ret
                        .value
                        .map(|value| self.eval(function, frame, value))
                        .transpose();
                }
                InstrKind::Br(br) => br.target,
                InstrKind::CondBr(br) => {
                    if self.eval(function, frame, br.cond)? != 0 {
                        br.true_target
                    } else {
                        br.false_target
                    }
                }
                _ => bail!("Terminator of {} is not a control transfer", bb),
            };
            came_from = Some(bb_ref);
            bb_ref = next;
        }
    }

    fn exec_instr(
        &mut self,
        function: &'module Function,
        frame: &Frame,
        instr: &Instr,
    ) -> Result<Option<u64>> {
        let module = self.module;
        let types = &module.types;
        let value = match &instr.kind {
            InstrKind::Alloca(alloca) => {
                let size = types.size_of(alloca.ty) * u64::from(alloca.num_elements);
                Some(self.allocate(size, types.align_of(alloca.ty))?)
            }
            InstrKind::Load(load) => {
                let address = self.eval(function, frame, load.source)?;
                let raw = self.read(address, self.scalar_size(instr.ty)?)?;
                Some(self.truncate(raw, instr.ty))
            }
            InstrKind::Store(store) => {
                let address = self.eval(function, frame, store.dest)?;
                let value = self.eval(function, frame, store.value)?;
                let ty = self.ty_of(function, store.value)?;
                self.write(address, value, self.scalar_size(ty)?)?;
                None
            }
            InstrKind::Bin(bin) => {
                let bits = self.int_bits(instr.ty)?;
                let lhs = self.eval(function, frame, bin.lhs)?;
                let rhs = self.eval(function, frame, bin.rhs)?;
                Some(self.truncate(eval_bin_op(bin.op, lhs, rhs, bits)?, instr.ty))
            }
            InstrKind::Cmp(cmp) => {
                let ty = self.ty_of(function, cmp.lhs)?;
                let bits = types.int_bits(ty).unwrap_or(64);
                let lhs = self.eval(function, frame, cmp.lhs)?;
                let rhs = self.eval(function, frame, cmp.rhs)?;
                Some(u64::from(eval_cmp_op(cmp.op, lhs, rhs, bits)))
            }
            InstrKind::Phi(_) => bail!("Phi {} is not at the head of its block", instr),
            InstrKind::ElementPtr(gep) => {
                let base = self.eval(function, frame, gep.ptr)?;
                let pointee = types
                    .pointee(self.ty_of(function, gep.ptr)?)
                    .ok_or_else(|| anyhow!("{} does not offset a pointer", instr))?;
                let index_ty = self.ty_of(function, gep.index)?;
                let index = sign_extend(
                    self.eval(function, frame, gep.index)?,
                    self.int_bits(index_ty)?,
                );
                let offset = (index as i64).wrapping_mul(types.size_of(pointee) as i64);
                Some(base.wrapping_add(offset as u64))
            }
            InstrKind::StructElementPtr(gep) => {
                let base = self.eval(function, frame, gep.ptr)?;
                let offset = types
                    .pointee(self.ty_of(function, gep.ptr)?)
                    .and_then(|pointee| types.field_offset(pointee, gep.field as usize))
                    .ok_or_else(|| anyhow!("{} does not address a struct field", instr))?;
                Some(base.wrapping_add(offset))
            }
            InstrKind::IntToPtr(cast) => Some(self.eval(function, frame, cast.value)?),
            InstrKind::Cast(cast) => {
                let value = self.eval(function, frame, cast.value)?;
                let from = self.int_bits(self.ty_of(function, cast.value)?)?;
                let value = match cast.kind {
                    CastKind::Trunc | CastKind::ZExt => value,
                    CastKind::SExt => sign_extend(value, from),
                };
                Some(self.truncate(value, instr.ty))
            }
            InstrKind::Call(call) => {
                let arguments = call
                    .args
                    .iter()
                    .map(|arg| self.eval(function, frame, *arg))
                    .collect::<Result<Vec<_>>>()?;
                self.call(call.callee, &arguments)?
            }
            InstrKind::Ret(_) | InstrKind::Br(_) | InstrKind::CondBr(_) => {
                bail!("Terminator {} in the middle of a block", instr)
            }
        };
        Ok(value)
    }

    fn eval(&self, function: &Function, frame: &Frame, value: Value) -> Result<u64> {
        match value {
            Value::Const(constant) => match function.cfg.constants.get(constant) {
                Some(Const::Int(ty, value)) => Ok(self.truncate(*value as u64, *ty)),
                Some(Const::Null(_)) => Ok(0),
                None => bail!("Unknown constant in {}", function.name),
            },
            Value::Instr(_) | Value::Param(_) => frame
                .get(&value)
                .copied()
                .ok_or_else(|| anyhow!("{} used before it was computed", value.display(function))),
        }
    }

    fn step(&mut self) -> Result<()> {
        if self.steps >= self.config.max_steps {
            bail!("Step limit of {} exceeded", self.config.max_steps);
        }
        self.steps += 1;
        Ok(())
    }

    fn allocate(&mut self, size: u64, align: u64) -> Result<u64> {
        let address = self.stack_top.next_multiple_of(align);
        let end = address
            .checked_add(size)
            .filter(|end| *end <= STACK_BASE + self.memory.len() as u64)
            .ok_or_else(|| anyhow!("Stack overflow allocating {} byte(s)", size))?;
        trace!("Allocated {} byte(s) at 0x{:x}", size, address);
        self.stack_top = end;
        Ok(address)
    }

    fn range(&self, address: u64, size: usize) -> Result<std::ops::Range<usize>> {
        let in_bounds = address >= STACK_BASE
            && address
                .checked_add(size as u64)
                .is_some_and(|end| end <= self.stack_top);
        if !in_bounds {
            bail!(
                "Out of bounds access of {} byte(s) at 0x{:x}",
                size,
                address
            );
        }
        let start = (address - STACK_BASE) as usize;
        Ok(start..start + size)
    }

    fn read(&self, address: u64, size: usize) -> Result<u64> {
        let mut bytes = [0; 8];
        bytes[..size].copy_from_slice(&self.memory[self.range(address, size)?]);
        Ok(u64::from_le_bytes(bytes))
    }

    fn write(&mut self, address: u64, value: u64, size: usize) -> Result<()> {
        let range = self.range(address, size)?;
        self.memory[range].copy_from_slice(&value.to_le_bytes()[..size]);
        Ok(())
    }

    /// Byte size of a value that fits into a register.
    fn scalar_size(&self, ty: Type) -> Result<usize> {
        let types = &self.module.types;
        if !types.is_int(ty) && !types.is_ptr(ty) {
            bail!(
                "Cannot move a value of type {} through memory",
                types.display(ty)
            );
        }
        Ok(types.size_of(ty) as usize)
    }

    fn int_bits(&self, ty: Type) -> Result<u32> {
        self.module
            .types
            .int_bits(ty)
            .ok_or_else(|| anyhow!("Expected an integer, got {}", self.module.types.display(ty)))
    }

    fn ty_of(&self, function: &Function, value: Value) -> Result<Type> {
        function
            .value_ty(value)
            .ok_or_else(|| anyhow!("Value does not belong to {}", function.name))
    }

    /// Masks `value` to the width of `ty`. Pointers keep all 64 bits.
    fn truncate(&self, value: u64, ty: Type) -> u64 {
        match self.module.types.int_bits(ty) {
            Some(bits) => mask(value, bits),
            None => value,
        }
    }
}

const fn mask(value: u64, bits: u32) -> u64 {
    if bits >= 64 {
        value
    } else {
        value & ((1 << bits) - 1)
    }
}

const fn sign_extend(value: u64, bits: u32) -> u64 {
    if bits >= 64 {
        value
    } else {
        let shift = 64 - bits;
        (((value << shift) as i64) >> shift) as u64
    }
}

fn eval_bin_op(op: BinOp, lhs: u64, rhs: u64, bits: u32) -> Result<u64> {
    let signed = |value| sign_extend(value, bits) as i64;
    let shift_amount = || -> Result<u32> {
        if rhs >= u64::from(bits) {
            bail!("Shift amount {} is not below the bit width {}", rhs, bits);
        }
        Ok(rhs as u32)
    };
    let is_division = matches!(op, BinOp::UDiv | BinOp::SDiv | BinOp::URem | BinOp::SRem);
    if is_division && rhs == 0 {
        bail!("Division by zero");
    }
    Ok(match op {
        BinOp::Add => lhs.wrapping_add(rhs),
        BinOp::Sub => lhs.wrapping_sub(rhs),
        BinOp::Mul => lhs.wrapping_mul(rhs),
        BinOp::UDiv => lhs / rhs,
        BinOp::SDiv => signed(lhs).wrapping_div(signed(rhs)) as u64,
        BinOp::URem => lhs % rhs,
        BinOp::SRem => signed(lhs).wrapping_rem(signed(rhs)) as u64,
        BinOp::And => lhs & rhs,
        BinOp::Or => lhs | rhs,
        BinOp::Xor => lhs ^ rhs,
        BinOp::Shl => lhs << shift_amount()?,
        BinOp::LShr => lhs >> shift_amount()?,
        BinOp::AShr => (signed(lhs) >> shift_amount()?) as u64,
    })
}

fn eval_cmp_op(op: CmpOp, lhs: u64, rhs: u64, bits: u32) -> bool {
    let ordering = if op.is_signed() {
        (sign_extend(lhs, bits) as i64).cmp(&(sign_extend(rhs, bits) as i64))
    } else {
        lhs.cmp(&rhs)
    };
    match op {
        CmpOp::Eq => ordering.is_eq(),
        CmpOp::Ne => ordering.is_ne(),
        CmpOp::Ugt | CmpOp::Sgt => ordering.is_gt(),
        CmpOp::Uge | CmpOp::Sge => ordering.is_ge(),
        CmpOp::Ult | CmpOp::Slt => ordering.is_lt(),
        CmpOp::Ule | CmpOp::Sle => ordering.is_le(),
    }
}
