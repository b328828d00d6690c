use std::fmt::{
    Display,
    Formatter,
};

use itertools::Itertools;

use crate::{
    cfg::{
        Cfg,
        InstrRef,
        KeySpace,
        ParamRef,
    },
    error::{
        BuilderError,
        Result,
    },
    instruction::Const,
    phi::PhiResolver,
    Module,
    Type,
    Types,
    Value,
};

#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    /// The interned function type, `fun ret (params...)`.
    pub ty: Type,
    pub params: Vec<ParamRef>,
    pub ret_ty: Type,
    pub cfg: Cfg,
    phis: PhiResolver,
}

impl Function {
    pub fn new(
        keys: &mut KeySpace,
        name: String,
        ty: Type,
        param_tys: &[Type],
        ret_ty: Type,
    ) -> Self {
        let mut cfg = Cfg::new();
        let params = param_tys
            .iter()
            .enumerate()
            .map(|(index, ty)| cfg.add_param(keys, *ty, index))
            .collect();
        Self {
            name,
            ty,
            params,
            ret_ty,
            cfg,
            phis: PhiResolver::new(),
        }
    }

    pub fn param(&self, index: usize) -> Option<Value> {
        self.params.get(index).copied().map(Value::Param)
    }

    /// Returns the type of `value`, or `None` if it does not belong to this function.
    pub fn value_ty(&self, value: Value) -> Option<Type> {
        self.cfg.value_ty(value)
    }

    pub(crate) fn const_int(
        &mut self,
        keys: &mut KeySpace,
        types: &Types,
        ty: Type,
        value: i64,
    ) -> Result<Value> {
        if !types.is_int(ty) {
            return Err(BuilderError::TypeMismatch {
                expected: "an integer type".to_string(),
                actual: types.display(ty).to_string(),
            });
        }
        Ok(Value::Const(self.cfg.add_constant(keys, Const::Int(ty, value))))
    }

    pub(crate) fn const_null(
        &mut self,
        keys: &mut KeySpace,
        types: &Types,
        ty: Type,
    ) -> Result<Value> {
        if !types.is_ptr(ty) {
            return Err(BuilderError::TypeMismatch {
                expected: "a pointer type".to_string(),
                actual: types.display(ty).to_string(),
            });
        }
        Ok(Value::Const(self.cfg.add_constant(keys, Const::Null(ty))))
    }

    pub fn phis(&self) -> &PhiResolver {
        &self.phis
    }

    pub(crate) fn phis_mut(&mut self) -> &mut PhiResolver {
        &mut self.phis
    }

    pub fn is_fully_resolved(&self, phi: InstrRef) -> bool {
        self.phis.is_fully_resolved(&self.cfg, phi)
    }

    pub fn unresolved_phis(&self) -> Vec<InstrRef> {
        self.phis.unresolved(&self.cfg)
    }

    /// Declares the control-flow graph complete and returns the phis that remain unresolved.
    pub fn finalize_cfg(&mut self) -> Vec<InstrRef> {
        self.phis.finalize(&self.cfg)
    }

    pub fn is_cfg_finalized(&self) -> bool {
        self.phis.is_finalized()
    }

    pub fn display<'a>(&'a self, module: &'a Module) -> FunctionDisplay<'a> {
        FunctionDisplay {
            module,
            function: self,
        }
    }
}

pub struct FunctionDisplay<'a> {
    module: &'a Module,
    function: &'a Function,
}

impl Display for FunctionDisplay<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let types = &self.module.types;
        let function = self.function;
        let params = function.params.iter().map(|param| {
            let param = &function.cfg.params[*param];
            format!("{} {}", types.display(param.ty), param)
        });
        writeln!(
            f,
            "fun {} @{}({}) {{",
            types.display(function.ret_ty),
            function.name,
            params.format(", ")
        )?;
        let indent = "    ";
        for (_, bb) in &function.cfg.basic_blocks {
            writeln!(f, "{}:", bb)?;
            for instr in bb.instructions().chain(bb.terminator()) {
                let instr = &function.cfg.instructions[instr];
                writeln!(f, "{}{};", indent, instr.display(self.module, function))?;
            }
        }
        writeln!(f, "}}")?;
        Ok(())
    }
}
