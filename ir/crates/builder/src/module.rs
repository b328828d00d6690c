use std::fmt::{
    Display,
    Formatter,
};

use slotmap::{
    new_key_type,
    SlotMap,
};
use tracing::debug;

use crate::{
    cfg::{
        BasicBlockRef,
        Builder,
        KeySpace,
    },
    error::Result,
    verifier::{
        Verifier,
        VerifyError,
    },
    Function,
    Type,
    Types,
};

new_key_type! { pub struct FunctionRef; }

/// Owner of all types and functions.
///
/// Builders borrow the module mutably, so at most one of them can insert at a time.
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub types: Types,
    pub functions: SlotMap<FunctionRef, Function>,
    pub(crate) keys: KeySpace,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a function without any basic blocks.
    pub fn declare_function(
        &mut self,
        name: impl Into<String>,
        params: Vec<Type>,
        ret_ty: Type,
    ) -> FunctionRef {
        let name = name.into();
        let ty = self.types.function(params.clone(), ret_ty);
        debug!("Declaring function {} : {}", name, self.types.display(ty));
        let function = Function::new(&mut self.keys, name, ty, &params, ret_ty);
        self.functions.insert(function)
    }

    pub fn find_function_by_name(&self, name: &str) -> Option<FunctionRef> {
        self.functions
            .iter()
            .find(|(_, function)| function.name == name)
            .map(|(id, _)| id)
    }

    pub fn builder(&mut self, function: FunctionRef) -> Builder<'_> {
        Builder::new(self, function)
    }

    /// Returns a builder that appends to the end of `bb`.
    pub fn builder_at(&mut self, function: FunctionRef, bb: BasicBlockRef) -> Result<Builder<'_>> {
        let mut builder = Builder::new(self, function);
        builder.set_insert_point(bb)?;
        Ok(builder)
    }

    pub fn verify(&self, function: FunctionRef) -> Vec<VerifyError> {
        Verifier::new(self, function).verify()
    }
}

impl Display for Module {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (_, func) in &self.functions {
            write!(f, "{}", func.display(self))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::{
            BuilderError,
            StateViolation,
        },
        test::{
            assert_function_is_equal_to_src,
            create_test_module,
        },
    };

    #[test]
    fn should_find_functions_by_name() {
        let (mut module, function) = create_test_module();
        let i64 = module.types.i64();
        let helper = module.declare_function("helper", vec![i64], i64);
        assert_eq!(module.find_function_by_name("test"), Some(function));
        assert_eq!(module.find_function_by_name("helper"), Some(helper));
        assert_eq!(module.find_function_by_name("missing"), None);
    }

    #[test]
    fn should_create_builder_positioned_at_block() {
        let (mut module, function) = create_test_module();
        let i32 = module.types.i32();
        let bb0 = module.builder(function).create_block("bb0");
        let mut builder = module.builder_at(function, bb0).unwrap();
        assert_eq!(builder.insert_block(), Some(bb0));
        let seven = builder.const_int(i32, 7).unwrap();
        builder.create_return(Some(seven)).unwrap();
        assert_function_is_equal_to_src(
            &module,
            function,
            "
            fun i32 @test() {
            bb0:
                ret i32 7;
            }
            ",
        );
    }

    #[test]
    fn should_not_position_builder_at_block_of_other_function() {
        let (mut module, function) = create_test_module();
        let void = module.types.void();
        let other = module.declare_function("other", vec![], void);
        let foreign = module.builder(other).create_block("entry");
        assert!(matches!(
            module.builder_at(function, foreign),
            Err(BuilderError::InvalidState(StateViolation::UnknownBlock))
        ));
    }
}
