use std::fmt::{
    Display,
    Formatter,
};

use rustc_hash::FxHashMap;

use crate::{
    cfg::{
        BasicBlockRef,
        DomTree,
        InstrRef,
    },
    Function,
    FunctionRef,
    Module,
    Value,
};

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum VerifyError {
    UnknownFunction(FunctionRef),
    MissingTerminator(BasicBlockRef),
    PhiNotAtBlockHead(InstrRef),
    UnresolvedPhi(InstrRef),
    /// The value is used by the instruction before it is defined.
    UsedBeforeDefinition(Value, InstrRef),
    UseNotDominatedByDefinition(Value, InstrRef),
}

impl Display for VerifyError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownFunction(function) => write!(f, "Function {function:?} does not exist"),
            Self::MissingTerminator(bb) => write!(f, "Missing terminator in {bb:?}"),
            Self::PhiNotAtBlockHead(phi) => {
                write!(f, "Phi {phi:?} is preceded by a non-phi instruction")
            }
            Self::UnresolvedPhi(phi) => write!(
                f,
                "Incoming values of phi {phi:?} do not match the predecessors of its block"
            ),
            Self::UsedBeforeDefinition(value, user) => {
                write!(f, "{value:?} used by {user:?} before definition")
            }
            Self::UseNotDominatedByDefinition(value, user) => {
                write!(f, "Definition of {value:?} does not dominate its use in {user:?}")
            }
        }
    }
}

/// Checks a finished function for structural well-formedness.
///
/// The builder already guarantees typing. This catches what it cannot see
/// while instructions are still being appended.
#[derive(Debug, Clone)]
pub struct Verifier<'module> {
    module: &'module Module,
    function: FunctionRef,
}

impl<'module> Verifier<'module> {
    pub fn new(module: &'module Module, function: FunctionRef) -> Self {
        Self { module, function }
    }

    pub fn verify(self) -> Vec<VerifyError> {
        let Some(function) = self.module.functions.get(self.function) else {
            return vec![VerifyError::UnknownFunction(self.function)];
        };
        let mut errors = vec![];
        // Position of every instruction within its block; terminators come after the list.
        let mut definitions = FxHashMap::default();
        for (bb_id, bb) in &function.cfg.basic_blocks {
            if !bb.is_sealed() {
                errors.push(VerifyError::MissingTerminator(bb_id));
            }
            let mut seen_non_phi = false;
            for (index, instr_id) in bb.instructions().enumerate() {
                if function.cfg.instructions[instr_id].is_phi() {
                    if seen_non_phi {
                        errors.push(VerifyError::PhiNotAtBlockHead(instr_id));
                    }
                } else {
                    seen_non_phi = true;
                }
                definitions.insert(instr_id, (bb_id, index));
            }
            if let Some(terminator) = bb.terminator() {
                definitions.insert(terminator, (bb_id, bb.instructions.len()));
            }
        }
        errors.extend(
            function
                .unresolved_phis()
                .into_iter()
                .map(VerifyError::UnresolvedPhi),
        );
        if let Some(domtree) = function.cfg.dom_tree() {
            self.verify_uses(function, &domtree, &definitions, &mut errors);
        }
        errors
    }

    fn verify_uses(
        &self,
        function: &Function,
        domtree: &DomTree<'_>,
        definitions: &FxHashMap<InstrRef, (BasicBlockRef, usize)>,
        errors: &mut Vec<VerifyError>,
    ) {
        // Dominance is meaningless in unreachable code.
        let reachable = function.cfg.reachable_blocks();
        for used_in_bb in function.cfg.basic_block_ids_ordered() {
            let bb = &function.cfg.basic_blocks[used_in_bb];
            for (index, instr_id) in bb.instructions().chain(bb.terminator()).enumerate() {
                let instr = &function.cfg.instructions[instr_id];
                if let Some(phi) = instr.kind.try_as_phi_ref() {
                    for (pred, value) in &phi.incoming {
                        let Value::Instr(def) = value else {
                            continue;
                        };
                        if !reachable.contains(pred) {
                            continue;
                        }
                        match definitions.get(def) {
                            None => errors.push(VerifyError::UsedBeforeDefinition(*value, instr_id)),
                            // The value flows along the edge, so it only has to be available
                            // at the end of the predecessor.
                            Some((defined_in_bb, _)) => {
                                if !domtree.dominates(*defined_in_bb, *pred) {
                                    errors.push(VerifyError::UseNotDominatedByDefinition(
                                        *value, instr_id,
                                    ));
                                }
                            }
                        }
                    }
                    continue;
                }
                for value in instr.used() {
                    let Value::Instr(def) = value else {
                        continue;
                    };
                    match definitions.get(&def) {
                        None => errors.push(VerifyError::UsedBeforeDefinition(value, instr_id)),
                        Some((defined_in_bb, defined_at)) => {
                            if *defined_in_bb == used_in_bb {
                                if index <= *defined_at {
                                    errors.push(VerifyError::UsedBeforeDefinition(value, instr_id));
                                }
                            } else if !domtree.dominates(*defined_in_bb, used_in_bb) {
                                errors.push(VerifyError::UseNotDominatedByDefinition(
                                    value, instr_id,
                                ));
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        instruction::PhiInstr,
        test::create_test_module,
        InstrKind,
    };

    #[test]
    fn should_accept_counting_loop() {
        let (mut module, function) = create_test_module();
        let i32 = module.types.i32();
        let mut builder = module.builder(function);
        let entry = builder.create_block("entry");
        let header = builder.create_block("header");
        let body = builder.create_block("body");
        let exit = builder.create_block("exit");
        builder.set_insert_point(entry).unwrap();
        builder.create_branch(header).unwrap();
        builder.set_insert_point(header).unwrap();
        let i = builder.create_phi(i32).unwrap();
        let zero = builder.const_int(i32, 0).unwrap();
        let ten = builder.const_int(i32, 10).unwrap();
        let cond = builder.create_icmp_ult(i.into(), ten).unwrap();
        builder.create_conditional_branch(cond, body, exit).unwrap();
        builder.set_insert_point(body).unwrap();
        let one = builder.const_int(i32, 1).unwrap();
        let next = builder.create_add(i.into(), one).unwrap();
        builder.create_branch(header).unwrap();
        builder.add_incoming(i, zero, entry).unwrap();
        builder.add_incoming(i, next, body).unwrap();
        builder.set_insert_point(exit).unwrap();
        builder.create_return(Some(i.into())).unwrap();
        assert_eq!(module.verify(function), vec![]);
    }

    #[test]
    fn should_report_missing_terminator_and_unresolved_phi() {
        let (mut module, function) = create_test_module();
        let i32 = module.types.i32();
        let mut builder = module.builder(function);
        let entry = builder.create_block("entry");
        let join = builder.create_block("join");
        builder.set_insert_point(entry).unwrap();
        builder.create_branch(join).unwrap();
        builder.set_insert_point(join).unwrap();
        let phi = builder.create_phi(i32).unwrap();
        let errors = module.verify(function);
        assert_eq!(
            errors,
            vec![
                VerifyError::MissingTerminator(join),
                VerifyError::UnresolvedPhi(phi),
            ]
        );
        assert_eq!(
            errors[1].to_string(),
            format!("Incoming values of phi {phi:?} do not match the predecessors of its block")
        );
    }

    #[test]
    fn should_report_use_not_dominated_by_definition() {
        let (mut module, function) = create_test_module();
        let i32 = module.types.i32();
        let mut builder = module.builder(function);
        let a = builder.create_block("a");
        let b = builder.create_block("b");
        let c = builder.create_block("c");
        let d = builder.create_block("d");
        builder.set_insert_point(a).unwrap();
        let cond = builder.const_bool(false).unwrap();
        builder.create_conditional_branch(cond, b, c).unwrap();
        builder.set_insert_point(b).unwrap();
        let one = builder.const_int(i32, 1).unwrap();
        let only_in_b = builder.create_add(one, one).unwrap();
        builder.create_branch(d).unwrap();
        builder.set_insert_point(c).unwrap();
        builder.create_branch(d).unwrap();
        builder.set_insert_point(d).unwrap();
        let ret = builder.create_return(Some(only_in_b)).unwrap();
        assert_eq!(
            module.verify(function),
            vec![VerifyError::UseNotDominatedByDefinition(only_in_b, ret)]
        );
    }

    #[test]
    fn should_report_use_before_definition_in_same_block() {
        let (mut module, function) = create_test_module();
        let i32 = module.types.i32();
        let mut builder = module.builder(function);
        let bb0 = builder.create_block("bb0");
        builder.set_insert_point(bb0).unwrap();
        let one = builder.const_int(i32, 1).unwrap();
        let later = builder.create_add(one, one).unwrap();
        builder.set_insert_point_before(later.as_instr().unwrap()).unwrap();
        let early = builder.create_mul(later, one).unwrap();
        builder.set_insert_point(bb0).unwrap();
        builder.create_return(Some(early)).unwrap();
        assert_eq!(
            module.verify(function),
            vec![VerifyError::UsedBeforeDefinition(
                later,
                early.as_instr().unwrap()
            )]
        );
    }

    #[test]
    fn should_report_phi_below_non_phi() {
        let (mut module, function) = create_test_module();
        let i32 = module.types.i32();
        let mut builder = module.builder(function);
        let bb0 = builder.create_block("bb0");
        builder.set_insert_point(bb0).unwrap();
        let one = builder.const_int(i32, 1).unwrap();
        builder.create_add(one, one).unwrap();
        builder.create_return(Some(one)).unwrap();
        let Module {
            functions, keys, ..
        } = &mut module;
        let phi = functions[function].cfg.insert_instruction(
            keys,
            bb0,
            1,
            i32,
            InstrKind::Phi(PhiInstr::operandless()),
        );
        assert_eq!(
            module.verify(function),
            vec![VerifyError::PhiNotAtBlockHead(phi)]
        );
    }

    #[test]
    fn should_report_unknown_function() {
        let (mut module, function) = create_test_module();
        module.functions.remove(function);
        assert_eq!(
            module.verify(function),
            vec![VerifyError::UnknownFunction(function)]
        );
    }
}
