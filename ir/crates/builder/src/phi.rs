//! Bookkeeping for phi nodes whose incoming edges are attached after creation.
//!
//! Phis are usually created before all predecessors of their block are known
//! (loop headers being the typical case). The [`PhiResolver`] remembers every
//! phi of a function so that downstream consumers can ask whether the
//! incoming edges match the control-flow graph before trusting SSA form.
//! Resolution is a query, the builder never enforces it.

use rustc_hash::FxHashSet;
use tracing::{
    debug,
    warn,
};

use crate::{
    cfg::{
        BasicBlockRef,
        Cfg,
        InstrRef,
    },
    FxIndexSet,
};

#[derive(Debug, Clone, Default)]
pub struct PhiResolver {
    tracked: FxIndexSet<InstrRef>,
    finalized: bool,
}

impl PhiResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, phi: InstrRef) {
        self.tracked.insert(phi);
    }

    /// Every tracked phi, in creation order.
    pub fn pending(&self) -> impl Iterator<Item = InstrRef> + '_ {
        self.tracked.iter().copied()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Returns true iff every predecessor of the phi's block that is reachable from the
    /// entry block supplied exactly one incoming value, and no incoming value names a
    /// block that is not a predecessor.
    ///
    /// Returns false for anything that is not a phi of `cfg`.
    pub fn is_fully_resolved(&self, cfg: &Cfg, phi: InstrRef) -> bool {
        self.is_resolved_against(cfg, phi, &cfg.reachable_blocks())
    }

    fn is_resolved_against(
        &self,
        cfg: &Cfg,
        phi: InstrRef,
        reachable: &FxHashSet<BasicBlockRef>,
    ) -> bool {
        let Some(instr) = cfg.instructions.get(phi) else {
            return false;
        };
        let Some(phi_instr) = instr.kind.try_as_phi_ref() else {
            return false;
        };
        let predecessors: FxHashSet<BasicBlockRef> = cfg.predecessors(instr.defined_in).collect();
        let all_incoming_are_predecessors = phi_instr
            .incoming
            .keys()
            .all(|bb| predecessors.contains(bb));
        let all_reachable_predecessors_covered = predecessors
            .iter()
            .filter(|bb| reachable.contains(*bb))
            .all(|bb| phi_instr.incoming.contains_key(bb));
        all_incoming_are_predecessors && all_reachable_predecessors_covered
    }

    /// Tracked phis that are not fully resolved, in creation order.
    pub fn unresolved(&self, cfg: &Cfg) -> Vec<InstrRef> {
        let reachable = cfg.reachable_blocks();
        self.pending()
            .filter(|phi| cfg.instructions.contains_key(*phi))
            .filter(|phi| !self.is_resolved_against(cfg, *phi, &reachable))
            .collect()
    }

    /// Declares control-flow graph assembly complete.
    ///
    /// Returns the phis that are still unresolved at this point. Afterwards no phi may be
    /// created or extended.
    pub fn finalize(&mut self, cfg: &Cfg) -> Vec<InstrRef> {
        self.finalized = true;
        let unresolved = self.unresolved(cfg);
        if unresolved.is_empty() {
            debug!("Finalized cfg with {} resolved phi(s)", self.tracked.len());
        } else {
            warn!(
                "Finalized cfg with {} unresolved phi(s) out of {}",
                unresolved.len(),
                self.tracked.len()
            );
        }
        unresolved
    }
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use crate::{
        test::create_test_module,
        BuilderError,
        StateViolation,
        Value,
    };

    #[test]
    #[traced_test]
    fn should_resolve_phi_of_diamond() {
        let (mut module, function) = create_test_module();
        let i32 = module.types.i32();
        let mut builder = module.builder(function);
        let a = builder.create_block("a");
        let b = builder.create_block("b");
        let c = builder.create_block("c");
        let d = builder.create_block("d");
        builder.set_insert_point(a).unwrap();
        let cond = builder.const_bool(true).unwrap();
        builder.create_conditional_branch(cond, b, c).unwrap();
        builder.set_insert_point(b).unwrap();
        let from_b = builder.const_int(i32, 1).unwrap();
        builder.create_branch(d).unwrap();
        builder.set_insert_point(c).unwrap();
        let from_c = builder.const_int(i32, 2).unwrap();
        builder.create_branch(d).unwrap();
        builder.set_insert_point(d).unwrap();
        let phi = builder.create_phi(i32).unwrap();
        builder.create_return(Some(phi.into())).unwrap();

        assert!(!module.functions[function].is_fully_resolved(phi));
        let mut builder = module.builder(function);
        builder.add_incoming(phi, from_b, b).unwrap();
        assert!(!module.functions[function].is_fully_resolved(phi));
        let mut builder = module.builder(function);
        builder.add_incoming(phi, from_c, c).unwrap();
        assert!(module.functions[function].is_fully_resolved(phi));
        assert!(module.functions[function].unresolved_phis().is_empty());
    }

    #[test]
    fn should_not_require_incoming_value_from_unreachable_predecessor() {
        let (mut module, function) = create_test_module();
        let i32 = module.types.i32();
        let mut builder = module.builder(function);
        let entry = builder.create_block("entry");
        let dead = builder.create_block("dead");
        let join = builder.create_block("join");
        builder.set_insert_point(entry).unwrap();
        builder.create_branch(join).unwrap();
        builder.set_insert_point(dead).unwrap();
        builder.create_branch(join).unwrap();
        builder.set_insert_point(join).unwrap();
        let phi = builder.create_phi(i32).unwrap();
        let zero = builder.const_int(i32, 0).unwrap();
        builder.add_incoming(phi, zero, entry).unwrap();
        builder.create_return(Some(phi.into())).unwrap();
        assert!(module.functions[function].is_fully_resolved(phi));
    }

    #[test]
    fn should_not_resolve_phi_with_incoming_value_from_non_predecessor() {
        let (mut module, function) = create_test_module();
        let i32 = module.types.i32();
        let mut builder = module.builder(function);
        let entry = builder.create_block("entry");
        let other = builder.create_block("other");
        let join = builder.create_block("join");
        builder.set_insert_point(entry).unwrap();
        builder.create_branch(join).unwrap();
        builder.set_insert_point(join).unwrap();
        let phi = builder.create_phi(i32).unwrap();
        let zero = builder.const_int(i32, 0).unwrap();
        builder.add_incoming(phi, zero, entry).unwrap();
        builder.add_incoming(phi, zero, other).unwrap();
        builder.create_return(Some(phi.into())).unwrap();
        assert!(!module.functions[function].is_fully_resolved(phi));
        assert_eq!(module.functions[function].unresolved_phis(), vec![phi]);
    }

    #[test]
    #[traced_test]
    fn should_reject_phi_edits_after_finalization() {
        let (mut module, function) = create_test_module();
        let i32 = module.types.i32();
        let mut builder = module.builder(function);
        let entry = builder.create_block("entry");
        let join = builder.create_block("join");
        builder.set_insert_point(entry).unwrap();
        builder.create_branch(join).unwrap();
        builder.set_insert_point(join).unwrap();
        let phi = builder.create_phi(i32).unwrap();
        let zero = builder.const_int(i32, 0).unwrap();

        let unresolved = module.functions[function].finalize_cfg();
        assert_eq!(unresolved, vec![phi]);
        assert!(logs_contain("unresolved phi"));

        let mut builder = module.builder(function);
        builder.set_insert_point(join).unwrap();
        assert_eq!(
            builder.add_incoming(phi, zero, entry),
            Err(BuilderError::InvalidState(StateViolation::CfgFinalized))
        );
        assert_eq!(
            builder.create_phi(i32),
            Err(BuilderError::InvalidState(StateViolation::CfgFinalized))
        );
        let value: Value = phi.into();
        assert!(builder.create_return(Some(value)).is_ok());
        assert!(!module.functions[function].is_fully_resolved(phi));
    }
}
