use petgraph::{
    algo::dominators::Dominators,
    prelude::NodeIndex,
};

use super::{
    BasicBlockRef,
    Cfg,
};

pub struct DomTree<'a> {
    dominators: Dominators<NodeIndex>,
    cfg: &'a Cfg,
}

impl<'a> DomTree<'a> {
    pub fn compute(cfg: &'a Cfg, entry: BasicBlockRef) -> Self {
        Self {
            dominators: petgraph::algo::dominators::simple_fast(
                &cfg.graph,
                cfg.basic_blocks[entry].node_index,
            ),
            cfg,
        }
    }

    pub fn idom(&self, basic_block: BasicBlockRef) -> Option<BasicBlockRef> {
        self.dominators
            .immediate_dominator(self.cfg.basic_blocks[basic_block].node_index)
            .map(|node_idx| self.cfg.graph[node_idx].bb_ref)
    }

    /// Returns true if `a` dominates `b`.
    ///
    /// A basic block `a` dominates `b` if every path from the entry block to `b` must go through `a`.
    ///
    /// **Note** that false is returned if `b` is not reachable from the entry block.
    pub fn dominates(&self, a: BasicBlockRef, b: BasicBlockRef) -> bool {
        let Some(mut dominators) = self
            .dominators
            .dominators(self.cfg.basic_blocks[b].node_index)
        else {
            return false;
        };
        let a = self.cfg.basic_blocks[a].node_index;
        dominators.any(|node_idx| node_idx == a)
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        cfg::{
            Cfg,
            KeySpace,
        },
        instruction::{
            BranchTerm,
            Const,
            CondBranchTerm,
            RetTerm,
        },
        InstrKind,
        Types,
        Value,
    };

    #[test]
    fn should_compute_diamond_dominators() {
        let mut types = Types::new();
        let void = types.void();
        let bool = types.bool();
        let mut keys = KeySpace::new();
        let mut cfg = Cfg::new();
        let a = cfg.new_basic_block(&mut keys, "a".into());
        let b = cfg.new_basic_block(&mut keys, "b".into());
        let c = cfg.new_basic_block(&mut keys, "c".into());
        let d = cfg.new_basic_block(&mut keys, "d".into());
        let cond = Value::Const(cfg.add_constant(&mut keys, Const::Int(bool, 1)));
        cfg.set_terminator(
            &mut keys,
            a,
            void,
            InstrKind::CondBr(CondBranchTerm::new(cond, b, c)),
        );
        cfg.set_terminator(&mut keys, b, void, InstrKind::Br(BranchTerm::new(d)));
        cfg.set_terminator(&mut keys, c, void, InstrKind::Br(BranchTerm::new(d)));
        cfg.set_terminator(&mut keys, d, void, InstrKind::Ret(RetTerm::empty()));
        let domtree = cfg.dom_tree().unwrap();
        assert!(domtree.dominates(a, d));
        assert!(domtree.dominates(d, d));
        assert!(!domtree.dominates(b, d));
        assert!(!domtree.dominates(c, d));
        assert_eq!(domtree.idom(d), Some(a));
        assert_eq!(domtree.idom(a), None);
    }
}
