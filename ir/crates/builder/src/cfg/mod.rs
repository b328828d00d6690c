use std::fmt::{
    Display,
    Formatter,
};

pub use builder::{
    Builder,
    InsertPoint,
};
pub use domtree::DomTree;
pub use petgraph::{
    prelude::*,
    visit::Walker,
};
use rustc_hash::FxHashSet;
use slotmap::{
    new_key_type,
    SecondaryMap,
    SlotMap,
};
use tracing::{
    debug,
    trace,
};

use crate::{
    instruction::{
        Const,
        Instr,
    },
    InstrKind,
    Type,
    Value,
};

mod builder;
mod domtree;

new_key_type! { pub struct BasicBlockRef; }
new_key_type! { pub struct InstrRef; }
new_key_type! { pub struct ConstRef; }
new_key_type! { pub struct ParamRef; }

#[derive(Debug, Clone, Eq, PartialEq)]
struct CFGNode {
    bb_ref: BasicBlockRef,
}
type Graph = StableGraph<CFGNode, (), Directed>;

/// Hands out block, instruction, constant and parameter handles.
///
/// A module owns a single key space, so a handle is unique across all of its
/// functions and never resolves inside a function that did not create it.
#[derive(Debug, Default, Clone)]
pub struct KeySpace {
    basic_blocks: SlotMap<BasicBlockRef, ()>,
    instructions: SlotMap<InstrRef, ()>,
    constants: SlotMap<ConstRef, ()>,
    params: SlotMap<ParamRef, ()>,
}

impl KeySpace {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Arena of a single function.
///
/// Owns every basic block, instruction, constant and parameter of the function.
/// Their handles come from the module's [`KeySpace`].
/// Edges of the control-flow graph are derived from terminators as they are set.
#[derive(Debug, Default, Clone)]
pub struct Cfg {
    graph: Graph,
    pub basic_blocks: SecondaryMap<BasicBlockRef, BasicBlock>,
    pub instructions: SecondaryMap<InstrRef, Instr>,
    pub constants: SecondaryMap<ConstRef, Const>,
    pub params: SecondaryMap<ParamRef, Param>,
    entry_block: Option<BasicBlockRef>,
    next_symbol: u32,
}

impl Cfg {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_basic_block(&mut self, keys: &mut KeySpace, symbol: String) -> BasicBlockRef {
        let bb = keys.basic_blocks.insert(());
        let node_idx = self.graph.add_node(CFGNode { bb_ref: bb });
        self.basic_blocks.insert(bb, BasicBlock::new(bb, node_idx, symbol));
        if self.entry_block.is_none() {
            self.entry_block = Some(bb);
        }
        debug!("Created basic block {}", self.basic_blocks[bb]);
        bb
    }

    pub fn entry_block(&self) -> Option<BasicBlockRef> {
        self.entry_block
    }

    pub fn add_param(&mut self, keys: &mut KeySpace, ty: Type, index: usize) -> ParamRef {
        let symbol = self.next_symbol();
        let param = keys.params.insert(());
        self.params.insert(param, Param { ty, index, symbol });
        param
    }

    pub fn add_constant(&mut self, keys: &mut KeySpace, constant: Const) -> ConstRef {
        let key = keys.constants.insert(());
        self.constants.insert(key, constant);
        key
    }

    pub fn value_ty(&self, value: Value) -> Option<Type> {
        match value {
            Value::Instr(instr) => self.instructions.get(instr).map(|instr| instr.ty),
            Value::Const(constant) => self.constants.get(constant).map(Const::ty),
            Value::Param(param) => self.params.get(param).map(|param| param.ty),
        }
    }

    /// Inserts a non-terminator instruction at `position` of `bb`'s instruction list.
    ///
    /// Does not validate anything, that is the job of the [`Builder`].
    pub fn insert_instruction(
        &mut self,
        keys: &mut KeySpace,
        bb: BasicBlockRef,
        position: usize,
        ty: Type,
        kind: InstrKind,
    ) -> InstrRef {
        let instr_ref = self.alloc_instr(keys, bb, ty, kind);
        self.basic_blocks[bb].instructions.insert(position, instr_ref);
        trace!(
            "Inserted {} at position {} of {}",
            self.instructions[instr_ref].symbol,
            position,
            self.basic_blocks[bb]
        );
        instr_ref
    }

    /// Seals `bb` with the terminator `kind` and records its outgoing edges.
    pub fn set_terminator(
        &mut self,
        keys: &mut KeySpace,
        bb: BasicBlockRef,
        ty: Type,
        kind: InstrKind,
    ) -> InstrRef {
        debug_assert!(kind.is_terminator());
        for target in kind.successors() {
            self.add_edge(bb, target);
        }
        let instr_ref = self.alloc_instr(keys, bb, ty, kind);
        self.basic_blocks[bb].terminator = Some(instr_ref);
        debug!("Sealed {}", self.basic_blocks[bb]);
        instr_ref
    }

    fn alloc_instr(
        &mut self,
        keys: &mut KeySpace,
        bb: BasicBlockRef,
        ty: Type,
        kind: InstrKind,
    ) -> InstrRef {
        let symbol = self.next_symbol();
        let id = keys.instructions.insert(());
        self.instructions
            .insert(id, Instr::new(ty, kind, bb, id, symbol));
        id
    }

    fn add_edge(&mut self, source: BasicBlockRef, target: BasicBlockRef) {
        self.graph.add_edge(
            self.basic_blocks[source].node_index,
            self.basic_blocks[target].node_index,
            (),
        );
    }

    /// Number of phis heading `bb`, which is also the index of its first non-phi instruction.
    pub fn phi_count(&self, bb: BasicBlockRef) -> usize {
        self.basic_blocks[bb]
            .instructions()
            .take_while(|instr| self.instructions[*instr].is_phi())
            .count()
    }

    /// Immediate predecessors of `bb`, deduplicated and in no particular order.
    pub fn predecessors(&self, bb_ref: BasicBlockRef) -> impl Iterator<Item = BasicBlockRef> + '_ {
        let mut seen = FxHashSet::default();
        self.graph
            .neighbors_directed(self.basic_blocks[bb_ref].node_index, Incoming)
            .map(|n| self.graph[n].bb_ref)
            .filter(move |bb| seen.insert(*bb))
    }

    pub fn successors(&self, bb_ref: BasicBlockRef) -> impl Iterator<Item = BasicBlockRef> + '_ {
        let mut seen = FxHashSet::default();
        self.graph
            .neighbors(self.basic_blocks[bb_ref].node_index)
            .map(|n| self.graph[n].bb_ref)
            .filter(move |bb| seen.insert(*bb))
    }

    /// Blocks reachable from the entry block, in breadth-first order.
    pub fn basic_block_ids_ordered(&self) -> impl Iterator<Item = BasicBlockRef> + '_ {
        self.entry_block
            .into_iter()
            .flat_map(move |entry| {
                Bfs::new(&self.graph, self.basic_blocks[entry].node_index).iter(&self.graph)
            })
            .map(|node| self.graph[node].bb_ref)
    }

    pub fn reachable_blocks(&self) -> FxHashSet<BasicBlockRef> {
        self.basic_block_ids_ordered().collect()
    }

    pub fn dom_tree(&self) -> Option<DomTree<'_>> {
        self.entry_block.map(|entry| DomTree::compute(self, entry))
    }

    fn next_symbol(&mut self) -> String {
        let symbol = format!("v{}", self.next_symbol);
        self.next_symbol += 1;
        symbol
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Param {
    pub ty: Type,
    pub index: usize,
    pub symbol: String,
}

impl Display for Param {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.symbol)
    }
}

#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub id: BasicBlockRef,
    pub instructions: Vec<InstrRef>,
    pub terminator: Option<InstrRef>,
    node_index: NodeIndex,
    pub symbol: String,
}

impl BasicBlock {
    pub fn new(id: BasicBlockRef, graph_index: NodeIndex, symbol: String) -> Self {
        Self {
            id,
            instructions: Vec::new(),
            terminator: None,
            node_index: graph_index,
            symbol,
        }
    }

    /// A block is sealed once its terminator is set. Sealing is permanent.
    pub fn is_sealed(&self) -> bool {
        self.terminator.is_some()
    }

    pub fn terminator(&self) -> Option<InstrRef> {
        self.terminator
    }

    /// Returns an iterator over the [`BasicBlock`]'s instructions, excluding the terminator.
    pub fn instructions(&self) -> impl DoubleEndedIterator<Item = InstrRef> + '_ {
        self.instructions.iter().copied()
    }

    pub fn position_of(&self, instr: InstrRef) -> Option<usize> {
        self.instructions.iter().position(|id| *id == instr)
    }
}

impl Display for BasicBlock {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.symbol)
    }
}
