//! Functions: signature, parameters, data flow graph, layout.

use crate::ir::dfg::DataFlowGraph;
use crate::ir::layout::Layout;
use crate::ir::{Block, Inst, Opcode, Type, Value};
use core::fmt;

/// A function signature: parameter types and return type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature {
    /// Parameter types, in order.
    pub params: Vec<Type>,
    /// Return type; `types::VOID` for procedures.
    pub ret: Type,
}

impl Signature {
    /// Create a signature.
    pub fn new(params: Vec<Type>, ret: Type) -> Self {
        Self { params, ret }
    }
}

/// The runtime helpers the frontend may reference. Declarations only; their
/// bodies live in the runtime library.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
#[allow(missing_docs)]
pub enum RuntimeFunc {
    Getint,
    Getfloat,
    Putint,
    Putfloat,
    Putf,
    Memset,
}

impl RuntimeFunc {
    /// The linkage name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Getint => "getint",
            Self::Getfloat => "getfloat",
            Self::Putint => "putint",
            Self::Putfloat => "putfloat",
            Self::Putf => "putf",
            Self::Memset => "memset",
        }
    }

    /// Does the helper read from the environment?
    pub fn reads_io(self) -> bool {
        matches!(self, Self::Getint | Self::Getfloat)
    }

    /// Does the helper write to the environment?
    pub fn writes_io(self) -> bool {
        matches!(self, Self::Putint | Self::Putfloat | Self::Putf)
    }
}

/// Defined function or runtime declaration.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum FunctionKind {
    /// A function with a body in this module.
    Defined,
    /// A declaration of a runtime helper.
    Declaration(RuntimeFunc),
}

/// A function: the unit the analyses and transforms operate on.
#[derive(Clone)]
pub struct Function {
    /// Name for dumps and emission.
    pub name: String,
    /// The signature.
    pub signature: Signature,
    /// Parameter values, one per signature parameter.
    pub params: Vec<Value>,
    /// Value and instruction tables.
    pub dfg: DataFlowGraph,
    /// Block and instruction order.
    pub layout: Layout,
    /// Defined or declared.
    pub kind: FunctionKind,
}

impl Function {
    /// Create a function with `signature`; parameter values are created
    /// eagerly.
    pub fn with_signature(name: impl Into<String>, signature: Signature) -> Self {
        let mut dfg = DataFlowGraph::new();
        let params = signature
            .params
            .iter()
            .enumerate()
            .map(|(i, &ty)| dfg.make_param(ty, i as u32))
            .collect();
        Self {
            name: name.into(),
            signature,
            params,
            dfg,
            layout: Layout::new(),
            kind: FunctionKind::Defined,
        }
    }

    /// Create a runtime declaration.
    pub fn declaration(rt: RuntimeFunc, signature: Signature) -> Self {
        let mut func = Self::with_signature(rt.name(), signature);
        func.kind = FunctionKind::Declaration(rt);
        func
    }

    /// Is this a declaration without a body?
    pub fn is_declaration(&self) -> bool {
        matches!(self.kind, FunctionKind::Declaration(_))
    }

    /// The entry block.
    pub fn entry_block(&self) -> Option<Block> {
        self.layout.entry_block()
    }

    /// Number of phis at the front of `block`. Phis are contiguous there, so
    /// this is also the insertion point for a new phi.
    pub fn num_phis(&self, block: Block) -> usize {
        self.layout
            .block_insts(block)
            .iter()
            .take_while(|&&inst| self.dfg.opcode(inst) == Opcode::Phi)
            .count()
    }

    /// The phis of `block`.
    pub fn phis(&self, block: Block) -> &[Inst] {
        let insts = self.layout.block_insts(block);
        &insts[..self.num_phis(block)]
    }

    /// Insert a freshly created phi at the phi position of `block`.
    pub fn prepend_phi(&mut self, block: Block, phi: Inst) {
        debug_assert_eq!(self.dfg.opcode(phi), Opcode::Phi);
        let at = self.num_phis(block);
        self.layout.insert_inst_at(phi, block, at);
    }

    /// The terminator of `block`. Panics if the block is unterminated.
    pub fn terminator(&self, block: Block) -> Inst {
        let last = self
            .layout
            .last_inst(block)
            .unwrap_or_else(|| panic!("{block} is empty"));
        debug_assert!(
            self.dfg.opcode(last).is_terminator(),
            "{block} does not end in a terminator"
        );
        last
    }

    /// Delete `inst` entirely: detach operands, then remove from the layout.
    pub fn delete_inst(&mut self, inst: Inst) {
        self.dfg.detach_inst(inst);
        self.layout.remove_inst(inst);
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "function {}({} params, {} blocks)",
            self.name,
            self.params.len(),
            self.layout.num_blocks()
        )
    }
}
