//! The sysyc code generator.
//!
//! This crate is the back half of the compiler: it consumes an [`ir::Module`]
//! built by the frontend, runs the SSA optimization pipeline (mem2reg, loop
//! restructuring, strength-preserving canonicalizations, dead-code removal),
//! lowers to a register-oriented low-level IR, performs constant strength
//! reduction and graph-coloring register allocation, and emits textual RV64
//! assembly.
//!
//! The frontend (lexer, parser, AST) is a separate concern; modules are
//! constructed through the [`cursor::FuncCursor`] instruction-builder API.

#![warn(missing_docs)]

pub use crate::context::{compile, compile_to_assembly, optimize, Context, OptLevel};

pub mod alias_analysis;
pub mod cursor;
pub mod dce;
pub mod divconst_magic_numbers;
pub mod dominator_tree;
pub mod effects;
pub mod flowgraph;
pub mod induction;
pub mod ir;
pub mod isa;
pub mod lcssa;
pub mod licm;
pub mod lir;
pub mod loop_analysis;
pub mod loop_simplify;
pub mod loop_unroll;
pub mod loop_unswitch;
pub mod mem2reg;
pub mod regalloc;
pub mod scev;
pub mod simple_preopt;
pub mod unreachable_code;

mod context;
mod fx;
mod timing;

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
