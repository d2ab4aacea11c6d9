//! Representation of SysY functions in static single-assignment form.

pub mod condcodes;
pub mod dfg;
pub mod entities;
pub mod function;
pub mod instructions;
pub mod layout;
pub mod module;
pub mod types;

pub use self::condcodes::{FloatCC, IntCC};
pub use self::dfg::{DataFlowGraph, ValueData};
pub use self::entities::{Block, FuncRef, GlobalVar, Inst, StringId, Type, Value};
pub use self::function::{Function, FunctionKind, RuntimeFunc, Signature};
pub use self::instructions::{InstructionData, Opcode};
pub use self::layout::Layout;
pub use self::module::{GlobalVarData, Initializer, Module};
pub use self::types::{TypeData, TypeStore};
