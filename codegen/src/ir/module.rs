//! The module: functions, globals, constant strings, and the type store.

use crate::fx::FxHashMap;
use crate::ir::function::{Function, FunctionKind, RuntimeFunc, Signature};
use crate::ir::types::{self, TypeStore};
use crate::ir::{FuncRef, GlobalVar, StringId, Type};
use sysyc_entity::PrimaryMap;

/// A constant initializer tree for a global variable.
#[derive(Clone, Debug, PartialEq)]
pub enum Initializer {
    /// A scalar constant, stored as its canonical bit pattern (the same
    /// convention the value constants use).
    Scalar(u64),
    /// All-zero data of the variable's (sub-)type.
    Zero,
    /// A (possibly nested) array initializer.
    Array {
        /// Per-element initializers, one per array element.
        elems: Vec<Initializer>,
        /// Fast path: every element is zero.
        zero_initialized: bool,
        /// Index of the last non-zero element, when not zero-initialized.
        last_non_zero: Option<usize>,
    },
}

impl Initializer {
    /// Build an array initializer, computing the zero fast path and the
    /// last-non-zero index.
    pub fn array(elems: Vec<Initializer>) -> Self {
        let last_non_zero = elems.iter().rposition(|e| !e.is_zero());
        Self::Array {
            zero_initialized: last_non_zero.is_none(),
            last_non_zero,
            elems,
        }
    }

    /// Is this initializer all zeros?
    pub fn is_zero(&self) -> bool {
        match self {
            Self::Zero => true,
            Self::Scalar(bits) => *bits == 0,
            Self::Array {
                zero_initialized, ..
            } => *zero_initialized,
        }
    }
}

/// A module global variable.
#[derive(Clone, Debug)]
pub struct GlobalVarData {
    /// Linkage name.
    pub name: String,
    /// The variable's type (not the pointer type).
    pub ty: Type,
    /// Its constant initializer.
    pub init: Initializer,
}

/// A whole translation unit: the unit passed through the pipeline.
pub struct Module {
    /// The structural type interner.
    pub types: TypeStore,
    /// All functions, defined and declared.
    pub functions: PrimaryMap<FuncRef, Function>,
    /// Global variables.
    pub globals: PrimaryMap<GlobalVar, GlobalVarData>,
    /// Constant strings referenced by `putf` (UTF-8, C escapes preserved).
    pub strings: PrimaryMap<StringId, String>,
    runtime: FxHashMap<RuntimeFunc, FuncRef>,
}

impl Module {
    /// Create an empty module.
    pub fn new() -> Self {
        Self {
            types: TypeStore::new(),
            functions: PrimaryMap::new(),
            globals: PrimaryMap::new(),
            strings: PrimaryMap::new(),
            runtime: FxHashMap::default(),
        }
    }

    /// Create a defined function and return its reference.
    pub fn declare_function(&mut self, name: impl Into<String>, sig: Signature) -> FuncRef {
        self.functions.push(Function::with_signature(name, sig))
    }

    /// The cached declaration of a runtime helper, created on first use.
    pub fn runtime_func(&mut self, rt: RuntimeFunc) -> FuncRef {
        if let Some(&fr) = self.runtime.get(&rt) {
            return fr;
        }
        let sig = self.runtime_signature(rt);
        let fr = self.functions.push(Function::declaration(rt, sig));
        self.runtime.insert(rt, fr);
        fr
    }

    fn runtime_signature(&mut self, rt: RuntimeFunc) -> Signature {
        let i32_ptr = self.types.ptr_to(types::I32);
        match rt {
            RuntimeFunc::Getint => Signature::new(vec![], types::I32),
            RuntimeFunc::Getfloat => Signature::new(vec![], types::F32),
            RuntimeFunc::Putint => Signature::new(vec![types::I32], types::VOID),
            RuntimeFunc::Putfloat => Signature::new(vec![types::F32], types::VOID),
            // putf's string operand travels as a string index; variadic value
            // arguments follow.
            RuntimeFunc::Putf => Signature::new(vec![types::I32], types::VOID),
            RuntimeFunc::Memset => {
                Signature::new(vec![i32_ptr, types::I32, types::I32], types::VOID)
            }
        }
    }

    /// The runtime tag of `func`, if it is a runtime declaration.
    pub fn runtime_kind(&self, func: FuncRef) -> Option<RuntimeFunc> {
        match self.functions[func].kind {
            FunctionKind::Declaration(rt) => Some(rt),
            FunctionKind::Defined => None,
        }
    }

    /// Create a global variable.
    pub fn declare_global(
        &mut self,
        name: impl Into<String>,
        ty: Type,
        init: Initializer,
    ) -> GlobalVar {
        self.globals.push(GlobalVarData {
            name: name.into(),
            ty,
            init,
        })
    }

    /// Intern a constant string, returning its index.
    pub fn intern_string(&mut self, s: impl Into<String>) -> StringId {
        let s = s.into();
        if let Some((id, _)) = self.strings.iter().find(|(_, existing)| **existing == s) {
            return id;
        }
        self.strings.push(s)
    }
}

impl Default for Module {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initializer_zero_tracking() {
        let init = Initializer::array(vec![
            Initializer::Scalar(0),
            Initializer::Scalar(3),
            Initializer::Zero,
        ]);
        match &init {
            Initializer::Array {
                zero_initialized,
                last_non_zero,
                ..
            } => {
                assert!(!zero_initialized);
                assert_eq!(*last_non_zero, Some(1));
            }
            _ => unreachable!(),
        }
        assert!(Initializer::array(vec![Initializer::Zero; 4]).is_zero());
    }

    #[test]
    fn runtime_declarations_are_cached() {
        let mut module = Module::new();
        let a = module.runtime_func(RuntimeFunc::Putint);
        let b = module.runtime_func(RuntimeFunc::Putint);
        assert_eq!(a, b);
        assert!(module.functions[a].is_declaration());
        assert_eq!(module.runtime_kind(a), Some(RuntimeFunc::Putint));
    }

    #[test]
    fn string_interning() {
        let mut module = Module::new();
        let a = module.intern_string("%d\\n");
        let b = module.intern_string("%d\\n");
        let c = module.intern_string("%f");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
