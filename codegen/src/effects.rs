//! Call graph and per-function effect summaries.
//!
//! Every function is summarized by a set of effect flags (memory reads and
//! writes, allocation, I/O, writes through pointer arguments). Direct effects
//! are read off the instructions; the flags then propagate along the call
//! graph, callees before callers, until stable. The dead-code and
//! loop-invariant passes consult the summaries to decide whether a call can
//! be deleted or hoisted.

use crate::ir::{FuncRef, Function, Module, Opcode, RuntimeFunc, Value, ValueData};
use crate::timing;
use sysyc_entity::SecondaryMap;

/// Effect flags of one function.
#[derive(Clone, Default, Debug)]
pub struct FunctionInfo {
    /// Participates in a call-graph cycle (including self calls).
    pub is_recursive: bool,
    /// Makes no calls at all.
    pub is_leaf: bool,
    /// May read global memory or memory reachable from pointer arguments.
    pub memory_read: bool,
    /// May write global memory.
    pub memory_write: bool,
    /// Allocates stack memory.
    pub memory_alloc: bool,
    /// May consume program input.
    pub io_read: bool,
    /// May produce program output.
    pub io_write: bool,
    /// Returns a value.
    pub has_return: bool,
    /// May write through a pointer argument.
    pub has_side_effect: bool,
    /// Pure modulo I/O: no memory state is read or written.
    pub no_state: bool,
}

/// Call graph and effect summaries for a whole module.
pub struct FunctionEffects {
    infos: SecondaryMap<FuncRef, FunctionInfo>,
    callees: SecondaryMap<FuncRef, Vec<FuncRef>>,
    /// Defined functions, callees before callers where the graph allows.
    topo: Vec<FuncRef>,
}

impl FunctionEffects {
    /// Compute summaries for every function of `module`.
    pub fn compute(module: &Module) -> Self {
        let _tt = timing::effects();
        let mut this = Self {
            infos: SecondaryMap::new(),
            callees: SecondaryMap::new(),
            topo: Vec::new(),
        };
        for (fr, func) in module.functions.iter() {
            this.infos[fr] = match module.runtime_kind(fr) {
                Some(rt) => runtime_info(rt),
                None => this.scan_function(fr, func),
            };
        }
        this.order_topologically(module);
        this.mark_recursion();
        this.propagate();
        for fr in module.functions.keys() {
            let info = &mut this.infos[fr];
            info.no_state = !info.memory_read
                && !info.memory_write
                && !info.memory_alloc
                && !info.has_side_effect;
        }
        this
    }

    /// The summary of `func`.
    pub fn info(&self, func: FuncRef) -> &FunctionInfo {
        &self.infos[func]
    }

    /// The direct callees of `func`.
    pub fn callees(&self, func: FuncRef) -> &[FuncRef] {
        &self.callees[func]
    }

    /// May a call to `func` whose result is unused be deleted? True when the
    /// callee performs no I/O, no memory writes, and no writes through
    /// pointer arguments.
    pub fn call_removable(&self, func: FuncRef) -> bool {
        let info = &self.infos[func];
        !info.io_read && !info.io_write && !info.memory_write && !info.has_side_effect
    }

    /// May a call to `func` be freely reordered (hoisted out of a loop)?
    /// Stricter than [`Self::call_removable`]: the callee must not observe
    /// memory either.
    pub fn call_pure(&self, func: FuncRef) -> bool {
        self.call_removable(func) && !self.infos[func].memory_read
    }

    // ------------------------------------------------------------------

    fn scan_function(&mut self, fr: FuncRef, func: &Function) -> FunctionInfo {
        let mut info = FunctionInfo {
            is_leaf: true,
            ..Default::default()
        };
        for &block in func.layout.blocks() {
            for &inst in func.layout.block_insts(block) {
                match func.dfg.inst_data(inst) {
                    crate::ir::InstructionData::Call { func: callee, .. } => {
                        info.is_leaf = false;
                        if !self.callees[fr].contains(callee) {
                            self.callees[fr].push(*callee);
                        }
                    }
                    crate::ir::InstructionData::Store { args } => {
                        match pointer_root(func, args[0]) {
                            PointerRoot::Global => info.memory_write = true,
                            PointerRoot::Argument => info.has_side_effect = true,
                            PointerRoot::Local => {}
                            PointerRoot::Unknown => {
                                info.memory_write = true;
                                info.has_side_effect = true;
                            }
                        }
                    }
                    crate::ir::InstructionData::Load { ptr } => {
                        match pointer_root(func, *ptr) {
                            PointerRoot::Local => {}
                            _ => info.memory_read = true,
                        }
                    }
                    crate::ir::InstructionData::Return { arg } => {
                        if arg.is_some() {
                            info.has_return = true;
                        }
                    }
                    data if data.opcode() == Opcode::Alloc => info.memory_alloc = true,
                    _ => {}
                }
            }
        }
        info
    }

    /// Depth-first postorder over the call graph starting from every defined
    /// function, yielding callees before callers on acyclic paths.
    fn order_topologically(&mut self, module: &Module) {
        let mut state: SecondaryMap<FuncRef, u8> = SecondaryMap::new();
        for root in module.functions.keys() {
            if state[root] != 0 {
                continue;
            }
            let mut stack = vec![(root, 0usize)];
            state[root] = 1;
            while let Some(top) = stack.len().checked_sub(1) {
                let (fr, cursor) = stack[top];
                if let Some(&callee) = self.callees[fr].get(cursor) {
                    stack[top].1 += 1;
                    if state[callee] == 0 {
                        state[callee] = 1;
                        stack.push((callee, 0));
                    }
                } else {
                    state[fr] = 2;
                    self.topo.push(fr);
                    stack.pop();
                }
            }
        }
    }

    fn mark_recursion(&mut self) {
        let n = self.topo.len();
        for i in 0..n {
            let root = self.topo[i];
            // Reachability from the callees of `root` back to `root`.
            let mut seen: SecondaryMap<FuncRef, bool> = SecondaryMap::new();
            let mut worklist = self.callees[root].clone();
            let mut recursive = false;
            while let Some(fr) = worklist.pop() {
                if fr == root {
                    recursive = true;
                    break;
                }
                if seen[fr] {
                    continue;
                }
                seen[fr] = true;
                worklist.extend_from_slice(&self.callees[fr]);
            }
            self.infos[root].is_recursive = recursive;
        }
    }

    /// Merge callee flags into callers until a fixed point.
    fn propagate(&mut self) {
        let mut changed = true;
        while changed {
            changed = false;
            for i in 0..self.topo.len() {
                let fr = self.topo[i];
                for j in 0..self.callees[fr].len() {
                    let callee = self.callees[fr][j];
                    let c = self.infos[callee].clone();
                    let info = &mut self.infos[fr];
                    let before = (
                        info.memory_read,
                        info.memory_write,
                        info.memory_alloc,
                        info.io_read,
                        info.io_write,
                        info.has_side_effect,
                    );
                    info.memory_read |= c.memory_read;
                    info.memory_write |= c.memory_write;
                    info.memory_alloc |= c.memory_alloc;
                    info.io_read |= c.io_read;
                    info.io_write |= c.io_write;
                    info.has_side_effect |= c.has_side_effect;
                    let after = (
                        info.memory_read,
                        info.memory_write,
                        info.memory_alloc,
                        info.io_read,
                        info.io_write,
                        info.has_side_effect,
                    );
                    changed |= before != after;
                }
            }
        }
    }
}

fn runtime_info(rt: RuntimeFunc) -> FunctionInfo {
    let mut info = FunctionInfo {
        is_leaf: true,
        ..Default::default()
    };
    info.io_read = rt.reads_io();
    info.io_write = rt.writes_io();
    if rt == RuntimeFunc::Memset {
        info.has_side_effect = true;
    }
    info.has_return = matches!(rt, RuntimeFunc::Getint | RuntimeFunc::Getfloat);
    info
}

/// Classification of the storage a pointer refers to.
enum PointerRoot {
    /// A module global.
    Global,
    /// A pointer-typed function argument.
    Argument,
    /// A stack allocation of this function.
    Local,
    /// Anything else (phi of pointers, loaded pointer, call result).
    Unknown,
}

/// Trace a pointer through GEPs and bitcasts to its root.
fn pointer_root(func: &Function, mut ptr: Value) -> PointerRoot {
    loop {
        match func.dfg.value_data(ptr) {
            ValueData::GlobalAddr { .. } => return PointerRoot::Global,
            ValueData::Param { .. } => return PointerRoot::Argument,
            ValueData::Inst { inst, .. } => match func.dfg.inst_data(inst) {
                crate::ir::InstructionData::Alloc { .. } => return PointerRoot::Local,
                crate::ir::InstructionData::GetElementPtr { args } => ptr = args[0],
                crate::ir::InstructionData::Unary {
                    opcode: Opcode::Bitcast,
                    arg,
                } => ptr = *arg,
                _ => return PointerRoot::Unknown,
            },
            _ => return PointerRoot::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::FuncCursor;
    use crate::ir::{types, Initializer, Signature};

    #[test]
    fn local_stores_are_invisible() {
        let mut module = Module::new();
        let f = module.declare_function("f", Signature::new(vec![], types::I32));
        let func = &mut module.functions[f];
        let types = &mut module.types;
        let mut cur = FuncCursor::new(func);
        cur.insert_block();
        let slot = cur.ins().alloc(types, types::I32);
        let one = cur.func.dfg.iconst(1);
        cur.ins().store(slot, one);
        let v = cur.ins().load(types, slot);
        cur.ins().ret(Some(v));

        let effects = FunctionEffects::compute(&module);
        let info = effects.info(f);
        assert!(!info.memory_write);
        assert!(!info.memory_read);
        assert!(info.memory_alloc);
        assert!(info.is_leaf);
        assert!(!info.is_recursive);
        assert!(effects.call_removable(f));
    }

    #[test]
    fn global_store_and_callers() {
        let mut module = Module::new();
        let g = module.declare_global("g", types::I32, Initializer::Zero);
        let callee = module.declare_function("callee", Signature::new(vec![], types::VOID));
        let caller = module.declare_function("caller", Signature::new(vec![], types::VOID));

        {
            let func = &mut module.functions[callee];
            let types = &mut module.types;
            let gptr_ty = types.ptr_to(types::I32);
            let mut cur = FuncCursor::new(func);
            cur.insert_block();
            let addr = cur.func.dfg.global_addr(g, gptr_ty);
            let one = cur.func.dfg.iconst(1);
            cur.ins().store(addr, one);
            cur.ins().ret(None);
        }
        {
            let func = &mut module.functions[caller];
            let mut cur = FuncCursor::new(func);
            cur.insert_block();
            cur.ins().call(callee, types::VOID, &[]);
            cur.ins().ret(None);
        }

        let effects = FunctionEffects::compute(&module);
        assert!(effects.info(callee).memory_write);
        // The flag propagates to the caller.
        assert!(effects.info(caller).memory_write);
        assert!(!effects.info(caller).is_leaf);
        assert!(!effects.call_removable(caller));
        assert_eq!(effects.callees(caller), &[callee]);
    }

    #[test]
    fn recursion_and_io() {
        let mut module = Module::new();
        let putint = module.runtime_func(crate::ir::RuntimeFunc::Putint);
        let f = module.declare_function("f", Signature::new(vec![types::I32], types::VOID));
        {
            let func = &mut module.functions[f];
            let x = func.params[0];
            let mut cur = FuncCursor::new(func);
            cur.insert_block();
            cur.ins().call(putint, types::VOID, &[x]);
            cur.ins().call(f, types::VOID, &[x]);
            cur.ins().ret(None);
        }
        let effects = FunctionEffects::compute(&module);
        assert!(effects.info(f).is_recursive);
        assert!(effects.info(f).io_write);
        assert!(effects.info(putint).io_write);
        assert!(!effects.call_removable(f));
        assert!(effects.info(f).no_state);
    }

    #[test]
    fn store_through_argument_is_a_side_effect() {
        let mut module = Module::new();
        let ptr_ty = module.types.ptr_to(types::I32);
        let f = module.declare_function("f", Signature::new(vec![ptr_ty], types::VOID));
        {
            let func = &mut module.functions[f];
            let p = func.params[0];
            let mut cur = FuncCursor::new(func);
            cur.insert_block();
            let one = cur.func.dfg.iconst(1);
            cur.ins().store(p, one);
            cur.ins().ret(None);
        }
        let effects = FunctionEffects::compute(&module);
        assert!(effects.info(f).has_side_effect);
        assert!(!effects.info(f).memory_write);
        assert!(!effects.call_removable(f));
    }
}
