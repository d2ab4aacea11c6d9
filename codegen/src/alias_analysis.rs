//! Property-set alias analysis.
//!
//! Every pointer value is assigned a set of *kind ids*; selected pairs of
//! ids are registered as mutually disjoint. Two pointers may alias unless
//! some pair of their ids is registered disjoint. Pointers with an empty id
//! set (phi results, loaded pointers, call results) conservatively alias
//! everything.
//!
//! Kinds: every global gets its own id (globals are pairwise disjoint and
//! disjoint from stack storage); every `alloc` gets a fresh stack-slot id;
//! pointer-typed arguments share one group id, disjoint from the stack slots
//! but not from globals. A GEP result inherits its base's ids, and constant
//! element offsets of the same base are tagged pairwise disjoint — two
//! different offsets cannot alias.

use crate::fx::{FxHashMap, FxHashSet};
use crate::ir::module::GlobalVarData;
use crate::ir::{Function, GlobalVar, InstructionData, TypeStore, Value, ValueData};
use crate::timing;
use smallvec::SmallVec;
use sysyc_entity::PrimaryMap;

type KindSet = SmallVec<[u32; 2]>;

/// The alias facts of one function.
pub struct AliasAnalysis {
    attrs: FxHashMap<Value, KindSet>,
    distinct: FxHashSet<(u32, u32)>,
    next_id: u32,
}

impl AliasAnalysis {
    /// Compute alias kinds for every pointer value of `func`.
    pub fn compute(
        globals: &PrimaryMap<GlobalVar, GlobalVarData>,
        types: &TypeStore,
        func: &Function,
    ) -> Self {
        let _tt = timing::alias_analysis();
        let mut this = Self {
            attrs: FxHashMap::default(),
            distinct: FxHashSet::default(),
            next_id: 0,
        };
        this.assign_roots(globals, types, func);
        this.assign_derived(func);
        this
    }

    fn fresh_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn add_pair(&mut self, a: u32, b: u32) {
        assert_ne!(a, b, "a kind id cannot be disjoint from itself");
        let pair = (a.min(b), a.max(b));
        self.distinct.insert(pair);
    }

    fn assign_roots(
        &mut self,
        globals: &PrimaryMap<GlobalVar, GlobalVarData>,
        types: &TypeStore,
        func: &Function,
    ) {
        // One id per global; all pairwise disjoint.
        let mut global_ids: Vec<u32> = Vec::new();
        let mut global_map: FxHashMap<GlobalVar, u32> = FxHashMap::default();
        for gv in globals.keys() {
            let id = self.fresh_id();
            for &other in &global_ids {
                self.add_pair(id, other);
            }
            global_ids.push(id);
            global_map.insert(gv, id);
        }

        // The argument-pointer group.
        let arg_id = self.fresh_id();
        for &param in &func.params {
            if types.is_ptr(func.dfg.value_type(param)) {
                self.attrs.insert(param, KindSet::from_slice(&[arg_id]));
            }
        }

        // Stack slots: fresh id per alloc, disjoint from every global, from
        // the argument group, and from every other alloc.
        let mut alloc_ids: Vec<u32> = Vec::new();
        for &block in func.layout.blocks() {
            for &inst in func.layout.block_insts(block) {
                match func.dfg.inst_data(inst) {
                    InstructionData::Alloc { .. } => {
                        let id = self.fresh_id();
                        for &g in &global_ids {
                            self.add_pair(id, g);
                        }
                        self.add_pair(id, arg_id);
                        for &a in &alloc_ids {
                            self.add_pair(id, a);
                        }
                        alloc_ids.push(id);
                        let result = func.dfg.inst_result(inst).unwrap();
                        self.attrs.insert(result, KindSet::from_slice(&[id]));
                    }
                    _ => {}
                }
            }
        }

        // Global address values.
        for &block in func.layout.blocks() {
            for &inst in func.layout.block_insts(block) {
                for arg in func.dfg.inst_args(inst) {
                    if let ValueData::GlobalAddr { gv, .. } = func.dfg.value_data(arg) {
                        let id = global_map[&gv];
                        self.attrs.entry(arg).or_insert_with(|| KindSet::from_slice(&[id]));
                    }
                }
            }
        }
    }

    fn assign_derived(&mut self, func: &Function) {
        // GEPs inherit their base's kinds; constant offsets of the same base
        // get pairwise-disjoint offset tags. Iterate until stable so GEP
        // chains resolve regardless of block order.
        let mut offset_ids: FxHashMap<(Value, i32), u32> = FxHashMap::default();
        let mut changed = true;
        while changed {
            changed = false;
            for &block in func.layout.blocks() {
                for &inst in func.layout.block_insts(block) {
                    let (base, index) = match func.dfg.inst_data(inst) {
                        InstructionData::GetElementPtr { args } => (args[0], args[1]),
                        _ => continue,
                    };
                    let result = func.dfg.inst_result(inst).unwrap();
                    let mut kinds = match self.attrs.get(&base) {
                        Some(kinds) => kinds.clone(),
                        None => continue,
                    };
                    if let Some(c) = func.dfg.as_iconst(index) {
                        if c != 0 {
                            let id = match offset_ids.get(&(base, c)) {
                                Some(&id) => id,
                                None => {
                                    let id = self.fresh_id();
                                    for (&(b, _), &other) in offset_ids.iter() {
                                        if b == base {
                                            self.add_pair(id, other);
                                        }
                                    }
                                    offset_ids.insert((base, c), id);
                                    id
                                }
                            };
                            if !kinds.contains(&id) {
                                kinds.push(id);
                            }
                        }
                    }
                    if self.attrs.get(&result) != Some(&kinds) {
                        self.attrs.insert(result, kinds);
                        changed = true;
                    }
                }
            }
        }
    }

    /// The kind ids of `ptr`. Empty means unknown.
    pub fn kinds(&self, ptr: Value) -> &[u32] {
        self.attrs.get(&ptr).map(|k| k.as_slice()).unwrap_or(&[])
    }

    /// May `a` and `b` refer to overlapping storage?
    pub fn may_alias(&self, a: Value, b: Value) -> bool {
        let ka = self.kinds(a);
        let kb = self.kinds(b);
        if ka.is_empty() || kb.is_empty() {
            return true;
        }
        for &x in ka {
            for &y in kb {
                if x != y && self.distinct.contains(&(x.min(y), x.max(y))) {
                    return false;
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::FuncCursor;
    use crate::ir::{types, Initializer, Module, Signature};

    #[test]
    fn allocs_globals_and_args() {
        let mut module = Module::new();
        let g1 = module.declare_global("g1", types::I32, Initializer::Zero);
        let g2 = module.declare_global("g2", types::I32, Initializer::Zero);
        let ptr_ty = module.types.ptr_to(types::I32);
        let f = module.declare_function("f", Signature::new(vec![ptr_ty], types::I32));

        let (a1, a2, ga1, ga2, param) = {
            let func = &mut module.functions[f];
            let param = func.params[0];
            let types_store = &mut module.types;
            let mut cur = FuncCursor::new(func);
            cur.insert_block();
            let a1 = cur.ins().alloc(types_store, types::I32);
            let a2 = cur.ins().alloc(types_store, types::I32);
            let ga1 = cur.func.dfg.global_addr(g1, ptr_ty);
            let ga2 = cur.func.dfg.global_addr(g2, ptr_ty);
            let v = cur.ins().load(types_store, ga1);
            let w = cur.ins().load(types_store, ga2);
            let s = cur.ins().iadd(v, w);
            cur.ins().store(a1, s);
            cur.ins().store(a2, s);
            cur.ins().store(param, s);
            cur.ins().ret(Some(s));
            (a1, a2, ga1, ga2, param)
        };

        let func = &module.functions[f];
        let aa = AliasAnalysis::compute(&module.globals, &module.types, func);
        assert!(!aa.may_alias(a1, a2));
        assert!(!aa.may_alias(a1, ga1));
        assert!(!aa.may_alias(ga1, ga2));
        assert!(!aa.may_alias(a1, param));
        // An argument pointer may point into a global.
        assert!(aa.may_alias(param, ga1));
        assert!(aa.may_alias(a1, a1));
    }

    #[test]
    fn gep_offsets() {
        let mut module = Module::new();
        let arr_ty = module.types.array_of(types::I32, 8);
        let g = module.declare_global("g", arr_ty, Initializer::Zero);
        let f = module.declare_function("f", Signature::new(vec![types::I32], types::I32));

        let (p0, p1, p2, pdyn, base) = {
            let func = &mut module.functions[f];
            let i = func.params[0];
            let types_store = &mut module.types;
            let ptr_arr = types_store.ptr_to(arr_ty);
            let mut cur = FuncCursor::new(func);
            cur.insert_block();
            let base = cur.func.dfg.global_addr(g, ptr_arr);
            let zero = cur.func.dfg.iconst(0);
            let one = cur.func.dfg.iconst(1);
            let two = cur.func.dfg.iconst(2);
            let p0 = cur.ins().gep(types_store, base, zero);
            let p1 = cur.ins().gep(types_store, base, one);
            let p2 = cur.ins().gep(types_store, base, two);
            let pdyn = cur.ins().gep(types_store, base, i);
            let v = cur.ins().load(types_store, p1);
            cur.ins().ret(Some(v));
            (p0, p1, p2, pdyn, base)
        };

        let func = &module.functions[f];
        let aa = AliasAnalysis::compute(&module.globals, &module.types, func);
        // Distinct constant offsets of the same base cannot alias.
        assert!(!aa.may_alias(p1, p2));
        // A zero offset is the base itself.
        assert!(aa.may_alias(p0, base));
        // Dynamic offsets may be anything within the base.
        assert!(aa.may_alias(pdyn, p1));
        assert!(aa.may_alias(pdyn, p0));
        // Still within the same global: disjoint from other regions.
        let aa_kinds = aa.kinds(p1);
        assert!(!aa_kinds.is_empty());
    }
}
