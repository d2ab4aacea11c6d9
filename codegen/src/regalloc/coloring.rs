//! Chaitin–Briggs graph coloring for one register class.
//!
//! Nodes are the virtual registers of the class plus one pre-colored node
//! per allocatable physical register. The pipeline is the classic loop:
//! simplify (push trivially colorable non-move nodes), coalesce moves under
//! the Briggs criterion (restart on success), freeze a low-degree
//! move-related node when stuck, otherwise push a potential spill chosen by
//! minimum cost/degree with cost weighted by `10^loop_depth`. Selection
//! pops the stack assigning the lowest-numbered free color; nodes that
//! cannot be colored become actual spills — a stack slot plus a load/store
//! around every use and def — and the whole pipeline restarts on the
//! rewritten function.

use crate::fx::FxHashMap;
use crate::lir::{Function, MInst, MemKind, PReg, Reg, RegClass, VReg};
use crate::regalloc::liveness::{self, inst_defs, inst_uses};
use smallvec::SmallVec;

/// Bail out if the spill-restart loop fails to settle; the range splitting
/// performed by spilling makes this unreachable in practice.
const MAX_ROUNDS: usize = 100;

/// Allocate every virtual register of `class` in `func` to one of `colors`.
pub fn allocate_class(func: &mut Function, class: RegClass, colors: &[PReg]) {
    for _round in 0..MAX_ROUNDS {
        let mut graph = Graph::build(func, class, colors);
        match graph.color(colors) {
            Outcome::Colored(assignment) => {
                apply_assignment(func, class, &assignment);
                return;
            }
            Outcome::Spilled(vregs) => {
                log::debug!(
                    "{}: spilling {} {:?} registers",
                    func.name,
                    vregs.len(),
                    class
                );
                insert_spill_code(func, class, &vregs);
            }
        }
    }
    panic!("register allocation failed to converge for {}", func.name);
}

enum Outcome {
    Colored(FxHashMap<VReg, PReg>),
    Spilled(Vec<VReg>),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum State {
    Active,
    /// Pushed on the select stack; the flag marks potential spills.
    OnStack(bool),
    Coalesced(usize),
}

struct Node {
    reg: Reg,
    precolored: Option<PReg>,
    adj: Vec<usize>,
    moves: Vec<usize>,
    /// Nodes merged into this one by coalescing.
    members: Vec<usize>,
    state: State,
    cost: f64,
}

struct Graph {
    nodes: Vec<Node>,
    indices: FxHashMap<Reg, usize>,
}

impl Graph {
    fn build(func: &Function, class: RegClass, colors: &[PReg]) -> Self {
        let mut graph = Graph {
            nodes: Vec::new(),
            indices: FxHashMap::default(),
        };
        for &p in colors {
            graph.add_node(Reg::Phys(p), Some(p));
        }
        // Virtual registers of the class, in order of appearance.
        let mut defs: SmallVec<[Reg; 4]> = SmallVec::new();
        let mut uses: SmallVec<[Reg; 4]> = SmallVec::new();
        for &block in &func.block_order {
            for inst in &func.blocks[block].insts {
                defs.clear();
                uses.clear();
                inst_defs(func, inst, class, &mut defs);
                inst_uses(func, inst, class, &mut uses);
                for &r in defs.iter().chain(uses.iter()) {
                    if r.is_virtual() {
                        graph.add_node(r, None);
                    }
                }
            }
        }

        graph.build_interference(func, class);
        graph.compute_costs(func, class);
        graph
    }

    fn add_node(&mut self, reg: Reg, precolored: Option<PReg>) -> usize {
        if let Some(&idx) = self.indices.get(&reg) {
            return idx;
        }
        let idx = self.nodes.len();
        self.nodes.push(Node {
            reg,
            precolored,
            adj: Vec::new(),
            moves: Vec::new(),
            members: Vec::new(),
            state: State::Active,
            cost: 0.0,
        });
        self.indices.insert(reg, idx);
        idx
    }

    fn node_of(&self, reg: Reg) -> Option<usize> {
        self.indices.get(&reg).copied()
    }

    fn add_edge(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        if !self.nodes[a].adj.contains(&b) {
            self.nodes[a].adj.push(b);
            self.nodes[b].adj.push(a);
        }
    }

    fn add_move(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        if !self.nodes[a].moves.contains(&b) {
            self.nodes[a].moves.push(b);
            self.nodes[b].moves.push(a);
        }
    }

    fn build_interference(&mut self, func: &Function, class: RegClass) {
        let live_sets = liveness::compute(func, class);
        let mut defs: SmallVec<[Reg; 4]> = SmallVec::new();
        let mut uses: SmallVec<[Reg; 4]> = SmallVec::new();

        for &block in &func.block_order {
            let mut live: Vec<Reg> = live_sets.live_out[block].iter().copied().collect();
            live.sort_by_key(reg_sort_key);
            for inst in func.blocks[block].insts.iter().rev() {
                defs.clear();
                uses.clear();
                inst_defs(func, inst, class, &mut defs);
                inst_uses(func, inst, class, &mut uses);

                // The source of a move does not interfere with its
                // destination; that edge is what coalescing later removes.
                let move_pair = match inst {
                    MInst::Move { dst, src }
                        if func.reg_class(*dst) == class && func.reg_class(*src) == class =>
                    {
                        Some((*dst, *src))
                    }
                    _ => None,
                };

                for &d in &defs {
                    let Some(di) = self.node_of(d) else { continue };
                    for &l in &live {
                        if move_pair == Some((d, l)) {
                            continue;
                        }
                        if let Some(li) = self.node_of(l) {
                            self.add_edge(di, li);
                        }
                    }
                }
                for &d in &defs {
                    if let Some(pos) = live.iter().position(|&r| r == d) {
                        live.swap_remove(pos);
                    }
                }
                for &u in &uses {
                    if !live.contains(&u) {
                        live.push(u);
                    }
                }

                if let Some((dst, src)) = move_pair {
                    if let (Some(a), Some(b)) = (self.node_of(dst), self.node_of(src)) {
                        self.add_move(a, b);
                    }
                }
            }
        }
    }

    fn compute_costs(&mut self, func: &Function, class: RegClass) {
        let mut defs: SmallVec<[Reg; 4]> = SmallVec::new();
        let mut uses: SmallVec<[Reg; 4]> = SmallVec::new();
        for &block in &func.block_order {
            let weight = 10f64.powi(func.blocks[block].loop_depth.min(8) as i32);
            for inst in &func.blocks[block].insts {
                defs.clear();
                uses.clear();
                inst_defs(func, inst, class, &mut defs);
                inst_uses(func, inst, class, &mut uses);
                for &r in defs.iter().chain(uses.iter()) {
                    if let Some(idx) = self.node_of(r) {
                        self.nodes[idx].cost += weight;
                    }
                }
            }
        }
    }

    // --------------------------------------------------------------

    fn resolve(&self, mut idx: usize) -> usize {
        while let State::Coalesced(into) = self.nodes[idx].state {
            idx = into;
        }
        idx
    }

    fn is_selectable(&self, idx: usize) -> bool {
        self.nodes[idx].state == State::Active && self.nodes[idx].precolored.is_none()
    }

    /// Degree counting only live neighbors; pre-colored nodes are infinite.
    fn degree(&self, idx: usize) -> usize {
        if self.nodes[idx].precolored.is_some() {
            return usize::MAX;
        }
        self.nodes[idx]
            .adj
            .iter()
            .filter(|&&n| self.nodes[n].state == State::Active)
            .count()
    }

    fn active_moves(&self, idx: usize) -> usize {
        self.nodes[idx]
            .moves
            .iter()
            .filter(|&&n| self.nodes[n].state == State::Active)
            .count()
    }

    fn color(&mut self, colors: &[PReg]) -> Outcome {
        let k = colors.len();
        let mut stack: Vec<usize> = Vec::new();

        loop {
            // Simplify: non-move-related, trivially colorable nodes leave
            // the graph.
            let mut simplified = true;
            while simplified {
                simplified = false;
                for idx in 0..self.nodes.len() {
                    if self.is_selectable(idx)
                        && self.active_moves(idx) == 0
                        && self.degree(idx) < k
                    {
                        self.nodes[idx].state = State::OnStack(false);
                        stack.push(idx);
                        simplified = true;
                    }
                }
            }

            // Coalesce one Briggs-conservative move, then restart.
            if self.coalesce_one(k) {
                continue;
            }

            // Freeze: give up on the moves of one low-degree node.
            if let Some(idx) = (0..self.nodes.len()).find(|&idx| {
                self.is_selectable(idx) && self.active_moves(idx) > 0 && self.degree(idx) < k
            }) {
                self.nodes[idx].moves.clear();
                for other in 0..self.nodes.len() {
                    self.nodes[other].moves.retain(|&m| m != idx);
                }
                continue;
            }

            // Potential spill: cheapest cost/degree goes on the stack and
            // may still get a color during selection.
            let candidate = (0..self.nodes.len())
                .filter(|&idx| self.is_selectable(idx))
                .min_by(|&a, &b| {
                    let ka = self.nodes[a].cost / self.degree(a).max(1) as f64;
                    let kb = self.nodes[b].cost / self.degree(b).max(1) as f64;
                    ka.partial_cmp(&kb).unwrap()
                });
            match candidate {
                Some(idx) => {
                    self.nodes[idx].state = State::OnStack(true);
                    stack.push(idx);
                }
                None => break,
            }
        }

        // Select.
        let mut coloring: FxHashMap<usize, PReg> = FxHashMap::default();
        let mut spills: Vec<VReg> = Vec::new();
        while let Some(idx) = stack.pop() {
            let mut used: SmallVec<[PReg; 8]> = SmallVec::new();
            for i in 0..self.nodes[idx].adj.len() {
                let n = self.resolve(self.nodes[idx].adj[i]);
                if let Some(p) = self.nodes[n].precolored {
                    used.push(p);
                } else if let Some(&p) = coloring.get(&n) {
                    used.push(p);
                }
            }
            match colors.iter().find(|c| !used.contains(c)) {
                Some(&color) => {
                    coloring.insert(idx, color);
                    self.nodes[idx].state = State::Active;
                }
                None => {
                    // An optimistic candidate that did not get lucky.
                    let members = self.nodes[idx].members.clone();
                    for m in members.into_iter().chain([idx]) {
                        if let Reg::Virtual(v) = self.nodes[m].reg {
                            spills.push(v);
                        }
                    }
                }
            }
        }
        if !spills.is_empty() {
            return Outcome::Spilled(spills);
        }

        // Coalesced members take their representative's color.
        let mut assignment: FxHashMap<VReg, PReg> = FxHashMap::default();
        for idx in 0..self.nodes.len() {
            let Reg::Virtual(v) = self.nodes[idx].reg else {
                continue;
            };
            let root = self.resolve(idx);
            let color = self.nodes[root]
                .precolored
                .or_else(|| coloring.get(&root).copied())
                .unwrap_or_else(|| panic!("uncolored register {v} survived selection"));
            assignment.insert(v, color);
        }
        Outcome::Colored(assignment)
    }

    /// Find one coalescable move and merge it. Constrained moves (the pair
    /// interferes) lose their move edge instead.
    fn coalesce_one(&mut self, k: usize) -> bool {
        for a in 0..self.nodes.len() {
            if self.nodes[a].state != State::Active {
                continue;
            }
            for mi in 0..self.nodes[a].moves.len() {
                let b = self.nodes[a].moves[mi];
                if self.nodes[b].state != State::Active || a == b {
                    continue;
                }
                if self.nodes[a].precolored.is_some() && self.nodes[b].precolored.is_some() {
                    continue;
                }
                if self.nodes[a].adj.contains(&b) {
                    // Constrained: never coalescable.
                    self.nodes[a].moves.retain(|&m| m != b);
                    self.nodes[b].moves.retain(|&m| m != a);
                    return true;
                }
                // Briggs for virtual pairs; George when one side is a
                // physical register, since the pre-colored node's own degree
                // is unbounded.
                let ok = match (self.nodes[a].precolored, self.nodes[b].precolored) {
                    (None, None) => self.briggs_ok(a, b, k),
                    (Some(_), None) => self.george_ok(b, a, k),
                    (None, Some(_)) => self.george_ok(a, b, k),
                    (Some(_), Some(_)) => unreachable!(),
                };
                if ok {
                    let (survivor, merged) = if self.nodes[b].precolored.is_some() {
                        (b, a)
                    } else {
                        (a, b)
                    };
                    self.merge(survivor, merged);
                    return true;
                }
            }
        }
        false
    }

    /// The Briggs criterion: the merged node must have fewer than `k`
    /// neighbors of significant degree.
    fn briggs_ok(&self, a: usize, b: usize, k: usize) -> bool {
        let mut significant = 0;
        let mut seen: SmallVec<[usize; 16]> = SmallVec::new();
        for &n in self.nodes[a].adj.iter().chain(self.nodes[b].adj.iter()) {
            if self.nodes[n].state != State::Active || seen.contains(&n) {
                continue;
            }
            seen.push(n);
            if self.degree(n) >= k {
                significant += 1;
                if significant >= k {
                    return false;
                }
            }
        }
        true
    }

    /// The George criterion for merging `virt` into the pre-colored `pre`:
    /// every significant virtual neighbor of `virt` must already interfere
    /// with `pre`. Physical neighbors are distinct registers and need no
    /// check.
    fn george_ok(&self, virt: usize, pre: usize, k: usize) -> bool {
        for &t in &self.nodes[virt].adj {
            if self.nodes[t].state != State::Active || self.nodes[t].precolored.is_some() {
                continue;
            }
            if self.degree(t) < k {
                continue;
            }
            if !self.nodes[t].adj.contains(&pre) {
                return false;
            }
        }
        true
    }

    fn merge(&mut self, survivor: usize, merged: usize) {
        debug_assert!(self.nodes[merged].precolored.is_none());
        self.nodes[merged].state = State::Coalesced(survivor);

        let merged_members = std::mem::take(&mut self.nodes[merged].members);
        self.nodes[survivor].members.push(merged);
        self.nodes[survivor].members.extend(merged_members);
        self.nodes[survivor].cost += self.nodes[merged].cost;

        let adj = self.nodes[merged].adj.clone();
        for n in adj {
            self.nodes[n].adj.retain(|&x| x != merged);
            self.add_edge(survivor, n);
        }
        let moves = std::mem::take(&mut self.nodes[merged].moves);
        for n in moves {
            self.nodes[n].moves.retain(|&x| x != merged);
            if n != survivor {
                self.add_move(survivor, n);
            }
        }
        self.nodes[survivor].moves.retain(|&x| x != merged);
    }
}

/// A deterministic ordering key for live-set vectors.
fn reg_sort_key(reg: &Reg) -> (u8, u32) {
    match reg {
        Reg::Phys(p) => (0, p.0 as u32),
        Reg::Virtual(v) => (1, v.as_u32()),
    }
}

fn apply_assignment(func: &mut Function, class: RegClass, assignment: &FxHashMap<VReg, PReg>) {
    let map = |func_vregs: &sysyc_entity::PrimaryMap<VReg, RegClass>, r: Reg| -> Reg {
        match r {
            Reg::Virtual(v) if func_vregs[v] == class => Reg::Phys(assignment[&v]),
            other => other,
        }
    };
    for idx in 0..func.block_order.len() {
        let block = func.block_order[idx];
        let mut insts = std::mem::take(&mut func.blocks[block].insts);
        for inst in insts.iter_mut() {
            inst.map_uses(|r| map(&func.vregs, r));
            inst.map_def(|r| map(&func.vregs, r));
        }
        func.blocks[block].insts = insts;
    }
}

/// Promote each spilled register to a stack slot: every use reloads into a
/// fresh temporary just before the instruction, every def stores from one
/// just after.
fn insert_spill_code(func: &mut Function, class: RegClass, spilled: &[VReg]) {
    let kind = match class {
        RegClass::Int => MemKind::Double,
        RegClass::Float => MemKind::Float,
    };
    let size = match kind {
        MemKind::Double => 8,
        _ => 4,
    };
    let mut slots: FxHashMap<VReg, crate::lir::StackSlot> = FxHashMap::default();
    for &v in spilled {
        slots.entry(v).or_insert_with(|| func.frame.alloc_slot(size));
    }

    for idx in 0..func.block_order.len() {
        let block = func.block_order[idx];
        let old = std::mem::take(&mut func.blocks[block].insts);
        let mut new = Vec::with_capacity(old.len());
        for mut inst in old {
            let mut reloads: SmallVec<[(VReg, Reg); 2]> = SmallVec::new();
            inst.map_uses(|r| match r {
                Reg::Virtual(v) if slots.contains_key(&v) => {
                    if let Some(&(_, tmp)) = reloads.iter().find(|&&(sv, _)| sv == v) {
                        tmp
                    } else {
                        let tmp = func.vregs.push(class);
                        reloads.push((v, Reg::Virtual(tmp)));
                        Reg::Virtual(tmp)
                    }
                }
                other => other,
            });
            for &(v, tmp) in &reloads {
                new.push(MInst::Load {
                    kind,
                    dst: tmp,
                    addr: crate::lir::AMode::Slot(slots[&v], 0),
                });
            }

            let mut store: Option<(VReg, Reg)> = None;
            inst.map_def(|r| match r {
                Reg::Virtual(v) if slots.contains_key(&v) => {
                    let tmp = Reg::Virtual(func.vregs.push(class));
                    store = Some((v, tmp));
                    tmp
                }
                other => other,
            });
            new.push(inst);
            if let Some((v, tmp)) = store {
                new.push(MInst::Store {
                    kind,
                    src: tmp,
                    addr: crate::lir::AMode::Slot(slots[&v], 0),
                });
            }
        }
        func.blocks[block].insts = new;
    }
}
