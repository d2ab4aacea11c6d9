//! Textual RV64 assembly emission.
//!
//! Walks the allocated LIR and prints GNU-assembler syntax: a `.data`
//! section for the globals (with zero-run compression), `.rodata` for the
//! `putf` format strings, and one `.text` body per function with the
//! `ra`-at-frame-top prologue and epilogue. Every instruction here is from
//! the RV64GC subset (plus the standard pseudo-instructions `li`, `la`,
//! `mv`, `j`, `bgt`, `ble`, `fneg.s`, `seqz`, `snez`).

use crate::ir::condcodes::{FloatCC, IntCC};
use crate::ir::{Initializer, Module as IrModule, TypeData};
use crate::lir::{
    frame::is_imm12, AMode, Block, Function, IntOp, MInst, MemKind, Reg, RegImm,
};
use crate::timing;
use std::fmt::Write;

use super::regs::name;

/// Emit the whole program.
pub fn emit_module(ir: &IrModule, lir: &crate::lir::Module) -> String {
    let _tt = timing::emit();
    let mut out = String::new();
    emit_data(ir, &mut out);
    out.push_str("\t.text\n");
    for func in &lir.functions {
        emit_function(ir, func, &mut out);
    }
    out
}

fn emit_data(ir: &IrModule, out: &mut String) {
    if ir.globals.len() > 0 {
        out.push_str("\t.data\n");
        for (_, data) in ir.globals.iter() {
            let _ = writeln!(out, "\t.globl {}\n{}:", data.name, data.name);
            emit_init(ir, data.ty, &data.init, out);
        }
    }
    if ir.strings.len() > 0 {
        out.push_str("\t.section .rodata\n");
        for (id, s) in ir.strings.iter() {
            let _ = writeln!(out, ".Lstr{}:\n\t.string \"{}\"", id.as_u32(), s);
        }
    }
}

fn emit_init(ir: &IrModule, ty: crate::ir::Type, init: &Initializer, out: &mut String) {
    let size = ir.types.size_of(ty);
    match init {
        Initializer::Zero => {
            let _ = writeln!(out, "\t.zero {size}");
        }
        Initializer::Scalar(bits) => {
            let word = match ir.types.data(ty) {
                TypeData::F32 => (f64::from_bits(*bits) as f32).to_bits(),
                _ => *bits as u32,
            };
            let _ = writeln!(out, "\t.word {word}");
        }
        Initializer::Array {
            elems,
            zero_initialized,
            last_non_zero,
        } => {
            if *zero_initialized {
                let _ = writeln!(out, "\t.zero {size}");
                return;
            }
            let elem_ty = ir.types.elem(ty);
            let elem_size = ir.types.size_of(elem_ty);
            // Everything past the last non-zero element compresses into one
            // .zero directive.
            let keep = last_non_zero.map(|i| i + 1).unwrap_or(0);
            for elem in elems.iter().take(keep) {
                emit_init(ir, elem_ty, elem, out);
            }
            let rest = (elems.len() - keep) as u32 * elem_size;
            if rest > 0 {
                let _ = writeln!(out, "\t.zero {rest}");
            }
        }
    }
}

fn block_label(func: &Function, block: Block) -> String {
    format!(".L{}_{}", func.name, block.as_u32())
}

fn emit_function(ir: &IrModule, func: &Function, out: &mut String) {
    let _ = writeln!(out, "\t.globl {}\n\t.align 2\n{}:", func.name, func.name);
    let total = func.frame.total_size() as i32;
    let ra_off = func.frame.ra_offset();

    // Prologue: grow the frame, save ra at its top.
    if is_imm12(-total) {
        let _ = writeln!(out, "\taddi sp, sp, -{total}");
    } else {
        let _ = writeln!(out, "\tli t6, {total}\n\tsub sp, sp, t6");
    }
    if is_imm12(ra_off) {
        let _ = writeln!(out, "\tsd ra, {ra_off}(sp)");
    } else {
        let _ = writeln!(out, "\tli t6, {ra_off}\n\tadd t6, sp, t6\n\tsd ra, 0(t6)");
    }

    for &block in &func.block_order {
        let _ = writeln!(out, "{}:", block_label(func, block));
        for inst in &func.blocks[block].insts {
            emit_inst(ir, func, inst, out);
        }
    }
}

fn reg(r: Reg) -> &'static str {
    match r {
        Reg::Phys(p) => name(p),
        Reg::Virtual(v) => panic!("virtual register {v} reached emission"),
    }
}

/// Resolve a frame-based or global address into `(base, offset)` usable in a
/// load/store, materializing into `t6` when needed.
fn mem_operand(func: &Function, addr: &AMode, out: &mut String) -> (String, i32) {
    match addr {
        AMode::RegOffset(base, off) => {
            if is_imm12(*off) {
                (reg(*base).to_string(), *off)
            } else {
                let _ = writeln!(out, "\tli t6, {off}\n\tadd t6, t6, {}", reg(*base));
                ("t6".to_string(), 0)
            }
        }
        AMode::Slot(slot, extra) => {
            let off = func.frame.offset_of(*slot) + extra;
            debug_assert!(is_imm12(off), "unrewritten large frame offset {off}");
            ("sp".to_string(), off)
        }
        AMode::IncomingArg(index) => {
            let off = func.frame.total_size() as i32 + index * 8;
            debug_assert!(is_imm12(off), "unrewritten large argument offset {off}");
            ("sp".to_string(), off)
        }
        AMode::Global(..) | AMode::Str(_) => {
            unreachable!("symbolic addresses are resolved by load_store_operand")
        }
    }
}

fn emit_inst(ir: &IrModule, func: &Function, inst: &MInst, out: &mut String) {
    match inst {
        MInst::Move { dst, src } => {
            let mnemonic = match dst {
                Reg::Phys(p) if p.class() == crate::lir::RegClass::Float => "fmv.s",
                _ => "mv",
            };
            let _ = writeln!(out, "\t{mnemonic} {}, {}", reg(*dst), reg(*src));
        }
        MInst::LoadImm { dst, imm } => {
            let _ = writeln!(out, "\tli {}, {imm}", reg(*dst));
        }
        MInst::LoadFloatImm { dst, bits } => {
            let _ = writeln!(out, "\tli t6, {}\n\tfmv.w.x {}, t6", *bits as i32, reg(*dst));
        }
        MInst::LoadAddr { dst, addr } => match addr {
            AMode::RegOffset(base, off) => {
                if is_imm12(*off) {
                    let _ = writeln!(out, "\taddi {}, {}, {off}", reg(*dst), reg(*base));
                } else {
                    let _ = writeln!(out, "\tli {}, {off}", reg(*dst));
                    let _ = writeln!(out, "\tadd {}, {}, {}", reg(*dst), reg(*dst), reg(*base));
                }
            }
            AMode::Slot(slot, extra) => {
                let off = func.frame.offset_of(*slot) + extra;
                if is_imm12(off) {
                    let _ = writeln!(out, "\taddi {}, sp, {off}", reg(*dst));
                } else {
                    let _ = writeln!(out, "\tli {}, {off}", reg(*dst));
                    let _ = writeln!(out, "\tadd {}, {}, sp", reg(*dst), reg(*dst));
                }
            }
            AMode::IncomingArg(index) => {
                let off = func.frame.total_size() as i32 + index * 8;
                if is_imm12(off) {
                    let _ = writeln!(out, "\taddi {}, sp, {off}", reg(*dst));
                } else {
                    let _ = writeln!(out, "\tli {}, {off}", reg(*dst));
                    let _ = writeln!(out, "\tadd {}, {}, sp", reg(*dst), reg(*dst));
                }
            }
            AMode::Global(gv, off) => {
                let gname = &ir.globals[*gv].name;
                if *off == 0 {
                    let _ = writeln!(out, "\tla {}, {gname}", reg(*dst));
                } else {
                    let _ = writeln!(out, "\tla {}, {gname}{off:+}", reg(*dst));
                }
            }
            AMode::Str(id) => {
                let _ = writeln!(out, "\tla {}, .Lstr{}", reg(*dst), id.as_u32());
            }
        },
        MInst::Load { kind, dst, addr } => {
            let mnemonic = match kind {
                MemKind::Word => "lw",
                MemKind::Double => "ld",
                MemKind::Float => "flw",
            };
            let (base, off) = load_store_operand(ir, func, addr, out);
            let _ = writeln!(out, "\t{mnemonic} {}, {off}({base})", reg(*dst));
        }
        MInst::Store { kind, src, addr } => {
            let mnemonic = match kind {
                MemKind::Word => "sw",
                MemKind::Double => "sd",
                MemKind::Float => "fsw",
            };
            let (base, off) = load_store_operand(ir, func, addr, out);
            let _ = writeln!(out, "\t{mnemonic} {}, {off}({base})", reg(*src));
        }
        MInst::IntArith { op, dst, lhs, rhs } => emit_int_arith(*op, *dst, *lhs, rhs, out),
        MInst::FloatArith { op, dst, lhs, rhs } => {
            let mnemonic = match op {
                crate::lir::FloatOp::Fadd => "fadd.s",
                crate::lir::FloatOp::Fsub => "fsub.s",
                crate::lir::FloatOp::Fmul => "fmul.s",
                crate::lir::FloatOp::Fdiv => "fdiv.s",
                crate::lir::FloatOp::Fmin => "fmin.s",
                crate::lir::FloatOp::Fmax => "fmax.s",
            };
            let _ = writeln!(out, "\t{mnemonic} {}, {}, {}", reg(*dst), reg(*lhs), reg(*rhs));
        }
        MInst::FloatFma { op, dst, a, b, c } => {
            let mnemonic = match op {
                crate::lir::FmaOp::Fmadd => "fmadd.s",
                crate::lir::FmaOp::Fmsub => "fmsub.s",
                crate::lir::FmaOp::Fnmadd => "fnmadd.s",
                crate::lir::FmaOp::Fnmsub => "fnmsub.s",
            };
            let _ = writeln!(
                out,
                "\t{mnemonic} {}, {}, {}, {}",
                reg(*dst),
                reg(*a),
                reg(*b),
                reg(*c)
            );
        }
        MInst::Fneg { dst, src } => {
            let _ = writeln!(out, "\tfneg.s {}, {}", reg(*dst), reg(*src));
        }
        MInst::Icmp { cc, dst, lhs, rhs } => {
            let rhs = match rhs {
                RegImm::Reg(r) => reg(*r).to_string(),
                RegImm::Imm(imm) => {
                    let _ = writeln!(out, "\tli t6, {imm}");
                    "t6".to_string()
                }
            };
            let d = reg(*dst);
            let l = reg(*lhs);
            match cc {
                IntCC::SignedLessThan => {
                    let _ = writeln!(out, "\tslt {d}, {l}, {rhs}");
                }
                IntCC::SignedGreaterThan => {
                    let _ = writeln!(out, "\tslt {d}, {rhs}, {l}");
                }
                IntCC::SignedLessThanOrEqual => {
                    let _ = writeln!(out, "\tslt {d}, {rhs}, {l}\n\txori {d}, {d}, 1");
                }
                IntCC::SignedGreaterThanOrEqual => {
                    let _ = writeln!(out, "\tslt {d}, {l}, {rhs}\n\txori {d}, {d}, 1");
                }
                IntCC::Equal => {
                    let _ = writeln!(out, "\txor {d}, {l}, {rhs}\n\tseqz {d}, {d}");
                }
                IntCC::NotEqual => {
                    let _ = writeln!(out, "\txor {d}, {l}, {rhs}\n\tsnez {d}, {d}");
                }
            }
        }
        MInst::Fcmp { cc, dst, lhs, rhs } => {
            let d = reg(*dst);
            let l = reg(*lhs);
            let r = reg(*rhs);
            match cc {
                FloatCC::Equal => {
                    let _ = writeln!(out, "\tfeq.s {d}, {l}, {r}");
                }
                FloatCC::NotEqual => {
                    let _ = writeln!(out, "\tfeq.s {d}, {l}, {r}\n\txori {d}, {d}, 1");
                }
                FloatCC::LessThan => {
                    let _ = writeln!(out, "\tflt.s {d}, {l}, {r}");
                }
                FloatCC::LessThanOrEqual => {
                    let _ = writeln!(out, "\tfle.s {d}, {l}, {r}");
                }
                FloatCC::GreaterThan => {
                    let _ = writeln!(out, "\tflt.s {d}, {r}, {l}");
                }
                FloatCC::GreaterThanOrEqual => {
                    let _ = writeln!(out, "\tfle.s {d}, {r}, {l}");
                }
            }
        }
        MInst::FcvtWS { dst, src } => {
            let _ = writeln!(out, "\tfcvt.w.s {}, {}, rtz", reg(*dst), reg(*src));
        }
        MInst::FcvtSW { dst, src } => {
            let _ = writeln!(out, "\tfcvt.s.w {}, {}", reg(*dst), reg(*src));
        }
        MInst::Branch {
            cc,
            lhs,
            rhs,
            taken,
            not_taken,
        } => {
            let mnemonic = match cc {
                IntCC::Equal => "beq",
                IntCC::NotEqual => "bne",
                IntCC::SignedLessThan => "blt",
                IntCC::SignedGreaterThanOrEqual => "bge",
                IntCC::SignedGreaterThan => "bgt",
                IntCC::SignedLessThanOrEqual => "ble",
            };
            let _ = writeln!(
                out,
                "\t{mnemonic} {}, {}, {}",
                reg(*lhs),
                reg(*rhs),
                block_label(func, *taken)
            );
            let _ = writeln!(out, "\tj {}", block_label(func, *not_taken));
        }
        MInst::Jump { dest } => {
            let _ = writeln!(out, "\tj {}", block_label(func, *dest));
        }
        MInst::Call { name, .. } => {
            let _ = writeln!(out, "\tcall {name}");
        }
        MInst::Ret { .. } => {
            let total = func.frame.total_size() as i32;
            let ra_off = func.frame.ra_offset();
            if is_imm12(ra_off) {
                let _ = writeln!(out, "\tld ra, {ra_off}(sp)");
            } else {
                let _ = writeln!(out, "\tli t6, {ra_off}\n\tadd t6, sp, t6\n\tld ra, 0(t6)");
            }
            if is_imm12(total) {
                let _ = writeln!(out, "\taddi sp, sp, {total}");
            } else {
                let _ = writeln!(out, "\tli t6, {total}\n\tadd sp, sp, t6");
            }
            out.push_str("\tret\n");
        }
    }
}

/// Resolve a load/store address to `(base, imm12 offset)`, spilling global
/// addresses into `t6`.
fn load_store_operand(
    ir: &IrModule,
    func: &Function,
    addr: &AMode,
    out: &mut String,
) -> (String, i32) {
    match addr {
        AMode::Global(gv, off) => {
            let gname = &ir.globals[*gv].name;
            if *off == 0 {
                let _ = writeln!(out, "\tla t6, {gname}");
            } else {
                let _ = writeln!(out, "\tla t6, {gname}{off:+}");
            }
            ("t6".to_string(), 0)
        }
        AMode::Str(id) => {
            let _ = writeln!(out, "\tla t6, .Lstr{}", id.as_u32());
            ("t6".to_string(), 0)
        }
        other => mem_operand(func, other, out),
    }
}

fn emit_int_arith(op: IntOp, dst: Reg, lhs: Reg, rhs: &RegImm, out: &mut String) {
    let (rr, ri) = match op {
        IntOp::Add => ("add", Some("addi")),
        IntOp::Addw => ("addw", Some("addiw")),
        IntOp::Sub => ("sub", None),
        IntOp::Subw => ("subw", None),
        IntOp::Mul => ("mul", None),
        IntOp::Mulw => ("mulw", None),
        IntOp::Divw => ("divw", None),
        IntOp::Remw => ("remw", None),
        IntOp::And => ("and", Some("andi")),
        IntOp::Or => ("or", Some("ori")),
        IntOp::Xor => ("xor", Some("xori")),
        IntOp::Sll => ("sll", Some("slli")),
        IntOp::Sllw => ("sllw", Some("slliw")),
        IntOp::Srl => ("srl", Some("srli")),
        IntOp::Sra => ("sra", Some("srai")),
        IntOp::Sraw => ("sraw", Some("sraiw")),
    };
    match rhs {
        RegImm::Reg(r) => {
            let _ = writeln!(out, "\t{rr} {}, {}, {}", reg(dst), reg(lhs), reg(*r));
        }
        RegImm::Imm(imm) => match ri {
            Some(ri) if is_imm12(*imm) => {
                let _ = writeln!(out, "\t{ri} {}, {}, {imm}", reg(dst), reg(lhs), imm = imm);
            }
            _ => {
                let _ = writeln!(out, "\tli t6, {imm}");
                let _ = writeln!(out, "\t{rr} {}, {}, t6", reg(dst), reg(lhs));
            }
        },
    }
}
