//! Target-specific lowering and optimization.
//!
//! RV64 is the only target; the module structure keeps the target-dependent
//! pieces (lowering, strength reduction, peepholes, register sets, emission)
//! behind one boundary.

pub mod riscv64;
