//! Lightweight pass timing.
//!
//! Each pass grabs a scoped guard on entry; the elapsed time is logged at
//! debug level when the guard drops. The overhead is a clock read per pass,
//! which is noise next to the passes themselves.

use std::time::Instant;

/// Scoped timer for a single pass invocation.
pub struct PassTimer {
    pass: &'static str,
    start: Instant,
}

impl Drop for PassTimer {
    fn drop(&mut self) {
        log::debug!("{}: {}us", self.pass, self.start.elapsed().as_micros());
    }
}

fn start(pass: &'static str) -> PassTimer {
    PassTimer {
        pass,
        start: Instant::now(),
    }
}

macro_rules! define_passes {
    ($($name:ident),* $(,)?) => {
        $(
            /// Start timing the named pass.
            pub fn $name() -> PassTimer {
                start(stringify!($name))
            }
        )*
    };
}

define_passes! {
    flowgraph,
    domtree,
    loop_analysis,
    alias_analysis,
    effects,
    scev,
    mem2reg,
    simple_preopt,
    dce,
    loop_simplify,
    lcssa,
    licm,
    induction,
    loop_unroll,
    loop_unswitch,
    unreachable_code,
    lower,
    strength_reduction,
    peephole,
    regalloc,
    stack_rewrite,
    emit,
}
