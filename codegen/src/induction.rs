//! Induction-variable canonicalization: trip-count annotation.
//!
//! Runs the scalar-evolution analysis over a function's loops and caches the
//! derived trip counts on the loop nodes, where the unrolling passes pick
//! them up. Loops whose shape is not recognized simply stay unannotated.

use crate::flowgraph::ControlFlowGraph;
use crate::ir::Function;
use crate::loop_analysis::LoopAnalysis;
use crate::scev::ScevAnalysis;
use crate::timing;

/// Annotate the loops of `func` with trip counts. Returns the number of
/// loops that received one.
pub fn do_induction_analysis(
    func: &Function,
    cfg: &ControlFlowGraph,
    la: &mut LoopAnalysis,
) -> usize {
    let _tt = timing::induction();
    let scev = ScevAnalysis::compute(func, cfg, la);
    let mut annotated = 0;
    for lp in la.loops_postorder() {
        if la.data(lp).trip_count.is_some() {
            continue;
        }
        if let Some(trip) = scev.loop_trip_count(func, la, lp) {
            la.set_trip_count(lp, trip);
            annotated += 1;
            log::debug!("loop at {} has trip count {}", la.data(lp).header, trip);
        }
    }
    annotated
}
