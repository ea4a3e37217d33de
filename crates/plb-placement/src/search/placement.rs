//! New replica placement.
//!
//! Extra replicas are dropped first, then every unplaced slot is put on the
//! node that yields the best (violations, energy) without adding a
//! violation. When moves are allowed, a slot that fits nowhere may push a
//! replica of another partition out of the way; whatever is still
//! unplaced after that goes through a short annealing pass.

use crate::error::SearchResult;
use crate::score::ScoreScope;
use crate::solution::{Move, Solution};

use super::{SearchContext, annealing};

pub(crate) fn place<'a>(ctx: &mut SearchContext<'a>, with_move: bool) -> SearchResult<Solution<'a>> {
    let snap = ctx.snap;
    let mut solution = Solution::new(snap, ScoreScope::All)
        .respect_node_buffer(true)
        .penalize_unplaced(true);

    drop_extra_replicas(ctx, &mut solution)?;
    place_new_replicas(ctx, &mut solution)?;
    if with_move && solution.unplaced_count() > 0 {
        place_by_relocation(ctx, &mut solution)?;
        if solution.unplaced_count() > 0 {
            annealing::place_leftovers(ctx, &mut solution)?;
        }
    }
    Ok(solution)
}

fn drop_extra_replicas(ctx: &mut SearchContext<'_>, solution: &mut Solution<'_>) -> SearchResult<()> {
    let snap = ctx.snap;
    for (p, part) in snap.partitions.iter().enumerate() {
        for _ in 0..part.extra_replicas {
            ctx.tick()?;
            let mut best: Option<(crate::Violations, f64, usize)> = None;
            for slot in 0..part.replicas.len() {
                if !solution.can_drop(p, slot) {
                    continue;
                }
                let (v, e) = solution.evaluate(&[Move::Drop { partition: p, slot }]);
                if best.is_none_or(|(bv, be, _)| (v, e) < (bv, be)) {
                    best = Some((v, e, slot));
                }
            }
            let Some((_, _, slot)) = best else {
                break;
            };
            solution.apply(&[Move::Drop { partition: p, slot }]);
        }
    }
    Ok(())
}

fn unplaced_slots(solution: &Solution<'_>) -> Vec<(usize, usize)> {
    let snap = solution.snapshot();
    let mut out = Vec::new();
    for (p, part) in snap.partitions.iter().enumerate() {
        for (i, entry) in part.replicas.iter().enumerate() {
            let slot = solution.slots()[p][i];
            if entry.is_new && slot.node.is_none() && !slot.dropped {
                out.push((p, i));
            }
        }
    }
    out
}

fn place_new_replicas(ctx: &mut SearchContext<'_>, solution: &mut Solution<'_>) -> SearchResult<()> {
    let snap = ctx.snap;
    for (p, slot) in unplaced_slots(solution) {
        ctx.tick()?;
        let before = solution.violations();
        let mut best: Option<(crate::Violations, f64, usize)> = None;
        for to in 0..snap.nodes.len() {
            if !solution.can_relocate(p, slot, to) {
                continue;
            }
            let (v, e) = solution.evaluate(&[Move::Relocate {
                partition: p,
                slot,
                to,
            }]);
            if v > before {
                continue;
            }
            if best.is_none_or(|(bv, be, _)| (v, e) < (bv, be)) {
                best = Some((v, e, to));
            }
        }
        if let Some((_, _, to)) = best {
            solution.apply(&[Move::Relocate {
                partition: p,
                slot,
                to,
            }]);
        }
    }
    Ok(())
}

/// Make room for an unplaced slot by relocating one replica of another partition.
fn place_by_relocation(ctx: &mut SearchContext<'_>, solution: &mut Solution<'_>) -> SearchResult<()> {
    let snap = ctx.snap;
    let budget = ctx.limits.total_iterations();
    for (p, slot) in unplaced_slots(solution) {
        let before = solution.violations();
        let mut evaluated = 0u64;
        let mut best: Option<(crate::Violations, f64, Vec<Move>)> = None;

        'targets: for to in 0..snap.nodes.len() {
            if !snap.nodes[to].accepts_replicas() || solution.slots()[p].iter().any(|s| s.live_node() == Some(to)) {
                continue;
            }
            for q in 0..snap.partitions.len() {
                if q == p {
                    continue;
                }
                for j in 0..solution.slots()[q].len() {
                    if solution.slots()[q][j].live_node() != Some(to) {
                        continue;
                    }
                    for away in 0..snap.nodes.len() {
                        if !solution.can_relocate(q, j, away) {
                            continue;
                        }
                        if evaluated >= budget {
                            break 'targets;
                        }
                        evaluated += 1;
                        ctx.tick()?;

                        let mut moves = solution.with_followers(Move::Relocate {
                            partition: q,
                            slot: j,
                            to: away,
                        });
                        let undo = solution.apply(&moves);
                        let fits = solution.can_relocate(p, slot, to);
                        solution.undo(undo);
                        if !fits {
                            continue;
                        }
                        moves.push(Move::Relocate {
                            partition: p,
                            slot,
                            to,
                        });
                        let (v, e) = solution.evaluate(&moves);
                        if v > before {
                            continue;
                        }
                        if best.as_ref().is_none_or(|(bv, be, _)| (v, e) < (*bv, *be)) {
                            best = Some((v, e, moves));
                        }
                    }
                }
            }
        }
        if let Some((_, _, moves)) = best {
            solution.apply(&moves);
        }
    }
    Ok(())
}
