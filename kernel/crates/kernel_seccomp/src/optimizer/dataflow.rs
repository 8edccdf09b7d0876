//! Accumulator Dataflow
//!
//! A single forward pass computes the [`AccState`] reaching every node;
//! jumps only go forward, so predecessors are always complete. With those
//! states the pass
//!
//! - folds comparisons whose outcome is fixed into `ja`,
//! - turns loads of the value already in `A` into `ja 0`,
//! - threads each jump edge through every following node the edge's state
//!   makes a no-op: redundant loads, `ja` and decided comparisons.
//!
//! Threading is what merges the repeated `ld [arg]; jeq` prefixes of
//! adjacent rules: the failing edge of the first test skips the reload and
//! the now-decided second test. An edge may also step over a fresh load of
//! `seccomp_data`, but then it only lands where `A` is dead, since the
//! skipped load never happens on the new path.

extern crate alloc;

use alloc::vec;
use alloc::vec::Vec;

use super::dce::accumulator_live;
use super::state::AccState;
use super::{Node, Pass, reaches};
use crate::bytecode::opcode::{Operation, Source};

/// Longest chain of no-op nodes one edge is threaded through.
const MAX_THREAD_STEPS: usize = 64;

pub(super) struct Dataflow;

impl Pass for Dataflow {
    fn name(&self) -> &'static str {
        "dataflow"
    }

    fn run(&self, nodes: &mut Vec<Node>) {
        let states = analyze(nodes);
        let live = accumulator_live(nodes);
        let thread = |pc, state, target, conditional| thread_edge(nodes, &live, pc, state, target, conditional);
        let mut out = nodes.clone();

        for (pc, state) in states.iter().enumerate() {
            let Some(state) = state else {
                continue;
            };
            out[pc] = match nodes[pc] {
                Node::Stmt(insn) if state.is_redundant_load(&insn) => Node::Ja(pc + 1),
                Node::Ja(target) => Node::Ja(thread(pc, state.clone(), target, false)),
                Node::Cond {
                    op,
                    source: Source::K,
                    k,
                    jt,
                    jf,
                } => match (state.refine(op, k, true), state.refine(op, k, false)) {
                    (Some(taken), None) => Node::Ja(thread(pc, taken, jt, false)),
                    (None, Some(not_taken)) => Node::Ja(thread(pc, not_taken, jf, false)),
                    (Some(taken), Some(not_taken)) => Node::Cond {
                        op,
                        source: Source::K,
                        k,
                        jt: thread(pc, taken, jt, true),
                        jf: thread(pc, not_taken, jf, true),
                    },
                    (None, None) => nodes[pc],
                },
                other => other,
            };
        }

        *nodes = out;
    }
}

/// State of `A` on entry to each node, `None` where no path arrives.
pub(super) fn analyze(nodes: &[Node]) -> Vec<Option<AccState>> {
    let mut states: Vec<Option<AccState>> = vec![None; nodes.len()];
    if let Some(entry) = states.first_mut() {
        // The kernel clears A before the first instruction.
        *entry = Some(AccState::constant(0));
    }

    for pc in 0..nodes.len() {
        let Some(state) = states[pc].clone() else {
            continue;
        };
        match nodes[pc] {
            Node::Stmt(insn) => join(&mut states, pc + 1, state.transfer(&insn)),
            Node::Ret(_) => {}
            Node::Ja(target) => join(&mut states, target, state),
            Node::Cond {
                op,
                source: Source::K,
                k,
                jt,
                jf,
            } => {
                if let Some(taken) = state.refine(op, k, true) {
                    join(&mut states, jt, taken);
                }
                if let Some(not_taken) = state.refine(op, k, false) {
                    join(&mut states, jf, not_taken);
                }
            }
            Node::Cond { jt, jf, .. } => {
                join(&mut states, jt, state.clone());
                join(&mut states, jf, state);
            }
        }
    }
    states
}

fn join(states: &mut [Option<AccState>], idx: usize, incoming: AccState) {
    if let Some(slot) = states.get_mut(idx) {
        *slot = Some(match slot.take() {
            Some(existing) => existing.meet(&incoming),
            None => incoming,
        });
    }
}

/// Furthest node an edge from `pc` into `target` can be redirected to.
fn thread_edge(
    nodes: &[Node],
    live: &[bool],
    pc: usize,
    mut state: AccState,
    mut target: usize,
    conditional: bool,
) -> usize {
    let mut best = target;
    // False once a skipped load leaves the real `A` behind `state`.
    let mut in_sync = true;
    for _ in 0..MAX_THREAD_STEPS {
        let next = match nodes.get(target) {
            Some(&Node::Ja(next)) => next,
            Some(Node::Stmt(insn)) if state.is_redundant_load(insn) => target + 1,
            Some(Node::Stmt(insn))
                if matches!(
                    insn.operation(),
                    Some(Operation::LoadAbs | Operation::LoadImm | Operation::LoadLen)
                ) =>
            {
                state = state.transfer(insn);
                in_sync = false;
                target + 1
            }
            Some(&Node::Cond {
                op,
                source: Source::K,
                k,
                jt,
                jf,
            }) => match (state.refine(op, k, true), state.refine(op, k, false)) {
                (Some(taken), None) => {
                    state = taken;
                    jt
                }
                (None, Some(not_taken)) => {
                    state = not_taken;
                    jf
                }
                _ => break,
            },
            _ => break,
        };
        if conditional && !reaches(pc, next) {
            break;
        }
        target = next;
        if in_sync || !live.get(target).copied().unwrap_or(true) {
            best = target;
        }
    }
    best
}
