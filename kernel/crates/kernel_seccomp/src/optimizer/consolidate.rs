//! Range and Mask Consolidation
//!
//! Both passes look for chains of `jeq #k` tests that share their true
//! target `T`, each linked to the next through its false edge, every link
//! reachable only from the previous one:
//!
//! ```text
//!   jeq #k0, T, p1
//! p1:
//!   jeq #k1, T, p2
//!   ...
//!   jeq #kn, T, F
//! ```
//!
//! A contiguous value set becomes a `jge`/`jgt` pair. A set of every
//! combination of some free bits over a fixed base becomes `and` + `jeq`,
//! which clobbers `A` and therefore needs it dead at `T` and `F`.

extern crate alloc;

use alloc::collections::BTreeSet;
use alloc::vec;
use alloc::vec::Vec;

use super::dce::accumulator_live;
use super::{Node, Pass, reaches};
use crate::bytecode::insn::Instruction;
use crate::bytecode::opcode::{AluOp, JmpOp, Source};

/// Fewest tests worth consolidating into a range.
const MIN_RANGE_CHAIN: usize = 3;

/// Fewest free bits worth consolidating into a mask test.
const MIN_FREE_BITS: u32 = 2;

struct Chain {
    members: Vec<usize>,
    values: BTreeSet<u32>,
    on_match: usize,
    on_miss: usize,
}

pub(super) struct ConsolidateRanges;

impl Pass for ConsolidateRanges {
    fn name(&self) -> &'static str {
        "consolidate-ranges"
    }

    fn run(&self, nodes: &mut Vec<Node>) {
        for chain in find_chains(nodes) {
            let (Some(&lo), Some(&hi)) = (chain.values.first(), chain.values.last()) else {
                continue;
            };
            let contiguous = u64::from(hi) - u64::from(lo) + 1 == chain.values.len() as u64;
            if chain.values.len() < MIN_RANGE_CHAIN || !contiguous {
                continue;
            }
            let (head, second) = (chain.members[0], chain.members[1]);
            if !reaches(head, chain.on_miss) {
                continue;
            }
            nodes[head] = Node::Cond {
                op: JmpOp::Jge,
                source: Source::K,
                k: lo,
                jt: second,
                jf: chain.on_miss,
            };
            nodes[second] = Node::Cond {
                op: JmpOp::Jgt,
                source: Source::K,
                k: hi,
                jt: chain.on_miss,
                jf: chain.on_match,
            };
        }
    }
}

pub(super) struct ConsolidateMasks;

impl Pass for ConsolidateMasks {
    fn name(&self) -> &'static str {
        "consolidate-masks"
    }

    fn run(&self, nodes: &mut Vec<Node>) {
        let live = accumulator_live(nodes);
        for chain in find_chains(nodes) {
            let Some((free, base)) = mask_cover(&chain.values) else {
                continue;
            };
            let (head, second) = (chain.members[0], chain.members[1]);
            let a_dead = |idx: usize| !live.get(idx).copied().unwrap_or(true);
            if second != head + 1
                || !reaches(second, chain.on_miss)
                || !a_dead(chain.on_match)
                || !a_dead(chain.on_miss)
            {
                continue;
            }
            nodes[head] = Node::Stmt(Instruction::alu_k(AluOp::And, !free));
            nodes[second] = Node::Cond {
                op: JmpOp::Jeq,
                source: Source::K,
                k: base,
                jt: chain.on_match,
                jf: chain.on_miss,
            };
        }
    }
}

/// `(free, base)` when `values` is exactly every `base | subset(free)`.
fn mask_cover(values: &BTreeSet<u32>) -> Option<(u32, u32)> {
    let &first = values.first()?;
    let free = values.iter().fold(0, |acc, v| acc | (v ^ first));
    let bits = free.count_ones();
    if bits < MIN_FREE_BITS || values.len() != 1usize << bits {
        return None;
    }
    Some((free, first & !free))
}

fn is_jeq_k(node: &Node) -> Option<(u32, usize, usize)> {
    match *node {
        Node::Cond {
            op: JmpOp::Jeq,
            source: Source::K,
            k,
            jt,
            jf,
        } => Some((k, jt, jf)),
        _ => None,
    }
}

fn find_chains(nodes: &[Node]) -> Vec<Chain> {
    let mut preds = vec![0usize; nodes.len()];
    for (pc, node) in nodes.iter().enumerate() {
        for succ in node.successors(pc).into_iter().flatten() {
            if let Some(count) = preds.get_mut(succ) {
                *count += 1;
            }
        }
    }

    let mut claimed = vec![false; nodes.len()];
    let mut chains = Vec::new();
    for head in 0..nodes.len() {
        if claimed[head] {
            continue;
        }
        let Some((k, on_match, mut next)) = is_jeq_k(&nodes[head]) else {
            continue;
        };
        let mut members = vec![head];
        let mut values = BTreeSet::from([k]);
        while let Some((k, jt, jf)) = nodes.get(next).and_then(is_jeq_k) {
            if jt != on_match || preds[next] != 1 {
                break;
            }
            members.push(next);
            values.insert(k);
            next = jf;
        }
        if members.len() < 2 {
            continue;
        }
        for &member in &members {
            claimed[member] = true;
        }
        chains.push(Chain {
            members,
            values,
            on_match,
            on_miss: next,
        });
    }
    chains
}
