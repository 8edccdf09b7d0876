//! Jump threading and return merging.

use super::{Node, Pass, reaches};

/// Redirect jumps past `ja` chains.
///
/// A `ja` ending at a return becomes that return, and a conditional whose
/// two targets coincide becomes a `ja`. Conditionals only follow a chain as
/// far as their 8-bit offsets reach.
pub(super) struct ThreadJumps;

impl Pass for ThreadJumps {
    fn name(&self) -> &'static str {
        "thread-jumps"
    }

    fn run(&self, nodes: &mut alloc::vec::Vec<Node>) {
        for pc in 0..nodes.len() {
            nodes[pc] = match nodes[pc] {
                Node::Ja(target) => {
                    let end = follow(nodes, target, |_| true);
                    match nodes.get(end) {
                        Some(ret @ Node::Ret(_)) if end != pc + 1 => *ret,
                        _ => Node::Ja(end),
                    }
                }
                Node::Cond {
                    op,
                    source,
                    k,
                    jt,
                    jf,
                } => {
                    let jt = follow(nodes, jt, |t| reaches(pc, t));
                    let jf = follow(nodes, jf, |t| reaches(pc, t));
                    if jt == jf {
                        Node::Ja(jt)
                    } else {
                        Node::Cond {
                            op,
                            source,
                            k,
                            jt,
                            jf,
                        }
                    }
                }
                other => other,
            };
        }
    }
}

/// End of the `ja` chain starting at `target`, stopping before any hop
/// `accept` rejects.
fn follow(nodes: &[Node], mut target: usize, accept: impl Fn(usize) -> bool) -> usize {
    while let Some(&Node::Ja(next)) = nodes.get(target) {
        if !accept(next) {
            break;
        }
        target = next;
    }
    target
}

/// Send conditional edges that end at `ret #k` to the nearest identical
/// return after the jump.
pub(super) struct MergeReturns;

impl Pass for MergeReturns {
    fn name(&self) -> &'static str {
        "merge-returns"
    }

    fn run(&self, nodes: &mut alloc::vec::Vec<Node>) {
        for pc in 0..nodes.len() {
            let Node::Cond {
                op,
                source,
                k,
                jt,
                jf,
            } = nodes[pc]
            else {
                continue;
            };
            let jt = nearest_return(nodes, pc, jt);
            let jf = nearest_return(nodes, pc, jf);
            nodes[pc] = Node::Cond {
                op,
                source,
                k,
                jt,
                jf,
            };
        }
    }
}

fn nearest_return(nodes: &[Node], pc: usize, target: usize) -> usize {
    let end = follow(nodes, target, |_| true);
    let Some(ret) = nodes.get(end).filter(|node| node.is_ret_k()) else {
        return target;
    };
    (pc + 1..=end)
        .find(|&idx| nodes[idx] == *ret)
        .filter(|&idx| reaches(pc, idx))
        .unwrap_or(target)
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;
    use crate::bytecode::insn::Instruction;
    use crate::bytecode::opcode::{JmpOp, Source};

    fn cond(jt: usize, jf: usize) -> Node {
        Node::Cond {
            op: JmpOp::Jeq,
            source: Source::K,
            k: 1,
            jt,
            jf,
        }
    }

    #[test]
    fn follows_chains() {
        let mut nodes = vec![
            cond(1, 3),
            Node::Ja(2),
            Node::Ja(4),
            Node::Ret(Instruction::ret(0)),
            Node::Ret(Instruction::ret(9)),
        ];
        ThreadJumps.run(&mut nodes);
        assert_eq!(nodes[0], cond(4, 3));
        assert_eq!(nodes[1], Node::Ret(Instruction::ret(9)));
        assert_eq!(nodes[2], Node::Ret(Instruction::ret(9)));
    }

    #[test]
    fn equal_targets_become_ja() {
        let mut nodes = vec![cond(1, 2), Node::Ja(2), Node::Ret(Instruction::ret(0))];
        ThreadJumps.run(&mut nodes);
        assert_eq!(nodes[0], Node::Ja(2));
    }

    #[test]
    fn conditional_stays_in_range() {
        let mut nodes = vec![cond(1, 2), Node::Ja(400), Node::Ret(Instruction::ret(1))];
        nodes.resize(400, Node::Ret(Instruction::ret(1)));
        nodes.push(Node::Ret(Instruction::ret(2)));
        ThreadJumps.run(&mut nodes);
        assert_eq!(nodes[0], cond(1, 2));
    }

    #[test]
    fn merges_to_nearest_return() {
        let mut nodes = vec![
            cond(3, 1),
            Node::Ret(Instruction::ret(7)),
            Node::Ret(Instruction::ret(8)),
            Node::Ja(4),
            Node::Ret(Instruction::ret(7)),
        ];
        MergeReturns.run(&mut nodes);
        assert_eq!(nodes[0], cond(1, 1));
    }
}
