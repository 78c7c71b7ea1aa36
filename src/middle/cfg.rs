//! The control-flow graph of a function, derived from block terminators.
//!
//! The graph is a view: it borrows nothing and holds plain block ids, so
//! it can outlive intermediate analysis state.  Edges come from jump
//! targets naming blocks directly; targets expressed as address terms
//! contribute edges only after the dataflow engine has resolved them
//! (see [Cfg::with_resolved_targets]).

use crate::common::*;
use crate::middle::ir::{BlockId, Function, StmtId};

#[derive(Clone, Debug)]
pub struct Cfg {
    succs: Vec<Vec<BlockId>>,
    preds: Vec<Vec<BlockId>>,
}

impl Cfg {
    /// Builds the graph from direct jump targets alone.
    pub fn new(function: &Function) -> Self {
        Self::with_resolved_targets(function, &Map::new())
    }

    /// Builds the graph from direct jump targets plus the targets the
    /// dataflow engine resolved for indirect jumps.
    pub fn with_resolved_targets(
        function: &Function,
        resolved: &Map<StmtId, Vec<BlockId>>,
    ) -> Self {
        let count = function.block_ids().count();
        let mut succs = vec![Vec::new(); count];
        let mut preds = vec![Vec::new(); count];
        for block in function.block_ids() {
            let mut targets = function.successors(block);
            if let Some(stmt) = function.terminator(block) {
                if let Some(extra) = resolved.get(&stmt) {
                    for &target in extra {
                        if !targets.contains(&target) {
                            targets.push(target);
                        }
                    }
                }
            }
            for &target in &targets {
                preds[target.index()].push(block);
            }
            succs[block.index()] = targets;
        }
        Self { succs, preds }
    }

    pub fn successors(&self, block: BlockId) -> &[BlockId] {
        &self.succs[block.index()]
    }

    pub fn predecessors(&self, block: BlockId) -> &[BlockId] {
        &self.preds[block.index()]
    }

    /// Blocks reachable from `entry`, in breadth-first discovery order.
    pub fn reachable(&self, entry: BlockId) -> Vec<BlockId> {
        let mut seen = Set::new();
        let mut queue = std::collections::VecDeque::new();
        let mut order = Vec::new();
        seen.insert(entry);
        queue.push_back(entry);
        while let Some(block) = queue.pop_front() {
            order.push(block);
            for &succ in self.successors(block) {
                if seen.insert(succ) {
                    queue.push_back(succ);
                }
            }
        }
        order
    }

    /// Reverse postorder from `entry`; unreachable blocks are absent.
    pub fn reverse_postorder(&self, entry: BlockId) -> Vec<BlockId> {
        let mut seen = Set::new();
        let mut postorder = Vec::new();
        // Iterative DFS keeping an explicit edge cursor per frame.
        let mut stack = vec![(entry, 0usize)];
        seen.insert(entry);
        while let Some(&mut (block, ref mut cursor)) = stack.last_mut() {
            if let Some(&succ) = self.succs[block.index()].get(*cursor) {
                *cursor += 1;
                if seen.insert(succ) {
                    stack.push((succ, 0));
                }
            } else {
                postorder.push(block);
                stack.pop();
            }
        }
        postorder.reverse();
        postorder
    }
}

/// Immediate dominators of a graph given by dense `u32`-like indices.
///
/// Shared by the block-level CFG and the structural analyzer's region
/// graph, which is why it speaks raw `usize` indices.  Returns, for every
/// node, its immediate dominator; the entry dominates itself and
/// unreachable nodes have none.
pub fn immediate_dominators(
    count: usize,
    entry: usize,
    successors: impl Fn(usize) -> Vec<usize>,
) -> Vec<Option<usize>> {
    // Reverse postorder and predecessor lists.
    let mut seen = vec![false; count];
    let mut postorder = Vec::new();
    let mut preds = vec![Vec::new(); count];
    let mut stack = vec![(entry, 0usize)];
    seen[entry] = true;
    while let Some(&mut (node, ref mut cursor)) = stack.last_mut() {
        let succs = successors(node);
        if let Some(&succ) = succs.get(*cursor) {
            *cursor += 1;
            preds[succ].push(node);
            if !seen[succ] {
                seen[succ] = true;
                stack.push((succ, 0));
            }
        } else {
            postorder.push(node);
            stack.pop();
        }
    }
    let rpo: Vec<usize> = postorder.iter().rev().copied().collect();
    let mut rpo_index = vec![usize::MAX; count];
    for (index, &node) in rpo.iter().enumerate() {
        rpo_index[node] = index;
    }

    // The Cooper-Harvey-Kennedy iteration.
    let mut idom: Vec<Option<usize>> = vec![None; count];
    idom[entry] = Some(entry);
    let intersect = |idom: &[Option<usize>], a: usize, b: usize| -> usize {
        let (mut a, mut b) = (a, b);
        while a != b {
            while rpo_index[a] > rpo_index[b] {
                a = idom[a].expect("processed nodes have a dominator");
            }
            while rpo_index[b] > rpo_index[a] {
                b = idom[b].expect("processed nodes have a dominator");
            }
        }
        a
    };
    let mut changed = true;
    while changed {
        changed = false;
        for &node in rpo.iter().skip(1) {
            let mut new_idom = None;
            for &pred in &preds[node] {
                if idom[pred].is_none() {
                    continue;
                }
                new_idom = Some(match new_idom {
                    None => pred,
                    Some(current) => intersect(&idom, current, pred),
                });
            }
            if new_idom.is_some() && idom[node] != new_idom {
                idom[node] = new_idom;
                changed = true;
            }
        }
    }
    idom
}

/// The dominator tree of a function's CFG.
#[derive(Clone, Debug)]
pub struct Dominators {
    idom: Vec<Option<BlockId>>,
}

impl Dominators {
    pub fn new(cfg: &Cfg, entry: BlockId) -> Self {
        let count = cfg.succs.len();
        let idom = immediate_dominators(count, entry.index(), |node| {
            cfg.successors(BlockId(node as u32))
                .iter()
                .map(|succ| succ.index())
                .collect()
        });
        Self {
            idom: idom
                .into_iter()
                .map(|dom| dom.map(|index| BlockId(index as u32)))
                .collect(),
        }
    }

    pub fn immediate(&self, block: BlockId) -> Option<BlockId> {
        self.idom[block.index()]
    }

    /// True iff `a` dominates `b` (reflexively).
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        let mut cursor = b;
        loop {
            if cursor == a {
                return true;
            }
            match self.immediate(cursor) {
                Some(dom) if dom != cursor => cursor = dom,
                _ => return false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middle::ir::*;

    // A diamond: entry -> (left | right) -> exit.
    fn diamond() -> (Function, [BlockId; 4]) {
        let mut f = Function::new(None, None);
        let entry = f.add_block(None);
        let left = f.add_block(None);
        let right = f.add_block(None);
        let exit = f.add_block(None);
        let guard = f.constant(1, 1);
        f.push_stmt(
            entry,
            StatementKind::Jump(Jump {
                condition: Some(guard),
                then_target: JumpTarget::Block(left),
                else_target: Some(JumpTarget::Block(right)),
            }),
            None,
        )
        .unwrap();
        for block in [left, right] {
            f.push_stmt(
                block,
                StatementKind::Jump(Jump {
                    condition: None,
                    then_target: JumpTarget::Block(exit),
                    else_target: None,
                }),
                None,
            )
            .unwrap();
        }
        f.push_stmt(exit, StatementKind::Halt, None).unwrap();
        f.set_entry(entry);
        (f, [entry, left, right, exit])
    }

    #[test]
    fn edges_of_a_diamond() {
        let (f, [entry, left, right, exit]) = diamond();
        let cfg = Cfg::new(&f);
        assert_eq!(cfg.successors(entry), &[left, right]);
        assert_eq!(cfg.predecessors(exit), &[left, right]);
        assert_eq!(cfg.reachable(entry), vec![entry, left, right, exit]);
    }

    #[test]
    fn dominators_of_a_diamond() {
        let (f, [entry, left, right, exit]) = diamond();
        let cfg = Cfg::new(&f);
        let doms = Dominators::new(&cfg, entry);
        assert_eq!(doms.immediate(left), Some(entry));
        assert_eq!(doms.immediate(right), Some(entry));
        assert_eq!(doms.immediate(exit), Some(entry));
        assert!(doms.dominates(entry, exit));
        assert!(!doms.dominates(left, exit));
    }

    #[test]
    fn resolved_targets_extend_the_graph() {
        let mut f = Function::new(None, None);
        let entry = f.add_block(None);
        let target = f.add_block(None);
        let address = f.constant(0x2000, 32);
        let stmt = f
            .push_stmt(
                entry,
                StatementKind::Jump(Jump {
                    condition: None,
                    then_target: JumpTarget::Address(address),
                    else_target: None,
                }),
                None,
            )
            .unwrap();
        f.push_stmt(target, StatementKind::Halt, None).unwrap();
        f.set_entry(entry);

        assert!(Cfg::new(&f).successors(entry).is_empty());
        let mut resolved = Map::new();
        resolved.insert(stmt, vec![target]);
        let cfg = Cfg::with_resolved_targets(&f, &resolved);
        assert_eq!(cfg.successors(entry), &[target]);
    }
}
