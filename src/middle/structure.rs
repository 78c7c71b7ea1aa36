//! Structural analysis: reducing the CFG to a region tree.
//!
//! The analyzer starts from one node per reachable basic block and
//! repeatedly collapses subgraphs matching a structured template —
//! sequence, if, loop, switch — into region nodes, relinking edges, until
//! a single root remains.  Templates are tried from most to least
//! specific, and `If` wins over `While` where both would apply, so the
//! output never invents a loop where a conditional suffices.  When no
//! template applies, a dominator-based natural loop is collapsed instead;
//! whatever still resists at the end is wrapped as one natural loop whose
//! members the emitter renders as labelled blocks with gotos.  Reduction
//! therefore always terminates with a single root and never fails a
//! function.

use log::warn;

use crate::common::cancel::{CancellationToken, Cancelled};
use crate::common::*;
use crate::middle::cfg::{self, Cfg};
use crate::middle::dataflow::Dataflow;
use crate::middle::ir::*;
use crate::middle::patterns;

/// Handle to a node of the region graph.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// One `case` group of a switch: the values selecting it and the region
/// handling it.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SwitchCase {
    pub values: Vec<u64>,
    pub body: NodeId,
}

/// How the halves of a short-circuited condition combine.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ShortCircuitOp {
    And,
    Or,
}

impl std::fmt::Display for ShortCircuitOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShortCircuitOp::And => write!(f, "&&"),
            ShortCircuitOp::Or => write!(f, "||"),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum RegionKind {
    /// A straight sequence with a single entry and a single exit.
    Block { children: Vec<NodeId> },
    /// `if (c) { then }`; `negated` means the then-part hangs off the
    /// false edge of the branch.
    IfThen {
        jump: StmtId,
        negated: bool,
        condition: NodeId,
        then: NodeId,
    },
    /// `if (c) { then } else { else }`.
    IfThenElse {
        jump: StmtId,
        condition: NodeId,
        then: NodeId,
        else_: NodeId,
    },
    /// Pre-test loop: the condition node runs first, the body jumps
    /// back to it.
    While {
        jump: StmtId,
        negated: bool,
        condition: NodeId,
        body: NodeId,
    },
    /// Post-test loop: one node looping back to itself through the
    /// conditional jump at its bottom.
    DoWhile {
        jump: StmtId,
        negated: bool,
        body: NodeId,
    },
    /// Two chained condition nodes forming one short-circuited
    /// condition (`a && b`, `a || b`).  Still a two-exit node, exiting
    /// through the second half's branch, so it nests and eventually
    /// becomes the condition of an `If` or a loop.
    CompoundCondition {
        first: NodeId,
        second: NodeId,
        op: ShortCircuitOp,
        /// The first half enters the condition negated.
        first_negated: bool,
    },
    /// A loop (or an irreducible fragment) that fits no structured
    /// template; members are emitted as labelled blocks with gotos.
    NaturalLoop { members: Vec<NodeId> },
    /// A jump-table dispatch, optionally guarded by a recognized bounds
    /// check whose jump becomes dead.
    Switch {
        jump: StmtId,
        /// The term computing the table index.
        index: TermId,
        bounds_check: Option<NodeId>,
        bounds_jump: Option<StmtId>,
        max_value: Option<u64>,
        dispatch: NodeId,
        cases: Vec<SwitchCase>,
        default: Option<NodeId>,
    },
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Region {
    pub kind: RegionKind,
}

impl Region {
    /// Child nodes in emission order, each listed once.
    pub fn children(&self) -> Vec<NodeId> {
        let mut result = Vec::new();
        let mut push = |node: NodeId| {
            if !result.contains(&node) {
                result.push(node);
            }
        };
        match &self.kind {
            RegionKind::Block { children } => children.iter().copied().for_each(&mut push),
            RegionKind::IfThen { condition, then, .. } => {
                push(*condition);
                push(*then);
            }
            RegionKind::IfThenElse {
                condition,
                then,
                else_,
                ..
            } => {
                push(*condition);
                push(*then);
                push(*else_);
            }
            RegionKind::While { condition, body, .. } => {
                push(*condition);
                push(*body);
            }
            RegionKind::DoWhile { body, .. } => push(*body),
            RegionKind::CompoundCondition { first, second, .. } => {
                push(*first);
                push(*second);
            }
            RegionKind::NaturalLoop { members } => members.iter().copied().for_each(&mut push),
            RegionKind::Switch {
                bounds_check,
                dispatch,
                cases,
                default,
                ..
            } => {
                if let Some(bounds) = bounds_check {
                    push(*bounds);
                }
                push(*dispatch);
                for case in cases {
                    push(case.body);
                }
                if let Some(default) = default {
                    push(*default);
                }
            }
        }
        result
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Node {
    Basic(BlockId),
    Region(Region),
}

/// The result of structural analysis: an arena of nodes and the root the
/// reduction converged to.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct RegionGraph {
    nodes: Vec<Node>,
    root: NodeId,
}

impl RegionGraph {
    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    /// The basic blocks under `node`, in emission order.
    pub fn leaves_of(&self, node: NodeId) -> Vec<BlockId> {
        let mut result = Vec::new();
        self.collect_leaves(node, &mut result);
        result
    }

    /// All basic blocks of the function, in emission order.  Every
    /// reachable block appears exactly once.
    pub fn leaves(&self) -> Vec<BlockId> {
        self.leaves_of(self.root)
    }

    fn collect_leaves(&self, node: NodeId, out: &mut Vec<BlockId>) {
        match self.node(node) {
            Node::Basic(block) => out.push(*block),
            Node::Region(region) => {
                for child in region.children() {
                    self.collect_leaves(child, out);
                }
            }
        }
    }

    /// Jumps made redundant by the structure itself: the bounds-check
    /// branches of recognized switches.  Sorted for binary search.
    pub fn dead_jumps(&self) -> Vec<StmtId> {
        let mut result: Vec<StmtId> = self
            .nodes
            .iter()
            .filter_map(|node| match node {
                Node::Region(Region {
                    kind: RegionKind::Switch { bounds_jump, .. },
                }) => *bounds_jump,
                _ => None,
            })
            .collect();
        result.sort();
        result
    }
}

pub struct StructuralAnalyzer<'a> {
    function: &'a Function,
    dataflow: &'a Dataflow,
    token: CancellationToken,
    max_passes: u32,
}

impl<'a> StructuralAnalyzer<'a> {
    pub fn new(function: &'a Function, dataflow: &'a Dataflow, token: CancellationToken) -> Self {
        Self {
            function,
            dataflow,
            token,
            max_passes: 1000,
        }
    }

    pub fn with_max_passes(mut self, max_passes: u32) -> Self {
        self.max_passes = max_passes;
        self
    }

    pub fn analyze(self) -> Result<RegionGraph, Cancelled> {
        let entry = self
            .function
            .entry()
            .expect("structural analysis runs on functions with an entry");
        let cfg = Cfg::with_resolved_targets(self.function, self.dataflow.resolved_targets());
        let reachable = cfg.reachable(entry);

        let mut reducer = Reducer {
            function: self.function,
            dataflow: self.dataflow,
            nodes: Vec::new(),
            succs: Map::new(),
            preds: Map::new(),
            head_of: Map::new(),
            entry_block: Map::new(),
            exit_jump: Map::new(),
            active: Set::new(),
            entry: NodeId(0),
        };
        for (index, &block) in reachable.iter().enumerate() {
            let node = NodeId(index as u32);
            reducer.nodes.push(Node::Basic(block));
            reducer.head_of.insert(block, node);
            reducer.entry_block.insert(node, block);
            let jump = self
                .function
                .terminator(block)
                .filter(|&stmt| self.function.stmt(stmt).as_jump().is_some());
            reducer.exit_jump.insert(node, jump);
            reducer.active.insert(node);
            if block == entry {
                reducer.entry = node;
            }
        }
        let in_graph: Set<BlockId> = reachable.iter().copied().collect();
        for &block in &reachable {
            let node = reducer.head_of[&block];
            let succs: Vec<NodeId> = cfg
                .successors(block)
                .iter()
                .copied()
                .filter(|succ| in_graph.contains(succ))
                .map(|succ| reducer.head_of[&succ])
                .collect();
            for &succ in &succs {
                reducer.preds.entry(succ).or_default().push(node);
            }
            reducer.succs.insert(node, succs);
        }
        for node in reducer.active.clone() {
            reducer.preds.entry(node).or_default();
        }

        reducer.reduce(&self.token, self.max_passes)?;
        Ok(reducer.finish())
    }
}

struct Reducer<'a> {
    function: &'a Function,
    dataflow: &'a Dataflow,
    nodes: Vec<Node>,
    succs: Map<NodeId, Vec<NodeId>>,
    preds: Map<NodeId, Vec<NodeId>>,
    /// Block -> the active node whose entry leaf it is.
    head_of: Map<BlockId, NodeId>,
    /// Active node -> the block control enters it at.
    entry_block: Map<NodeId, BlockId>,
    /// Active node -> the jump statement control leaves it through.
    exit_jump: Map<NodeId, Option<StmtId>>,
    active: Set<NodeId>,
    entry: NodeId,
}

impl Reducer<'_> {
    fn reduce(&mut self, token: &CancellationToken, max_passes: u32) -> Result<(), Cancelled> {
        let mut passes = 0;
        while self.active.len() > 1 {
            token.check()?;
            passes += 1;
            if passes > max_passes {
                warn!(
                    "{}: structural analysis ran out of passes, leaving {} unreduced nodes",
                    format_addr(self.function.addr()),
                    self.active.len()
                );
                break;
            }
            let mut changed = false;
            for node in self.active.clone() {
                if !self.active.contains(&node) {
                    continue;
                }
                if self.try_switch(node)
                    || self.try_compound_condition(node)
                    || self.try_if_then_else(node)
                    || self.try_if_then(node)
                    || self.try_do_while(node)
                    || self.try_while(node)
                    || self.try_sequence(node)
                {
                    changed = true;
                }
            }
            if !changed && !self.collapse_natural_loop() {
                break;
            }
        }
        Ok(())
    }

    fn finish(mut self) -> RegionGraph {
        let root = if self.active.len() == 1 {
            let mut node = *self.active.iter().next().expect("one active node");
            // A lone node can still loop onto itself.
            if self.succs[&node].contains(&node) && self.try_do_while(node) {
                node = *self.active.iter().next().expect("one active node");
            }
            // The root is always a region; a lone basic block becomes a
            // one-leaf sequence.
            if matches!(self.nodes[node.index()], Node::Basic(_)) {
                self.new_region(
                    RegionKind::Block {
                        children: vec![node],
                    },
                    &[node],
                    node,
                    None,
                )
            } else {
                node
            }
        } else {
            let members: Vec<NodeId> = self.active.iter().copied().collect();
            self.new_region(
                RegionKind::NaturalLoop { members: members.clone() },
                &members,
                self.entry,
                None,
            )
        };
        RegionGraph {
            nodes: self.nodes,
            root,
        }
    }

    /// Collapses `consumed` into a fresh region node, relinking external
    /// edges to it.
    fn new_region(
        &mut self,
        kind: RegionKind,
        consumed: &[NodeId],
        entry_of: NodeId,
        exit_jump: Option<StmtId>,
    ) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node::Region(Region { kind }));
        let consumed_set: Set<NodeId> = consumed.iter().copied().collect();
        let entry_block = self.entry_block[&entry_of];

        let mut new_preds = Vec::new();
        let mut new_succs = Vec::new();
        for &node in consumed {
            for &pred in &self.preds[&node] {
                if !consumed_set.contains(&pred) && !new_preds.contains(&pred) {
                    new_preds.push(pred);
                }
            }
            for &succ in &self.succs[&node] {
                if !consumed_set.contains(&succ) && !new_succs.contains(&succ) {
                    new_succs.push(succ);
                }
            }
        }
        for &pred in &new_preds {
            redirect_edges(self.succs.get_mut(&pred).expect("active node"), &consumed_set, id);
        }
        for &succ in &new_succs {
            redirect_edges(self.preds.get_mut(&succ).expect("active node"), &consumed_set, id);
        }

        for &node in consumed {
            self.active.remove(&node);
            self.succs.remove(&node);
            self.preds.remove(&node);
            let block = self.entry_block.remove(&node).expect("active node has an entry");
            self.head_of.remove(&block);
            self.exit_jump.remove(&node);
        }

        self.succs.insert(id, new_succs);
        self.preds.insert(id, new_preds);
        self.entry_block.insert(id, entry_block);
        self.head_of.insert(entry_block, id);
        self.exit_jump.insert(id, exit_jump);
        self.active.insert(id);
        if consumed_set.contains(&self.entry) {
            self.entry = id;
        }
        id
    }

    /// The conditional branch leaving `node`, with both targets mapped
    /// to active nodes.
    fn branch_targets(&self, node: NodeId) -> Option<(StmtId, NodeId, NodeId)> {
        let stmt = (*self.exit_jump.get(&node)?)?;
        let jump = self.function.stmt(stmt).as_jump()?;
        jump.condition?;
        let then_block = jump.then_target.block()?;
        let else_block = jump.else_target.as_ref()?.block()?;
        let then_node = *self.head_of.get(&then_block)?;
        let else_node = *self.head_of.get(&else_block)?;
        if self.active.contains(&then_node) && self.active.contains(&else_node) {
            Some((stmt, then_node, else_node))
        } else {
            None
        }
    }

    fn try_sequence(&mut self, a: NodeId) -> bool {
        let succs = &self.succs[&a];
        if succs.len() != 1 {
            return false;
        }
        let s = succs[0];
        if s == a || s == self.entry || self.preds[&s].len() != 1 {
            return false;
        }
        // Flatten nested sequences as they form.
        let mut children = Vec::new();
        for node in [a, s] {
            match &self.nodes[node.index()] {
                Node::Region(Region {
                    kind: RegionKind::Block { children: inner },
                }) => children.extend(inner.iter().copied()),
                _ => children.push(node),
            }
        }
        let exit = self.exit_jump[&s];
        self.new_region(RegionKind::Block { children }, &[a, s], a, exit);
        true
    }

    /// Folds two chained branches into one short-circuited condition.
    /// With `c1` branching to `second` and `other`, and `second`
    /// branching to `t2` and `e2`, the pattern applies whenever `other`
    /// coincides with one of `second`'s exits; which one, and which edge
    /// `second` hangs off, decide the operator and the negation.
    fn try_compound_condition(&mut self, c1: NodeId) -> bool {
        let Some((_, t1, e1)) = self.branch_targets(c1) else {
            return false;
        };
        if t1 == e1 {
            return false;
        }
        for (second, other, second_on_then) in [(t1, e1, true), (e1, t1, false)] {
            if second == c1 || second == self.entry || self.preds[&second] != vec![c1] {
                continue;
            }
            let Some((j2, t2, e2)) = self.branch_targets(second) else {
                continue;
            };
            if t2 == e2 || t2 == c1 || e2 == c1 || t2 == second || e2 == second {
                continue;
            }
            use ShortCircuitOp::*;
            let (op, first_negated) = if second_on_then {
                if other == e2 {
                    (And, false)
                } else if other == t2 {
                    (Or, true)
                } else {
                    continue;
                }
            } else if other == t2 {
                (Or, false)
            } else if other == e2 {
                (And, true)
            } else {
                continue;
            };
            self.new_region(
                RegionKind::CompoundCondition {
                    first: c1,
                    second,
                    op,
                    first_negated,
                },
                &[c1, second],
                c1,
                Some(j2),
            );
            return true;
        }
        false
    }

    fn try_if_then_else(&mut self, c: NodeId) -> bool {
        let Some((stmt, t, e)) = self.branch_targets(c) else {
            return false;
        };
        if t == e || t == c || e == c {
            return false;
        }
        if self.preds[&t] != vec![c] || self.preds[&e] != vec![c] {
            return false;
        }
        let mut follow: Vec<NodeId> = Vec::new();
        for branch in [t, e] {
            let succs = &self.succs[&branch];
            if succs.len() > 1 {
                return false;
            }
            for &succ in succs {
                if succ == c || succ == t || succ == e {
                    return false;
                }
                if !follow.contains(&succ) {
                    follow.push(succ);
                }
            }
        }
        if follow.len() > 1 {
            return false;
        }
        self.new_region(
            RegionKind::IfThenElse {
                jump: stmt,
                condition: c,
                then: t,
                else_: e,
            },
            &[c, t, e],
            c,
            None,
        );
        true
    }

    fn try_if_then(&mut self, c: NodeId) -> bool {
        let Some((stmt, t, e)) = self.branch_targets(c) else {
            return false;
        };
        if t == e || t == c || e == c {
            return false;
        }
        for (branch, join, negated) in [(t, e, false), (e, t, true)] {
            // A branch that never rejoins (it returns or halts) must not
            // swallow a loop header: when the other edge loops straight
            // back, this node is a `while` condition, not an `if`.
            if self.succs[&branch].is_empty()
                && self.preds[&join] == vec![c]
                && self.succs[&join] == vec![c]
            {
                continue;
            }
            if self.preds[&branch] == vec![c]
                && self.succs[&branch].iter().all(|&succ| succ == join)
            {
                self.new_region(
                    RegionKind::IfThen {
                        jump: stmt,
                        negated,
                        condition: c,
                        then: branch,
                    },
                    &[c, branch],
                    c,
                    None,
                );
                return true;
            }
        }
        false
    }

    fn try_while(&mut self, c: NodeId) -> bool {
        let Some((stmt, t, e)) = self.branch_targets(c) else {
            return false;
        };
        if t == e {
            return false;
        }
        for (body, negated) in [(t, false), (e, true)] {
            if body != c
                && self.preds[&body] == vec![c]
                && self.succs[&body] == vec![c]
            {
                self.new_region(
                    RegionKind::While {
                        jump: stmt,
                        negated,
                        condition: c,
                        body,
                    },
                    &[c, body],
                    c,
                    None,
                );
                return true;
            }
        }
        false
    }

    fn try_do_while(&mut self, b: NodeId) -> bool {
        if !self.succs[&b].contains(&b) {
            return false;
        }
        if let Some((stmt, t, e)) = self.branch_targets(b) {
            if t == b || e == b {
                let negated = t != b;
                self.new_region(
                    RegionKind::DoWhile {
                        jump: stmt,
                        negated,
                        body: b,
                    },
                    &[b],
                    b,
                    None,
                );
                return true;
            }
        }
        // A self edge without a clean bottom test: keep it, but give up
        // on structuring it.
        self.new_region(RegionKind::NaturalLoop { members: vec![b] }, &[b], b, None);
        true
    }

    fn try_switch(&mut self, d: NodeId) -> bool {
        let Some(Some(stmt)) = self.exit_jump.get(&d).copied() else {
            return false;
        };
        let Some(jump) = self.function.stmt(stmt).as_jump() else {
            return false;
        };
        if !jump.is_unconditional() || jump.then_target.address().is_none() {
            return false;
        }
        let Some(table) = self.dataflow.jump_table(stmt) else {
            return false;
        };

        // An optional dominating bounds check in the single predecessor.
        let mut bounds = None;
        let preds = self.preds[&d].clone();
        if let [p] = preds[..] {
            if p != d {
                if let Some(Some(bounds_stmt)) = self.exit_jump.get(&p).copied() {
                    if let Some(check) = patterns::recognize_bounds_check(
                        bounds_stmt,
                        self.entry_block[&d],
                        self.function,
                        self.dataflow,
                    ) {
                        if let Some(&default_node) = self.head_of.get(&check.if_failed) {
                            if self.active.contains(&default_node) && default_node != d {
                                bounds = Some((p, bounds_stmt, check.max_value, default_node));
                            }
                        }
                    }
                }
            }
        }

        let max_value = bounds.map(|(_, _, max, _)| max);
        let bounds_node = bounds.map(|(p, _, _, _)| p);
        let allowed_preds: Vec<NodeId> = Some(d).into_iter().chain(bounds_node).collect();

        // Group table entries into cases, in table order.
        let mut cases: Vec<SwitchCase> = Vec::new();
        for entry in &table.entries {
            if max_value.is_some_and(|max| entry.index > max) {
                continue;
            }
            let Some(&node) = self.head_of.get(&entry.block) else {
                return false;
            };
            if node == d || !self.active.contains(&node) {
                return false;
            }
            if bounds_node == Some(node) {
                return false;
            }
            match cases.iter_mut().find(|case| case.body == node) {
                Some(case) => case.values.push(entry.index),
                None => cases.push(SwitchCase {
                    values: vec![entry.index],
                    body: node,
                }),
            }
        }
        if cases.len() < 2 {
            return false;
        }

        // The branches must be private to the switch and agree on one
        // follow node.
        let mut consumed: Vec<NodeId> = Vec::new();
        if let Some(p) = bounds_node {
            consumed.push(p);
        }
        consumed.push(d);
        for case in &cases {
            consumed.push(case.body);
        }
        let mut default = None;
        if let Some((_, _, _, default_node)) = bounds {
            if self.preds[&default_node]
                .iter()
                .all(|pred| allowed_preds.contains(pred))
            {
                if !consumed.contains(&default_node) {
                    consumed.push(default_node);
                }
                default = Some(default_node);
            }
        }
        let body_set: Set<NodeId> = consumed.iter().copied().collect();
        let mut follow: Option<NodeId> = None;
        for case in cases.iter().map(|case| case.body).chain(default) {
            for &pred in &self.preds[&case] {
                if !allowed_preds.contains(&pred) {
                    return false;
                }
            }
            for &succ in &self.succs[&case] {
                if body_set.contains(&succ) {
                    return false;
                }
                match follow {
                    None => follow = Some(succ),
                    Some(existing) if existing == succ => {}
                    Some(_) => return false,
                }
            }
        }

        let entry_of = bounds_node.unwrap_or(d);
        self.new_region(
            RegionKind::Switch {
                jump: stmt,
                index: table.index,
                bounds_check: bounds_node,
                bounds_jump: bounds.map(|(_, stmt, _, _)| stmt),
                max_value,
                dispatch: d,
                cases,
                default,
            },
            &consumed,
            entry_of,
            None,
        );
        true
    }

    /// Finds a dominator-certified back edge and collapses its natural
    /// loop.  Returns false when the active graph has none.
    fn collapse_natural_loop(&mut self) -> bool {
        let nodes: Vec<NodeId> = self.active.iter().copied().collect();
        let index_of: Map<NodeId, usize> = nodes
            .iter()
            .enumerate()
            .map(|(index, &node)| (node, index))
            .collect();
        let entry_index = index_of[&self.entry];
        let idom = cfg::immediate_dominators(nodes.len(), entry_index, |index| {
            self.succs[&nodes[index]]
                .iter()
                .filter_map(|succ| index_of.get(succ).copied())
                .collect()
        });
        let dominates = |a: usize, b: usize| -> bool {
            let mut cursor = b;
            loop {
                if cursor == a {
                    return true;
                }
                match idom[cursor] {
                    Some(dom) if dom != cursor => cursor = dom,
                    _ => return false,
                }
            }
        };

        let mut back_edge = None;
        'search: for (from_index, &from) in nodes.iter().enumerate() {
            for &to in &self.succs[&from] {
                let Some(&to_index) = index_of.get(&to) else {
                    continue;
                };
                if idom[from_index].is_some() && dominates(to_index, from_index) {
                    back_edge = Some((from, to));
                    break 'search;
                }
            }
        }
        let Some((tail, header)) = back_edge else {
            return false;
        };

        // The loop body: the header plus everything that reaches the
        // tail without passing through the header.
        let mut body: Set<NodeId> = Set::new();
        body.insert(header);
        body.insert(tail);
        let mut stack = vec![tail];
        while let Some(node) = stack.pop() {
            for &pred in &self.preds[&node] {
                if body.insert(pred) {
                    stack.push(pred);
                }
            }
        }
        let members: Vec<NodeId> = body.iter().copied().collect();
        self.new_region(
            RegionKind::NaturalLoop { members: members.clone() },
            &members,
            header,
            None,
        );
        true
    }
}

/// Replaces every edge endpoint in `consumed` with `replacement`,
/// keeping order and dropping duplicates.
fn redirect_edges(edges: &mut Vec<NodeId>, consumed: &Set<NodeId>, replacement: NodeId) {
    let mut seen_replacement = false;
    edges.retain_mut(|edge| {
        if consumed.contains(edge) {
            *edge = replacement;
        }
        if *edge == replacement {
            if seen_replacement {
                return false;
            }
            seen_replacement = true;
        }
        true
    });
}
