//! Liveness: deciding which terms must appear in the emitted program.
//!
//! Roots are the observable effects — branch conditions and computed
//! targets, call targets and arguments covered by a signature, writes to
//! global memory or to nothing the dataflow could name, and return
//! values the signature promises.  From the roots, liveness walks
//! backwards: a live read drags in its reaching definitions, a live
//! write drags in the value it stores.  Bounds-check jumps of recognized
//! switches are deliberately left out: the emitted `switch` carries the
//! range check itself, so the jump's condition must die with it.
//!
//! Insertion order is preserved so everything downstream that iterates
//! live terms is deterministic.

use crate::common::cancel::{CancellationToken, Cancelled};
use crate::common::*;
use crate::front::arch::Architecture;
use crate::middle::cconv::{Hooks, Signature, Signatures};
use crate::middle::dataflow::{self, Dataflow};
use crate::middle::ir::*;
use crate::middle::structure::RegionGraph;

/// The set of live terms, in discovery order.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct Liveness {
    order: Vec<TermId>,
    set: Set<TermId>,
}

impl Liveness {
    pub fn is_live(&self, term: TermId) -> bool {
        self.set.contains(&term)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Live terms in the order they were discovered.
    pub fn iter(&self) -> impl Iterator<Item = TermId> + '_ {
        self.order.iter().copied()
    }

    fn insert(&mut self, term: TermId) -> bool {
        if self.set.insert(term) {
            self.order.push(term);
            true
        } else {
            false
        }
    }
}

pub struct LivenessAnalyzer<'a> {
    function: &'a Function,
    dataflow: &'a Dataflow,
    regions: &'a RegionGraph,
    hooks: &'a Hooks,
    /// The signature of the analyzed function itself.
    signature: &'a Signature,
    /// The program-wide repository, for callees.
    signatures: &'a Signatures,
    arch: &'a Architecture,
    token: CancellationToken,
    dead_jumps: Vec<StmtId>,
    liveness: Liveness,
}

impl<'a> LivenessAnalyzer<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        function: &'a Function,
        dataflow: &'a Dataflow,
        regions: &'a RegionGraph,
        hooks: &'a Hooks,
        signature: &'a Signature,
        signatures: &'a Signatures,
        arch: &'a Architecture,
        token: CancellationToken,
    ) -> Self {
        Self {
            function,
            dataflow,
            regions,
            hooks,
            signature,
            signatures,
            arch,
            token,
            dead_jumps: Vec::new(),
            liveness: Liveness::default(),
        }
    }

    pub fn analyze(mut self) -> Result<Liveness, Cancelled> {
        self.dead_jumps = self.regions.dead_jumps();
        for block in self.function.block_ids() {
            self.token.check()?;
            for &stmt in self.function.block(block).stmts() {
                self.compute_liveness(stmt);
            }
        }
        Ok(self.liveness)
    }

    fn compute_liveness(&mut self, stmt: StmtId) {
        match &self.function.stmt(stmt).kind {
            StatementKind::InlineAssembly => {}
            StatementKind::Assignment { left, .. } => {
                let location = self.dataflow.location(*left);
                match location {
                    Some(location) if !self.arch.is_global_memory(&location) => {}
                    // Writes to global memory, and writes the dataflow
                    // could not place, are observable.
                    _ => self.make_live(*left),
                }
            }
            StatementKind::Jump(jump) => {
                if self.dead_jumps.binary_search(&stmt).is_ok() {
                    return;
                }
                if dataflow::is_return(stmt, self.function, self.dataflow) {
                    if let Some(slot) = self.signature.return_value {
                        if let Some(hook) = self.hooks.returns.get(&stmt) {
                            if let Some(term) = hook.return_term(&slot) {
                                self.make_live(term);
                            }
                        }
                    }
                } else {
                    if let Some(condition) = jump.condition {
                        self.make_live(condition);
                    }
                    if let Some(address) = jump.then_target.address() {
                        self.make_live(address);
                    }
                    if let Some(address) =
                        jump.else_target.as_ref().and_then(JumpTarget::address)
                    {
                        self.make_live(address);
                    }
                }
            }
            StatementKind::Call { target } => {
                self.make_live(*target);
                if let Some(signature) =
                    self.signatures
                        .for_call(self.function, stmt, self.dataflow)
                {
                    if let Some(hook) = self.hooks.calls.get(&stmt) {
                        for slot in &signature.arguments {
                            if let Some(term) = hook.argument_term(slot) {
                                self.make_live(term);
                            }
                        }
                    }
                }
            }
            StatementKind::Touch { .. }
            | StatementKind::Halt
            | StatementKind::Callback
            | StatementKind::RememberReachingDefinitions => {}
        }
    }

    fn make_live(&mut self, term: TermId) {
        if self.liveness.insert(term) {
            self.propagate_liveness(term);
        }
    }

    fn propagate_liveness(&mut self, term: TermId) {
        match self.function.term(term).kind.clone() {
            TermKind::IntConst(_) | TermKind::Intrinsic(_) => {}
            TermKind::Access(_) => self.propagate_through_location(term),
            TermKind::Dereference { address } => {
                self.propagate_through_location(term);
                // An unresolved dereference keeps its address
                // computation alive: the emitted code needs the pointer.
                if self.dataflow.location(term).is_none() {
                    self.make_live(address);
                }
            }
            TermKind::Unary { operand, .. } => self.make_live(operand),
            TermKind::Binary { left, right, .. } => {
                self.make_live(left);
                self.make_live(right);
            }
            TermKind::Choice { preferred, fallback } => {
                if self.dataflow.has_definitions(preferred) {
                    self.make_live(preferred);
                } else {
                    self.make_live(fallback);
                }
            }
        }
    }

    fn propagate_through_location(&mut self, term: TermId) {
        let info = self.function.term(term);
        if info.is_read() {
            let chunks: Vec<Vec<TermId>> = self
                .dataflow
                .definitions(term)
                .map(|defs| {
                    defs.chunks()
                        .iter()
                        .map(|chunk| chunk.definitions().to_vec())
                        .collect()
                })
                .unwrap_or_default();
            for definitions in chunks {
                for definition in definitions {
                    self.make_live(definition);
                }
            }
        }
        if info.is_write() {
            if let Some(source) = self.function.source_of(term) {
                self.make_live(source);
            }
        }
    }
}
