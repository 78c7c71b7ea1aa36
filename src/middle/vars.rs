//! Variable reconstruction.
//!
//! Live terms that touch the same storage are coalesced into variables
//! with a disjoint-set union keyed by memory location: every live
//! located term starts as a singleton, and every live read is unioned
//! with each of its reaching definitions.  Each resulting class becomes
//! one variable whose location is the merge of its members' locations
//! and whose scope is global exactly when that location lies in shared
//! machine memory.
//!
//! Classes are enumerated in liveness order, so variable numbering is
//! stable across runs.

use crate::common::disjoint::{DisjointSet, Element};
use crate::common::*;
use crate::front::arch::Architecture;
use crate::middle::dataflow::Dataflow;
use crate::middle::ir::*;
use crate::middle::liveness::Liveness;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Scope {
    /// Lives in machine memory visible to the whole program.
    Global,
    /// Private to the function: a register, stack slot, or temporary.
    Local,
}

/// A reconstructed variable.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Variable {
    location: MemoryLocation,
    scope: Scope,
    /// Member terms, in liveness order.
    terms: Vec<TermId>,
}

impl Variable {
    pub fn location(&self) -> MemoryLocation {
        self.location
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn is_global(&self) -> bool {
        self.scope == Scope::Global
    }

    pub fn terms(&self) -> &[TermId] {
        &self.terms
    }
}

/// All variables of one function, with the term -> variable mapping the
/// emitter renames accesses through.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct Variables {
    list: Vec<Variable>,
    by_term: Map<TermId, usize>,
}

impl Variables {
    pub fn list(&self) -> &[Variable] {
        &self.list
    }

    pub fn get(&self, term: TermId) -> Option<&Variable> {
        self.index_of(term).map(|index| &self.list[index])
    }

    /// The stable index of the variable a term belongs to.
    pub fn index_of(&self, term: TermId) -> Option<usize> {
        self.by_term.get(&term).copied()
    }
}

/// Coalesces live terms into variables.  Fails only on the invariant
/// violation of members ending up in different address spaces, which
/// aborts the run.
pub fn reconstruct(
    function: &Function,
    dataflow: &Dataflow,
    liveness: &Liveness,
    arch: &Architecture,
) -> Result<Variables, DomainMismatch> {
    let mut sets = DisjointSet::new();
    let mut elements: Map<TermId, Element> = Map::new();

    for term in liveness.iter() {
        if dataflow.location(term).is_some() {
            let element = sets.make_set();
            elements.insert(term, element);
        }
    }

    for term in liveness.iter() {
        if !function.term(term).is_read() {
            continue;
        }
        let Some(&reader) = elements.get(&term) else {
            continue;
        };
        let Some(definitions) = dataflow.definitions(term) else {
            continue;
        };
        for chunk in definitions.chunks() {
            for &definition in chunk.definitions() {
                debug_assert!(
                    dataflow
                        .location(definition)
                        .zip(dataflow.location(term))
                        .is_some_and(|(a, b)| a.overlaps(&b)),
                    "a definition must overlap the read it reaches"
                );
                if let Some(&defining) = elements.get(&definition) {
                    sets.union(reader, defining);
                }
            }
        }
    }

    // Group classes in liveness order so numbering is deterministic.
    let mut variables = Variables::default();
    let mut class_index: Map<Element, usize> = Map::new();
    for term in liveness.iter() {
        let Some(&element) = elements.get(&term) else {
            continue;
        };
        let root = sets.find(element);
        let index = match class_index.get(&root) {
            Some(&index) => index,
            None => {
                let location = dataflow.location(term).expect("located term");
                let scope = if arch.is_global_memory(&location) {
                    Scope::Global
                } else {
                    Scope::Local
                };
                let index = variables.list.len();
                variables.list.push(Variable {
                    location,
                    scope,
                    terms: Vec::new(),
                });
                class_index.insert(root, index);
                index
            }
        };
        let location = dataflow.location(term).expect("located term");
        let variable = &mut variables.list[index];
        variable.location = variable.location.merged(&location)?;
        variable.terms.push(term);
        variables.by_term.insert(term, index);
    }

    Ok(variables)
}
