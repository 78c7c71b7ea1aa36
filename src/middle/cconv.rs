//! Calling-convention reconstruction.
//!
//! The IR of a single function meets an unseen ABI at three boundaries:
//! its own entry, every call site, and every return.  Hooks splice
//! synthesized statements into the IR at those boundaries so the
//! analyses see argument and return-value flow explicitly:
//!
//! - the entry hook assigns the stack pointer its symbolic base, plants
//!   the return address, and *defines* every candidate argument location;
//! - a call hook *reads* the argument locations the callee consumes and
//!   *defines* the location its return value arrives in;
//! - a return hook *reads* the location holding the value the function
//!   hands back.
//!
//! Installation runs in two phases around the first dataflow pass.  The
//! prepare phase needs no value information; the install phase places
//! call arguments (whose stack slots depend on the stack-pointer offset
//! at the call) and return-value reads (returns are only identifiable
//! once the return address has been traced).  A second dataflow pass
//! then sees the full picture.
//!
//! Lowerings must push the return address before emitting a `Call`
//! statement, so at the call statement the callee frame starts exactly
//! at the current stack pointer.

use log::warn;

use crate::common::*;
use crate::front::arch::Architecture;
use crate::middle::cfg::Cfg;
use crate::middle::dataflow::{self, Dataflow};
use crate::middle::ir::*;

/// Argument locations in passing order plus the optional return-value
/// location, in the callee's frame.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct Signature {
    pub arguments: Vec<MemoryLocation>,
    pub return_value: Option<MemoryLocation>,
}

/// The program-wide signature repository, keyed by function entry
/// address.  Explicit signatures win over inferred ones.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct Signatures {
    by_addr: Map<ByteAddr, Signature>,
}

impl Signatures {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, addr: ByteAddr) -> Option<&Signature> {
        self.by_addr.get(&addr)
    }

    pub fn set(&mut self, addr: ByteAddr, signature: Signature) {
        self.by_addr.insert(addr, signature);
    }

    pub fn for_function(&self, function: &Function) -> Option<&Signature> {
        self.get(function.addr()?)
    }

    /// The signature of a call's callee, when the call target resolves
    /// to the address of a function we know a signature for.
    pub fn for_call(
        &self,
        function: &Function,
        call: StmtId,
        dataflow: &Dataflow,
    ) -> Option<&Signature> {
        let target = function.stmt(call).as_call()?;
        let addr = dataflow.as_exact(target)?.value();
        self.get(addr)
    }
}

/// The synthesized terms at a function's entry.
#[derive(Clone, Debug, Default)]
pub struct EntryHook {
    /// Statements the hook inserted, for filtering during emission.
    pub stmts: Set<StmtId>,
    /// The write-mode term defining each candidate argument, in passing
    /// order.
    pub argument_terms: Vec<(MemoryLocation, TermId)>,
}

impl EntryHook {
    pub fn argument_term(&self, location: &MemoryLocation) -> Option<TermId> {
        self.argument_terms
            .iter()
            .find(|(slot, _)| slot == location)
            .map(|&(_, term)| term)
    }
}

/// The synthesized terms around one call site.
#[derive(Clone, Debug, Default)]
pub struct CallHook {
    pub stmts: Set<StmtId>,
    /// Reads the stack pointer right before the call; its value places
    /// the callee frame.
    pub stack_probe: Option<TermId>,
    /// Read-mode terms consuming the arguments, in passing order.
    pub argument_terms: Vec<(MemoryLocation, TermId)>,
    /// Write-mode terms defining the return-value locations.
    pub return_terms: Vec<(MemoryLocation, TermId)>,
}

impl CallHook {
    pub fn argument_term(&self, location: &MemoryLocation) -> Option<TermId> {
        self.argument_terms
            .iter()
            .find(|(slot, _)| slot == location)
            .map(|&(_, term)| term)
    }
}

/// The synthesized terms before one return jump.
#[derive(Clone, Debug, Default)]
pub struct ReturnHook {
    pub stmts: Set<StmtId>,
    /// Read-mode terms consuming the would-be return value.
    pub return_terms: Vec<(MemoryLocation, TermId)>,
}

impl ReturnHook {
    pub fn return_term(&self, location: &MemoryLocation) -> Option<TermId> {
        self.return_terms
            .iter()
            .find(|(slot, _)| slot == location)
            .map(|&(_, term)| term)
    }
}

/// All hooks installed into one function.
#[derive(Clone, Debug, Default)]
pub struct Hooks {
    pub entry: Option<EntryHook>,
    pub calls: Map<StmtId, CallHook>,
    pub returns: Map<StmtId, ReturnHook>,
}

impl Hooks {
    /// True iff the statement was synthesized by some hook.  The emitter
    /// hides these; parameters and return values surface through
    /// signatures instead.
    pub fn is_hook_stmt(&self, stmt: StmtId) -> bool {
        self.entry
            .as_ref()
            .is_some_and(|hook| hook.stmts.contains(&stmt))
            || self.calls.values().any(|hook| hook.stmts.contains(&stmt))
            || self.returns.values().any(|hook| hook.stmts.contains(&stmt))
    }
}

pub struct HookInstaller<'a> {
    arch: &'a Architecture,
    signatures: &'a Signatures,
}

impl<'a> HookInstaller<'a> {
    pub fn new(arch: &'a Architecture, signatures: &'a Signatures) -> Self {
        Self { arch, signatures }
    }

    /// Phase one, before any dataflow: the entry hook, stack probes at
    /// call sites, and fixpoint checkpoints at join blocks.
    pub fn prepare(&self, function: &mut Function) -> Result<Hooks, IrError> {
        let mut hooks = Hooks::default();
        let Some(entry) = function.entry() else {
            return Ok(hooks);
        };

        let mut entry_hook = EntryHook::default();
        let sp = self.arch.stack_pointer();
        let convention = self.arch.convention();

        let mut index = 0;
        let mut insert_entry_stmt =
            |function: &mut Function, kind: StatementKind| -> Result<StmtId, IrError> {
                let stmt = function.insert_stmt(entry, index, kind, None)?;
                index += 1;
                Ok(stmt)
            };

        let sp_target = function.access(sp);
        let sp_base = function.intrinsic(IntrinsicKind::StackBase, sp.size());
        let stmt = insert_entry_stmt(
            function,
            StatementKind::Assignment {
                left: sp_target,
                right: sp_base,
            },
        )?;
        entry_hook.stmts.insert(stmt);

        let ra_target = function.access(convention.return_address);
        let ra_value =
            function.intrinsic(IntrinsicKind::ReturnAddress, convention.return_address.size());
        let stmt = insert_entry_stmt(
            function,
            StatementKind::Assignment {
                left: ra_target,
                right: ra_value,
            },
        )?;
        entry_hook.stmts.insert(stmt);

        let argument_slots = match self.signatures.for_function(function) {
            Some(signature) => signature.arguments.clone(),
            None => convention.arguments.clone(),
        };
        for slot in argument_slots {
            let term = function.access(slot);
            let stmt = insert_entry_stmt(
                function,
                StatementKind::Touch {
                    term,
                    access: Access::Write,
                },
            )?;
            entry_hook.stmts.insert(stmt);
            entry_hook.argument_terms.push((slot, term));
        }
        hooks.entry = Some(entry_hook);

        self.insert_checkpoints(function, entry)?;
        self.insert_stack_probes(function, &mut hooks)?;
        Ok(hooks)
    }

    /// Plants a `RememberReachingDefinitions` checkpoint at the head of
    /// every join block, giving loops a stable point to converge at.
    fn insert_checkpoints(&self, function: &mut Function, entry: BlockId) -> Result<(), IrError> {
        let cfg = Cfg::new(function);
        let joins: Vec<BlockId> = function
            .block_ids()
            .filter(|&block| block != entry && cfg.predecessors(block).len() > 1)
            .collect();
        for block in joins {
            function.insert_stmt(block, 0, StatementKind::RememberReachingDefinitions, None)?;
        }
        Ok(())
    }

    fn insert_stack_probes(&self, function: &mut Function, hooks: &mut Hooks) -> Result<(), IrError> {
        let sp = self.arch.stack_pointer();
        // Collected first: inserting while scanning would shift indices.
        let mut call_sites: Vec<(BlockId, usize, StmtId)> = Vec::new();
        for block in function.block_ids() {
            for (index, &stmt) in function.block(block).stmts().iter().enumerate() {
                if function.stmt(stmt).as_call().is_some() {
                    call_sites.push((block, index, stmt));
                }
            }
        }
        for (block, index, call) in call_sites.into_iter().rev() {
            let probe = function.access(sp);
            let stmt = function.insert_stmt(
                block,
                index,
                StatementKind::Touch {
                    term: probe,
                    access: Access::Read,
                },
                function.stmt(call).addr(),
            )?;
            let hook = hooks.calls.entry(call).or_default();
            hook.stack_probe = Some(probe);
            hook.stmts.insert(stmt);
        }
        Ok(())
    }

    /// Phase two, after the first dataflow pass: argument and
    /// return-value terms at calls and returns.
    pub fn install(
        &self,
        function: &mut Function,
        hooks: &mut Hooks,
        dataflow: &Dataflow,
    ) -> Result<(), IrError> {
        self.install_return_hooks(function, hooks, dataflow)?;
        self.install_call_hooks(function, hooks, dataflow)?;
        Ok(())
    }

    fn install_return_hooks(
        &self,
        function: &mut Function,
        hooks: &mut Hooks,
        dataflow: &Dataflow,
    ) -> Result<(), IrError> {
        let return_slot = match self.signatures.for_function(function) {
            Some(signature) => signature.return_value,
            None => self.arch.convention().return_value,
        };
        let Some(slot) = return_slot else {
            return Ok(());
        };

        let mut returns: Vec<(BlockId, usize, StmtId)> = Vec::new();
        for block in function.block_ids() {
            for (index, &stmt) in function.block(block).stmts().iter().enumerate() {
                if dataflow::is_return(stmt, function, dataflow) {
                    returns.push((block, index, stmt));
                }
            }
        }
        for (block, index, ret) in returns.into_iter().rev() {
            let term = function.access(slot);
            let stmt = function.insert_stmt(
                block,
                index,
                StatementKind::Touch {
                    term,
                    access: Access::Read,
                },
                function.stmt(ret).addr(),
            )?;
            let hook = hooks.returns.entry(ret).or_default();
            hook.stmts.insert(stmt);
            hook.return_terms.push((slot, term));
        }
        Ok(())
    }

    fn install_call_hooks(
        &self,
        function: &mut Function,
        hooks: &mut Hooks,
        dataflow: &Dataflow,
    ) -> Result<(), IrError> {
        let calls: Vec<StmtId> = hooks.calls.keys().copied().collect();
        for call in calls {
            let signature = self
                .signatures
                .for_call(function, call, dataflow)
                .cloned()
                .unwrap_or_else(|| Signature {
                    arguments: Vec::new(),
                    // Without a signature, still assume the callee may
                    // leave a value in the conventional location so the
                    // caller's later reads of it are defined.
                    return_value: self.arch.convention().return_value,
                });

            let hook = &hooks.calls[&call];
            let sp_offset = hook
                .stack_probe
                .and_then(|probe| dataflow.value(probe))
                .and_then(|value| value.stack_offset());

            let block = function.stmt(call).block();
            let call_index = function
                .block(block)
                .stmts()
                .iter()
                .position(|&stmt| stmt == call)
                .expect("a call belongs to its block");
            let addr = function.stmt(call).addr();

            // Return-value definitions go right after the call.
            let mut return_terms = Vec::new();
            let mut new_stmts = Vec::new();
            if let Some(slot) = signature.return_value {
                let term = function.access(slot);
                let stmt = function.insert_stmt(
                    block,
                    call_index + 1,
                    StatementKind::Touch {
                        term,
                        access: Access::Write,
                    },
                    addr,
                )?;
                new_stmts.push(stmt);
                return_terms.push((slot, term));
            }

            // Argument reads go right before it, in reverse so they end
            // up in passing order.
            let mut argument_terms = Vec::new();
            for &slot in signature.arguments.iter().rev() {
                let Some(mapped) = self.map_callee_slot(slot, sp_offset) else {
                    warn!(
                        "{}: stack pointer unknown at call site, dropping a stack argument",
                        format_addr(addr)
                    );
                    continue;
                };
                let term = function.access(mapped);
                let stmt = function.insert_stmt(
                    block,
                    call_index,
                    StatementKind::Touch {
                        term,
                        access: Access::Read,
                    },
                    addr,
                )?;
                new_stmts.push(stmt);
                argument_terms.push((slot, term));
            }
            argument_terms.reverse();

            let hook = hooks.calls.get_mut(&call).expect("hook exists");
            hook.stmts.extend(new_stmts);
            hook.argument_terms = argument_terms;
            hook.return_terms = return_terms;
        }
        Ok(())
    }

    /// Maps a callee-frame location into the caller's frame.  Register
    /// slots map to themselves; stack slots shift by the stack-pointer
    /// offset at the call.
    fn map_callee_slot(
        &self,
        slot: MemoryLocation,
        sp_offset: Option<i64>,
    ) -> Option<MemoryLocation> {
        if slot.domain() != Domain::STACK {
            return Some(slot);
        }
        sp_offset.map(|offset| slot.shifted(offset * 8))
    }
}

/// Derives a function's signature from what the analyses saw: an
/// argument candidate is kept if its entry definition is ever consumed,
/// and the function returns a value if any return hook found one
/// defined.  Candidates are trimmed to the used prefix because argument
/// lists are contiguous.
pub fn infer_signature(
    function: &Function,
    hooks: &Hooks,
    dataflow: &Dataflow,
    arch: &Architecture,
) -> Signature {
    let mut used_defs: Set<TermId> = Set::new();
    for term in function.term_ids() {
        if let Some(defs) = dataflow.definitions(term) {
            for chunk in defs.chunks() {
                used_defs.extend(chunk.definitions().iter().copied());
            }
        }
    }

    let mut arguments = Vec::new();
    if let Some(entry_hook) = &hooks.entry {
        let last_used = entry_hook
            .argument_terms
            .iter()
            .rposition(|(_, term)| used_defs.contains(term));
        if let Some(last) = last_used {
            arguments = entry_hook.argument_terms[..=last]
                .iter()
                .map(|&(slot, _)| slot)
                .collect();
        }
    }

    // The entry hook defines every candidate location, so only a
    // definition made by the function body is evidence of a value
    // actually being returned.
    let entry_terms: Set<TermId> = hooks
        .entry
        .iter()
        .flat_map(|hook| &hook.argument_terms)
        .map(|&(_, term)| term)
        .collect();
    let returns_value = hooks
        .returns
        .values()
        .flat_map(|hook| &hook.return_terms)
        .any(|&(_, term)| {
            dataflow.definitions(term).is_some_and(|defs| {
                defs.chunks()
                    .iter()
                    .flat_map(|chunk| chunk.definitions())
                    .any(|def| !entry_terms.contains(def))
            })
        });

    Signature {
        arguments,
        return_value: if returns_value {
            arch.convention().return_value
        } else {
            None
        },
    }
}
