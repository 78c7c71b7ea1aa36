//! Call inlining: splicing a callee's body into the caller.
//!
//! The caller's block is split right after the call, the callee's blocks
//! are cloned in, the call becomes a jump to the cloned entry, and every
//! cloned return jump is retargeted at the continuation.  The caller
//! must rebuild its derived tables afterwards; inlining is a structural
//! mutation like any other.

use thiserror::Error;

use crate::middle::dataflow::{self, Dataflow};
use crate::middle::ir::*;

#[derive(Clone, PartialEq, Eq, Debug, Error)]
pub enum InlineError {
    #[error("the statement being inlined into is not a call")]
    NotACall,
    #[error("the inlined function has no entry block")]
    NoEntry,
}

/// The return jumps of a function, as identified by its dataflow.
pub fn returns_of(function: &Function, dataflow: &Dataflow) -> Vec<StmtId> {
    function
        .block_ids()
        .filter_map(|block| function.terminator(block))
        .filter(|&stmt| dataflow::is_return(stmt, function, dataflow))
        .collect()
}

/// Return jumps of a function whose dataflow ran without the entry hook,
/// where the return address has not been traced yet.  An unconditional
/// computed jump that resolved to nothing is taken for a return; an
/// unresolved computed goto would be misclassified, so callers should
/// prefer [returns_of] when hooked dataflow is available.
pub fn likely_returns(function: &Function, dataflow: &Dataflow) -> Vec<StmtId> {
    function
        .block_ids()
        .filter_map(|block| function.terminator(block))
        .filter(|&stmt| {
            if dataflow::is_return(stmt, function, dataflow) {
                return true;
            }
            let Some(jump) = function.stmt(stmt).as_jump() else {
                return false;
            };
            jump.is_unconditional()
                && jump.then_target.address().is_some()
                && !dataflow.resolved_targets().contains_key(&stmt)
                && dataflow.jump_table(stmt).is_none()
        })
        .collect()
}

/// Inlines `callee` into `caller` at `call`.  `callee_returns` lists the
/// callee's return jumps (see [returns_of]).
pub fn inline_call(
    program: &mut Program,
    caller: FuncId,
    call: StmtId,
    callee: FuncId,
    callee_returns: &[StmtId],
) -> Result<(), InlineError> {
    let callee_fn = program.function(callee).clone();
    let callee_entry = callee_fn.entry().ok_or(InlineError::NoEntry)?;

    let function = program.function_mut(caller);
    if function.stmt(call).as_call().is_none() {
        return Err(InlineError::NotACall);
    }
    let block = function.stmt(call).block();
    let call_index = function
        .block(block)
        .stmts()
        .iter()
        .position(|&stmt| stmt == call)
        .expect("a call belongs to its block");

    // Split after the call; the lead-in now ends with the call followed
    // by a jump to the continuation.
    let lead_out = function.split_block(block, call_index + 1);

    let block_map = function.clone_blocks_from(&callee_fn, &callee_fn.block_ids().collect::<Vec<_>>());

    // Replace `call; goto lead_out` with a jump into the cloned body.
    function.pop_stmt(block);
    function.pop_stmt(block);
    function
        .push_stmt(
            block,
            StatementKind::Jump(Jump {
                condition: None,
                then_target: JumpTarget::Block(block_map[&callee_entry]),
                else_target: None,
            }),
            None,
        )
        .expect("the lead-in lost its terminator");

    // Retarget cloned returns at the continuation.
    for (&old_block, &new_block) in &block_map {
        let Some(terminator) = callee_fn.terminator(old_block) else {
            continue;
        };
        if !callee_returns.contains(&terminator) {
            continue;
        }
        function.pop_stmt(new_block);
        function
            .push_stmt(
                new_block,
                StatementKind::Jump(Jump {
                    condition: None,
                    then_target: JumpTarget::Block(lead_out),
                    else_target: None,
                }),
                None,
            )
            .expect("the cloned block lost its terminator");
    }

    program.reindex_blocks();
    Ok(())
}
