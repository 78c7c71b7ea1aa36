//! Recognition of idioms the structural analyzer and the code generator
//! care about: array accesses behind jump tables and the bounds checks
//! compilers emit in front of them.
//!
//! Both recognizers are pure functions over `(term, dataflow)`.  They see
//! through copies first: registers are shuffled freely by real code, so a
//! pattern rarely sits in one term tree.

use crate::common::ByteAddr;
use crate::middle::dataflow::Dataflow;
use crate::middle::ir::*;

/// A dereference of `base + index * stride` with constant `base` and
/// `stride`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ArrayAccess {
    pub base: ByteAddr,
    pub stride: u64,
    /// The term computing the index.
    pub index: TermId,
}

/// A conditional jump checking `index <= max_value` before a table
/// dispatch.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BoundsCheck {
    /// The term holding the checked index.
    pub index: TermId,
    /// Largest index that passes the check.
    pub max_value: u64,
    /// Where control goes when the check fails.
    pub if_failed: BlockId,
}

/// Walks along identity assignments to the earliest term holding the
/// same value: a write moves to the assignment's right side, a read with
/// a unique same-location definition moves to that definition.
pub fn first_copy(term: TermId, function: &Function, dataflow: &Dataflow) -> TermId {
    let mut current = term;
    // Bounded: a self-assignment would make the copy chain cyclic.
    for _ in 0..100 {
        if function.term(current).is_write() {
            if let Some(source) = function.source_of(current) {
                current = source;
                continue;
            }
        }
        if function.term(current).is_read() {
            if let Some(def) = dataflow.the_only_definition(current) {
                current = def;
                continue;
            }
        }
        break;
    }
    current
}

/// Matches `*(base + index*stride)` or `*(base + (index << shift))` where
/// `base` and the stride resolve to concrete constants.
pub fn recognize_array_access(
    term: TermId,
    function: &Function,
    dataflow: &Dataflow,
) -> Option<ArrayAccess> {
    let term = first_copy(term, function, dataflow);
    let address = function.term(term).as_dereference()?;
    let address = first_copy(address, function, dataflow);
    let (op, left, right) = function.term(address).as_binary()?;
    if op != BinaryOp::Add {
        return None;
    }
    let left = first_copy(left, function, dataflow);
    let right = first_copy(right, function, dataflow);
    recognize_base_and_scaled_index(left, right, function, dataflow)
        .or_else(|| recognize_base_and_scaled_index(right, left, function, dataflow))
}

fn recognize_base_and_scaled_index(
    base: TermId,
    multiplication: TermId,
    function: &Function,
    dataflow: &Dataflow,
) -> Option<ArrayAccess> {
    let base_value = dataflow.as_exact(base)?;
    let (op, left, right) = function.term(multiplication).as_binary()?;
    match op {
        BinaryOp::Shl => {
            let shift = dataflow.as_exact(right)?;
            Some(ArrayAccess {
                base: base_value.value(),
                stride: 1u64.checked_shl(shift.value() as u32)?,
                index: left,
            })
        }
        BinaryOp::Mul => {
            if let Some(stride) = dataflow.as_exact(left) {
                return Some(ArrayAccess {
                    base: base_value.value(),
                    stride: stride.value(),
                    index: right,
                });
            }
            let stride = dataflow.as_exact(right)?;
            Some(ArrayAccess {
                base: base_value.value(),
                stride: stride.value(),
                index: left,
            })
        }
        _ => None,
    }
}

/// Matches a (possibly negated) `index <= const` / `index < const`
/// conditional jump whose passing edge leads to `if_passed`.
pub fn recognize_bounds_check(
    stmt: StmtId,
    if_passed: BlockId,
    function: &Function,
    dataflow: &Dataflow,
) -> Option<BoundsCheck> {
    let jump = function.stmt(stmt).as_jump()?;
    let condition = jump.condition?;
    let else_target = jump.else_target.as_ref()?;

    let mut inverse = if jump.then_target.block() == Some(if_passed) {
        false
    } else if else_target.block() == Some(if_passed) {
        true
    } else {
        return None;
    };

    // Peel double negations; compilers and lowering both produce them.
    // Ten unwraps tolerate any sane chain without risking a cycle.
    let mut condition = first_copy(condition, function, dataflow);
    for _ in 0..10 {
        match function.term(condition).as_unary() {
            Some((UnaryOp::Not, operand)) if function.term(condition).size() == 1 => {
                condition = first_copy(operand, function, dataflow);
                inverse = !inverse;
            }
            _ => break,
        }
    }

    let (op, left, right) = function.term(condition).as_binary()?;
    if !inverse {
        let if_failed = else_target.block()?;
        match op {
            BinaryOp::UnsignedLessOrEqual => {
                let max = dataflow.as_exact(right)?;
                Some(BoundsCheck {
                    index: left,
                    max_value: max.value(),
                    if_failed,
                })
            }
            BinaryOp::UnsignedLess => {
                let max = dataflow.as_exact(right)?;
                Some(BoundsCheck {
                    index: left,
                    max_value: max.value().checked_sub(1)?,
                    if_failed,
                })
            }
            _ => None,
        }
    } else {
        let if_failed = jump.then_target.block()?;
        match op {
            BinaryOp::UnsignedLess => {
                let max = dataflow.as_exact(left)?;
                Some(BoundsCheck {
                    index: right,
                    max_value: max.value(),
                    if_failed,
                })
            }
            BinaryOp::UnsignedLessOrEqual => {
                let max = dataflow.as_exact(left)?;
                Some(BoundsCheck {
                    index: right,
                    max_value: max.value().checked_sub(1)?,
                    if_failed,
                })
            }
            _ => None,
        }
    }
}
