//! The intermediate representation.
//!
//! A [Program] is a set of [Function]s.  Each function owns three arenas:
//! basic blocks, statements, and terms.  Handles into the arenas
//! ([BlockId], [StmtId], [TermId]) are plain indices, so cross-references
//! (a jump naming its target block, a reaching definition naming the
//! defining term) are cheap copies and carry no ownership.  All IR is
//! created while lowering machine code, mutated only by the structural
//! transforms in this module (block splitting, call inlining), and dropped
//! together with the owning function.
//!
//! Statements and terms are tagged variants matched exhaustively; the
//! `as_*` accessors exist for call sites that only care about one variant.

use derive_more::Display;
use thiserror::Error;

use crate::common::*;

/// An integer value together with its width.  The stored value is always
/// normalized: bits above `size` are zero.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Display)]
#[display("{value}:{size}")]
pub struct SizedValue {
    size: BitSize,
    value: u64,
}

impl SizedValue {
    pub fn new(size: BitSize, value: u64) -> Self {
        assert!(size > 0 && size <= 64);
        Self {
            size,
            value: value & Self::mask(size),
        }
    }

    fn mask(size: BitSize) -> u64 {
        if size >= 64 {
            u64::MAX
        } else {
            (1u64 << size) - 1
        }
    }

    pub fn size(&self) -> BitSize {
        self.size
    }

    /// The value zero-extended to 64 bits.
    pub fn value(&self) -> u64 {
        self.value
    }

    /// The value sign-extended to 64 bits.
    pub fn signed_value(&self) -> i64 {
        let shift = 64 - self.size;
        ((self.value << shift) as i64) >> shift
    }
}

/// An address space tag.
///
/// Machine memory is one shared space.  The stack is a second space whose
/// offsets are relative to the value of the stack pointer at function
/// entry.  Each architectural register file entry gets a space of its own
/// (sub-registers live at bit offsets inside their parent's space), and
/// synthesized temporaries are handed fresh spaces by [Program].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Display)]
#[display("d{_0}")]
pub struct Domain(pub u32);

impl Domain {
    pub const MEMORY: Domain = Domain(0);
    pub const STACK: Domain = Domain(1);
    /// First domain available to architecture register tables.
    pub const FIRST_REGISTER: Domain = Domain(0x100);
    /// First domain available for synthesized temporaries.
    pub const FIRST_TEMPORARY: Domain = Domain(0x1000_0000);
}

/// Raised when two memory locations from different address spaces are
/// asked to merge.  This is an invariant violation that aborts the whole
/// run, not a per-function condition.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Error)]
#[error("cannot merge memory locations from different address spaces ({0} and {1})")]
pub struct DomainMismatch(pub Domain, pub Domain);

/// A bit-addressed slice of one address space: `(domain, addr, size)` with
/// `size > 0`.  Bit addressing keeps sub-register writes (say, the low
/// eight bits of a wider register) representable exactly.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct MemoryLocation {
    domain: Domain,
    addr: BitAddr,
    size: BitSize,
}

impl std::fmt::Display for MemoryLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}..{})", self.domain, self.addr, self.end())
    }
}

impl MemoryLocation {
    pub fn new(domain: Domain, addr: BitAddr, size: BitSize) -> Self {
        assert!(size > 0, "a memory location must cover at least one bit");
        Self { domain, addr, size }
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    /// First bit covered.
    pub fn addr(&self) -> BitAddr {
        self.addr
    }

    /// One past the last bit covered.
    pub fn end(&self) -> BitAddr {
        self.addr + self.size as BitAddr
    }

    pub fn size(&self) -> BitSize {
        self.size
    }

    /// True iff the two locations share a domain and their bit intervals
    /// intersect.
    pub fn overlaps(&self, other: &MemoryLocation) -> bool {
        self.domain == other.domain && self.addr < other.end() && other.addr < self.end()
    }

    /// True iff `other` lies entirely within this location.
    pub fn covers(&self, other: &MemoryLocation) -> bool {
        self.domain == other.domain && self.addr <= other.addr && other.end() <= self.end()
    }

    /// The common part of the two locations, if any.
    pub fn intersected(&self, other: &MemoryLocation) -> Option<MemoryLocation> {
        if !self.overlaps(other) {
            return None;
        }
        let addr = self.addr.max(other.addr);
        let end = self.end().min(other.end());
        Some(MemoryLocation::new(self.domain, addr, (end - addr) as BitSize))
    }

    /// The smallest location covering both operands.  Merging across
    /// domains has no meaning and is rejected.
    pub fn merged(&self, other: &MemoryLocation) -> Result<MemoryLocation, DomainMismatch> {
        if self.domain != other.domain {
            return Err(DomainMismatch(self.domain, other.domain));
        }
        let addr = self.addr.min(other.addr);
        let end = self.end().max(other.end());
        Ok(MemoryLocation::new(self.domain, addr, (end - addr) as BitSize))
    }

    /// The same slice moved by `delta` bits within its domain.
    pub fn shifted(&self, delta: BitAddr) -> MemoryLocation {
        MemoryLocation::new(self.domain, self.addr + delta, self.size)
    }

    /// A slice of this location described in bits relative to its start.
    pub fn subrange(&self, offset: BitAddr, size: BitSize) -> MemoryLocation {
        debug_assert!(offset >= 0 && offset + size as BitAddr <= self.size as BitAddr);
        MemoryLocation::new(self.domain, self.addr + offset, size)
    }
}

/// How a term touches its value.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Display)]
pub enum Access {
    #[display("read")]
    Read,
    #[display("write")]
    Write,
    #[display("read-write")]
    ReadWrite,
}

impl Access {
    pub fn is_read(self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }

    pub fn is_write(self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
}

/// What an opaque [TermKind::Intrinsic] stands for.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Display)]
pub enum IntrinsicKind {
    /// A value about which nothing is known.
    #[display("undefined")]
    Undefined,
    /// The value of the stack pointer at function entry.
    #[display("stack_base")]
    StackBase,
    /// The address execution resumes at when the function returns.
    #[display("return_address")]
    ReturnAddress,
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Display)]
pub enum UnaryOp {
    #[display("!")]
    Not,
    #[display("-")]
    Negate,
    #[display("sign_extend")]
    SignExtend,
    #[display("zero_extend")]
    ZeroExtend,
    #[display("truncate")]
    Truncate,
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Display)]
pub enum BinaryOp {
    #[display("+")]
    Add,
    #[display("-")]
    Sub,
    #[display("*")]
    Mul,
    #[display("/s")]
    SignedDiv,
    #[display("/u")]
    UnsignedDiv,
    #[display("%s")]
    SignedRem,
    #[display("%u")]
    UnsignedRem,
    #[display("&")]
    And,
    #[display("|")]
    Or,
    #[display("^")]
    Xor,
    #[display("<<")]
    Shl,
    #[display(">>u")]
    Shr,
    #[display(">>s")]
    Sar,
    #[display("==")]
    Equal,
    #[display("<s")]
    SignedLess,
    #[display("<=s")]
    SignedLessOrEqual,
    #[display("<u")]
    UnsignedLess,
    #[display("<=u")]
    UnsignedLessOrEqual,
}

impl BinaryOp {
    /// Comparisons produce a one-bit truth value; everything else keeps
    /// the width of its operands.
    pub fn is_comparison(self) -> bool {
        use BinaryOp::*;
        matches!(
            self,
            Equal | SignedLess | SignedLessOrEqual | UnsignedLess | UnsignedLessOrEqual
        )
    }

    /// Shift amounts are allowed to be narrower than the shifted value.
    pub fn is_shift(self) -> bool {
        use BinaryOp::*;
        matches!(self, Shl | Shr | Sar)
    }
}

macro_rules! arena_id {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
        pub struct $name(pub u32);

        impl $name {
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}{}", $prefix, self.0)
            }
        }
    };
}

arena_id!(
    /// Handle to a [Term] in its function's term arena.
    TermId, "t");
arena_id!(
    /// Handle to a [Statement] in its function's statement arena.
    StmtId, "s");
arena_id!(
    /// Handle to a [BasicBlock] in its function's block arena.
    BlockId, "b");
arena_id!(
    /// Handle to a [Function] in the program's function arena.
    FuncId, "f");

/// A pure expression node.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum TermKind {
    /// An integer constant.
    IntConst(SizedValue),
    /// An opaque value of known width.
    Intrinsic(IntrinsicKind),
    /// A read or write of a fixed memory location.
    Access(MemoryLocation),
    /// A read or write of the memory the child term's value points to.
    Dereference { address: TermId },
    Unary { op: UnaryOp, operand: TermId },
    Binary { op: BinaryOp, left: TermId, right: TermId },
    /// A preferred term and a fallback, used where one definition may be
    /// absent (say, an argument register that only some callers set).
    Choice { preferred: TermId, fallback: TermId },
}

#[derive(Clone, Debug)]
pub struct Term {
    pub kind: TermKind,
    size: BitSize,
    access: Access,
    stmt: Option<StmtId>,
}

impl Term {
    pub fn size(&self) -> BitSize {
        self.size
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn is_read(&self) -> bool {
        self.access.is_read()
    }

    pub fn is_write(&self) -> bool {
        self.access.is_write()
    }

    /// The statement this term belongs to.  Set when the statement is
    /// appended; a term not yet attached to a statement has none.
    pub fn stmt(&self) -> Option<StmtId> {
        self.stmt
    }

    pub fn as_binary(&self) -> Option<(BinaryOp, TermId, TermId)> {
        match self.kind {
            TermKind::Binary { op, left, right } => Some((op, left, right)),
            _ => None,
        }
    }

    pub fn as_unary(&self) -> Option<(UnaryOp, TermId)> {
        match self.kind {
            TermKind::Unary { op, operand } => Some((op, operand)),
            _ => None,
        }
    }

    pub fn as_int_const(&self) -> Option<SizedValue> {
        match self.kind {
            TermKind::IntConst(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_access(&self) -> Option<MemoryLocation> {
        match self.kind {
            TermKind::Access(location) => Some(location),
            _ => None,
        }
    }

    pub fn as_dereference(&self) -> Option<TermId> {
        match self.kind {
            TermKind::Dereference { address } => Some(address),
            _ => None,
        }
    }
}

/// Where a jump transfers control: either straight to a block of the same
/// function, or to whatever address the term's value names.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum JumpTarget {
    Block(BlockId),
    Address(TermId),
}

impl JumpTarget {
    pub fn block(&self) -> Option<BlockId> {
        match *self {
            JumpTarget::Block(block) => Some(block),
            JumpTarget::Address(_) => None,
        }
    }

    pub fn address(&self) -> Option<TermId> {
        match *self {
            JumpTarget::Block(_) => None,
            JumpTarget::Address(term) => Some(term),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Jump {
    /// One-bit guard; an unconditional jump has none.
    pub condition: Option<TermId>,
    pub then_target: JumpTarget,
    /// Taken when the condition is false.  Must be present iff there is a
    /// condition.
    pub else_target: Option<JumpTarget>,
}

impl Jump {
    pub fn is_unconditional(&self) -> bool {
        self.condition.is_none()
    }
}

/// A side-effecting node, the unit of execution within a basic block.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum StatementKind {
    /// Opaque machine code the lowering could not translate.
    InlineAssembly,
    /// `left <- right`.
    Assignment { left: TermId, right: TermId },
    /// The term is accessed with the given mode, but no value flows.
    /// Models implicit effects such as flags an instruction clobbers.
    Touch { term: TermId, access: Access },
    Jump(Jump),
    Call { target: TermId },
    /// Execution stops here.
    Halt,
    /// An opaque side effect.
    Callback,
    /// A checkpoint where the dataflow fixpoint joins states flowing in
    /// through back edges.
    RememberReachingDefinitions,
}

impl StatementKind {
    /// Statements that end a basic block.
    pub fn is_terminator(&self) -> bool {
        matches!(self, StatementKind::Jump(_) | StatementKind::Halt)
    }
}

#[derive(Clone, Debug)]
pub struct Statement {
    pub kind: StatementKind,
    block: BlockId,
    addr: Option<ByteAddr>,
}

impl Statement {
    pub fn block(&self) -> BlockId {
        self.block
    }

    /// Address of the machine instruction this statement was lowered
    /// from, if any.
    pub fn addr(&self) -> Option<ByteAddr> {
        self.addr
    }

    pub fn as_jump(&self) -> Option<&Jump> {
        match &self.kind {
            StatementKind::Jump(jump) => Some(jump),
            _ => None,
        }
    }

    pub fn as_call(&self) -> Option<TermId> {
        match self.kind {
            StatementKind::Call { target } => Some(target),
            _ => None,
        }
    }

    pub fn as_assignment(&self) -> Option<(TermId, TermId)> {
        match self.kind {
            StatementKind::Assignment { left, right } => Some((left, right)),
            _ => None,
        }
    }
}

/// A straight-line sequence of statements.  Only the last statement may
/// alter control flow.
#[derive(Clone, Debug, Default)]
pub struct BasicBlock {
    stmts: Vec<StmtId>,
    addr: Option<ByteAddr>,
}

impl BasicBlock {
    pub fn stmts(&self) -> &[StmtId] {
        &self.stmts
    }

    /// Address of the first machine instruction of the block, if the
    /// block was lowered from one.
    pub fn addr(&self) -> Option<ByteAddr> {
        self.addr
    }
}

/// Errors raised while building or transforming IR.  Any of these renders
/// the surrounding function unanalyzable; other functions are unaffected.
#[derive(Clone, PartialEq, Eq, Debug, Error)]
pub enum IrError {
    #[error("operand widths disagree: {left} and {right} bits")]
    WidthMismatch { left: BitSize, right: BitSize },
    #[error("term is already owned by another statement")]
    TermReused,
    #[error("cannot append a statement after a terminator")]
    TerminatorNotLast,
    #[error("a conditional jump needs an else target, an unconditional one must not have it")]
    MalformedJump,
}

#[derive(Clone, Debug)]
pub struct Function {
    name: Option<Id>,
    addr: Option<ByteAddr>,
    entry: Option<BlockId>,
    blocks: Vec<BasicBlock>,
    stmts: Vec<Statement>,
    terms: Vec<Term>,
}

impl Function {
    pub fn new(name: Option<Id>, addr: Option<ByteAddr>) -> Self {
        Self {
            name,
            addr,
            entry: None,
            blocks: Vec::new(),
            stmts: Vec::new(),
            terms: Vec::new(),
        }
    }

    pub fn name(&self) -> Option<Id> {
        self.name
    }

    pub fn addr(&self) -> Option<ByteAddr> {
        self.addr
    }

    pub fn entry(&self) -> Option<BlockId> {
        self.entry
    }

    pub fn set_entry(&mut self, block: BlockId) {
        self.entry = Some(block);
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.index()]
    }

    pub fn stmt(&self, id: StmtId) -> &Statement {
        &self.stmts[id.index()]
    }

    pub fn term(&self, id: TermId) -> &Term {
        &self.terms[id.index()]
    }

    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> {
        (0..self.blocks.len() as u32).map(BlockId)
    }

    pub fn stmt_ids(&self) -> impl Iterator<Item = StmtId> {
        (0..self.stmts.len() as u32).map(StmtId)
    }

    pub fn term_ids(&self) -> impl Iterator<Item = TermId> {
        (0..self.terms.len() as u32).map(TermId)
    }

    pub fn add_block(&mut self, addr: Option<ByteAddr>) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BasicBlock { stmts: Vec::new(), addr });
        id
    }

    fn add_term(&mut self, kind: TermKind, size: BitSize) -> TermId {
        let id = TermId(self.terms.len() as u32);
        self.terms.push(Term {
            kind,
            size,
            access: Access::Read,
            stmt: None,
        });
        id
    }

    pub fn int_const(&mut self, value: SizedValue) -> TermId {
        let size = value.size();
        self.add_term(TermKind::IntConst(value), size)
    }

    /// Shorthand for a constant built from a plain integer.
    pub fn constant(&mut self, value: u64, size: BitSize) -> TermId {
        self.int_const(SizedValue::new(size, value))
    }

    pub fn intrinsic(&mut self, kind: IntrinsicKind, size: BitSize) -> TermId {
        self.add_term(TermKind::Intrinsic(kind), size)
    }

    pub fn access(&mut self, location: MemoryLocation) -> TermId {
        let size = location.size();
        self.add_term(TermKind::Access(location), size)
    }

    pub fn dereference(&mut self, address: TermId, size: BitSize) -> TermId {
        self.add_term(TermKind::Dereference { address }, size)
    }

    pub fn unary(&mut self, op: UnaryOp, operand: TermId, size: BitSize) -> Result<TermId, IrError> {
        let operand_size = self.term(operand).size();
        let consistent = match op {
            UnaryOp::Not | UnaryOp::Negate => size == operand_size,
            UnaryOp::SignExtend | UnaryOp::ZeroExtend => size >= operand_size,
            UnaryOp::Truncate => size <= operand_size,
        };
        if !consistent {
            return Err(IrError::WidthMismatch {
                left: size,
                right: operand_size,
            });
        }
        Ok(self.add_term(TermKind::Unary { op, operand }, size))
    }

    pub fn binary(&mut self, op: BinaryOp, left: TermId, right: TermId) -> Result<TermId, IrError> {
        let left_size = self.term(left).size();
        let right_size = self.term(right).size();
        if !op.is_shift() && left_size != right_size {
            return Err(IrError::WidthMismatch {
                left: left_size,
                right: right_size,
            });
        }
        let size = if op.is_comparison() { 1 } else { left_size };
        Ok(self.add_term(TermKind::Binary { op, left, right }, size))
    }

    pub fn choice(&mut self, preferred: TermId, fallback: TermId) -> Result<TermId, IrError> {
        let preferred_size = self.term(preferred).size();
        let fallback_size = self.term(fallback).size();
        if preferred_size != fallback_size {
            return Err(IrError::WidthMismatch {
                left: preferred_size,
                right: fallback_size,
            });
        }
        Ok(self.add_term(TermKind::Choice { preferred, fallback }, preferred_size))
    }

    /// Claims the term tree rooted at `term` for `stmt`, fixing the access
    /// mode of the root and marking every inner operand as read.
    fn attach(&mut self, term: TermId, stmt: StmtId, access: Access) -> Result<(), IrError> {
        if self.terms[term.index()].stmt.is_some() {
            return Err(IrError::TermReused);
        }
        self.terms[term.index()].stmt = Some(stmt);
        self.terms[term.index()].access = access;
        match self.terms[term.index()].kind.clone() {
            TermKind::IntConst(_) | TermKind::Intrinsic(_) | TermKind::Access(_) => {}
            // The address computation is read even when the pointed-to
            // memory is written.
            TermKind::Dereference { address } => self.attach(address, stmt, Access::Read)?,
            TermKind::Unary { operand, .. } => self.attach(operand, stmt, Access::Read)?,
            TermKind::Binary { left, right, .. } => {
                self.attach(left, stmt, Access::Read)?;
                self.attach(right, stmt, Access::Read)?;
            }
            TermKind::Choice { preferred, fallback } => {
                self.attach(preferred, stmt, access)?;
                self.attach(fallback, stmt, access)?;
            }
        }
        Ok(())
    }

    fn attach_stmt_terms(&mut self, id: StmtId, kind: &StatementKind) -> Result<(), IrError> {
        match *kind {
            StatementKind::Assignment { left, right } => {
                let left_size = self.term(left).size();
                let right_size = self.term(right).size();
                if left_size != right_size {
                    return Err(IrError::WidthMismatch {
                        left: left_size,
                        right: right_size,
                    });
                }
                self.attach(left, id, Access::Write)?;
                self.attach(right, id, Access::Read)?;
            }
            StatementKind::Touch { term, access } => {
                self.attach(term, id, access)?;
            }
            StatementKind::Jump(ref jump) => {
                if jump.condition.is_some() != jump.else_target.is_some() {
                    return Err(IrError::MalformedJump);
                }
                if let Some(condition) = jump.condition {
                    self.attach(condition, id, Access::Read)?;
                }
                if let Some(address) = jump.then_target.address() {
                    self.attach(address, id, Access::Read)?;
                }
                if let Some(address) = jump.else_target.as_ref().and_then(JumpTarget::address) {
                    self.attach(address, id, Access::Read)?;
                }
            }
            StatementKind::Call { target } => {
                self.attach(target, id, Access::Read)?;
            }
            StatementKind::InlineAssembly
            | StatementKind::Halt
            | StatementKind::Callback
            | StatementKind::RememberReachingDefinitions => {}
        }
        Ok(())
    }

    /// Appends a statement to a block, claiming its term tree.
    pub fn push_stmt(
        &mut self,
        block: BlockId,
        kind: StatementKind,
        addr: Option<ByteAddr>,
    ) -> Result<StmtId, IrError> {
        let len = self.blocks[block.index()].stmts.len();
        self.insert_stmt(block, len, kind, addr)
    }

    /// Inserts a statement at a position inside a block.  Used by the
    /// calling-convention hooks, which splice synthesized statements in
    /// front of existing code.
    pub fn insert_stmt(
        &mut self,
        block: BlockId,
        index: usize,
        kind: StatementKind,
        addr: Option<ByteAddr>,
    ) -> Result<StmtId, IrError> {
        let stmts = &self.blocks[block.index()].stmts;
        let at_end = index == stmts.len();
        if at_end {
            if let Some(&last) = stmts.last() {
                if self.stmt(last).kind.is_terminator() {
                    return Err(IrError::TerminatorNotLast);
                }
            }
        } else if kind.is_terminator() {
            return Err(IrError::TerminatorNotLast);
        }
        let id = StmtId(self.stmts.len() as u32);
        self.attach_stmt_terms(id, &kind)?;
        self.stmts.push(Statement { kind, block, addr });
        self.blocks[block.index()].stmts.insert(index, id);
        Ok(id)
    }

    /// Removes the last statement of a block.  The statement stays in the
    /// arena but is no longer part of any block.  Used by inlining to
    /// strip a return jump before appending a jump to the continuation.
    pub fn pop_stmt(&mut self, block: BlockId) -> Option<StmtId> {
        self.blocks[block.index()].stmts.pop()
    }

    /// Splits `block` before the statement at `index`.  Statements from
    /// `index` on move to a fresh block and the shortened original gets an
    /// unconditional jump to it.  Returns the fresh block.
    pub fn split_block(&mut self, block: BlockId, index: usize) -> BlockId {
        let tail = self.blocks[block.index()].stmts.split_off(index);
        let new_block = self.add_block(None);
        for &stmt in &tail {
            self.stmts[stmt.index()].block = new_block;
        }
        self.blocks[new_block.index()].stmts = tail;
        self.push_stmt(
            block,
            StatementKind::Jump(Jump {
                condition: None,
                then_target: JumpTarget::Block(new_block),
                else_target: None,
            }),
            None,
        )
        .expect("the split-off prefix cannot end with a terminator");
        new_block
    }

    /// Deep-copies the given blocks of `src` into this function.  Jump
    /// targets pointing into the copied set are redirected to the copies;
    /// the returned mapping lets the caller redirect its own edges.
    /// Clones carry no entry address: the original blocks keep their
    /// claim on the program's address index.
    pub fn clone_blocks_from(&mut self, src: &Function, blocks: &[BlockId]) -> Map<BlockId, BlockId> {
        let mut block_map: Map<BlockId, BlockId> = Map::new();
        for &block in blocks {
            let clone = self.add_block(None);
            block_map.insert(block, clone);
        }
        for &block in blocks {
            let clone = block_map[&block];
            for &stmt in src.block(block).stmts() {
                let statement = src.stmt(stmt);
                let kind = self.clone_stmt_kind(src, &statement.kind, &block_map);
                self.push_stmt(clone, kind, statement.addr())
                    .expect("source block shape is preserved by cloning");
            }
        }
        block_map
    }

    fn clone_stmt_kind(
        &mut self,
        src: &Function,
        kind: &StatementKind,
        block_map: &Map<BlockId, BlockId>,
    ) -> StatementKind {
        let map_target = |this: &mut Self, target: &JumpTarget| match *target {
            JumpTarget::Block(block) => {
                JumpTarget::Block(block_map.get(&block).copied().unwrap_or(block))
            }
            JumpTarget::Address(term) => JumpTarget::Address(this.clone_term_from(src, term)),
        };
        match *kind {
            StatementKind::InlineAssembly => StatementKind::InlineAssembly,
            StatementKind::Assignment { left, right } => StatementKind::Assignment {
                left: self.clone_term_from(src, left),
                right: self.clone_term_from(src, right),
            },
            StatementKind::Touch { term, access } => StatementKind::Touch {
                term: self.clone_term_from(src, term),
                access,
            },
            StatementKind::Jump(ref jump) => StatementKind::Jump(Jump {
                condition: jump.condition.map(|term| self.clone_term_from(src, term)),
                then_target: map_target(self, &jump.then_target),
                else_target: jump.else_target.as_ref().map(|target| map_target(self, target)),
            }),
            StatementKind::Call { target } => StatementKind::Call {
                target: self.clone_term_from(src, target),
            },
            StatementKind::Halt => StatementKind::Halt,
            StatementKind::Callback => StatementKind::Callback,
            StatementKind::RememberReachingDefinitions => StatementKind::RememberReachingDefinitions,
        }
    }

    fn clone_term_from(&mut self, src: &Function, term: TermId) -> TermId {
        let size = src.term(term).size();
        match src.term(term).kind.clone() {
            TermKind::IntConst(value) => self.int_const(value),
            TermKind::Intrinsic(kind) => self.intrinsic(kind, size),
            TermKind::Access(location) => self.access(location),
            TermKind::Dereference { address } => {
                let address = self.clone_term_from(src, address);
                self.dereference(address, size)
            }
            TermKind::Unary { op, operand } => {
                let operand = self.clone_term_from(src, operand);
                self.add_term(TermKind::Unary { op, operand }, size)
            }
            TermKind::Binary { op, left, right } => {
                let left = self.clone_term_from(src, left);
                let right = self.clone_term_from(src, right);
                self.add_term(TermKind::Binary { op, left, right }, size)
            }
            TermKind::Choice { preferred, fallback } => {
                let preferred = self.clone_term_from(src, preferred);
                let fallback = self.clone_term_from(src, fallback);
                self.add_term(TermKind::Choice { preferred, fallback }, size)
            }
        }
    }

    /// The statement ending the block, if it alters control flow.
    pub fn terminator(&self, block: BlockId) -> Option<StmtId> {
        let &last = self.block(block).stmts().last()?;
        self.stmt(last).kind.is_terminator().then_some(last)
    }

    /// Blocks this block hands control to, as far as the IR alone can
    /// tell.  Targets expressed as address terms resolve through the
    /// program-wide block index instead.
    pub fn successors(&self, block: BlockId) -> Vec<BlockId> {
        let mut result = Vec::new();
        if let Some(stmt) = self.terminator(block) {
            if let Some(jump) = self.stmt(stmt).as_jump() {
                if let Some(target) = jump.then_target.block() {
                    result.push(target);
                }
                if let Some(target) = jump.else_target.as_ref().and_then(JumpTarget::block) {
                    if !result.contains(&target) {
                        result.push(target);
                    }
                }
            }
        }
        result
    }

    /// The term a statement writes through, if any: an assignment's
    /// target or a write-mode touch.
    pub fn written_term(&self, stmt: StmtId) -> Option<TermId> {
        match self.stmt(stmt).kind {
            StatementKind::Assignment { left, .. } => Some(left),
            StatementKind::Touch { term, access } if access.is_write() => Some(term),
            _ => None,
        }
    }

    /// For a write-mode term, the term whose value it receives (the right
    /// side of the owning assignment).
    pub fn source_of(&self, term: TermId) -> Option<TermId> {
        let stmt = self.term(term).stmt()?;
        match self.stmt(stmt).kind {
            StatementKind::Assignment { left, right } if left == term => Some(right),
            _ => None,
        }
    }

    /// Renders a term for diagnostics and IR dumps.
    pub fn term_to_string(&self, term: TermId) -> String {
        match &self.term(term).kind {
            TermKind::IntConst(value) => format!("{value}"),
            TermKind::Intrinsic(kind) => format!("{kind}()"),
            TermKind::Access(location) => format!("{location}"),
            TermKind::Dereference { address } => format!("*({})", self.term_to_string(*address)),
            TermKind::Unary { op, operand } => match op {
                UnaryOp::Not | UnaryOp::Negate => format!("{op}{}", self.term_to_string(*operand)),
                _ => format!("{op}{}({})", self.term(term).size(), self.term_to_string(*operand)),
            },
            TermKind::Binary { op, left, right } => format!(
                "({} {op} {})",
                self.term_to_string(*left),
                self.term_to_string(*right)
            ),
            TermKind::Choice { preferred, fallback } => format!(
                "choice({}, {})",
                self.term_to_string(*preferred),
                self.term_to_string(*fallback)
            ),
        }
    }

    /// Renders a statement for diagnostics and IR dumps.
    pub fn stmt_to_string(&self, stmt: StmtId) -> String {
        let target_to_string = |target: &JumpTarget| match target {
            JumpTarget::Block(block) => format!("{block}"),
            JumpTarget::Address(term) => format!("[{}]", self.term_to_string(*term)),
        };
        match &self.stmt(stmt).kind {
            StatementKind::InlineAssembly => "asm".to_owned(),
            StatementKind::Assignment { left, right } => {
                format!("{} = {}", self.term_to_string(*left), self.term_to_string(*right))
            }
            StatementKind::Touch { term, access } => {
                format!("touch({}, {access})", self.term_to_string(*term))
            }
            StatementKind::Jump(jump) => match (&jump.condition, &jump.else_target) {
                (Some(condition), Some(else_target)) => format!(
                    "if {} goto {} else {}",
                    self.term_to_string(*condition),
                    target_to_string(&jump.then_target),
                    target_to_string(else_target)
                ),
                _ => format!("goto {}", target_to_string(&jump.then_target)),
            },
            StatementKind::Call { target } => format!("call {}", self.term_to_string(*target)),
            StatementKind::Halt => "halt".to_owned(),
            StatementKind::Callback => "callback".to_owned(),
            StatementKind::RememberReachingDefinitions => "remember_reaching_definitions".to_owned(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Program {
    functions: Vec<Function>,
    /// Code address -> the block starting there, across all functions.
    /// Resolves indirect and cross-function jumps.
    blocks_by_addr: Map<ByteAddr, (FuncId, BlockId)>,
    next_temporary: u32,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_function(&mut self, function: Function) -> FuncId {
        let id = FuncId(self.functions.len() as u32);
        for block in function.block_ids() {
            if let Some(addr) = function.block(block).addr() {
                self.blocks_by_addr.insert(addr, (id, block));
            }
        }
        self.functions.push(function);
        id
    }

    pub fn function(&self, id: FuncId) -> &Function {
        &self.functions[id.index()]
    }

    pub fn function_mut(&mut self, id: FuncId) -> &mut Function {
        &mut self.functions[id.index()]
    }

    pub fn func_ids(&self) -> impl Iterator<Item = FuncId> {
        (0..self.functions.len() as u32).map(FuncId)
    }

    /// Function ids ordered by entry address; functions without one come
    /// last, in creation order.  This is the emission order.
    pub fn functions_by_addr(&self) -> Vec<FuncId> {
        let mut ids: Vec<FuncId> = self.func_ids().collect();
        ids.sort_by_key(|id| (self.function(*id).addr().is_none(), self.function(*id).addr()));
        ids
    }

    pub fn block_at(&self, addr: ByteAddr) -> Option<(FuncId, BlockId)> {
        self.blocks_by_addr.get(&addr).copied()
    }

    /// Rebuilds the address index after a structural transform moved or
    /// added blocks.
    pub fn reindex_blocks(&mut self) {
        self.blocks_by_addr.clear();
        for id in 0..self.functions.len() as u32 {
            let id = FuncId(id);
            for block in self.functions[id.index()].block_ids() {
                if let Some(addr) = self.functions[id.index()].block(block).addr() {
                    self.blocks_by_addr.insert(addr, (id, block));
                }
            }
        }
    }

    /// A fresh address space for a synthesized temporary.
    pub fn temporary_domain(&mut self) -> Domain {
        let domain = Domain(Domain::FIRST_TEMPORARY.0 + self.next_temporary);
        self.next_temporary += 1;
        domain
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(domain: u32, addr: BitAddr, size: BitSize) -> MemoryLocation {
        MemoryLocation::new(Domain(domain), addr, size)
    }

    #[test]
    fn location_overlap_requires_same_domain() {
        assert!(loc(1, 0, 32).overlaps(&loc(1, 16, 32)));
        assert!(!loc(1, 0, 32).overlaps(&loc(2, 16, 32)));
        assert!(!loc(1, 0, 32).overlaps(&loc(1, 32, 32)));
    }

    #[test]
    fn location_covers_is_interval_containment() {
        assert!(loc(1, 0, 32).covers(&loc(1, 8, 8)));
        assert!(!loc(1, 0, 32).covers(&loc(1, 24, 16)));
        assert!(!loc(1, 0, 32).covers(&loc(2, 8, 8)));
    }

    #[test]
    fn location_merge_covers_both_operands() {
        let merged = loc(1, 0, 8).merged(&loc(1, 24, 8)).unwrap();
        assert_eq!(merged, loc(1, 0, 32));
    }

    #[test]
    fn location_merge_across_domains_is_an_error() {
        assert_eq!(
            loc(1, 0, 8).merged(&loc(2, 0, 8)),
            Err(DomainMismatch(Domain(1), Domain(2)))
        );
    }

    #[test]
    fn sized_value_is_normalized_and_sign_extends() {
        let value = SizedValue::new(8, 0x1ff);
        assert_eq!(value.value(), 0xff);
        assert_eq!(value.signed_value(), -1);
    }

    #[test]
    fn binary_width_rules_are_enforced() {
        let mut f = Function::new(None, None);
        let narrow = f.constant(1, 8);
        let wide = f.constant(1, 32);
        assert!(f.binary(BinaryOp::Add, narrow, wide).is_err());
        let shift = f.binary(BinaryOp::Shl, wide, narrow).unwrap();
        assert_eq!(f.term(shift).size(), 32);
        let narrow2 = f.constant(2, 8);
        let cmp = f.binary(BinaryOp::Equal, narrow, narrow2).unwrap();
        assert_eq!(f.term(cmp).size(), 1);
    }

    #[test]
    fn assignment_claims_terms_and_sets_access_modes() {
        let mut f = Function::new(None, None);
        let block = f.add_block(None);
        let target = f.access(loc(0x100, 0, 32));
        let source = f.constant(7, 32);
        let stmt = f
            .push_stmt(block, StatementKind::Assignment { left: target, right: source }, None)
            .unwrap();
        assert!(f.term(target).is_write());
        assert!(f.term(source).is_read());
        assert_eq!(f.term(target).stmt(), Some(stmt));
        assert_eq!(f.source_of(target), Some(source));
        assert_eq!(f.written_term(stmt), Some(target));
    }

    #[test]
    fn a_term_cannot_be_owned_twice() {
        let mut f = Function::new(None, None);
        let block = f.add_block(None);
        let term = f.constant(1, 32);
        let target = f.access(loc(0x100, 0, 32));
        f.push_stmt(block, StatementKind::Assignment { left: target, right: term }, None)
            .unwrap();
        let target2 = f.access(loc(0x100, 0, 32));
        assert_eq!(
            f.push_stmt(block, StatementKind::Assignment { left: target2, right: term }, None),
            Err(IrError::TermReused)
        );
    }

    #[test]
    fn nothing_goes_after_a_terminator() {
        let mut f = Function::new(None, None);
        let block = f.add_block(None);
        f.push_stmt(block, StatementKind::Halt, None).unwrap();
        assert_eq!(
            f.push_stmt(block, StatementKind::Callback, None),
            Err(IrError::TerminatorNotLast)
        );
    }

    #[test]
    fn split_block_joins_the_halves_with_a_jump() {
        let mut f = Function::new(None, None);
        let block = f.add_block(Some(0x1000));
        for _ in 0..3 {
            f.push_stmt(block, StatementKind::Callback, None).unwrap();
        }
        let tail = f.split_block(block, 1);
        assert_eq!(f.block(block).stmts().len(), 2);
        assert_eq!(f.block(tail).stmts().len(), 2);
        assert_eq!(f.successors(block), vec![tail]);
        let moved = f.block(tail).stmts()[0];
        assert_eq!(f.stmt(moved).block(), tail);
    }

    #[test]
    fn cloned_blocks_redirect_internal_jumps() {
        let mut src = Function::new(None, None);
        let a = src.add_block(None);
        let b = src.add_block(None);
        src.push_stmt(
            a,
            StatementKind::Jump(Jump {
                condition: None,
                then_target: JumpTarget::Block(b),
                else_target: None,
            }),
            None,
        )
        .unwrap();
        src.push_stmt(b, StatementKind::Halt, None).unwrap();

        let mut dst = Function::new(None, None);
        let map = dst.clone_blocks_from(&src, &[a, b]);
        let clone_a = map[&a];
        let clone_b = map[&b];
        assert_eq!(dst.successors(clone_a), vec![clone_b]);
    }

    #[test]
    fn program_indexes_blocks_by_address() {
        let mut f = Function::new(None, Some(0x400000));
        let entry = f.add_block(Some(0x400000));
        f.push_stmt(entry, StatementKind::Halt, None).unwrap();
        f.set_entry(entry);

        let mut program = Program::new();
        let id = program.add_function(f);
        assert_eq!(program.block_at(0x400000), Some((id, BlockId(0))));
        assert_eq!(program.block_at(0x400004), None);
    }
}
