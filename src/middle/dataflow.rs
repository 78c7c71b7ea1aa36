//! The dataflow engine.
//!
//! A forward, intra-procedural abstract interpretation over a function's
//! CFG.  For every term it computes an abstract [Value]; for every
//! read-mode term it computes which write-mode terms reach it, split by
//! sub-range so partial writes are tracked precisely; for dereferences it
//! resolves the accessed [MemoryLocation] when the address is provably a
//! constant or a stack-pointer offset.  As a side product it resolves
//! indirect jumps, including jump tables read from the byte image.
//!
//! The fixpoint is a worklist over basic blocks.  Termination is
//! guaranteed by joining block input states and by the
//! `RememberReachingDefinitions` checkpoints, and guarded by a
//! configurable per-block visit cap: a block that fails to converge is
//! widened to top — its writes stay visible as definitions and keep
//! flowing to its successors, but every state-dependent value it
//! computes becomes unknown and its dereferences are left unresolved.

use log::warn;

use crate::common::cancel::{CancellationToken, Cancelled};
use crate::common::*;
use crate::front::arch::Architecture;
use crate::front::image::Image;
use crate::middle::ir::*;
use crate::middle::patterns;

/// Jump tables longer than this are cut off; real tables end well before.
const MAX_JUMP_TABLE_ENTRIES: u64 = 1024;

/// The integer component of an abstract value.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AbstractInt {
    /// No value flows here (join identity).
    Bottom,
    /// Exactly this value, on all executions.
    Exact(SizedValue),
    /// Any value of the given width.
    Top(BitSize),
}

impl AbstractInt {
    pub fn as_exact(&self) -> Option<SizedValue> {
        match *self {
            AbstractInt::Exact(value) => Some(value),
            _ => None,
        }
    }

    pub fn join(&self, other: &AbstractInt) -> AbstractInt {
        use AbstractInt::*;
        match (*self, *other) {
            (Bottom, x) | (x, Bottom) => x,
            (Exact(a), Exact(b)) if a == b => Exact(a),
            (Exact(a), _) | (Top(_), Exact(a)) => Top(a.size()),
            (Top(size), Top(_)) => Top(size),
        }
    }
}

/// Stack-pointer tracking: is the value provably `entry SP + k` bytes?
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StackOffset {
    Bottom,
    Offset(i64),
    Top,
}

impl StackOffset {
    fn join(&self, other: &StackOffset) -> StackOffset {
        use StackOffset::*;
        match (*self, *other) {
            (Bottom, x) | (x, Bottom) => x,
            (Offset(a), Offset(b)) if a == b => Offset(a),
            _ => Top,
        }
    }
}

/// The abstract value of a term.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Value {
    num: AbstractInt,
    stack_offset: StackOffset,
    is_return_address: bool,
}

impl Value {
    /// The join identity.
    pub fn bottom() -> Value {
        Value {
            num: AbstractInt::Bottom,
            stack_offset: StackOffset::Bottom,
            is_return_address: true,
        }
    }

    pub fn top(size: BitSize) -> Value {
        Value {
            num: AbstractInt::Top(size),
            stack_offset: StackOffset::Top,
            is_return_address: false,
        }
    }

    pub fn exact(value: SizedValue) -> Value {
        Value {
            num: AbstractInt::Exact(value),
            stack_offset: StackOffset::Top,
            is_return_address: false,
        }
    }

    pub fn num(&self) -> &AbstractInt {
        &self.num
    }

    pub fn as_exact(&self) -> Option<SizedValue> {
        self.num.as_exact()
    }

    /// `Some(k)` iff the value is provably entry-SP plus `k` bytes.
    pub fn stack_offset(&self) -> Option<i64> {
        match self.stack_offset {
            StackOffset::Offset(offset) => Some(offset),
            _ => None,
        }
    }

    pub fn is_return_address(&self) -> bool {
        self.is_return_address
    }

    pub fn join(&self, other: &Value) -> Value {
        Value {
            num: self.num.join(&other.num),
            stack_offset: self.stack_offset.join(&other.stack_offset),
            is_return_address: self.is_return_address && other.is_return_address,
        }
    }
}

/// A maximal run of bits with one set of reaching definitions.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Chunk {
    location: MemoryLocation,
    definitions: Vec<TermId>,
}

impl Chunk {
    pub fn location(&self) -> MemoryLocation {
        self.location
    }

    pub fn definitions(&self) -> &[TermId] {
        &self.definitions
    }
}

/// Reaching definitions, either as the running per-program-point state of
/// the engine or as the per-read-term projection stored in [Dataflow].
/// Chunks never overlap and are kept sorted, so equality is structural.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct Definitions {
    chunks: Vec<Chunk>,
}

impl Definitions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    fn insert_chunk(&mut self, chunk: Chunk) {
        let position = self
            .chunks
            .partition_point(|existing| existing.location < chunk.location);
        self.chunks.insert(position, chunk);
    }

    /// Removes the given bit range from all chunks, splitting chunks that
    /// only partially overlap it.
    pub fn kill(&mut self, location: &MemoryLocation) {
        let mut result = Vec::with_capacity(self.chunks.len() + 1);
        for chunk in self.chunks.drain(..) {
            if !chunk.location.overlaps(location) {
                result.push(chunk);
                continue;
            }
            if chunk.location.addr() < location.addr() {
                result.push(Chunk {
                    location: MemoryLocation::new(
                        chunk.location.domain(),
                        chunk.location.addr(),
                        (location.addr() - chunk.location.addr()) as BitSize,
                    ),
                    definitions: chunk.definitions.clone(),
                });
            }
            if chunk.location.end() > location.end() {
                result.push(Chunk {
                    location: MemoryLocation::new(
                        chunk.location.domain(),
                        location.end(),
                        (chunk.location.end() - location.end()) as BitSize,
                    ),
                    definitions: chunk.definitions,
                });
            }
        }
        self.chunks = result;
        self.chunks.sort_by_key(|chunk| chunk.location);
    }

    /// Records `def` as the sole definition of the given bit range,
    /// killing whatever was defined there before.
    pub fn add(&mut self, location: MemoryLocation, def: TermId) {
        self.kill(&location);
        self.insert_chunk(Chunk {
            location,
            definitions: vec![def],
        });
    }

    /// Drops every chunk of the given address space.
    pub fn kill_domain(&mut self, domain: Domain) {
        self.chunks.retain(|chunk| chunk.location.domain() != domain);
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
    }

    /// The definitions visible through the given bit range, clipped to
    /// it.  Every returned chunk is a subrange of `location`.
    pub fn project(&self, location: &MemoryLocation) -> Definitions {
        let mut result = Definitions::new();
        for chunk in &self.chunks {
            if let Some(intersection) = chunk.location.intersected(location) {
                result.insert_chunk(Chunk {
                    location: intersection,
                    definitions: chunk.definitions.clone(),
                });
            }
        }
        result
    }

    /// True iff the chunks cover every bit of `location`.
    pub fn covers(&self, location: &MemoryLocation) -> bool {
        let mut cursor = location.addr();
        for chunk in &self.chunks {
            if chunk.location.domain() != location.domain() || chunk.location.end() <= cursor {
                continue;
            }
            if chunk.location.addr() > cursor {
                return false;
            }
            cursor = chunk.location.end();
            if cursor >= location.end() {
                return true;
            }
        }
        cursor >= location.end()
    }

    /// Joins `other` into `self` (bitwise union of definition sets).
    /// Returns true iff `self` changed.
    pub fn join(&mut self, other: &Definitions) -> bool {
        let merged = Self::union(self, other);
        if merged == *self {
            false
        } else {
            *self = merged;
            true
        }
    }

    fn union(a: &Definitions, b: &Definitions) -> Definitions {
        // Split both chunk lists at every boundary, union the definition
        // sets of the atomic pieces, then coalesce equal neighbours.
        let mut domains: Map<Domain, Vec<&Chunk>> = Map::new();
        for chunk in a.chunks.iter().chain(&b.chunks) {
            domains.entry(chunk.location.domain()).or_default().push(chunk);
        }
        let mut result = Definitions::new();
        for (domain, chunks) in domains {
            let mut bounds: Set<BitAddr> = Set::new();
            for chunk in &chunks {
                bounds.insert(chunk.location.addr());
                bounds.insert(chunk.location.end());
            }
            let bounds: Vec<BitAddr> = bounds.into_iter().collect();
            let mut pending: Option<Chunk> = None;
            for window in bounds.windows(2) {
                let (lo, hi) = (window[0], window[1]);
                let piece = MemoryLocation::new(domain, lo, (hi - lo) as BitSize);
                let mut defs: Set<TermId> = Set::new();
                for chunk in &chunks {
                    if chunk.location.covers(&piece) {
                        defs.extend(chunk.definitions.iter().copied());
                    }
                }
                if defs.is_empty() {
                    if let Some(done) = pending.take() {
                        result.insert_chunk(done);
                    }
                    continue;
                }
                let defs: Vec<TermId> = defs.into_iter().collect();
                match pending {
                    Some(ref mut open)
                        if open.definitions == defs && open.location.end() == lo =>
                    {
                        open.location = open
                            .location
                            .merged(&piece)
                            .expect("pieces of one domain always merge");
                    }
                    _ => {
                        if let Some(done) = pending.take() {
                            result.insert_chunk(done);
                        }
                        pending = Some(Chunk {
                            location: piece,
                            definitions: defs,
                        });
                    }
                }
            }
            if let Some(done) = pending.take() {
                result.insert_chunk(done);
            }
        }
        result
    }
}

/// One resolved entry of a jump table.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct JumpTableEntry {
    /// The index value that selects this entry.
    pub index: u64,
    /// The code address stored in the table.
    pub target: ByteAddr,
    /// The block starting at that address.
    pub block: BlockId,
}

/// A jump table recognized behind an indirect jump.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct JumpTable {
    /// Address of the first table slot.
    pub base: ByteAddr,
    /// Distance between slots, in bytes.
    pub stride: u64,
    /// The term computing the index into the table.
    pub index: TermId,
    pub entries: Vec<JumpTableEntry>,
}

/// Everything the engine learned about one function.  Written by exactly
/// one analysis run, immutable afterwards.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct Dataflow {
    values: Map<TermId, Value>,
    definitions: Map<TermId, Definitions>,
    locations: Map<TermId, MemoryLocation>,
    resolved_targets: Map<StmtId, Vec<BlockId>>,
    jump_tables: Map<StmtId, JumpTable>,
}

impl Dataflow {
    pub fn value(&self, term: TermId) -> Option<&Value> {
        self.values.get(&term)
    }

    /// The exact integer value of a term, if the engine proved one.
    pub fn as_exact(&self, term: TermId) -> Option<SizedValue> {
        self.value(term).and_then(Value::as_exact)
    }

    pub fn definitions(&self, term: TermId) -> Option<&Definitions> {
        self.definitions.get(&term)
    }

    pub fn has_definitions(&self, term: TermId) -> bool {
        self.definitions(term).is_some_and(|defs| !defs.is_empty())
    }

    /// The memory location a term resolved to: the fixed location of an
    /// access, or the computed pointee of a dereference.
    pub fn location(&self, term: TermId) -> Option<MemoryLocation> {
        self.locations.get(&term).copied()
    }

    /// Intra-function targets resolved for indirect jumps.
    pub fn resolved_targets(&self) -> &Map<StmtId, Vec<BlockId>> {
        &self.resolved_targets
    }

    pub fn jump_table(&self, stmt: StmtId) -> Option<&JumpTable> {
        self.jump_tables.get(&stmt)
    }

    /// The single term defining `term`, when there is exactly one chunk
    /// with exactly one definition writing precisely the read location.
    pub fn the_only_definition(&self, term: TermId) -> Option<TermId> {
        let defs = self.definitions(term)?;
        let read_location = self.location(term)?;
        match defs.chunks() {
            [chunk] if chunk.definitions().len() == 1 && chunk.location() == read_location => {
                let def = chunk.definitions()[0];
                (self.location(def) == Some(read_location)).then_some(def)
            }
            _ => None,
        }
    }

    fn set_value(&mut self, term: TermId, value: Value) {
        self.values.insert(term, value);
    }

    fn set_definitions(&mut self, term: TermId, definitions: Definitions) {
        self.definitions.insert(term, definitions);
    }

    fn set_location(&mut self, term: TermId, location: MemoryLocation) {
        self.locations.insert(term, location);
    }

    fn clear_location(&mut self, term: TermId) {
        self.locations.remove(&term);
    }
}

/// True iff the statement is a return: an unconditional jump to the
/// address the function was called from.
pub fn is_return(stmt: StmtId, function: &Function, dataflow: &Dataflow) -> bool {
    function.stmt(stmt).as_jump().is_some_and(|jump| {
        jump.is_unconditional()
            && jump.then_target.address().is_some_and(|address| {
                dataflow.value(address).is_some_and(Value::is_return_address)
            })
    })
}

/// The per-function fixpoint driver.
pub struct DataflowAnalyzer<'a> {
    function: &'a Function,
    func_id: FuncId,
    program: &'a Program,
    arch: &'a Architecture,
    image: Option<&'a Image>,
    token: CancellationToken,
    max_block_visits: u32,
}

impl<'a> DataflowAnalyzer<'a> {
    pub fn new(
        program: &'a Program,
        func_id: FuncId,
        arch: &'a Architecture,
        image: Option<&'a Image>,
        token: CancellationToken,
    ) -> Self {
        Self {
            function: program.function(func_id),
            func_id,
            program,
            arch,
            image,
            token,
            max_block_visits: 100,
        }
    }

    pub fn with_max_block_visits(mut self, max_block_visits: u32) -> Self {
        self.max_block_visits = max_block_visits;
        self
    }

    pub fn analyze(self) -> Result<Dataflow, Cancelled> {
        let mut dataflow = Dataflow::default();
        let Some(entry) = self.function.entry() else {
            return Ok(dataflow);
        };

        let mut in_states: Map<BlockId, Definitions> = Map::new();
        let mut remembered: Map<StmtId, Definitions> = Map::new();
        let mut visits: Map<BlockId, u32> = Map::new();
        let mut worklist: Set<BlockId> = Set::new();
        in_states.insert(entry, Definitions::new());
        worklist.insert(entry);

        while let Some(&block) = worklist.iter().next() {
            worklist.remove(&block);
            self.token.check()?;

            let visit = visits.entry(block).or_insert(0);
            *visit += 1;
            let capped = *visit > self.max_block_visits;
            if *visit == self.max_block_visits + 1 {
                warn!(
                    "{}: dataflow did not converge within {} visits, widening the block to top",
                    format_addr(self.function.block(block).addr()),
                    self.max_block_visits
                );
            }

            let mut state = in_states[&block].clone();
            for &stmt in self.function.block(block).stmts() {
                if capped {
                    self.widen_stmt(stmt, &mut state, &mut dataflow, &mut remembered);
                } else {
                    self.execute_stmt(stmt, &mut state, &mut dataflow, &mut remembered);
                }
            }

            for succ in self.successors(block, &dataflow) {
                let changed = match in_states.get_mut(&succ) {
                    Some(existing) => existing.join(&state),
                    None => {
                        in_states.insert(succ, state.clone());
                        true
                    }
                };
                if changed {
                    worklist.insert(succ);
                }
            }
        }
        Ok(dataflow)
    }

    fn successors(&self, block: BlockId, dataflow: &Dataflow) -> Vec<BlockId> {
        let mut result = self.function.successors(block);
        if let Some(stmt) = self.function.terminator(block) {
            if let Some(resolved) = dataflow.resolved_targets.get(&stmt) {
                for &target in resolved {
                    if !result.contains(&target) {
                        result.push(target);
                    }
                }
            }
        }
        result
    }

    fn execute_stmt(
        &self,
        stmt: StmtId,
        state: &mut Definitions,
        dataflow: &mut Dataflow,
        remembered: &mut Map<StmtId, Definitions>,
    ) {
        match self.function.stmt(stmt).kind.clone() {
            // Unknown machine code may have touched anything.
            StatementKind::InlineAssembly => state.clear(),
            StatementKind::Assignment { left, right } => {
                let value = self.eval_read(right, state, dataflow);
                self.eval_write(left, value, state, dataflow);
            }
            StatementKind::Touch { term, access } => {
                if access.is_read() {
                    self.eval_read(term, state, dataflow);
                }
                if access.is_write() {
                    let size = self.function.term(term).size();
                    self.eval_write(term, Value::top(size), state, dataflow);
                }
            }
            StatementKind::Jump(jump) => {
                if let Some(condition) = jump.condition {
                    self.eval_read(condition, state, dataflow);
                }
                self.resolve_target(stmt, &jump.then_target, state, dataflow);
                if let Some(else_target) = &jump.else_target {
                    self.resolve_target(stmt, else_target, state, dataflow);
                }
            }
            StatementKind::Call { target } => {
                self.eval_read(target, state, dataflow);
            }
            StatementKind::Halt | StatementKind::Callback => {}
            StatementKind::RememberReachingDefinitions => {
                let entry = remembered.entry(stmt).or_default();
                entry.join(state);
                *state = entry.clone();
            }
        }
    }

    /// Conservative replacement for [Self::execute_stmt] once the
    /// owning block hit the visit cap.  Writes are still recorded as
    /// definitions so successors keep receiving state, and reads keep
    /// their definition edges from the accumulated input state, but
    /// every value that depends on program state widens to top.  No
    /// new jump targets are resolved; targets resolved before the cap
    /// stay.
    fn widen_stmt(
        &self,
        stmt: StmtId,
        state: &mut Definitions,
        dataflow: &mut Dataflow,
        remembered: &mut Map<StmtId, Definitions>,
    ) {
        match self.function.stmt(stmt).kind.clone() {
            StatementKind::InlineAssembly => state.clear(),
            StatementKind::Assignment { left, right } => {
                self.widen_read(right, state, dataflow);
                self.widen_write(left, state, dataflow);
            }
            StatementKind::Touch { term, access } => {
                if access.is_read() {
                    self.widen_read(term, state, dataflow);
                }
                if access.is_write() {
                    self.widen_write(term, state, dataflow);
                }
            }
            StatementKind::Jump(jump) => {
                if let Some(condition) = jump.condition {
                    self.widen_read(condition, state, dataflow);
                }
                if let Some(address) = jump.then_target.address() {
                    self.widen_read(address, state, dataflow);
                }
                if let Some(address) = jump.else_target.as_ref().and_then(JumpTarget::address) {
                    self.widen_read(address, state, dataflow);
                }
            }
            StatementKind::Call { target } => {
                self.widen_read(target, state, dataflow);
            }
            StatementKind::Halt | StatementKind::Callback => {}
            StatementKind::RememberReachingDefinitions => {
                let entry = remembered.entry(stmt).or_default();
                entry.join(state);
                *state = entry.clone();
            }
        }
    }

    fn widen_read(&self, term: TermId, state: &mut Definitions, dataflow: &mut Dataflow) {
        let size = self.function.term(term).size();
        let value = match self.function.term(term).kind.clone() {
            // Constants and intrinsics depend on no state; they keep
            // their meaning.
            TermKind::IntConst(constant) => Value::exact(constant),
            TermKind::Intrinsic(kind) => intrinsic_value(kind, size),
            TermKind::Access(location) => {
                dataflow.set_location(term, location);
                dataflow.set_definitions(term, state.project(&location));
                Value::top(size)
            }
            TermKind::Dereference { address } => {
                self.widen_read(address, state, dataflow);
                dataflow.clear_location(term);
                dataflow.set_definitions(term, Definitions::new());
                Value::top(size)
            }
            TermKind::Unary { operand, .. } => {
                self.widen_read(operand, state, dataflow);
                Value::top(size)
            }
            TermKind::Binary { left, right, .. } => {
                self.widen_read(left, state, dataflow);
                self.widen_read(right, state, dataflow);
                Value::top(size)
            }
            TermKind::Choice { preferred, fallback } => {
                self.widen_read(preferred, state, dataflow);
                self.widen_read(fallback, state, dataflow);
                Value::top(size)
            }
        };
        dataflow.set_value(term, value);
    }

    fn widen_write(&self, term: TermId, state: &mut Definitions, dataflow: &mut Dataflow) {
        match self.function.term(term).kind.clone() {
            TermKind::Access(location) => {
                dataflow.set_location(term, location);
                state.add(location, term);
            }
            TermKind::Dereference { address } => {
                self.widen_read(address, state, dataflow);
                // With resolution given up, the store may have hit any
                // memory or stack slot.
                dataflow.clear_location(term);
                state.kill_domain(Domain::MEMORY);
                state.kill_domain(Domain::STACK);
            }
            _ => {}
        }
        let size = self.function.term(term).size();
        dataflow.set_value(term, Value::top(size));
    }

    fn resolve_target(
        &self,
        stmt: StmtId,
        target: &JumpTarget,
        state: &mut Definitions,
        dataflow: &mut Dataflow,
    ) {
        let JumpTarget::Address(address) = *target else {
            return;
        };
        let value = self.eval_read(address, state, dataflow);
        if value.is_return_address() {
            return;
        }
        if let Some(exact) = value.as_exact() {
            if let Some((func, block)) = self.program.block_at(exact.value()) {
                if func == self.func_id {
                    let targets = dataflow.resolved_targets.entry(stmt).or_default();
                    if !targets.contains(&block) {
                        targets.push(block);
                    }
                }
            }
            return;
        }
        self.resolve_jump_table(stmt, address, dataflow);
    }

    fn resolve_jump_table(&self, stmt: StmtId, address: TermId, dataflow: &mut Dataflow) {
        let Some(image) = self.image else {
            return;
        };
        let Some(access) =
            patterns::recognize_array_access(address, self.function, dataflow)
        else {
            return;
        };
        let pointer_size = self.arch.bitness();
        let mut entries = Vec::new();
        for index in 0..MAX_JUMP_TABLE_ENTRIES {
            let slot = access.base.wrapping_add(index.wrapping_mul(access.stride));
            let Some(target) = image.read_pointer(slot, pointer_size) else {
                break;
            };
            match self.program.block_at(target) {
                Some((func, block)) if func == self.func_id => entries.push(JumpTableEntry {
                    index,
                    target,
                    block,
                }),
                _ => break,
            }
        }
        if entries.len() < 2 {
            return;
        }
        let targets = dataflow.resolved_targets.entry(stmt).or_default();
        for entry in &entries {
            if !targets.contains(&entry.block) {
                targets.push(entry.block);
            }
        }
        dataflow.jump_tables.insert(
            stmt,
            JumpTable {
                base: access.base,
                stride: access.stride,
                index: access.index,
                entries,
            },
        );
    }

    fn eval_read(&self, term: TermId, state: &mut Definitions, dataflow: &mut Dataflow) -> Value {
        let size = self.function.term(term).size();
        let value = match self.function.term(term).kind.clone() {
            TermKind::IntConst(constant) => Value::exact(constant),
            TermKind::Intrinsic(kind) => intrinsic_value(kind, size),
            TermKind::Access(location) => {
                dataflow.set_location(term, location);
                self.read_location(term, location, state, dataflow)
            }
            TermKind::Dereference { address } => {
                let address_value = self.eval_read(address, state, dataflow);
                match resolve_address(&address_value, size) {
                    Some(location) => {
                        dataflow.set_location(term, location);
                        self.read_location(term, location, state, dataflow)
                    }
                    None => {
                        dataflow.clear_location(term);
                        dataflow.set_definitions(term, Definitions::new());
                        Value::top(size)
                    }
                }
            }
            TermKind::Unary { op, operand } => {
                let operand_value = self.eval_read(operand, state, dataflow);
                eval_unary(op, &operand_value, size)
            }
            TermKind::Binary { op, left, right } => {
                let left_value = self.eval_read(left, state, dataflow);
                let right_value = self.eval_read(right, state, dataflow);
                eval_binary(op, &left_value, &right_value, size)
            }
            TermKind::Choice { preferred, fallback } => {
                let preferred_value = self.eval_read(preferred, state, dataflow);
                let fallback_value = self.eval_read(fallback, state, dataflow);
                if dataflow.has_definitions(preferred) {
                    preferred_value
                } else {
                    fallback_value
                }
            }
        };
        dataflow.set_value(term, value);
        value
    }

    /// Computes the value observable through `location` and records the
    /// reaching definitions of the read.
    fn read_location(
        &self,
        term: TermId,
        location: MemoryLocation,
        state: &mut Definitions,
        dataflow: &mut Dataflow,
    ) -> Value {
        let defs = state.project(&location);
        // The value is only known when one chunk spans the whole read and
        // every definition wrote exactly this location; partial writes
        // leave the combined bit pattern unknown.
        let value = match defs.chunks() {
            [chunk] if chunk.location() == location => {
                let mut accumulated = Value::bottom();
                for &def in chunk.definitions() {
                    let def_value = if dataflow.location(def) == Some(location) {
                        dataflow
                            .value(def)
                            .copied()
                            .unwrap_or_else(|| Value::top(location.size()))
                    } else {
                        Value::top(location.size())
                    };
                    accumulated = accumulated.join(&def_value);
                }
                accumulated
            }
            _ => Value::top(location.size()),
        };
        dataflow.set_definitions(term, defs);
        value
    }

    fn eval_write(
        &self,
        term: TermId,
        value: Value,
        state: &mut Definitions,
        dataflow: &mut Dataflow,
    ) {
        match self.function.term(term).kind.clone() {
            TermKind::Access(location) => {
                dataflow.set_location(term, location);
                state.add(location, term);
            }
            TermKind::Dereference { address } => {
                let address_value = self.eval_read(address, state, dataflow);
                let size = self.function.term(term).size();
                match resolve_address(&address_value, size) {
                    Some(location) => {
                        dataflow.set_location(term, location);
                        state.add(location, term);
                    }
                    None => {
                        // A store through an unknown pointer may hit any
                        // memory or stack slot.
                        dataflow.clear_location(term);
                        state.kill_domain(Domain::MEMORY);
                        state.kill_domain(Domain::STACK);
                    }
                }
            }
            _ => {
                warn!(
                    "{}: unsupported write target kind, ignoring its effect",
                    format_addr(
                        self.function
                            .term(term)
                            .stmt()
                            .and_then(|stmt| self.function.stmt(stmt).addr())
                    )
                );
            }
        }
        dataflow.set_value(term, value);
    }
}

/// The value of an intrinsic term.  Intrinsics depend on no program
/// state, so the normal and the widened interpreters agree on them.
fn intrinsic_value(kind: IntrinsicKind, size: BitSize) -> Value {
    match kind {
        IntrinsicKind::StackBase => {
            let mut value = Value::top(size);
            value.stack_offset = StackOffset::Offset(0);
            value
        }
        IntrinsicKind::ReturnAddress => {
            let mut value = Value::top(size);
            value.is_return_address = true;
            value
        }
        IntrinsicKind::Undefined => Value::top(size),
    }
}

/// Turns an address value into the memory location it names, if the
/// engine can prove one.
fn resolve_address(value: &Value, size: BitSize) -> Option<MemoryLocation> {
    if let Some(offset) = value.stack_offset() {
        return Some(MemoryLocation::new(Domain::STACK, offset * 8, size));
    }
    if let Some(exact) = value.as_exact() {
        return Some(MemoryLocation::new(
            Domain::MEMORY,
            (exact.value() as BitAddr) * 8,
            size,
        ));
    }
    None
}

fn eval_unary(op: UnaryOp, operand: &Value, size: BitSize) -> Value {
    let num = match operand.as_exact() {
        Some(value) => match op {
            UnaryOp::Not => AbstractInt::Exact(SizedValue::new(size, !value.value())),
            UnaryOp::Negate => {
                AbstractInt::Exact(SizedValue::new(size, value.value().wrapping_neg()))
            }
            UnaryOp::SignExtend => {
                AbstractInt::Exact(SizedValue::new(size, value.signed_value() as u64))
            }
            UnaryOp::ZeroExtend | UnaryOp::Truncate => {
                AbstractInt::Exact(SizedValue::new(size, value.value()))
            }
        },
        None => AbstractInt::Top(size),
    };
    // Width changes keep pointer provenance; arithmetic does not.
    let keeps_provenance = matches!(
        op,
        UnaryOp::SignExtend | UnaryOp::ZeroExtend | UnaryOp::Truncate
    );
    Value {
        num,
        stack_offset: if keeps_provenance {
            operand.stack_offset
        } else {
            StackOffset::Top
        },
        is_return_address: keeps_provenance && operand.is_return_address,
    }
}

fn eval_binary(op: BinaryOp, left: &Value, right: &Value, size: BitSize) -> Value {
    let stack_offset = match op {
        BinaryOp::Add => match (left.stack_offset(), right.stack_offset()) {
            (Some(offset), None) => right
                .as_exact()
                .map(|value| StackOffset::Offset(offset + value.signed_value())),
            (None, Some(offset)) => left
                .as_exact()
                .map(|value| StackOffset::Offset(offset + value.signed_value())),
            _ => None,
        },
        BinaryOp::Sub => match (left.stack_offset(), right.as_exact()) {
            (Some(offset), Some(value)) => Some(StackOffset::Offset(offset - value.signed_value())),
            _ => None,
        },
        _ => None,
    }
    .unwrap_or(StackOffset::Top);

    let num = match (left.as_exact(), right.as_exact()) {
        (Some(a), Some(b)) => fold_binary(op, a, b, size)
            .map(AbstractInt::Exact)
            .unwrap_or(AbstractInt::Top(size)),
        _ => AbstractInt::Top(size),
    };
    Value {
        num,
        stack_offset,
        is_return_address: false,
    }
}

fn fold_binary(op: BinaryOp, a: SizedValue, b: SizedValue, size: BitSize) -> Option<SizedValue> {
    use BinaryOp::*;
    let truth = |flag: bool| SizedValue::new(1, flag as u64);
    let value = match op {
        Add => SizedValue::new(size, a.value().wrapping_add(b.value())),
        Sub => SizedValue::new(size, a.value().wrapping_sub(b.value())),
        Mul => SizedValue::new(size, a.value().wrapping_mul(b.value())),
        SignedDiv => {
            if b.signed_value() == 0 {
                return None;
            }
            SizedValue::new(size, a.signed_value().wrapping_div(b.signed_value()) as u64)
        }
        UnsignedDiv => {
            if b.value() == 0 {
                return None;
            }
            SizedValue::new(size, a.value() / b.value())
        }
        SignedRem => {
            if b.signed_value() == 0 {
                return None;
            }
            SizedValue::new(size, a.signed_value().wrapping_rem(b.signed_value()) as u64)
        }
        UnsignedRem => {
            if b.value() == 0 {
                return None;
            }
            SizedValue::new(size, a.value() % b.value())
        }
        And => SizedValue::new(size, a.value() & b.value()),
        Or => SizedValue::new(size, a.value() | b.value()),
        Xor => SizedValue::new(size, a.value() ^ b.value()),
        Shl => {
            if b.value() >= size as u64 {
                SizedValue::new(size, 0)
            } else {
                SizedValue::new(size, a.value() << b.value())
            }
        }
        Shr => {
            if b.value() >= size as u64 {
                SizedValue::new(size, 0)
            } else {
                SizedValue::new(size, a.value() >> b.value())
            }
        }
        Sar => {
            let shift = b.value().min(size as u64 - 1);
            SizedValue::new(size, (a.signed_value() >> shift) as u64)
        }
        Equal => truth(a.value() == b.value()),
        SignedLess => truth(a.signed_value() < b.signed_value()),
        SignedLessOrEqual => truth(a.signed_value() <= b.signed_value()),
        UnsignedLess => truth(a.value() < b.value()),
        UnsignedLessOrEqual => truth(a.value() <= b.value()),
    };
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middle::tests::{branch, goto, r, test_arch};

    fn loc(domain: u32, addr: BitAddr, size: BitSize) -> MemoryLocation {
        MemoryLocation::new(Domain(domain), addr, size)
    }

    #[test]
    fn a_full_write_kills_previous_definitions() {
        let mut defs = Definitions::new();
        defs.add(loc(1, 0, 32), TermId(1));
        defs.add(loc(1, 0, 32), TermId(2));
        let projected = defs.project(&loc(1, 0, 32));
        assert_eq!(projected.chunks().len(), 1);
        assert_eq!(projected.chunks()[0].definitions(), &[TermId(2)]);
    }

    #[test]
    fn a_partial_write_splits_the_old_chunk() {
        let mut defs = Definitions::new();
        defs.add(loc(0, 0, 32), TermId(1));
        defs.add(loc(0, 8, 8), TermId(2));
        let projected = defs.project(&loc(0, 0, 32));
        let described: Vec<(BitAddr, BitSize, &[TermId])> = projected
            .chunks()
            .iter()
            .map(|chunk| {
                (
                    chunk.location().addr(),
                    chunk.location().size(),
                    chunk.definitions(),
                )
            })
            .collect();
        assert_eq!(
            described,
            vec![
                (0, 8, &[TermId(1)][..]),
                (8, 8, &[TermId(2)][..]),
                (16, 16, &[TermId(1)][..]),
            ]
        );
        assert!(projected.covers(&loc(0, 0, 32)));
    }

    #[test]
    fn join_unions_definition_sets_per_bit() {
        let mut a = Definitions::new();
        a.add(loc(1, 0, 32), TermId(1));
        let mut b = Definitions::new();
        b.add(loc(1, 0, 32), TermId(2));
        assert!(a.join(&b));
        assert_eq!(a.chunks().len(), 1);
        assert_eq!(a.chunks()[0].definitions(), &[TermId(1), TermId(2)]);
        // Joining again changes nothing.
        assert!(!a.join(&b));
    }

    #[test]
    fn join_keeps_disjoint_chunks_apart() {
        let mut a = Definitions::new();
        a.add(loc(1, 0, 16), TermId(1));
        let mut b = Definitions::new();
        b.add(loc(1, 16, 16), TermId(2));
        a.join(&b);
        assert_eq!(a.chunks().len(), 2);
        assert!(a.covers(&loc(1, 0, 32)));
        assert!(!a.covers(&loc(1, 0, 48)));
    }

    #[test]
    fn abstract_ints_join_as_a_flat_lattice() {
        use AbstractInt::*;
        let one = Exact(SizedValue::new(32, 1));
        let two = Exact(SizedValue::new(32, 2));
        assert_eq!(Bottom.join(&one), one);
        assert_eq!(one.join(&one), one);
        assert_eq!(one.join(&two), Top(32));
        assert_eq!(Top(32).join(&one), Top(32));
    }

    #[test]
    fn constant_folding_masks_to_width() {
        let a = SizedValue::new(8, 0xff);
        let b = SizedValue::new(8, 1);
        assert_eq!(
            fold_binary(BinaryOp::Add, a, b, 8),
            Some(SizedValue::new(8, 0))
        );
        assert_eq!(fold_binary(BinaryOp::UnsignedDiv, a, SizedValue::new(8, 0), 8), None);
        assert_eq!(
            fold_binary(BinaryOp::UnsignedLessOrEqual, b, a, 8),
            Some(SizedValue::new(1, 1))
        );
    }

    #[test]
    fn stack_offsets_flow_through_additions() {
        let mut sp = Value::top(32);
        sp.stack_offset = StackOffset::Offset(0);
        let four = Value::exact(SizedValue::new(32, 4));
        let sum = eval_binary(BinaryOp::Add, &sp, &four, 32);
        assert_eq!(sum.stack_offset(), Some(4));
        let diff = eval_binary(BinaryOp::Sub, &sp, &four, 32);
        assert_eq!(diff.stack_offset(), Some(-4));
        let resolved = resolve_address(&sum, 32).unwrap();
        assert_eq!(resolved, loc(Domain::STACK.0, 32, 32));
    }

    #[test]
    fn the_visit_cap_widens_stale_values_and_keeps_definition_edges() {
        // init: r0 = 1; body: r0 = r0 + 1; if (r0 < 10) goto body.
        // One visit cannot settle the loop body: its first pass sees
        // r0 as exactly 1, so a bare cutoff would freeze that value.
        let mut f = Function::new(Some(id("count")), Some(0x1000));
        let init = f.add_block(Some(0x1000));
        let body = f.add_block(Some(0x1010));
        let exit = f.add_block(Some(0x1020));
        f.set_entry(init);

        let one = f.constant(1, 32);
        let start = f.access(r(0));
        f.push_stmt(init, StatementKind::Assignment { left: start, right: one }, None)
            .unwrap();
        goto(&mut f, init, body);

        let read = f.access(r(0));
        let one = f.constant(1, 32);
        let next = f.binary(BinaryOp::Add, read, one).unwrap();
        let step = f.access(r(0));
        f.push_stmt(body, StatementKind::Assignment { left: step, right: next }, None)
            .unwrap();
        let again = f.access(r(0));
        let ten = f.constant(10, 32);
        let cond = f.binary(BinaryOp::UnsignedLess, again, ten).unwrap();
        branch(&mut f, body, cond, body, exit);
        f.push_stmt(exit, StatementKind::Halt, None).unwrap();

        let mut program = Program::new();
        let func = program.add_function(f);
        let arch = test_arch();
        let dataflow =
            DataflowAnalyzer::new(&program, func, &arch, None, CancellationToken::new())
                .with_max_block_visits(1)
                .analyze()
                .unwrap();

        // The capped reads come back widened, not frozen at the first
        // pass's exact values.
        assert_eq!(dataflow.as_exact(read), None);
        assert_eq!(dataflow.as_exact(cond), None);
        // Both the initial store and the loop's own store reach the
        // read at the top of the body.
        let defs: Vec<TermId> = dataflow
            .definitions(read)
            .unwrap()
            .chunks()
            .iter()
            .flat_map(|chunk| chunk.definitions().iter().copied())
            .collect();
        assert!(defs.contains(&start));
        assert!(defs.contains(&step));
    }
}
