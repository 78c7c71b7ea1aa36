//! The C-like pretty-printer.
//!
//! Walks the region tree of every analyzed function.  At each basic-block
//! leaf it keeps only the statements whose written term is live, renames
//! term accesses to their reconstructed variables, and hides everything
//! the calling-convention hooks synthesized — parameters and return
//! values surface through the signature instead.  Structured regions
//! render as `if`/`while`/`do`/`switch`; natural loops and whatever else
//! resisted structuring fall back to labelled blocks and gotos.
//!
//! Emission runs twice per function: the first pass discovers which
//! blocks are goto targets, the second prints their labels.

use std::fmt::Write;

use crate::common::*;
use crate::front::arch::Architecture;
use crate::middle::dataflow;
use crate::middle::ir::*;
use crate::middle::pipeline::FunctionAnalysis;
use crate::middle::structure::{Node, NodeId, RegionKind};

pub struct CodeGenerator<'a> {
    program: &'a Program,
    arch: &'a Architecture,
}

impl<'a> CodeGenerator<'a> {
    pub fn new(program: &'a Program, arch: &'a Architecture) -> Self {
        Self { program, arch }
    }

    /// Emits the whole program, functions in entry-address order.
    pub fn emit_program(&self, analyses: &Map<FuncId, FunctionAnalysis>) -> String {
        let mut out = String::new();

        // Global variables, deduplicated across functions.
        let mut globals: Map<String, BitSize> = Map::new();
        for analysis in analyses.values() {
            for variable in analysis.variables.list() {
                if variable.is_global() {
                    globals.insert(
                        global_name(variable.location()),
                        c_int_size(variable.location().size()),
                    );
                }
            }
        }
        for (name, size) in &globals {
            let _ = writeln!(out, "uint{size}_t {name};");
        }
        if !globals.is_empty() {
            out.push('\n');
        }

        for func in self.program.functions_by_addr() {
            if let Some(analysis) = analyses.get(&func) {
                out.push_str(&self.emit_function(func, analysis));
                out.push('\n');
            }
        }
        out
    }

    /// Emits one function.
    pub fn emit_function(&self, func: FuncId, analysis: &'a FunctionAnalysis) -> String {
        let function = self.program.function(func);
        let mut emitter = FunctionEmitter {
            program: self.program,
            arch: self.arch,
            function,
            analysis,
            names: Map::new(),
            params: Set::new(),
            suppressed: Set::new(),
            next_leaf: Map::new(),
            labels: Set::new(),
            print_labels: false,
            out: String::new(),
            indent: 1,
        };
        emitter.prepare();
        emitter.emit()
    }
}

struct FunctionEmitter<'a> {
    program: &'a Program,
    arch: &'a Architecture,
    function: &'a Function,
    analysis: &'a FunctionAnalysis,
    /// Variable index -> C name.
    names: Map<usize, String>,
    /// Variable indices that are parameters.
    params: Set<usize>,
    /// Jumps the surrounding structure renders itself.
    suppressed: Set<StmtId>,
    /// Leaf -> the leaf emitted right after it (fallthrough).
    next_leaf: Map<BlockId, BlockId>,
    /// Blocks that turned out to be goto targets.
    labels: Set<BlockId>,
    print_labels: bool,
    out: String,
    indent: usize,
}

fn global_name(location: MemoryLocation) -> String {
    format!("g_{:x}", location.addr() / 8)
}

/// The narrowest C integer width holding `bits`.
fn c_int_size(bits: BitSize) -> BitSize {
    match bits {
        0..=8 => 8,
        9..=16 => 16,
        17..=32 => 32,
        _ => 64,
    }
}

fn c_op(op: BinaryOp) -> &'static str {
    use BinaryOp::*;
    match op {
        Add => "+",
        Sub => "-",
        Mul => "*",
        SignedDiv | UnsignedDiv => "/",
        SignedRem | UnsignedRem => "%",
        And => "&",
        Or => "|",
        Xor => "^",
        Shl => "<<",
        Shr | Sar => ">>",
        Equal => "==",
        SignedLess | UnsignedLess => "<",
        SignedLessOrEqual | UnsignedLessOrEqual => "<=",
    }
}

impl FunctionEmitter<'_> {
    fn prepare(&mut self) {
        // Parameters keep their passing order in their names.
        for (position, slot) in self.analysis.signature.arguments.iter().enumerate() {
            let term = self
                .analysis
                .hooks
                .entry
                .as_ref()
                .and_then(|hook| hook.argument_term(slot));
            if let Some(index) = term.and_then(|term| self.analysis.variables.index_of(term)) {
                self.names.insert(index, format!("a{}", position + 1));
                self.params.insert(index);
            }
        }
        let mut counter = 0;
        for (index, variable) in self.analysis.variables.list().iter().enumerate() {
            if self.names.contains_key(&index) {
                continue;
            }
            if variable.is_global() {
                self.names.insert(index, global_name(variable.location()));
            } else {
                counter += 1;
                self.names.insert(index, format!("v{counter}"));
            }
        }

        // Jumps whose meaning the region kinds carry: branch tests, and
        // the trailing goto of each structured branch (the structure
        // already says where control goes).
        let root = self.analysis.regions.root();
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            if let Node::Region(region) = self.analysis.regions.node(node) {
                match &region.kind {
                    RegionKind::IfThen { jump, then, .. } => {
                        self.suppressed.insert(*jump);
                        self.suppress_tail(*then);
                    }
                    RegionKind::IfThenElse {
                        jump, then, else_, ..
                    } => {
                        self.suppressed.insert(*jump);
                        self.suppress_tail(*then);
                        self.suppress_tail(*else_);
                    }
                    RegionKind::While { jump, body, .. } => {
                        self.suppressed.insert(*jump);
                        self.suppress_tail(*body);
                    }
                    RegionKind::DoWhile { jump, .. } => {
                        self.suppressed.insert(*jump);
                    }
                    RegionKind::Switch {
                        jump,
                        bounds_jump,
                        cases,
                        default,
                        ..
                    } => {
                        self.suppressed.insert(*jump);
                        self.suppressed.extend(bounds_jump);
                        for case in cases {
                            self.suppress_tail(case.body);
                        }
                        if let Some(default) = default {
                            self.suppress_tail(*default);
                        }
                    }
                    RegionKind::CompoundCondition { first, second, .. } => {
                        for child in [*first, *second] {
                            if let Some(stmt) = self.branch_stmt_of(child) {
                                self.suppressed.insert(stmt);
                            }
                        }
                    }
                    RegionKind::Block { .. } | RegionKind::NaturalLoop { .. } => {}
                }
                stack.extend(region.children());
            }
        }

        let leaves = self.analysis.regions.leaves();
        for window in leaves.windows(2) {
            self.next_leaf.insert(window[0], window[1]);
        }
    }

    fn emit(&mut self) -> String {
        // First pass discovers labels, second pass prints them.
        self.emit_body();
        self.out.clear();
        self.print_labels = true;
        self.emit_body();
        let body = std::mem::take(&mut self.out);

        let mut out = String::new();
        let name = match self.function.name() {
            Some(name) => name.to_string(),
            None => match self.function.addr() {
                Some(addr) => format!("sub_{addr:x}"),
                None => "sub_unknown".to_owned(),
            },
        };
        let return_type = match self.analysis.signature.return_value {
            Some(slot) => format!("uint{}_t", c_int_size(slot.size())),
            None => "void".to_owned(),
        };
        let params: Vec<String> = self
            .analysis
            .signature
            .arguments
            .iter()
            .enumerate()
            .map(|(position, slot)| {
                format!("uint{}_t a{}", c_int_size(slot.size()), position + 1)
            })
            .collect();
        let params = if params.is_empty() {
            "void".to_owned()
        } else {
            params.join(", ")
        };
        let _ = writeln!(out, "{return_type} {name}({params}) {{");
        for (index, variable) in self.analysis.variables.list().iter().enumerate() {
            if variable.is_global() || self.params.contains(&index) {
                continue;
            }
            let _ = writeln!(
                out,
                "    uint{}_t {};",
                c_int_size(variable.location().size()),
                self.names[&index]
            );
        }
        out.push_str(&body);
        out.push_str("}\n");
        out
    }

    fn line(&mut self, text: &str) {
        for _ in 0..self.indent {
            self.out.push_str("    ");
        }
        self.out.push_str(text);
        self.out.push('\n');
    }

    fn emit_body(&mut self) {
        self.emit_node(self.analysis.regions.root());
    }

    fn emit_node(&mut self, node: NodeId) {
        match self.analysis.regions.node(node) {
            Node::Basic(block) => self.emit_block(*block),
            Node::Region(region) => match region.kind.clone() {
                RegionKind::Block { children } => {
                    for child in children {
                        self.emit_node(child);
                    }
                }
                RegionKind::IfThen {
                    negated,
                    condition,
                    then,
                    ..
                } => {
                    self.emit_node(condition);
                    let condition_text = self.render_node_condition(condition, negated);
                    self.line(&format!("if ({condition_text}) {{"));
                    self.indent += 1;
                    self.emit_node(then);
                    self.indent -= 1;
                    self.line("}");
                }
                RegionKind::IfThenElse {
                    condition,
                    then,
                    else_,
                    ..
                } => {
                    self.emit_node(condition);
                    let condition_text = self.render_node_condition(condition, false);
                    self.line(&format!("if ({condition_text}) {{"));
                    self.indent += 1;
                    self.emit_node(then);
                    self.indent -= 1;
                    self.line("} else {");
                    self.indent += 1;
                    self.emit_node(else_);
                    self.indent -= 1;
                    self.line("}");
                }
                RegionKind::While {
                    negated,
                    condition,
                    body,
                    ..
                } => {
                    if self.node_has_output(condition) {
                        // The test needs computation; hoist it into the
                        // loop and break on the exit edge.
                        self.line("for (;;) {");
                        self.indent += 1;
                        self.emit_node(condition);
                        let exit = self.render_node_condition(condition, !negated);
                        self.line(&format!("if ({exit}) break;"));
                        self.emit_node(body);
                        self.indent -= 1;
                        self.line("}");
                    } else {
                        let condition_text = self.render_node_condition(condition, negated);
                        self.line(&format!("while ({condition_text}) {{"));
                        self.indent += 1;
                        self.emit_node(body);
                        self.indent -= 1;
                        self.line("}");
                    }
                }
                RegionKind::DoWhile { negated, body, .. } => {
                    self.line("do {");
                    self.indent += 1;
                    self.emit_node(body);
                    self.indent -= 1;
                    let condition_text = self.render_node_condition(body, negated);
                    self.line(&format!("}} while ({condition_text});"));
                }
                RegionKind::CompoundCondition { first, second, .. } => {
                    self.emit_node(first);
                    self.emit_node(second);
                }
                RegionKind::NaturalLoop { members } => {
                    for member in members {
                        self.emit_node(member);
                    }
                }
                RegionKind::Switch {
                    index,
                    bounds_check,
                    dispatch,
                    cases,
                    default,
                    ..
                } => {
                    if let Some(bounds) = bounds_check {
                        self.emit_node(bounds);
                    }
                    self.emit_node(dispatch);
                    let index_text = self.render_term(index);
                    self.line(&format!("switch ({index_text}) {{"));
                    for case in &cases {
                        for value in &case.values {
                            self.line(&format!("case {value}:"));
                        }
                        self.indent += 1;
                        self.emit_node(case.body);
                        self.line("break;");
                        self.indent -= 1;
                    }
                    if let Some(default) = default {
                        self.line("default:");
                        self.indent += 1;
                        self.emit_node(default);
                        self.line("break;");
                        self.indent -= 1;
                    }
                    self.line("}");
                }
            },
        }
    }

    fn emit_block(&mut self, block: BlockId) {
        if self.print_labels && self.labels.contains(&block) {
            let label = self.label_of(block);
            let _ = writeln!(self.out, "{label}: ;");
        }
        for &stmt in self.function.block(block).stmts() {
            if self.analysis.hooks.is_hook_stmt(stmt) {
                continue;
            }
            match &self.function.stmt(stmt).kind {
                StatementKind::Assignment { left, right } => {
                    if self.analysis.liveness.is_live(*left) {
                        let text =
                            format!("{} = {};", self.render_term(*left), self.render_term(*right));
                        self.line(&text);
                    }
                }
                StatementKind::Call { target } => {
                    let text = format!("{}();", self.render_call_target(*target));
                    self.line(&text);
                }
                StatementKind::Halt => self.line("abort();"),
                StatementKind::InlineAssembly => self.line("__asm__ volatile (\"\");"),
                StatementKind::Jump(_) => self.emit_jump(block, stmt),
                StatementKind::Touch { .. }
                | StatementKind::Callback
                | StatementKind::RememberReachingDefinitions => {}
            }
        }
    }

    /// Suppresses the unconditional jump a structured branch ends with.
    /// Returns stay: they render as `return`, not as control flow.
    fn suppress_tail(&mut self, node: NodeId) {
        let Some(stmt) = self.branch_stmt_of(node) else {
            return;
        };
        let Some(jump) = self.function.stmt(stmt).as_jump() else {
            return;
        };
        if jump.is_unconditional() {
            self.suppressed.insert(stmt);
        }
    }

    fn emit_jump(&mut self, block: BlockId, stmt: StmtId) {
        if dataflow::is_return(stmt, self.function, &self.analysis.dataflow) {
            let value = self
                .analysis
                .signature
                .return_value
                .and_then(|slot| {
                    self.analysis
                        .hooks
                        .returns
                        .get(&stmt)
                        .and_then(|hook| hook.return_term(&slot))
                })
                .filter(|&term| self.analysis.liveness.is_live(term));
            match value {
                Some(term) => {
                    let text = format!("return {};", self.render_term(term));
                    self.line(&text);
                }
                None => self.line("return;"),
            }
            return;
        }
        if self.suppressed.contains(&stmt) {
            return;
        }
        let jump = self
            .function
            .stmt(stmt)
            .as_jump()
            .expect("emit_jump runs on jumps")
            .clone();
        match (&jump.condition, &jump.else_target) {
            (None, _) => self.emit_goto(block, &jump.then_target, None),
            (Some(condition), Some(else_target)) => {
                let condition_text = self.render_term(*condition);
                self.emit_goto(block, &jump.then_target, Some(condition_text));
                self.emit_goto(block, else_target, None);
            }
            _ => {}
        }
    }

    fn emit_goto(&mut self, block: BlockId, target: &JumpTarget, condition: Option<String>) {
        match target {
            JumpTarget::Block(target) => {
                if condition.is_none() && self.next_leaf.get(&block) == Some(target) {
                    return;
                }
                self.labels.insert(*target);
                let label = self.label_of(*target);
                match condition {
                    Some(condition) => self.line(&format!("if ({condition}) goto {label};")),
                    None => self.line(&format!("goto {label};")),
                }
            }
            JumpTarget::Address(term) => {
                let text = self.render_term(*term);
                match condition {
                    Some(condition) => {
                        self.line(&format!("if ({condition}) goto *(void *)({text});"))
                    }
                    None => self.line(&format!("goto *(void *)({text});")),
                }
            }
        }
    }

    fn label_of(&self, block: BlockId) -> String {
        match self.function.block(block).addr() {
            Some(addr) => format!("l_{addr:x}"),
            None => format!("l_{block}"),
        }
    }

    /// Whether the node would print any statement, which decides between
    /// `while (c)` and the hoisted `for (;;)` rendition.
    fn node_has_output(&self, node: NodeId) -> bool {
        self.analysis.regions.leaves_of(node).iter().any(|&block| {
            self.function.block(block).stmts().iter().any(|&stmt| {
                if self.analysis.hooks.is_hook_stmt(stmt) {
                    return false;
                }
                match &self.function.stmt(stmt).kind {
                    StatementKind::Assignment { left, .. } => self.analysis.liveness.is_live(*left),
                    StatementKind::Call { .. }
                    | StatementKind::Halt
                    | StatementKind::InlineAssembly => true,
                    _ => false,
                }
            })
        })
    }

    /// Descends through sequences to the node actually holding the
    /// branch a loop or conditional tests.
    fn condition_source(&self, node: NodeId) -> NodeId {
        if let Node::Region(region) = self.analysis.regions.node(node) {
            if let RegionKind::Block { children } = &region.kind {
                if let Some(&last) = children.last() {
                    return self.condition_source(last);
                }
            }
        }
        node
    }

    /// The jump statement a condition node exits through, if it is a
    /// plain one (compound conditions render recursively instead).
    fn branch_stmt_of(&self, node: NodeId) -> Option<StmtId> {
        match self.analysis.regions.node(node) {
            Node::Basic(block) => self.function.terminator(*block),
            Node::Region(region) => match &region.kind {
                RegionKind::Block { children } => {
                    children.last().and_then(|&last| self.branch_stmt_of(last))
                }
                _ => None,
            },
        }
    }

    /// Renders the condition a node branches on, recursing through
    /// short-circuited halves.
    fn render_node_condition(&self, node: NodeId, negated: bool) -> String {
        let node = self.condition_source(node);
        if let Node::Region(region) = self.analysis.regions.node(node) {
            if let RegionKind::CompoundCondition {
                first,
                second,
                op,
                first_negated,
            } = &region.kind
            {
                let first_text = self.render_node_condition(*first, *first_negated);
                let second_text = self.render_node_condition(*second, false);
                let text = format!("({first_text} {op} {second_text})");
                return if negated { format!("!{text}") } else { text };
            }
        }
        let condition = self
            .branch_stmt_of(node)
            .and_then(|stmt| self.function.stmt(stmt).as_jump())
            .and_then(|jump| jump.condition);
        match condition {
            Some(term) => {
                let text = self.render_term(term);
                if negated {
                    format!("!{text}")
                } else {
                    text
                }
            }
            None => "1".to_owned(),
        }
    }

    fn render_call_target(&self, term: TermId) -> String {
        if let Some(addr) = self.analysis.dataflow.as_exact(term) {
            let addr = addr.value();
            for func in self.program.func_ids() {
                let callee = self.program.function(func);
                if callee.addr() == Some(addr) {
                    return match callee.name() {
                        Some(name) => name.to_string(),
                        None => format!("sub_{addr:x}"),
                    };
                }
            }
            return format!("sub_{addr:x}");
        }
        format!("(*(void (*)(void))({}))", self.render_term(term))
    }

    fn render_term(&self, term: TermId) -> String {
        if let Some(index) = self.analysis.variables.index_of(term) {
            return self.names[&index].clone();
        }
        let size = self.function.term(term).size();
        match &self.function.term(term).kind {
            TermKind::IntConst(value) => format!("{}", value.signed_value()),
            TermKind::Intrinsic(kind) => match kind {
                IntrinsicKind::Undefined => "__undefined()".to_owned(),
                IntrinsicKind::StackBase => "__stack_base".to_owned(),
                IntrinsicKind::ReturnAddress => "__return_address".to_owned(),
            },
            TermKind::Access(location) => match self.arch.register_covering(location) {
                Some(register) => register.name.to_string(),
                None => format!("loc_{}_{}", location.domain().0, location.addr()),
            },
            TermKind::Dereference { address } => format!(
                "*(uint{}_t *)({})",
                c_int_size(size),
                self.render_term(*address)
            ),
            TermKind::Unary { op, operand } => match op {
                UnaryOp::Not => format!("!{}", self.render_term(*operand)),
                UnaryOp::Negate => format!("-{}", self.render_term(*operand)),
                UnaryOp::SignExtend => format!(
                    "(int{}_t){}",
                    c_int_size(size),
                    self.render_term(*operand)
                ),
                UnaryOp::ZeroExtend | UnaryOp::Truncate => format!(
                    "(uint{}_t){}",
                    c_int_size(size),
                    self.render_term(*operand)
                ),
            },
            TermKind::Binary { op, left, right } => format!(
                "({} {} {})",
                self.render_term(*left),
                c_op(*op),
                self.render_term(*right)
            ),
            TermKind::Choice { preferred, fallback } => {
                if self.analysis.dataflow.has_definitions(*preferred) {
                    self.render_term(*preferred)
                } else {
                    self.render_term(*fallback)
                }
            }
        }
    }
}
