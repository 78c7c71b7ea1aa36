//! GraphViz dumps of the CFG, the IR, and the structural analysis
//! results.  One cluster per function, as the interactive tooling
//! expects.

use std::fmt::Write;

use crate::common::*;
use crate::middle::ir::*;
use crate::middle::pipeline::FunctionAnalysis;
use crate::middle::structure::{Node, NodeId, RegionKind};

fn function_title(function: &Function, func: FuncId) -> String {
    match (function.name(), function.addr()) {
        (Some(name), _) => name.to_string(),
        (None, Some(addr)) => format!("sub_{addr:x}"),
        (None, None) => format!("{func}"),
    }
}

fn escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

/// The control-flow graph of every function.
pub fn cfg_to_dot(program: &Program) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "digraph Cfg {{ compound=true;");
    for func in program.functions_by_addr() {
        let function = program.function(func);
        let _ = writeln!(out, "  subgraph cluster_{func} {{");
        let _ = writeln!(out, "    label=\"{}\";", escape(&function_title(function, func)));
        for block in function.block_ids() {
            let label = match function.block(block).addr() {
                Some(addr) => format!("{block} @ 0x{addr:x}"),
                None => format!("{block}"),
            };
            let _ = writeln!(out, "    {func}_{block} [label=\"{}\"];", escape(&label));
        }
        for block in function.block_ids() {
            for succ in function.successors(block) {
                let _ = writeln!(out, "    {func}_{block} -> {func}_{succ};");
            }
        }
        let _ = writeln!(out, "  }}");
    }
    let _ = writeln!(out, "}}");
    out
}

/// The IR: blocks with their statements, and the flow between them.
pub fn ir_to_dot(program: &Program) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "digraph Ir {{ compound=true; node [shape=box];");
    for func in program.functions_by_addr() {
        let function = program.function(func);
        let _ = writeln!(out, "  subgraph cluster_{func} {{");
        let _ = writeln!(out, "    label=\"{}\";", escape(&function_title(function, func)));
        for block in function.block_ids() {
            let mut label = match function.block(block).addr() {
                Some(addr) => format!("{block} @ 0x{addr:x}\\l"),
                None => format!("{block}\\l"),
            };
            for &stmt in function.block(block).stmts() {
                label.push_str(&escape(&function.stmt_to_string(stmt)));
                label.push_str("\\l");
            }
            let _ = writeln!(out, "    {func}_{block} [label=\"{label}\"];");
        }
        for block in function.block_ids() {
            for succ in function.successors(block) {
                let _ = writeln!(out, "    {func}_{block} -> {func}_{succ};");
            }
        }
        let _ = writeln!(out, "  }}");
    }
    let _ = writeln!(out, "}}");
    out
}

/// The region trees produced by structural analysis.
pub fn regions_to_dot(program: &Program, analyses: &Map<FuncId, FunctionAnalysis>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "digraph Regions {{ compound=true;");
    for func in program.functions_by_addr() {
        let Some(analysis) = analyses.get(&func) else {
            continue;
        };
        let function = program.function(func);
        let _ = writeln!(out, "  subgraph cluster_{func} {{");
        let _ = writeln!(out, "    label=\"{}\";", escape(&function_title(function, func)));
        let mut stack = vec![analysis.regions.root()];
        let mut seen: Set<NodeId> = Set::new();
        while let Some(node) = stack.pop() {
            if !seen.insert(node) {
                continue;
            }
            match analysis.regions.node(node) {
                Node::Basic(block) => {
                    let _ = writeln!(out, "    {func}_{node} [label=\"{block}\" shape=box];");
                }
                Node::Region(region) => {
                    let kind = match &region.kind {
                        RegionKind::Block { .. } => "block",
                        RegionKind::IfThen { .. } => "if-then",
                        RegionKind::IfThenElse { .. } => "if-then-else",
                        RegionKind::While { .. } => "while",
                        RegionKind::DoWhile { .. } => "do-while",
                        RegionKind::CompoundCondition { .. } => "compound-condition",
                        RegionKind::NaturalLoop { .. } => "natural-loop",
                        RegionKind::Switch { .. } => "switch",
                    };
                    let _ = writeln!(out, "    {func}_{node} [label=\"{kind}\"];");
                    for child in region.children() {
                        let _ = writeln!(out, "    {func}_{node} -> {func}_{child};");
                        stack.push(child);
                    }
                }
            }
        }
        let _ = writeln!(out, "  }}");
    }
    let _ = writeln!(out, "}}");
    out
}
