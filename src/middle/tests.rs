//! End-to-end tests of the analysis pipeline over hand-lifted functions.
//!
//! The fixtures use a small register-argument architecture (arguments in
//! r0..r3, result in r0, return address in lr) so the IR stays short; the
//! pipeline itself never knows the difference.

use crate::common::cancel::CancellationToken;
use crate::common::*;
use crate::front::arch::{Architecture, Convention, RegisterDesc};
use crate::front::image::{BufferByteSource, ByteOrder, Image, Section, SectionFlags};
use crate::middle::cconv::Signatures;
use crate::middle::dataflow::DataflowAnalyzer;
use crate::middle::inline;
use crate::middle::ir::*;
use crate::middle::patterns;
use crate::middle::pipeline::{AnalysisError, Driver, FunctionAnalysis};
use crate::middle::structure::{Node, RegionGraph, RegionKind, ShortCircuitOp};

pub(crate) fn r(n: u32) -> MemoryLocation {
    MemoryLocation::new(Domain(Domain::FIRST_REGISTER.0 + n), 0, 32)
}

fn lr() -> MemoryLocation {
    r(14)
}

pub(crate) fn test_arch() -> Architecture {
    let mut registers: Vec<RegisterDesc> = (0..8)
        .map(|n| RegisterDesc {
            name: id(format!("r{n}")),
            location: r(n),
        })
        .collect();
    registers.push(RegisterDesc {
        name: id("sp"),
        location: r(13),
    });
    registers.push(RegisterDesc {
        name: id("lr"),
        location: lr(),
    });
    Architecture::new(
        id("test32"),
        32,
        ByteOrder::Little,
        4,
        registers,
        r(13),
        Convention {
            arguments: vec![r(0), r(1), r(2), r(3)],
            return_value: Some(r(0)),
            return_address: lr(),
        },
    )
}

pub(crate) fn set(f: &mut Function, block: BlockId, location: MemoryLocation, value: TermId) {
    let target = f.access(location);
    f.push_stmt(
        block,
        StatementKind::Assignment {
            left: target,
            right: value,
        },
        None,
    )
    .unwrap();
}

pub(crate) fn goto(f: &mut Function, block: BlockId, target: BlockId) {
    f.push_stmt(
        block,
        StatementKind::Jump(Jump {
            condition: None,
            then_target: JumpTarget::Block(target),
            else_target: None,
        }),
        None,
    )
    .unwrap();
}

pub(crate) fn branch(
    f: &mut Function,
    block: BlockId,
    condition: TermId,
    then_block: BlockId,
    else_block: BlockId,
) -> StmtId {
    f.push_stmt(
        block,
        StatementKind::Jump(Jump {
            condition: Some(condition),
            then_target: JumpTarget::Block(then_block),
            else_target: Some(JumpTarget::Block(else_block)),
        }),
        None,
    )
    .unwrap()
}

pub(crate) fn ret(f: &mut Function, block: BlockId) {
    let address = f.access(lr());
    f.push_stmt(
        block,
        StatementKind::Jump(Jump {
            condition: None,
            then_target: JumpTarget::Address(address),
            else_target: None,
        }),
        None,
    )
    .unwrap();
}

pub(crate) fn analyze(
    program: &mut Program,
    func: FuncId,
    image: Option<&Image>,
) -> FunctionAnalysis {
    let arch = test_arch();
    let mut signatures = Signatures::new();
    Driver::new(&arch, image)
        .analyze_function(program, func, &mut signatures)
        .unwrap()
}

/// `gcd(a, b)` by Euclidean remainder: a while loop testing `b != 0`.
pub(crate) fn build_gcd() -> (Program, FuncId) {
    let mut f = Function::new(Some(id("gcd")), Some(0x1000));
    let head = f.add_block(Some(0x1000));
    let body = f.add_block(Some(0x1010));
    let exit = f.add_block(Some(0x1020));
    f.set_entry(head);

    // head: if (r1 == 0) goto exit else goto body
    let b = f.access(r(1));
    let zero = f.constant(0, 32);
    let cond = f.binary(BinaryOp::Equal, b, zero).unwrap();
    branch(&mut f, head, cond, exit, body);

    // body: r2 = r0 % r1; r0 = r1; r1 = r2
    let a = f.access(r(0));
    let b = f.access(r(1));
    let rem = f.binary(BinaryOp::UnsignedRem, a, b).unwrap();
    set(&mut f, body, r(2), rem);
    let b = f.access(r(1));
    set(&mut f, body, r(0), b);
    let t = f.access(r(2));
    set(&mut f, body, r(1), t);
    goto(&mut f, body, head);

    ret(&mut f, exit);

    let mut program = Program::new();
    let func = program.add_function(f);
    (program, func)
}

fn find_region<'a>(
    regions: &'a RegionGraph,
    mut matcher: impl FnMut(&RegionKind) -> bool,
) -> Option<&'a RegionKind> {
    let mut stack = vec![regions.root()];
    let mut seen = Set::new();
    while let Some(node) = stack.pop() {
        if !seen.insert(node) {
            continue;
        }
        if let Node::Region(region) = regions.node(node) {
            if matcher(&region.kind) {
                return Some(&region.kind);
            }
            stack.extend(region.children());
        }
    }
    None
}

#[test]
fn gcd_becomes_a_while_loop_with_two_arguments() {
    let (mut program, func) = build_gcd();
    let analysis = analyze(&mut program, func, None);

    let while_kind = find_region(&analysis.regions, |kind| {
        matches!(kind, RegionKind::While { .. })
    })
    .expect("the remainder loop reduces to a while region");
    let RegionKind::While {
        negated, condition, ..
    } = while_kind
    else {
        unreachable!();
    };
    // The branch exits on `b == 0`, so the loop condition is negated.
    assert!(*negated);
    assert_eq!(
        analysis.regions.leaves_of(*condition),
        vec![program.function(func).entry().unwrap()]
    );

    assert_eq!(analysis.signature.arguments, vec![r(0), r(1)]);
    assert_eq!(analysis.signature.return_value, Some(r(0)));

    let locations: Set<MemoryLocation> = analysis
        .variables
        .list()
        .iter()
        .map(|variable| variable.location())
        .collect();
    assert!(locations.contains(&r(0)));
    assert!(locations.contains(&r(1)));
}

#[test]
fn the_pipeline_is_deterministic() {
    let (mut first_program, first_func) = build_gcd();
    let (mut second_program, second_func) = build_gcd();
    let first = analyze(&mut first_program, first_func, None);
    let second = analyze(&mut second_program, second_func, None);
    assert_eq!(first.dataflow, second.dataflow);
    assert_eq!(first.liveness, second.liveness);
    assert_eq!(first.variables, second.variables);
    assert_eq!(first.regions, second.regions);
    assert_eq!(first.signature, second.signature);
}

#[test]
fn every_definition_of_a_live_read_is_live() {
    let (mut program, func) = build_gcd();
    let analysis = analyze(&mut program, func, None);
    let function = program.function(func);
    for term in analysis.liveness.iter() {
        if !function.term(term).is_read() {
            continue;
        }
        let Some(definitions) = analysis.dataflow.definitions(term) else {
            continue;
        };
        for chunk in definitions.chunks() {
            for &definition in chunk.definitions() {
                assert!(
                    analysis.liveness.is_live(definition),
                    "definition {definition} of live read {term} must be live"
                );
            }
        }
    }
}

#[test]
fn region_leaves_partition_the_reachable_blocks() {
    let (mut program, func) = build_gcd();
    let analysis = analyze(&mut program, func, None);
    let leaves = analysis.regions.leaves();
    let unique: Set<BlockId> = leaves.iter().copied().collect();
    assert_eq!(leaves.len(), unique.len(), "no block is emitted twice");
    let all: Set<BlockId> = program.function(func).block_ids().collect();
    assert_eq!(unique, all);
}

#[test]
fn variable_members_stay_inside_the_variable_location() {
    let (mut program, func) = build_gcd();
    let analysis = analyze(&mut program, func, None);
    for variable in analysis.variables.list() {
        for &term in variable.terms() {
            let location = analysis.dataflow.location(term).unwrap();
            assert!(variable.location().covers(&location));
        }
    }
}

#[test]
fn compound_conditions_become_nested_short_circuits() {
    // if ((a && b) || (c && d)) g() else h()
    let mut f = Function::new(Some(id("pick")), Some(0x2000));
    let c1 = f.add_block(Some(0x2000));
    let c2 = f.add_block(Some(0x2010));
    let c3 = f.add_block(Some(0x2020));
    let c4 = f.add_block(Some(0x2030));
    let then_block = f.add_block(Some(0x2040));
    let else_block = f.add_block(Some(0x2050));
    let exit = f.add_block(Some(0x2060));
    f.set_entry(c1);

    let mut truthy = |f: &mut Function, n: u32| {
        let value = f.access(r(n));
        let zero = f.constant(0, 32);
        f.binary(BinaryOp::UnsignedLess, zero, value).unwrap()
    };
    let t1 = truthy(&mut f, 0);
    branch(&mut f, c1, t1, c2, c3);
    let t2 = truthy(&mut f, 1);
    branch(&mut f, c2, t2, then_block, c3);
    let t3 = truthy(&mut f, 2);
    branch(&mut f, c3, t3, c4, else_block);
    let t4 = truthy(&mut f, 3);
    branch(&mut f, c4, t4, then_block, else_block);

    let g = f.constant(0x5000, 32);
    f.push_stmt(then_block, StatementKind::Call { target: g }, None)
        .unwrap();
    goto(&mut f, then_block, exit);
    let h = f.constant(0x6000, 32);
    f.push_stmt(else_block, StatementKind::Call { target: h }, None)
        .unwrap();
    goto(&mut f, else_block, exit);
    ret(&mut f, exit);

    let mut program = Program::new();
    let func = program.add_function(f);
    let analysis = analyze(&mut program, func, None);

    let if_kind = find_region(&analysis.regions, |kind| {
        matches!(kind, RegionKind::IfThenElse { .. })
    })
    .expect("the branch reduces to if-then-else");
    let RegionKind::IfThenElse { condition, .. } = if_kind else {
        unreachable!();
    };

    let Node::Region(top) = analysis.regions.node(*condition) else {
        panic!("the condition is a short-circuit region, not a flat block");
    };
    let RegionKind::CompoundCondition {
        first, second, op, ..
    } = &top.kind
    else {
        panic!("the condition is a short-circuit region");
    };
    assert_eq!(*op, ShortCircuitOp::Or);
    for half in [*first, *second] {
        let Node::Region(inner) = analysis.regions.node(half) else {
            panic!("each disjunct is itself a conjunction");
        };
        assert!(matches!(
            inner.kind,
            RegionKind::CompoundCondition {
                op: ShortCircuitOp::And,
                ..
            }
        ));
    }
}

/// The bounds-checked jump-table dispatch from `0..=10`, with a shared
/// data section holding the table.
pub(crate) fn build_switch() -> (Program, FuncId, Image) {
    let mut f = Function::new(Some(id("pick_name")), Some(0x1000));
    let bounds = f.add_block(Some(0x1000));
    let dispatch = f.add_block(Some(0x1010));
    let k0 = f.add_block(Some(0x1020));
    let k1 = f.add_block(Some(0x1030));
    let k2 = f.add_block(Some(0x1040));
    let default = f.add_block(Some(0x1050));
    let exit = f.add_block(Some(0x1060));
    f.set_entry(bounds);

    // bounds: if (r0 <= 10) goto dispatch else goto default
    let index = f.access(r(0));
    let ten = f.constant(10, 32);
    let check = f
        .binary(BinaryOp::UnsignedLessOrEqual, index, ten)
        .unwrap();
    branch(&mut f, bounds, check, dispatch, default);

    // dispatch: goto *(0x2000 + r0 * 4)
    let base = f.constant(0x2000, 32);
    let index = f.access(r(0));
    let four = f.constant(4, 32);
    let scaled = f.binary(BinaryOp::Mul, index, four).unwrap();
    let slot = f.binary(BinaryOp::Add, base, scaled).unwrap();
    let target = f.dereference(slot, 32);
    f.push_stmt(
        dispatch,
        StatementKind::Jump(Jump {
            condition: None,
            then_target: JumpTarget::Address(target),
            else_target: None,
        }),
        None,
    )
    .unwrap();

    for (block, callee) in [(k0, 0x5000), (k1, 0x5010), (k2, 0x5020), (default, 0x5030)] {
        let target = f.constant(callee, 32);
        f.push_stmt(block, StatementKind::Call { target }, None)
            .unwrap();
        goto(&mut f, block, exit);
    }
    ret(&mut f, exit);

    let mut program = Program::new();
    let func = program.add_function(f);

    // The jump table: eleven little-endian slots, round-robin over the
    // three case blocks.
    let mut table = Vec::new();
    for index in 0u32..11 {
        let target = [0x1020u32, 0x1030, 0x1040][(index % 3) as usize];
        table.extend_from_slice(&target.to_le_bytes());
    }
    let mut image = Image::new();
    let mut section = Section::new(id(".rodata"), 0x2000, table.len() as u64);
    section.set_flags(SectionFlags::ALLOCATED | SectionFlags::READABLE | SectionFlags::DATA);
    section.set_byte_order(ByteOrder::Little);
    section.set_source(Box::new(BufferByteSource(table)));
    image.add_section(section);

    (program, func, image)
}

#[test]
fn a_bounds_checked_jump_table_becomes_a_switch() {
    let (mut program, func, image) = build_switch();
    let analysis = analyze(&mut program, func, Some(&image));

    let switch = find_region(&analysis.regions, |kind| {
        matches!(kind, RegionKind::Switch { .. })
    })
    .expect("the dispatch reduces to a switch region");
    let RegionKind::Switch {
        bounds_check,
        bounds_jump,
        max_value,
        cases,
        default,
        ..
    } = switch
    else {
        unreachable!();
    };
    assert!(bounds_check.is_some());
    assert_eq!(*max_value, Some(10));
    assert!(default.is_some());
    let total_values: usize = cases.iter().map(|case| case.values.len()).sum();
    assert_eq!(total_values, 11);

    // The range check lives in the emitted `switch`, so its jump is dead
    // and its condition must not survive liveness.
    let bounds_stmt = bounds_jump.expect("a recognized check records its jump");
    assert_eq!(analysis.regions.dead_jumps(), vec![bounds_stmt]);
    let function = program.function(func);
    let condition = function
        .stmt(bounds_stmt)
        .as_jump()
        .and_then(|jump| jump.condition)
        .unwrap();
    assert!(!analysis.liveness.is_live(condition));
}

#[test]
fn a_misaligned_store_splits_the_reaching_definitions() {
    // *(int *)0x3000 = a; *(int *)0x3001 = b; return *(int *)0x3000;
    let mut f = Function::new(Some(id("smear")), Some(0x1000));
    let block = f.add_block(Some(0x1000));
    f.set_entry(block);

    let addr = f.constant(0x3000, 32);
    let store = f.dereference(addr, 32);
    let a = f.access(r(1));
    f.push_stmt(
        block,
        StatementKind::Assignment { left: store, right: a },
        None,
    )
    .unwrap();
    let addr = f.constant(0x3001, 32);
    let misaligned = f.dereference(addr, 32);
    let b = f.access(r(2));
    f.push_stmt(
        block,
        StatementKind::Assignment {
            left: misaligned,
            right: b,
        },
        None,
    )
    .unwrap();
    let addr = f.constant(0x3000, 32);
    let load = f.dereference(addr, 32);
    set(&mut f, block, r(0), load);
    ret(&mut f, block);

    let mut program = Program::new();
    let func = program.add_function(f);
    let analysis = analyze(&mut program, func, None);

    let definitions = analysis.dataflow.definitions(load).unwrap();
    let described: Vec<(BitAddr, BitSize, usize)> = definitions
        .chunks()
        .iter()
        .map(|chunk| {
            (
                chunk.location().addr() - 0x3000 * 8,
                chunk.location().size(),
                chunk.definitions().len(),
            )
        })
        .collect();
    assert_eq!(described, vec![(0, 8, 1), (8, 24, 1)]);
    assert_eq!(definitions.chunks()[0].definitions(), &[store]);
    assert_eq!(definitions.chunks()[1].definitions(), &[misaligned]);

    // Both stores end up in the variable reconstructed for the load.
    let variable = analysis.variables.get(load).unwrap();
    assert!(variable.terms().contains(&store));
    assert!(variable.terms().contains(&misaligned));
    assert_eq!(variable.location().size(), 40);
    assert!(variable.is_global());
}

#[test]
fn distinct_objects_do_not_coalesce() {
    // Writes through two different resolved addresses stay two
    // variables, the way an adjusted `this` must not merge with the
    // enclosing object.
    let mut f = Function::new(Some(id("thunk")), Some(0x1000));
    let block = f.add_block(Some(0x1000));
    f.set_entry(block);

    let addr = f.constant(0x4000, 32);
    let object = f.dereference(addr, 32);
    let a = f.access(r(1));
    f.push_stmt(
        block,
        StatementKind::Assignment { left: object, right: a },
        None,
    )
    .unwrap();
    let addr = f.constant(0x4008, 32);
    let adjusted = f.dereference(addr, 32);
    let b = f.access(r(2));
    f.push_stmt(
        block,
        StatementKind::Assignment {
            left: adjusted,
            right: b,
        },
        None,
    )
    .unwrap();
    let addr = f.constant(0x4000, 32);
    let load_object = f.dereference(addr, 32);
    let addr = f.constant(0x4008, 32);
    let load_adjusted = f.dereference(addr, 32);
    let sum = f.binary(BinaryOp::Add, load_object, load_adjusted).unwrap();
    set(&mut f, block, r(0), sum);
    ret(&mut f, block);

    let mut program = Program::new();
    let func = program.add_function(f);
    let analysis = analyze(&mut program, func, None);

    assert_eq!(
        analysis.dataflow.location(load_object),
        Some(MemoryLocation::new(Domain::MEMORY, 0x4000 * 8, 32))
    );
    assert_eq!(
        analysis.dataflow.location(load_adjusted),
        Some(MemoryLocation::new(Domain::MEMORY, 0x4008 * 8, 32))
    );
    let first = analysis.variables.index_of(load_object).unwrap();
    let second = analysis.variables.index_of(load_adjusted).unwrap();
    assert_ne!(first, second);
    assert!(!analysis.variables.list()[first]
        .location()
        .overlaps(&analysis.variables.list()[second].location()));
}

#[test]
fn a_self_looping_block_with_a_bottom_test_is_a_do_while() {
    let mut f = Function::new(Some(id("spin")), Some(0x1000));
    let body = f.add_block(Some(0x1000));
    let exit = f.add_block(Some(0x1010));
    f.set_entry(body);

    // body: r0 = r0 - 1; if (0 < r0) goto body else goto exit
    let value = f.access(r(0));
    let one = f.constant(1, 32);
    let next = f.binary(BinaryOp::Sub, value, one).unwrap();
    set(&mut f, body, r(0), next);
    let zero = f.constant(0, 32);
    let value = f.access(r(0));
    let cond = f.binary(BinaryOp::UnsignedLess, zero, value).unwrap();
    branch(&mut f, body, cond, body, exit);
    ret(&mut f, exit);

    let mut program = Program::new();
    let func = program.add_function(f);
    let analysis = analyze(&mut program, func, None);

    let do_while = find_region(&analysis.regions, |kind| {
        matches!(kind, RegionKind::DoWhile { .. })
    });
    assert!(do_while.is_some());
    let RegionKind::DoWhile { negated, .. } = do_while.unwrap() else {
        unreachable!();
    };
    assert!(!*negated);
    assert!(find_region(&analysis.regions, |kind| matches!(
        kind,
        RegionKind::While { .. }
    ))
    .is_none());
}

#[test]
fn a_single_halting_block_is_a_one_leaf_sequence() {
    let mut f = Function::new(Some(id("stop")), Some(0x1000));
    let block = f.add_block(Some(0x1000));
    f.set_entry(block);
    f.push_stmt(block, StatementKind::Halt, None).unwrap();

    let mut program = Program::new();
    let func = program.add_function(f);
    let analysis = analyze(&mut program, func, None);

    let Node::Region(root) = analysis.regions.node(analysis.regions.root()) else {
        panic!("the root is a region");
    };
    assert!(matches!(&root.kind, RegionKind::Block { children } if children.len() == 1));
    assert_eq!(analysis.regions.leaves(), vec![block]);
}

#[test]
fn a_spurious_read_does_not_lose_definition_edges() {
    let build = |spurious: bool| {
        let mut f = Function::new(Some(id("probe")), Some(0x1000));
        let block = f.add_block(Some(0x1000));
        f.set_entry(block);
        let one = f.constant(1, 32);
        set(&mut f, block, r(0), one);
        let read = f.access(r(0));
        set(&mut f, block, r(1), read);
        if spurious {
            let extra = f.access(r(0));
            f.push_stmt(
                block,
                StatementKind::Touch {
                    term: extra,
                    access: Access::Read,
                },
                None,
            )
            .unwrap();
        }
        ret(&mut f, block);
        let mut program = Program::new();
        let func = program.add_function(f);
        (program, func, read)
    };

    let (mut plain_program, plain_func, plain_read) = build(false);
    let plain = analyze(&mut plain_program, plain_func, None);
    let (mut noisy_program, noisy_func, noisy_read) = build(true);
    let noisy = analyze(&mut noisy_program, noisy_func, None);

    let plain_defs = plain.dataflow.definitions(plain_read).unwrap();
    let noisy_defs = noisy.dataflow.definitions(noisy_read).unwrap();
    assert_eq!(plain_defs, noisy_defs);
}

#[test]
fn a_capped_block_still_feeds_its_successors() {
    // Three straight-line blocks analyzed with no visit budget at all:
    // every block runs widened, yet the definition made in the first
    // block must still arrive two blocks downstream instead of the
    // chain starving.
    let mut f = Function::new(Some(id("chain")), Some(0x1000));
    let a = f.add_block(Some(0x1000));
    let b = f.add_block(Some(0x1010));
    let c = f.add_block(Some(0x1020));
    f.set_entry(a);

    let five = f.constant(5, 32);
    let first = f.access(r(0));
    f.push_stmt(a, StatementKind::Assignment { left: first, right: five }, None)
        .unwrap();
    goto(&mut f, a, b);
    let through = f.access(r(0));
    set(&mut f, b, r(1), through);
    goto(&mut f, b, c);
    let last = f.access(r(0));
    set(&mut f, c, r(2), last);
    f.push_stmt(c, StatementKind::Halt, None).unwrap();

    let mut program = Program::new();
    let func = program.add_function(f);
    let arch = test_arch();
    let token = CancellationToken::new();
    let dataflow = DataflowAnalyzer::new(&program, func, &arch, None, token)
        .with_max_block_visits(0)
        .analyze()
        .unwrap();

    // Widened, so nothing pretends to know the stored value...
    assert_eq!(dataflow.as_exact(through), None);
    assert_eq!(dataflow.as_exact(last), None);
    // ...but the definition edges are all there.
    let reached_by_first = |term: TermId| {
        dataflow.definitions(term).is_some_and(|defs| {
            defs.chunks()
                .iter()
                .any(|chunk| chunk.definitions().contains(&first))
        })
    };
    assert!(reached_by_first(through));
    assert!(reached_by_first(last));
}

#[test]
fn cancellation_yields_no_partial_results() {
    let (mut program, func) = build_gcd();
    let arch = test_arch();
    let mut signatures = Signatures::new();
    let token = CancellationToken::new();
    token.cancel();
    let result = Driver::new(&arch, None)
        .with_token(token)
        .analyze_function(&mut program, func, &mut signatures);
    assert!(matches!(result, Err(AnalysisError::Cancelled(_))));
}

#[test]
fn double_negated_bounds_checks_are_recognized() {
    let mut f = Function::new(Some(id("guard")), Some(0x1000));
    let head = f.add_block(Some(0x1000));
    let passed = f.add_block(Some(0x1010));
    let failed = f.add_block(Some(0x1020));
    let exit = f.add_block(Some(0x1030));
    f.set_entry(head);

    let index = f.access(r(0));
    let seven = f.constant(7, 32);
    let check = f
        .binary(BinaryOp::UnsignedLessOrEqual, index, seven)
        .unwrap();
    let once = f.unary(UnaryOp::Not, check, 1).unwrap();
    let twice = f.unary(UnaryOp::Not, once, 1).unwrap();
    let jump = branch(&mut f, head, twice, passed, failed);
    goto(&mut f, passed, exit);
    goto(&mut f, failed, exit);
    ret(&mut f, exit);

    let mut program = Program::new();
    let func = program.add_function(f);
    let analysis = analyze(&mut program, func, None);
    let function = program.function(func);

    let found = patterns::recognize_bounds_check(jump, passed, function, &analysis.dataflow)
        .expect("double negation unwraps");
    assert_eq!(found.max_value, 7);
    assert_eq!(found.if_failed, failed);

    // The negated orientation: passing on the else edge flips the sense.
    let inverted = patterns::recognize_bounds_check(jump, failed, function, &analysis.dataflow);
    assert!(inverted.is_none());
}

#[test]
fn inlining_splices_the_callee_into_the_caller() {
    let mut caller = Function::new(Some(id("caller")), Some(0x1000));
    let entry = caller.add_block(Some(0x1000));
    caller.set_entry(entry);
    let five = caller.constant(5, 32);
    set(&mut caller, entry, r(0), five);
    let target = caller.constant(0x9000, 32);
    let call = caller
        .push_stmt(entry, StatementKind::Call { target }, Some(0x1004))
        .unwrap();
    let result = caller.access(r(0));
    set(&mut caller, entry, r(1), result);
    ret(&mut caller, entry);

    let mut callee = Function::new(Some(id("inc")), Some(0x9000));
    let body = callee.add_block(Some(0x9000));
    callee.set_entry(body);
    let value = callee.access(r(0));
    let one = callee.constant(1, 32);
    let next = callee.binary(BinaryOp::Add, value, one).unwrap();
    set(&mut callee, body, r(0), next);
    ret(&mut callee, body);

    let mut program = Program::new();
    let caller_id = program.add_function(caller);
    let callee_id = program.add_function(callee);

    let arch = test_arch();
    let token = CancellationToken::new();
    let dataflow = DataflowAnalyzer::new(&program, callee_id, &arch, None, token)
        .analyze()
        .unwrap();
    let returns = inline::likely_returns(program.function(callee_id), &dataflow);
    assert_eq!(returns.len(), 1);

    inline::inline_call(&mut program, caller_id, call, callee_id, &returns).unwrap();

    let function = program.function(caller_id);
    // Lead-in, continuation, and the cloned callee body.
    assert_eq!(function.block_ids().count(), 3);
    for block in function.block_ids() {
        for &stmt in function.block(block).stmts() {
            assert!(function.stmt(stmt).as_call().is_none(), "the call is gone");
        }
    }

    // The spliced function still analyzes cleanly end to end.
    let analysis = analyze(&mut program, caller_id, None);
    assert_eq!(analysis.regions.leaves().len(), 3);
}
