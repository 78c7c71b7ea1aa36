//! Shape tests over the emitted program: the structured constructs come
//! out as structured C, and only unstructured residue falls back to
//! gotos.

use crate::back::cgen::CodeGenerator;
use crate::middle::ir::*;
use crate::middle::tests::{analyze, branch, build_gcd, build_switch, goto, r, ret, set, test_arch};

#[test]
fn gcd_emits_a_while_loop_and_a_return() {
    let (mut program, func) = build_gcd();
    let analysis = analyze(&mut program, func, None);
    let arch = test_arch();
    let code = CodeGenerator::new(&program, &arch).emit_function(func, &analysis);

    assert!(code.contains("uint32_t gcd(uint32_t a1, uint32_t a2)"), "{code}");
    assert!(code.contains("while ("), "{code}");
    assert!(code.contains("return "), "{code}");
    assert!(!code.contains("goto "), "{code}");
}

#[test]
fn a_switch_emits_cases_without_duplicating_the_range_check() {
    let (mut program, func, image) = build_switch();
    let analysis = analyze(&mut program, func, Some(&image));
    let arch = test_arch();
    let code = CodeGenerator::new(&program, &arch).emit_function(func, &analysis);

    assert!(code.contains("switch ("), "{code}");
    assert!(code.contains("case 0:"), "{code}");
    assert!(code.contains("case 10:"), "{code}");
    assert!(code.contains("default:"), "{code}");
    // The bounds check lives inside the `switch`; no `if` restates it.
    assert!(!code.contains("if ("), "{code}");
}

#[test]
fn irreducible_flow_falls_back_to_labelled_gotos() {
    let mut f = Function::new(None, Some(0x1000));
    let a = f.add_block(Some(0x1000));
    let b = f.add_block(Some(0x1010));
    let c = f.add_block(Some(0x1020));
    let exit = f.add_block(Some(0x1030));
    f.set_entry(a);

    // Two entries into the b <-> c cycle make it irreducible.
    let value = f.access(r(0));
    let zero = f.constant(0, 32);
    let cond = f.binary(BinaryOp::UnsignedLess, zero, value).unwrap();
    branch(&mut f, a, cond, b, c);
    goto(&mut f, b, c);
    let value = f.access(r(1));
    let zero = f.constant(0, 32);
    let cond = f.binary(BinaryOp::UnsignedLess, zero, value).unwrap();
    branch(&mut f, c, cond, b, exit);
    ret(&mut f, exit);

    let mut program = Program::new();
    let func = program.add_function(f);
    let analysis = analyze(&mut program, func, None);
    let arch = test_arch();
    let code = CodeGenerator::new(&program, &arch).emit_function(func, &analysis);

    assert!(code.contains("goto l_"), "{code}");
    assert!(code.contains("l_1010: ;") || code.contains("l_1020: ;"), "{code}");
}

#[test]
fn compound_conditions_emit_short_circuit_operators() {
    let mut f = Function::new(None, Some(0x1000));
    let c1 = f.add_block(Some(0x1000));
    let c2 = f.add_block(Some(0x1010));
    let then_block = f.add_block(Some(0x1020));
    let else_block = f.add_block(Some(0x1030));
    let exit = f.add_block(Some(0x1040));
    f.set_entry(c1);

    // if (a && b) r0 = 1 else r0 = 2
    let value = f.access(r(0));
    let zero = f.constant(0, 32);
    let cond = f.binary(BinaryOp::UnsignedLess, zero, value).unwrap();
    branch(&mut f, c1, cond, c2, else_block);
    let value = f.access(r(1));
    let zero = f.constant(0, 32);
    let cond = f.binary(BinaryOp::UnsignedLess, zero, value).unwrap();
    branch(&mut f, c2, cond, then_block, else_block);
    let one = f.constant(1, 32);
    set(&mut f, then_block, r(0), one);
    goto(&mut f, then_block, exit);
    let two = f.constant(2, 32);
    set(&mut f, else_block, r(0), two);
    goto(&mut f, else_block, exit);
    ret(&mut f, exit);

    let mut program = Program::new();
    let func = program.add_function(f);
    let analysis = analyze(&mut program, func, None);
    let arch = test_arch();
    let code = CodeGenerator::new(&program, &arch).emit_function(func, &analysis);

    assert!(code.contains("&&"), "{code}");
    assert!(code.contains("} else {"), "{code}");
    assert!(!code.contains("goto "), "{code}");
}
