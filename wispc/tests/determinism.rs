//! Output stability tests.
//!
//! These tests verify that:
//! 1. Compiling the same program twice produces identical bytes
//! 2. Effect table indices do not depend on declaration order
//! 3. Interning rows in different orders does not change the output

use wisp_runtime::table::{DIAGNOSTICS_SECTION, EFFECT_TABLE_SECTION};
use wisp_runtime::{EffectTable, Module, ResumeKind};
use wispc::hir::{BinOp, BodyBuilder, DefId, FnDecl, OpDecl, Program, Type};
use wispc::{compile, CompileOptions};

// ============================================================================
// Test Infrastructure
// ============================================================================

/// Two effects, declared in the given order, each performed by `main`.
fn program(log_first: bool) -> Program {
    let mut program = Program::new("app", "app.wisp");
    let (log, ask) = if log_first {
        let log = program.declare_effect("Log", vec![OpDecl::new("write", vec![Type::Int], Type::Unit, ResumeKind::Tail)]);
        let ask = program.declare_effect("Ask", vec![OpDecl::new("get", vec![], Type::Int, ResumeKind::Resume)]);
        (log, ask)
    } else {
        let ask = program.declare_effect("Ask", vec![OpDecl::new("get", vec![], Type::Int, ResumeKind::Resume)]);
        let log = program.declare_effect("Log", vec![OpDecl::new("write", vec![Type::Int], Type::Unit, ResumeKind::Tail)]);
        (log, ask)
    };
    let write = program.op(log, "write").unwrap();
    let get = program.op(ask, "get").unwrap();

    // main() = { perform Log.write(perform Ask.get()); perform Ask.get() * 2 }
    let mut b = BodyBuilder::new();
    let asked = b.perform(get, vec![], Type::Int);
    let logged = b.perform(write, vec![asked], Type::Unit);
    let asked = b.perform(get, vec![], Type::Int);
    let two = b.int(2);
    let doubled = b.binary(BinOp::Mul, asked, two);
    let body = b.block(vec![wispc::hir::Stmt::Expr(logged)], Some(doubled));
    program.add_function(FnDecl::new(DefId::new(0), "main", b.finish(body), Type::Int).exported());
    program
}

fn labels(table: &EffectTable) -> Vec<(u32, String)> {
    table.entries().iter().map(|e| (e.op_index, e.label.clone())).collect()
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn test_repeated_compilation_is_identical() {
    let first = compile(&program(true), CompileOptions::default()).unwrap();
    let second = compile(&program(true), CompileOptions::default()).unwrap();
    assert_eq!(first.bytes, second.bytes);
    assert_eq!(first.effect_table, second.effect_table);
    assert_eq!(first.runtime_diagnostics, second.runtime_diagnostics);
}

#[test]
fn test_table_independent_of_declaration_order() {
    let a = compile(&program(true), CompileOptions::default()).unwrap();
    let b = compile(&program(false), CompileOptions::default()).unwrap();
    assert_eq!(labels(&a.effect_table), labels(&b.effect_table));
    assert_eq!(
        labels(&a.effect_table),
        vec![(0, "app::Ask.get".to_string()), (1, "app::Log.write".to_string())]
    );
    let hashes = |t: &EffectTable| t.entries().iter().map(|e| e.effect_id_hash).collect::<Vec<_>>();
    assert_eq!(hashes(&a.effect_table), hashes(&b.effect_table));
}

#[test]
fn test_sections_decode_to_compiled_tables() {
    let output = compile(&program(true), CompileOptions::default()).unwrap();
    let decoded = Module::decode(&output.bytes).unwrap();
    let table = decoded.module.custom_section(EFFECT_TABLE_SECTION).unwrap();
    assert_eq!(EffectTable::decode(table).unwrap(), output.effect_table);
    assert!(decoded.module.custom_section(DIAGNOSTICS_SECTION).is_some());
}

#[test]
fn test_unrelated_interning_does_not_change_output() {
    let plain = program(true);
    let mut noisy = program(true);
    // Rows interned ahead of compilation only add unused interner entries.
    let ops: Vec<_> = (0..2)
        .flat_map(|e| noisy.effects[e].ops.iter().enumerate().map(move |(i, _)| (e, i)))
        .map(|(e, i)| wispc::hir::OpRef::new(wispc::hir::EffectId::new(e as u32), i as u32))
        .collect();
    noisy.rows.intern(ops.iter().rev().copied(), true);
    noisy.rows.intern(ops.iter().copied(), false);

    let a = compile(&plain, CompileOptions::default()).unwrap();
    let b = compile(&noisy, CompileOptions::default()).unwrap();
    assert_eq!(a.bytes, b.bytes);
}
