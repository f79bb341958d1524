//! Property-based tests for the effects engine.
//!
//! Uses proptest to generate rows, bodies and inputs and verify that the
//! row algebra, the usage analysis and the generated continuations agree
//! with their reference behavior.

use proptest::prelude::*;
use wisp_runtime::{Handler, HostValue, ResumeKind, Runtime, RuntimeConfig};
use wispc::effects::{analyze_usage, Bound, RowInterner};
use wispc::hir::{BinOp, BodyBuilder, DefId, EffectId, FnDecl, OpDecl, OpRef, Program, Stmt, Type};
use wispc::{compile, CompileOptions};

/// Strategy for generating operation references over a small universe
fn op_ref() -> impl Strategy<Value = OpRef> {
    (0u32..4, 0u32..4).prop_map(|(effect, op)| OpRef::new(EffectId::new(effect), op))
}

fn op_set() -> impl Strategy<Value = Vec<OpRef>> {
    prop::collection::vec(op_ref(), 0..8)
}

/// Strategy for small integers that never overflow under the tested arithmetic
fn small_int() -> impl Strategy<Value = i64> {
    -1000i64..1000
}

/// `f(a, b) = { let x = a; let y = b; let v = perform Ask.get(); x * y + v }`
fn capture_program() -> Program {
    let mut program = Program::new("app", "app.wisp");
    let ask = program.declare_effect("Ask", vec![OpDecl::new("get", vec![], Type::Int, ResumeKind::Resume)]);
    let get = program.op(ask, "get").unwrap();

    let mut b = BodyBuilder::new();
    let a = b.param("a", Type::Int);
    let c = b.param("b", Type::Int);
    let x = b.local("x", Type::Int);
    let y = b.local("y", Type::Int);
    let v = b.local("v", Type::Int);
    let get_a = b.local_ref(a);
    let bind_x = b.let_stmt(x, get_a);
    let get_c = b.local_ref(c);
    let bind_y = b.let_stmt(y, get_c);
    let asked = b.perform(get, vec![], Type::Int);
    let bind_v = b.let_stmt(v, asked);
    let get_x = b.local_ref(x);
    let get_y = b.local_ref(y);
    let product = b.binary(BinOp::Mul, get_x, get_y);
    let get_v = b.local_ref(v);
    let sum = b.binary(BinOp::Add, product, get_v);
    let body = b.block(vec![bind_x, bind_y, bind_v], Some(sum));
    program.add_function(FnDecl::new(DefId::new(0), "f", b.finish(body), Type::Int).exported());
    program
}

proptest! {
    /// Composition is commutative and idempotent
    #[test]
    fn compose_commutes(a in op_set(), b in op_set(), open_a in any::<bool>(), open_b in any::<bool>()) {
        let mut rows = RowInterner::new();
        let ra = rows.intern(a.iter().copied(), open_a);
        let rb = rows.intern(b.iter().copied(), open_b);
        let ab = rows.compose(ra, rb);
        let ba = rows.compose(rb, ra);
        prop_assert_eq!(ab, ba);
        prop_assert_eq!(rows.compose(ab, ab), ab);
        prop_assert!(rows.covers(ab, ra));
        prop_assert!(rows.covers(ab, rb));
    }

    /// Interning is insensitive to order and duplicates
    #[test]
    fn intern_is_canonical(ops in op_set(), open in any::<bool>()) {
        let mut rows = RowInterner::new();
        let forward = rows.intern(ops.iter().copied(), open);
        let backward = rows.intern(ops.iter().rev().chain(ops.iter()).copied(), open);
        prop_assert_eq!(forward, backward);
        let data = rows.get(forward);
        prop_assert!(data.ops.windows(2).all(|w| w[0] < w[1]));
        prop_assert_eq!(rows.is_empty(forward), ops.is_empty() && !open);
    }

    /// Removing handled operations leaves exactly the uncovered ones
    #[test]
    fn without_removes_handled(ops in op_set(), handled in op_set()) {
        let mut rows = RowInterner::new();
        let row = rows.intern(ops.iter().copied(), false);
        let rest = rows.without(row, &handled);
        for op in &ops {
            prop_assert_eq!(rows.contains(rest, *op), !handled.contains(op));
        }
    }

    /// A single call per statement in straight-line code is counted exactly
    #[test]
    fn straight_line_usage_is_exact(calls in 0u32..6) {
        let rows = RowInterner::new();
        let mut b = BodyBuilder::new();
        let f = b.param("f", Type::function(vec![Type::Int], Type::Int, rows.empty()));
        let mut stmts = Vec::new();
        for i in 0..calls {
            let callee = b.local_ref(f);
            let arg = b.int(i64::from(i));
            stmts.push(Stmt::Expr(b.call(callee, vec![arg], Type::Int)));
        }
        let tail = b.int(0);
        let block = b.block(stmts, Some(tail));
        let body = b.finish(block);

        let usage = analyze_usage(&body.expr, f);
        prop_assert_eq!(usage.min, calls);
        prop_assert_eq!(usage.max, Bound::Finite(calls));
        prop_assert!(!usage.escapes);
        prop_assert_eq!(usage.is_linear(), calls == 1);
    }

    /// A call inside a loop body is unbounded whatever precedes it
    #[test]
    fn loop_usage_is_unbounded(before in 0u32..4) {
        let rows = RowInterner::new();
        let mut b = BodyBuilder::new();
        let f = b.param("f", Type::function(vec![Type::Int], Type::Int, rows.empty()));
        let mut stmts = Vec::new();
        for i in 0..before {
            let callee = b.local_ref(f);
            let arg = b.int(i64::from(i));
            stmts.push(Stmt::Expr(b.call(callee, vec![arg], Type::Int)));
        }
        let cond = b.bool(true);
        let callee = b.local_ref(f);
        let arg = b.int(0);
        let inner = b.call(callee, vec![arg], Type::Int);
        let loop_body = b.block(vec![Stmt::Expr(inner)], None);
        stmts.push(Stmt::Expr(b.while_loop(cond, loop_body)));
        let block = b.block(stmts, None);
        let body = b.finish(block);

        let usage = analyze_usage(&body.expr, f);
        prop_assert_eq!(usage.min, before);
        prop_assert_eq!(usage.max, Bound::Unbounded);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Locals captured across a suspension survive the round trip through the host
    #[test]
    fn captured_locals_survive_resume(a in small_int(), b in small_int(), resumed in small_int()) {
        let output = compile(&capture_program(), CompileOptions::default()).unwrap();
        let mut runtime = Runtime::load(&output.bytes, RuntimeConfig::default()).unwrap();
        runtime
            .registry_mut()
            .register_label("Ask.get", Handler::resuming(move |_| HostValue::Int(resumed)))
            .unwrap();

        let result = runtime.run_blocking("f", vec![HostValue::Int(a), HostValue::Int(b)]).unwrap();
        prop_assert_eq!(result, HostValue::Int(a * b + resumed));
    }
}
