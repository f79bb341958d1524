//! Host loop benchmarks using criterion.
//!
//! Measures compilation of an effectful program and the cost of one
//! suspend/resume round trip through a host handler.
//!
//! Run with: cargo bench --bench host_loop_bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use wisp_runtime::{Handler, HostValue, ResumeKind, Runtime, RuntimeConfig};
use wispc::hir::{BinOp, BodyBuilder, DefId, FnDecl, OpDecl, Program, Stmt, Type};
use wispc::{compile, CompileOptions};

/// `sum(n)` performs `Ask.get(i)` once per iteration and adds the answers.
fn loop_program() -> Program {
    let mut program = Program::new("bench", "bench.wisp");
    let ask = program.declare_effect("Ask", vec![OpDecl::new("get", vec![Type::Int], Type::Int, ResumeKind::Resume)]);
    let get = program.op(ask, "get").unwrap();

    let mut b = BodyBuilder::new();
    let n = b.param("n", Type::Int);
    let i = b.local("i", Type::Int);
    let s = b.local("s", Type::Int);
    let zero = b.int(0);
    let init_i = b.let_stmt(i, zero);
    let zero = b.int(0);
    let init_s = b.let_stmt(s, zero);
    let get_i = b.local_ref(i);
    let get_n = b.local_ref(n);
    let cond = b.binary(BinOp::Lt, get_i, get_n);
    let get_s = b.local_ref(s);
    let get_i = b.local_ref(i);
    let asked = b.perform(get, vec![get_i], Type::Int);
    let added = b.binary(BinOp::Add, get_s, asked);
    let set_s = b.assign(s, added);
    let get_i = b.local_ref(i);
    let one = b.int(1);
    let inc = b.binary(BinOp::Add, get_i, one);
    let set_i = b.assign(i, inc);
    let body = b.block(vec![Stmt::Expr(set_s), Stmt::Expr(set_i)], None);
    let lp = b.while_loop(cond, body);
    let get_s = b.local_ref(s);
    let block = b.block(vec![init_i, init_s, Stmt::Expr(lp)], Some(get_s));
    program.add_function(FnDecl::new(DefId::new(0), "sum", b.finish(block), Type::Int).exported());
    program
}

fn bench_compile(c: &mut Criterion) {
    let program = loop_program();
    c.bench_function("compile_loop_program", |b| {
        b.iter(|| black_box(compile(black_box(&program), CompileOptions::default())))
    });
}

fn bench_round_trips(c: &mut Criterion) {
    let mut group = c.benchmark_group("host_round_trips");
    let output = compile(&loop_program(), CompileOptions::default()).unwrap();
    let mut runtime = Runtime::load(&output.bytes, RuntimeConfig::default()).unwrap();
    runtime
        .registry_mut()
        .register_label("Ask.get", Handler::resuming(|call| call.arg(0).cloned().unwrap_or(HostValue::Unit)))
        .unwrap();

    for requests in [1i64, 16, 256] {
        group.throughput(Throughput::Elements(requests as u64));
        group.bench_with_input(BenchmarkId::from_parameter(requests), &requests, |b, &n| {
            b.iter(|| black_box(runtime.run_blocking("sum", vec![HostValue::Int(n)])))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_compile, bench_round_trips);
criterion_main!(benches);
