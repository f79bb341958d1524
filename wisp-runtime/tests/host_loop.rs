//! Host loop tests over hand-assembled modules.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use wisp_runtime::abi;
use wisp_runtime::module::{BinOp, Const, CustomSection, Export, Function, Instr, StructType};
use wisp_runtime::table::{DIAGNOSTICS_SECTION, EFFECT_TABLE_SECTION};
use wisp_runtime::{
    block_on, CancellationSource, EffectTable, EffectTableEntry, ErrorKind, FunctionDiagnostic,
    Handler, HostValue, LineCol, Module, ResumeKind, Resumer, Runtime, RuntimeConfig, RuntimeDiagnostics,
    RuntimeError, TrapCode,
};

const OUTCOME: u32 = 0;
const ARGS1: u32 = 1;

fn types() -> Vec<StructType> {
    vec![
        StructType {
            name: abi::OUTCOME_TYPE.to_string(),
            fields: abi::OUTCOME_FIELDS.iter().map(|f| f.to_string()).collect(),
        },
        StructType {
            name: abi::args_type_name(1),
            fields: vec!["0".to_string()],
        },
    ]
}

/// `main` requests `Test.effect(41)`; resuming with `v` completes with `v + 1`.
fn effect_module(kind: ResumeKind) -> Module {
    let main = Function {
        name: "main".to_string(),
        params: 0,
        locals: 0,
        returns_outcome: true,
        code: vec![
            Instr::Const(Const::I64(abi::TAG_REQUEST)),
            Instr::Const(Const::Unit),
            Instr::Const(Const::I64(0)),
            Instr::Const(Const::I64(41)),
            Instr::StructNew { type_index: ARGS1 },
            Instr::Const(Const::Null),
            Instr::StructNew { type_index: OUTCOME },
            Instr::Return,
        ],
    };
    let resume = Function {
        name: "wisp$resume".to_string(),
        params: 2,
        locals: 0,
        returns_outcome: true,
        code: vec![
            Instr::Const(Const::I64(abi::TAG_VALUE)),
            Instr::LocalGet(1),
            Instr::Const(Const::I64(1)),
            Instr::Binary(BinOp::Add),
            Instr::Const(Const::I64(0)),
            Instr::Const(Const::Null),
            Instr::Const(Const::Null),
            Instr::StructNew { type_index: OUTCOME },
            Instr::Return,
        ],
    };
    let divide = Function {
        name: "divide".to_string(),
        params: 1,
        locals: 0,
        returns_outcome: false,
        code: vec![
            Instr::Const(Const::I64(10)),
            Instr::LocalGet(0),
            Instr::Binary(BinOp::Div),
            Instr::Return,
        ],
    };
    let table = EffectTable::new(vec![EffectTableEntry {
        op_index: 0,
        effect_id: "app::Test".to_string(),
        effect_id_hash: 7,
        op_id: 0,
        resume_kind: kind,
        signature_hash: 0xfeed,
        label: "app::Test.effect".to_string(),
    }])
    .unwrap();

    let mut module = Module {
        types: types(),
        functions: vec![main, resume, divide],
        exports: vec![
            Export {
                name: "main".to_string(),
                func: 0,
            },
            Export {
                name: abi::RESUME_EXPORT.to_string(),
                func: 1,
            },
            Export {
                name: "divide".to_string(),
                func: 2,
            },
        ],
        custom: vec![CustomSection {
            name: EFFECT_TABLE_SECTION.to_string(),
            data: table.encode(),
        }],
    };

    // Code ranges do not depend on custom sections, which are laid out last.
    let (_, ranges) = module.encode_with_layout();
    let diagnostics = RuntimeDiagnostics::new(vec![FunctionDiagnostic {
        function_name: "divide".to_string(),
        module_id: "app".to_string(),
        source_file: "app.wisp".to_string(),
        code_range: ranges[2].clone(),
        source_range: 30..52,
        start: LineCol { line: 3, col: 1 },
        end: LineCol { line: 5, col: 2 },
    }]);
    module.custom.push(CustomSection {
        name: DIAGNOSTICS_SECTION.to_string(),
        data: diagnostics.encode(),
    });
    module
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn runtime(kind: ResumeKind) -> Runtime {
    init_tracing();
    let bytes = effect_module(kind).encode();
    Runtime::load(&bytes, RuntimeConfig::default()).unwrap()
}

#[test]
fn test_synchronous_resume() {
    let mut rt = runtime(ResumeKind::Resume);
    let seen = Arc::new(Mutex::new(None));
    let seen_by_handler = Arc::clone(&seen);
    rt.registry_mut()
        .register_label(
            "Test.effect",
            Handler::resuming(move |call| {
                *seen_by_handler.lock().unwrap() = call.arg(0).cloned();
                HostValue::Int(2)
            }),
        )
        .unwrap();

    assert_eq!(rt.run_blocking("main", vec![]), Ok(HostValue::Int(3)));
    assert_eq!(*seen.lock().unwrap(), Some(HostValue::Int(41)));
}

#[test]
fn test_register_by_signature_hash() {
    let mut rt = runtime(ResumeKind::Resume);
    rt.registry_mut()
        .register("app::Test", 0, 0xfeed, Handler::resuming(|_| HostValue::Int(9)))
        .unwrap();
    assert_eq!(rt.run_blocking("main", vec![]), Ok(HostValue::Int(10)));
}

#[test]
fn test_unhandled_effect() {
    let rt = runtime(ResumeKind::Resume);
    let err = rt.run_blocking("main", vec![]).unwrap_err();
    assert_eq!(
        err,
        RuntimeError::UnhandledEffect {
            effect_id: "app::Test".to_string(),
            op_name: "effect".to_string(),
            op_index: 0,
        }
    );
    assert_eq!(err.kind(), ErrorKind::UnhandledEffect);
}

#[test]
fn test_tail_handler_returns_value() {
    let mut rt = runtime(ResumeKind::Tail);
    rt.registry_mut()
        .register_label("effect", Handler::returning(|_| HostValue::Int(5)))
        .unwrap();
    assert_eq!(rt.run_blocking("main", vec![]), Ok(HostValue::Int(6)));
}

#[test]
fn test_resume_kind_ignores_returned_value() {
    let mut rt = runtime(ResumeKind::Resume);
    rt.registry_mut()
        .register_label("effect", Handler::returning(|_| HostValue::Int(5)))
        .unwrap();
    let err = rt.run_blocking("main", vec![]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MissingTailResume);
}

#[test]
fn test_double_resume() {
    let mut rt = runtime(ResumeKind::Resume);
    rt.registry_mut()
        .register_label(
            "effect",
            Handler::new(|_, resumer| {
                let again = resumer.clone();
                resumer.resume(1i64).unwrap();
                assert!(again.resume(1i64).is_err());
                None
            }),
        )
        .unwrap();
    let err = rt.run_blocking("main", vec![]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DoubleResume);
}

#[test]
fn test_resume_from_another_thread() {
    let mut rt = runtime(ResumeKind::Resume);
    rt.registry_mut()
        .register_label(
            "effect",
            Handler::new(|call, resumer| {
                let n = call.arg(0).and_then(HostValue::as_int).unwrap_or(0);
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(10));
                    resumer.resume(n * 2).unwrap();
                });
                None
            }),
        )
        .unwrap();
    assert_eq!(rt.run_blocking("main", vec![]), Ok(HostValue::Int(83)));
}

#[test]
fn test_cancel_while_suspended() {
    let mut rt = runtime(ResumeKind::Resume);
    let parked: Arc<Mutex<Option<Resumer>>> = Arc::new(Mutex::new(None));
    let park = Arc::clone(&parked);
    rt.registry_mut()
        .register_label(
            "effect",
            Handler::new(move |_, resumer| {
                *park.lock().unwrap() = Some(resumer);
                None
            }),
        )
        .unwrap();

    let source = CancellationSource::new();
    let token = source.token();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(10));
        source.cancel_with_reason(Some("shutdown".to_string()));
    });

    let mut instance = rt.instantiate();
    let result = block_on(rt.call(&mut instance, "main", vec![]).with_cancellation(token));
    canceller.join().unwrap();
    assert_eq!(
        result,
        Err(RuntimeError::Cancelled {
            reason: Some("shutdown".to_string())
        })
    );

    // A late resume is rejected and has no effect.
    let late = parked.lock().unwrap().take().unwrap();
    assert!(late.resume(1i64).is_err());
}

#[test]
fn test_timeout() {
    let mut rt = runtime(ResumeKind::Resume);
    let parked: Arc<Mutex<Vec<Resumer>>> = Arc::new(Mutex::new(Vec::new()));
    let park = Arc::clone(&parked);
    rt.registry_mut()
        .register_label(
            "effect",
            Handler::new(move |_, resumer| {
                park.lock().unwrap().push(resumer);
                None
            }),
        )
        .unwrap();

    let mut instance = rt.instantiate();
    let err = block_on(
        rt.call(&mut instance, "main", vec![])
            .with_timeout(Duration::from_millis(20)),
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert!(err.to_string().contains("timed out"));
}

#[test]
fn test_execution_debug_names_export_and_state() {
    let rt = runtime(ResumeKind::Resume);
    let mut instance = rt.instantiate();
    let execution = rt.call(&mut instance, "main", vec![]);
    let shown = format!("{:?}", execution);
    assert!(shown.starts_with("Execution {"));
    assert!(shown.contains("export: \"main\""));
    assert!(shown.contains("state: Start([])"));
    assert!(shown.contains("deadline: None"));
}

#[test]
fn test_dropped_resumer_is_missing_resume() {
    let mut rt = runtime(ResumeKind::Resume);
    rt.registry_mut()
        .register_label("effect", Handler::new(|_, _resumer| None))
        .unwrap();
    let err = rt.run_blocking("main", vec![]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MissingTailResume);
}

#[test]
fn test_trap_is_annotated_from_diagnostics() {
    let rt = runtime(ResumeKind::Resume);
    let err = rt.run_blocking("divide", vec![HostValue::Int(0)]).unwrap_err();
    let report = err.trap().unwrap();
    assert_eq!(report.code, TrapCode::DivisionByZero);
    assert_eq!(report.function_name, "divide");
    assert_eq!(report.module_id.as_deref(), Some("app"));
    let span = report.span.as_ref().unwrap();
    assert_eq!(span.source_file, "app.wisp");
    assert_eq!(span.start, LineCol { line: 3, col: 1 });
    assert!(report.resume.is_none());

    assert_eq!(rt.run_blocking("divide", vec![HostValue::Int(5)]), Ok(HostValue::Int(2)));
}

#[test]
fn test_usage_errors() {
    let rt = runtime(ResumeKind::Resume);
    assert_eq!(
        rt.run_blocking("nope", vec![]),
        Err(RuntimeError::UnknownExport("nope".to_string()))
    );
    let err = rt.run_blocking("divide", vec![]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Usage);
}

#[test]
fn test_handler_invoked_once_per_request() {
    let mut rt = runtime(ResumeKind::Resume);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    rt.registry_mut()
        .register_label(
            "effect",
            Handler::resuming(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                HostValue::Int(0)
            }),
        )
        .unwrap();
    for _ in 0..3 {
        assert_eq!(rt.run_blocking("main", vec![]), Ok(HostValue::Int(1)));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn test_load_rejects_missing_resume_entry() {
    let mut module = effect_module(ResumeKind::Resume);
    module.exports.retain(|e| e.name != abi::RESUME_EXPORT);
    let err = Runtime::load(&module.encode(), RuntimeConfig::default()).unwrap_err();
    assert!(err.to_string().contains(abi::RESUME_EXPORT));
}
