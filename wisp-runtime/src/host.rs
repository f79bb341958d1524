//! Host dispatch loop.
//!
//! ```text
//!  call export ──► Outcome ──► Value(v) ───────────────► done
//!                     │
//!                     └─► Request(op, args, k)
//!                             │ lookup handler (O(1))
//!                             ▼
//!                         handler(call, resumer)   ── may finish later
//!                             │ resume(v)
//!                             ▼
//!                     wisp.resume(k, v) ──► Outcome ──► ...
//! ```
//!
//! An [`Execution`] is a future. It never blocks: when a handler has not
//! resumed yet it stores its waker and returns `Pending`, and the handler's
//! completion (or cancellation) wakes it. Only one request is ever in
//! flight per execution, and the execution holds the instance mutably, so a
//! second concurrent resume into the same instance cannot be expressed.

use std::future::Future;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use crate::abi;
use crate::cancellation::CancellationToken;
use crate::config::RuntimeConfig;
use crate::continuation::{Completion, CompletionSlot, ExecutionSignal};
use crate::engine::{Instance, Trap, Value};
use crate::error::{
    ContinuationDirection, LoadError, ResumeContext, ResumeViolation, RuntimeError, SourceSpan,
    TrapReport,
};
use crate::module::{DecodedModule, Module, TrapCode};
use crate::registry::{EffectCall, HandlerRegistry};
use crate::table::{
    EffectTable, EffectTableEntry, ResumeKind, RuntimeDiagnostics, DIAGNOSTICS_SECTION,
    EFFECT_TABLE_SECTION,
};
use crate::timeout::{Timeout, TimeoutGuard};
use crate::value::HostValue;

/// Type indices of the calling convention, resolved once per load.
#[derive(Debug, Clone)]
struct AbiLayout {
    outcome: Option<u32>,
    resume_entry: Option<u32>,
}

/// A loaded binary with its metadata and registered handlers.
#[derive(Debug)]
pub struct Runtime {
    module: Arc<DecodedModule>,
    diagnostics: RuntimeDiagnostics,
    registry: HandlerRegistry,
    config: RuntimeConfig,
    abi: AbiLayout,
}

impl Runtime {
    /// Decode a binary and parse its metadata sections.
    pub fn load(bytes: &[u8], config: RuntimeConfig) -> Result<Self, LoadError> {
        config.validate()?;
        let decoded = Module::decode(bytes)?;
        let module = &decoded.module;

        let table = match module.custom_section(EFFECT_TABLE_SECTION) {
            Some(data) => EffectTable::decode(data)?,
            None => EffectTable::default(),
        };
        let diagnostics = match module.custom_section(DIAGNOSTICS_SECTION) {
            Some(data) => RuntimeDiagnostics::decode(data)?,
            None => RuntimeDiagnostics::default(),
        };

        let abi = AbiLayout {
            outcome: module.type_index(abi::OUTCOME_TYPE),
            resume_entry: module.export(abi::RESUME_EXPORT),
        };
        if module.functions.iter().any(|f| f.returns_outcome) {
            if abi.outcome.is_none() {
                return Err(LoadError::MissingAbiType(abi::OUTCOME_TYPE));
            }
            if abi.resume_entry.is_none() {
                return Err(LoadError::MissingResumeEntry(abi::RESUME_EXPORT));
            }
        }

        tracing::debug!(
            functions = module.functions.len(),
            operations = table.len(),
            "loaded module"
        );

        Ok(Self {
            module: Arc::new(decoded),
            diagnostics,
            registry: HandlerRegistry::new(Arc::new(table)),
            config,
            abi,
        })
    }

    pub fn effect_table(&self) -> &EffectTable {
        self.registry.table()
    }

    pub fn diagnostics(&self) -> &RuntimeDiagnostics {
        &self.diagnostics
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut HandlerRegistry {
        &mut self.registry
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn instantiate(&self) -> Instance {
        Instance::new(Arc::clone(&self.module), self.config.engine.max_call_depth)
    }

    /// Start calling `export` on `instance`. Nothing runs until polled.
    pub fn call<'a>(
        &'a self,
        instance: &'a mut Instance,
        export: &str,
        args: Vec<HostValue>,
    ) -> Execution<'a> {
        let execution = Execution {
            runtime: self,
            instance,
            export: export.to_string(),
            state: State::Start(args),
            signal: ExecutionSignal::new(),
            cancel: CancellationToken::none(),
            token: CancellationToken::none(),
            timeout: None,
        };
        match self.config.host.default_timeout {
            Some(duration) => execution.with_timeout(duration),
            None => execution,
        }
    }

    /// Run `export` on a fresh instance, blocking the current thread.
    pub fn run_blocking(&self, export: &str, args: Vec<HostValue>) -> Result<HostValue, RuntimeError> {
        let mut instance = self.instantiate();
        block_on(self.call(&mut instance, export, args))
    }

    fn tuple_type(&self, arity: usize) -> Option<u32> {
        self.module.module.type_index(&abi::args_type_name(arity))
    }

    /// Attach whatever the diagnostics section knows to a trap.
    fn annotate(&self, trap: Trap, resuming: Option<&EffectTableEntry>) -> RuntimeError {
        let located = self.diagnostics.lookup(trap.offset);
        let function_name = match located {
            Some(d) => d.function_name.clone(),
            None => self
                .module
                .module
                .functions
                .get(trap.function as usize)
                .map_or_else(|| format!("#{}", trap.function), |f| f.name.clone()),
        };
        let report = TrapReport {
            code: trap.code,
            function_index: trap.function,
            function_name,
            module_id: located.map(|d| d.module_id.clone()),
            span: located.map(|d| SourceSpan {
                source_file: d.source_file.clone(),
                byte_range: d.source_range.clone(),
                start: d.start,
                end: d.end,
            }),
            offset: trap.offset,
            resume: resuming.map(|entry| ResumeContext {
                effect_id: entry.effect_id.clone(),
                op_name: op_name(&entry.label).to_string(),
                direction: ContinuationDirection::Resuming,
            }),
        };
        tracing::debug!(%report, "execution trapped");
        match trap.code {
            TrapCode::DoubleResume => RuntimeError::DoubleResume(Box::new(ResumeViolation {
                label: resuming.map(|e| e.label.clone()),
                trap: Some(report),
            })),
            TrapCode::MissingTailResume => RuntimeError::MissingTailResume(Box::new(ResumeViolation {
                label: resuming.map(|e| e.label.clone()),
                trap: Some(report),
            })),
            _ => RuntimeError::WasmTrap(Box::new(report)),
        }
    }
}

fn op_name(label: &str) -> &str {
    label.rsplit_once('.').map_or(label, |(_, op)| op)
}

/// A decoded outcome.
#[derive(Debug)]
enum Outcome {
    Value(HostValue),
    Request(Request),
}

#[derive(Debug)]
struct Request {
    op_index: u32,
    args: Value,
    cont: Value,
}

/// A request whose handler has not resumed yet.
#[derive(Debug)]
struct Pending {
    op_index: u32,
    cont: Value,
    slot: Arc<CompletionSlot>,
}

#[derive(Debug)]
enum State {
    Start(Vec<HostValue>),
    Suspended(Pending),
    Done,
}

enum Step {
    Continue,
    Pending,
    Done(HostValue),
}

/// A running call of an export.
///
/// States: Running → Suspended → Running → … → Completed | Trapped |
/// Cancelled. Dropping an execution finishes it: any later resume from a
/// handler is rejected.
pub struct Execution<'a> {
    runtime: &'a Runtime,
    instance: &'a mut Instance,
    export: String,
    state: State,
    signal: Arc<ExecutionSignal>,
    /// Caller-supplied token.
    cancel: CancellationToken,
    /// Token actually observed: `cancel`, or the armed timeout beneath it.
    token: CancellationToken,
    timeout: Option<TimeoutGuard>,
}

impl fmt::Debug for Execution<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Execution")
            .field("export", &self.export)
            .field("state", &self.state)
            .field("token", &self.token.id())
            .field("deadline", &self.timeout.as_ref().map(TimeoutGuard::deadline))
            .finish_non_exhaustive()
    }
}

impl<'a> Execution<'a> {
    /// Resolve with `Cancelled` once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        match self.timeout.take() {
            Some(guard) => {
                let remaining = guard.deadline().remaining().unwrap_or(Duration::ZERO);
                self.with_timeout(remaining)
            }
            None => {
                self.token = self.cancel.clone();
                self
            }
        }
    }

    /// Cancel the execution if it has not finished after `duration`.
    ///
    /// Replaces any earlier timeout, including the configured default.
    pub fn with_timeout(mut self, duration: Duration) -> Self {
        let guard = Timeout::new(duration).arm(&self.cancel);
        self.token = guard.token();
        self.timeout = Some(guard);
        self
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self.state, State::Suspended(_))
    }

    fn step(&mut self, cx: &mut Context<'_>) -> Result<Step, RuntimeError> {
        if let Some(label) = self.signal.take_violation() {
            return Err(RuntimeError::DoubleResume(Box::new(ResumeViolation {
                label: Some(label),
                trap: None,
            })));
        }
        if self.token.is_cancelled() {
            return Err(RuntimeError::Cancelled {
                reason: self.token.reason(),
            });
        }

        let outcome = match std::mem::replace(&mut self.state, State::Done) {
            State::Done => return Err(RuntimeError::PolledAfterCompletion),
            State::Start(args) => self.start(args)?,
            State::Suspended(pending) => {
                let completion = match pending.slot.take() {
                    Completion::Pending => {
                        self.signal.set_waker(cx.waker());
                        self.token.register_waker(cx.waker());
                        // Re-check: the handler may have finished while the
                        // waker was being registered.
                        pending.slot.take()
                    }
                    other => other,
                };
                match completion {
                    Completion::Pending => {
                        self.state = State::Suspended(pending);
                        return Ok(Step::Pending);
                    }
                    Completion::Resumed(value) => self.resume(pending, value)?,
                    Completion::Abandoned => {
                        let label = self.entry(pending.op_index)?.label.clone();
                        return Err(RuntimeError::MissingTailResume(Box::new(ResumeViolation {
                            label: Some(label),
                            trap: None,
                        })));
                    }
                }
            }
        };

        match outcome {
            Outcome::Value(value) => Ok(Step::Done(value)),
            Outcome::Request(request) => {
                self.dispatch(request)?;
                Ok(Step::Continue)
            }
        }
    }

    fn start(&mut self, args: Vec<HostValue>) -> Result<Outcome, RuntimeError> {
        let runtime = self.runtime;
        let module = &runtime.module.module;
        let func = module
            .export(&self.export)
            .ok_or_else(|| RuntimeError::UnknownExport(self.export.clone()))?;
        let signature = &module.functions[func as usize];
        if signature.params as usize != args.len() {
            return Err(RuntimeError::ArgumentCount {
                export: self.export.clone(),
                expected: signature.params as usize,
                found: args.len(),
            });
        }
        let args = args
            .iter()
            .map(|a| a.to_engine(&|n| runtime.tuple_type(n)))
            .collect::<Result<Vec<_>, _>>()
            .map_err(RuntimeError::ValueConversion)?;

        tracing::trace!(export = %self.export, "calling export");
        let result = self
            .instance
            .invoke(func, args)
            .map_err(|trap| runtime.annotate(trap, None))?;

        if signature.returns_outcome {
            self.decode_outcome(result)
        } else {
            HostValue::from_engine(&result)
                .map(Outcome::Value)
                .map_err(RuntimeError::ValueConversion)
        }
    }

    fn resume(&mut self, pending: Pending, value: HostValue) -> Result<Outcome, RuntimeError> {
        let runtime = self.runtime;
        let entry = self.entry(pending.op_index)?;
        let value = value
            .to_engine(&|n| runtime.tuple_type(n))
            .map_err(RuntimeError::ValueConversion)?;
        let resume_entry = runtime
            .abi
            .resume_entry
            .ok_or_else(|| RuntimeError::MalformedOutcome(self.export.clone()))?;

        tracing::trace!(label = %entry.label, "resuming continuation");
        let result = self
            .instance
            .invoke(resume_entry, vec![pending.cont, value])
            .map_err(|trap| runtime.annotate(trap, Some(entry)))?;
        self.decode_outcome(result)
    }

    /// Hand a request to its host handler and suspend.
    fn dispatch(&mut self, request: Request) -> Result<(), RuntimeError> {
        let runtime = self.runtime;
        let entry = self.entry(request.op_index)?;
        let Some(handler) = runtime.registry.lookup(request.op_index) else {
            return Err(RuntimeError::UnhandledEffect {
                effect_id: entry.effect_id.clone(),
                op_name: op_name(&entry.label).to_string(),
                op_index: entry.op_index,
            });
        };

        let args = match HostValue::from_engine(&request.args).map_err(RuntimeError::ValueConversion)? {
            HostValue::Tuple(items) => items,
            HostValue::Unit => Vec::new(),
            other => vec![other],
        };
        let call = EffectCall {
            op_index: entry.op_index,
            effect_id: entry.effect_id.clone(),
            op_name: op_name(&entry.label).to_string(),
            label: entry.label.clone(),
            resume_kind: entry.resume_kind,
            args,
        };

        let slot = CompletionSlot::new(&entry.label, Arc::clone(&self.signal));
        tracing::trace!(label = %entry.label, "dispatching request to host handler");
        let returned = handler.call(&call, slot.resumer());

        match (entry.resume_kind, returned) {
            (ResumeKind::Tail, Some(value)) => {
                if slot.complete(value).is_err() {
                    return Err(RuntimeError::DoubleResume(Box::new(ResumeViolation {
                        label: Some(entry.label.clone()),
                        trap: None,
                    })));
                }
            }
            (ResumeKind::Resume, Some(_)) => {
                tracing::trace!(label = %entry.label, "ignoring return value of resume-kind handler");
            }
            (_, None) => {}
        }

        self.state = State::Suspended(Pending {
            op_index: request.op_index,
            cont: request.cont,
            slot,
        });
        Ok(())
    }

    fn entry(&self, op_index: u32) -> Result<&'a EffectTableEntry, RuntimeError> {
        let runtime: &'a Runtime = self.runtime;
        runtime
            .registry
            .table()
            .get(op_index)
            .ok_or_else(|| RuntimeError::MalformedOutcome(self.export.clone()))
    }

    fn decode_outcome(&self, value: Value) -> Result<Outcome, RuntimeError> {
        let malformed = || RuntimeError::MalformedOutcome(self.export.clone());
        let outcome = value.as_struct().ok_or_else(malformed)?;
        if Some(outcome.type_index()) != self.runtime.abi.outcome {
            return Err(malformed());
        }
        let field = |index| outcome.get(index).ok_or_else(malformed);
        match field(abi::OUTCOME_TAG)?.as_i64() {
            Some(abi::TAG_VALUE) => HostValue::from_engine(&field(abi::OUTCOME_VALUE)?)
                .map(Outcome::Value)
                .map_err(RuntimeError::ValueConversion),
            Some(abi::TAG_REQUEST) => {
                let op_index = field(abi::OUTCOME_OP)?
                    .as_i64()
                    .and_then(|op| u32::try_from(op).ok())
                    .ok_or_else(malformed)?;
                Ok(Outcome::Request(Request {
                    op_index,
                    args: field(abi::OUTCOME_ARGS)?,
                    cont: field(abi::OUTCOME_CONT)?,
                }))
            }
            _ => Err(malformed()),
        }
    }
}

impl Future for Execution<'_> {
    type Output = Result<HostValue, RuntimeError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if matches!(this.state, State::Done) && this.signal.is_finished() {
            return Poll::Ready(Err(RuntimeError::PolledAfterCompletion));
        }
        loop {
            match this.step(cx) {
                Ok(Step::Continue) => continue,
                Ok(Step::Pending) => return Poll::Pending,
                Ok(Step::Done(value)) => {
                    this.signal.finish();
                    return Poll::Ready(Ok(value));
                }
                Err(err) => {
                    this.state = State::Done;
                    this.signal.finish();
                    return Poll::Ready(Err(err));
                }
            }
        }
    }
}

impl Drop for Execution<'_> {
    fn drop(&mut self) {
        self.signal.finish();
    }
}

/// Drive a future to completion on the current thread.
///
/// Handlers completing on other threads wake the blocked thread through
/// the future's waker.
pub fn block_on<F: Future>(future: F) -> F::Output {
    pollster::block_on(future)
}
