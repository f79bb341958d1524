//! Effect table and runtime diagnostics sections.
//!
//! Operation indices are content-derived: every operation some `perform`
//! can request is collected, sorted by label and then by operation id,
//! and numbered densely from zero. The same program therefore always
//! produces the same table, independent of declaration or traversal order.

use std::collections::{BTreeSet, HashMap};
use std::ops::Range;

use wisp_runtime::table::TableError;
use wisp_runtime::{EffectTable, EffectTableEntry, FunctionDiagnostic, RuntimeDiagnostics};

use crate::content::{effect_id_hash, signature_hash};
use crate::effects::RowInterner;
use crate::hir::{ExprKind, OpRef, Program};
use crate::span::{LineIndex, Span};

/// Operation indices of one compiled program.
#[derive(Debug, Clone, Default)]
pub struct OpIndex {
    indices: HashMap<OpRef, u32>,
}

impl OpIndex {
    pub fn get(&self, op: OpRef) -> Option<u32> {
        self.indices.get(&op).copied()
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Qualified names of a program's effects under a module id.
#[derive(Debug, Clone, Copy)]
pub struct EffectNames<'a> {
    pub program: &'a Program,
    pub module_id: &'a str,
}

impl EffectNames<'_> {
    pub fn effect_id(&self, op: OpRef) -> String {
        let name = self
            .program
            .effects
            .get(op.effect.index as usize)
            .map_or("?", |e| e.name.as_str());
        format!("{}::{}", self.module_id, name)
    }

    pub fn label(&self, op: OpRef) -> String {
        let name = self.program.op_decl(op).map_or("?", |o| o.name.as_str());
        format!("{}.{}", self.effect_id(op), name)
    }
}

/// Every operation performed somewhere in the program.
fn performed_ops(program: &Program) -> BTreeSet<OpRef> {
    let mut ops = BTreeSet::new();
    for func in &program.functions {
        func.body.expr.any(&mut |e| {
            if let ExprKind::Perform { op, .. } = &e.kind {
                ops.insert(*op);
            }
            false
        });
    }
    ops
}

/// Build the effect table of `program`.
pub fn build_effect_table(
    names: EffectNames<'_>,
    rows: &RowInterner,
) -> Result<(EffectTable, OpIndex), TableError> {
    let program = names.program;
    let mut ops: Vec<(String, OpRef)> = performed_ops(program)
        .into_iter()
        .map(|op| (names.label(op), op))
        .collect();
    ops.sort_by(|(la, a), (lb, b)| la.cmp(lb).then(a.op.cmp(&b.op)));

    let label_of = |op: &OpRef| names.label(*op);
    let mut index = OpIndex::default();
    let mut entries = Vec::with_capacity(ops.len());
    for (label, op) in ops {
        let Some(decl) = program.op_decl(op) else {
            continue;
        };
        let op_index = entries.len() as u32;
        let effect_id = names.effect_id(op);
        entries.push(EffectTableEntry {
            op_index,
            effect_id_hash: effect_id_hash(&effect_id),
            effect_id,
            op_id: op.op,
            resume_kind: decl.resume_kind,
            signature_hash: signature_hash(&label, op.op, decl, rows, &label_of),
            label,
        });
        index.indices.insert(op, op_index);
    }
    Ok((EffectTable::new(entries)?, index))
}

/// Source location of a compiled function.
#[derive(Debug, Clone)]
pub struct FunctionOrigin {
    pub name: String,
    pub span: Span,
}

/// Runtime diagnostics for every function, given the code layout of the
/// emitted binary and each function's origin, by function index.
pub fn build_runtime_diagnostics(
    program: &Program,
    module_id: &str,
    layout: &[Range<u32>],
    origins: &[FunctionOrigin],
) -> RuntimeDiagnostics {
    let lines = LineIndex::new(program.source.as_deref().unwrap_or(""));
    let entries = layout
        .iter()
        .zip(origins)
        .map(|(code_range, origin)| {
            let (start, end) = lines.span_bounds(origin.span);
            FunctionDiagnostic {
                function_name: origin.name.clone(),
                module_id: module_id.to_string(),
                source_file: program.source_file.clone(),
                code_range: code_range.clone(),
                source_range: origin.span.to_u32_range(),
                start,
                end,
            }
        })
        .collect();
    RuntimeDiagnostics::new(entries)
}
