//! Metadata sections: the effect table and runtime diagnostics.
//!
//! Both sections are versioned. A reader that encounters a version it does
//! not know rejects the section outright instead of guessing its layout.

use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::module::{ByteReader, ByteWriter, DecodeError};

/// Custom section name of the effect table.
pub const EFFECT_TABLE_SECTION: &str = "wisp.effects";
/// Current effect table layout version.
pub const EFFECT_TABLE_VERSION: u32 = 1;

/// Custom section name of the runtime diagnostics table.
pub const DIAGNOSTICS_SECTION: &str = "wisp.diagnostics";
/// Current runtime diagnostics layout version.
pub const DIAGNOSTICS_VERSION: u32 = 1;

/// How an operation's continuation may be used by its handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResumeKind {
    /// The handler must resume the continuation exactly once.
    Resume,
    /// The handler's return value is the result; it never calls resume.
    Tail,
}

impl ResumeKind {
    fn to_u8(self) -> u8 {
        match self {
            ResumeKind::Resume => 0,
            ResumeKind::Tail => 1,
        }
    }

    fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(ResumeKind::Resume),
            1 => Some(ResumeKind::Tail),
            _ => None,
        }
    }
}

impl fmt::Display for ResumeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResumeKind::Resume => f.write_str("resume"),
            ResumeKind::Tail => f.write_str("tail"),
        }
    }
}

/// Errors reading a metadata section.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TableError {
    #[error("unsupported {section} version {found} (this runtime reads version {expected})")]
    UnsupportedVersion {
        section: &'static str,
        found: u32,
        expected: u32,
    },

    #[error("invalid resume kind {0}")]
    InvalidResumeKind(u8),

    #[error("effect table entry {position} has op index {op_index}")]
    NonDenseIndex { position: usize, op_index: u32 },

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

// ============================================================
// Effect table
// ============================================================

/// One requestable operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectTableEntry {
    /// Dense index used in Request outcomes.
    pub op_index: u32,
    /// Fully qualified effect name.
    pub effect_id: String,
    /// Content hash of `effect_id`.
    pub effect_id_hash: u64,
    /// Index of the operation within its effect declaration.
    pub op_id: u32,
    pub resume_kind: ResumeKind,
    /// Content hash of the operation's signature.
    pub signature_hash: u32,
    /// Human-readable `Effect.op` label.
    pub label: String,
}

/// The binary's catalogue of operations, indexed by `op_index`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectTable {
    entries: Vec<EffectTableEntry>,
}

impl EffectTable {
    /// Build a table. Entries must be ordered by a dense `op_index` from zero.
    pub fn new(entries: Vec<EffectTableEntry>) -> Result<Self, TableError> {
        for (position, entry) in entries.iter().enumerate() {
            if entry.op_index as usize != position {
                return Err(TableError::NonDenseIndex {
                    position,
                    op_index: entry.op_index,
                });
            }
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[EffectTableEntry] {
        &self.entries
    }

    pub fn get(&self, op_index: u32) -> Option<&EffectTableEntry> {
        self.entries.get(op_index as usize)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.u32(EFFECT_TABLE_VERSION);
        w.u32(self.entries.len() as u32);
        for entry in &self.entries {
            w.u32(entry.op_index);
            w.str(&entry.effect_id);
            w.u64(entry.effect_id_hash);
            w.u32(entry.op_id);
            w.u8(entry.resume_kind.to_u8());
            w.u32(entry.signature_hash);
            w.str(&entry.label);
        }
        w.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TableError> {
        let mut r = ByteReader::new(bytes);
        let version = r.u32()?;
        if version != EFFECT_TABLE_VERSION {
            return Err(TableError::UnsupportedVersion {
                section: EFFECT_TABLE_SECTION,
                found: version,
                expected: EFFECT_TABLE_VERSION,
            });
        }
        let count = r.u32()?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let op_index = r.u32()?;
            let effect_id = r.str()?;
            let effect_id_hash = r.u64()?;
            let op_id = r.u32()?;
            let kind = r.u8()?;
            let resume_kind = ResumeKind::from_u8(kind).ok_or(TableError::InvalidResumeKind(kind))?;
            let signature_hash = r.u32()?;
            let label = r.str()?;
            entries.push(EffectTableEntry {
                op_index,
                effect_id,
                effect_id_hash,
                op_id,
                resume_kind,
                signature_hash,
                label,
            });
        }
        Self::new(entries)
    }
}

// ============================================================
// Runtime diagnostics
// ============================================================

/// A 1-based line/column position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LineCol {
    pub line: u32,
    pub col: u32,
}

impl fmt::Display for LineCol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

/// Source information for one compiled function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionDiagnostic {
    pub function_name: String,
    pub module_id: String,
    pub source_file: String,
    /// Byte range of the function body within the binary.
    pub code_range: Range<u32>,
    /// Byte range of the function within its source file.
    pub source_range: Range<u32>,
    pub start: LineCol,
    pub end: LineCol,
}

/// Per-function source map, consulted only when reporting traps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeDiagnostics {
    entries: Vec<FunctionDiagnostic>,
}

impl RuntimeDiagnostics {
    pub fn new(mut entries: Vec<FunctionDiagnostic>) -> Self {
        entries.sort_by_key(|e| e.code_range.start);
        Self { entries }
    }

    pub fn entries(&self) -> &[FunctionDiagnostic] {
        &self.entries
    }

    /// Find the function whose code contains a byte offset.
    pub fn lookup(&self, offset: u32) -> Option<&FunctionDiagnostic> {
        let idx = self
            .entries
            .partition_point(|e| e.code_range.start <= offset)
            .checked_sub(1)?;
        let entry = &self.entries[idx];
        entry.code_range.contains(&offset).then_some(entry)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.u32(DIAGNOSTICS_VERSION);
        w.u32(self.entries.len() as u32);
        for e in &self.entries {
            w.str(&e.function_name);
            w.str(&e.module_id);
            w.str(&e.source_file);
            w.u32(e.code_range.start);
            w.u32(e.code_range.end);
            w.u32(e.source_range.start);
            w.u32(e.source_range.end);
            w.u32(e.start.line);
            w.u32(e.start.col);
            w.u32(e.end.line);
            w.u32(e.end.col);
        }
        w.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TableError> {
        let mut r = ByteReader::new(bytes);
        let version = r.u32()?;
        if version != DIAGNOSTICS_VERSION {
            return Err(TableError::UnsupportedVersion {
                section: DIAGNOSTICS_SECTION,
                found: version,
                expected: DIAGNOSTICS_VERSION,
            });
        }
        let count = r.u32()?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let function_name = r.str()?;
            let module_id = r.str()?;
            let source_file = r.str()?;
            let code_range = r.u32()?..r.u32()?;
            let source_range = r.u32()?..r.u32()?;
            let start = LineCol {
                line: r.u32()?,
                col: r.u32()?,
            };
            let end = LineCol {
                line: r.u32()?,
                col: r.u32()?,
            };
            entries.push(FunctionDiagnostic {
                function_name,
                module_id,
                source_file,
                code_range,
                source_range,
                start,
                end,
            });
        }
        Ok(Self::new(entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(op_index: u32, label: &str, kind: ResumeKind) -> EffectTableEntry {
        let (effect, _) = label.split_once('.').unwrap();
        EffectTableEntry {
            op_index,
            effect_id: effect.to_string(),
            effect_id_hash: 0xfeed_0000 + op_index as u64,
            op_id: op_index,
            resume_kind: kind,
            signature_hash: 7,
            label: label.to_string(),
        }
    }

    #[test]
    fn test_effect_table_decode() {
        let table = EffectTable::new(vec![
            entry(0, "Log.write", ResumeKind::Tail),
            entry(1, "Test.effect", ResumeKind::Resume),
        ])
        .unwrap();
        let decoded = EffectTable::decode(&table.encode()).unwrap();
        assert_eq!(decoded, table);
        assert_eq!(decoded.get(1).unwrap().label, "Test.effect");
    }

    #[test]
    fn test_effect_table_rejects_unknown_version() {
        let mut bytes = EffectTable::default().encode();
        bytes[0] = 2;
        assert_eq!(
            EffectTable::decode(&bytes),
            Err(TableError::UnsupportedVersion {
                section: EFFECT_TABLE_SECTION,
                found: 2,
                expected: EFFECT_TABLE_VERSION,
            })
        );
    }

    #[test]
    fn test_effect_table_requires_dense_indices() {
        let result = EffectTable::new(vec![entry(1, "Test.effect", ResumeKind::Resume)]);
        assert!(matches!(result, Err(TableError::NonDenseIndex { position: 0, .. })));
    }

    #[test]
    fn test_diagnostics_lookup_by_offset() {
        let make = |name: &str, code: Range<u32>| FunctionDiagnostic {
            function_name: name.to_string(),
            module_id: "m".to_string(),
            source_file: "m.wisp".to_string(),
            code_range: code,
            source_range: 0..10,
            start: LineCol { line: 1, col: 1 },
            end: LineCol { line: 2, col: 4 },
        };
        let diags = RuntimeDiagnostics::new(vec![make("b", 40..60), make("a", 10..40)]);
        assert_eq!(diags.lookup(10).unwrap().function_name, "a");
        assert_eq!(diags.lookup(45).unwrap().function_name, "b");
        assert!(diags.lookup(60).is_none());
        assert!(diags.lookup(3).is_none());

        let decoded = RuntimeDiagnostics::decode(&diags.encode()).unwrap();
        assert_eq!(decoded, diags);
    }

    #[test]
    fn test_diagnostics_reject_unknown_version() {
        let mut bytes = RuntimeDiagnostics::default().encode();
        bytes[0] = 0;
        assert!(matches!(
            RuntimeDiagnostics::decode(&bytes),
            Err(TableError::UnsupportedVersion { found: 0, .. })
        ));
    }
}
