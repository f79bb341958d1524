//! Content hashing for effect table identities.
//!
//! Both hashes in the effect table are content-derived so that identical
//! declarations produce identical tables across builds and machines:
//!
//! | Field            | Input                                                    | Width |
//! |------------------|----------------------------------------------------------|-------|
//! | `effect_id_hash` | effect id                                                | 64    |
//! | `signature_hash` | format version, label, op id, param/return types, kind   | 32    |

use wisp_runtime::table::EFFECT_TABLE_VERSION;
use wisp_runtime::ResumeKind;

use crate::effects::row::RowInterner;
use crate::hir::{OpDecl, OpRef, Type};

/// Format version for hash computation.
/// Increment when changing what is fed to the hasher.
pub const FORMAT_VERSION: u8 = 1;

/// Incremental BLAKE3 hasher with little-endian integer updates.
#[derive(Debug, Clone)]
pub struct ContentHasher {
    hasher: blake3::Hasher,
}

impl ContentHasher {
    /// Create a new hasher with version prefix.
    pub fn new() -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&[FORMAT_VERSION]);
        Self { hasher }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn update_u8(&mut self, value: u8) {
        self.hasher.update(&[value]);
    }

    pub fn update_u32(&mut self, value: u32) {
        self.hasher.update(&value.to_le_bytes());
    }

    pub fn update_u64(&mut self, value: u64) {
        self.hasher.update(&value.to_le_bytes());
    }

    /// Length-prefixed string.
    pub fn update_str(&mut self, value: &str) {
        self.update_u32(value.len() as u32);
        self.hasher.update(value.as_bytes());
    }

    pub fn update_type(&mut self, ty: &Type, rows: &RowInterner, labels: &dyn Fn(&OpRef) -> String) {
        match ty {
            Type::Unit => self.update_u8(0),
            Type::Bool => self.update_u8(1),
            Type::Int => self.update_u8(2),
            Type::Float => self.update_u8(3),
            Type::Fn(fn_ty) => {
                self.update_u8(4);
                self.update_u32(fn_ty.params.len() as u32);
                for param in &fn_ty.params {
                    self.update_type(param, rows, labels);
                }
                self.update_type(&fn_ty.ret, rows, labels);
                let row = rows.get(fn_ty.effects);
                let mut ops: Vec<String> = row.ops.iter().map(labels).collect();
                ops.sort();
                self.update_u32(ops.len() as u32);
                for op in &ops {
                    self.update_str(op);
                }
                self.update_u8(row.open as u8);
            }
            Type::Cont(resume) => {
                self.update_u8(5);
                self.update_type(resume, rows, labels);
            }
            Type::Param(name) => {
                self.update_u8(6);
                self.update_str(name);
            }
        }
    }

    pub fn finalize(&self) -> [u8; 32] {
        *self.hasher.finalize().as_bytes()
    }

    pub fn finalize_u64(&self) -> u64 {
        let bytes = self.finalize();
        u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ])
    }

    pub fn finalize_u32(&self) -> u32 {
        let bytes = self.finalize();
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// `effect_id_hash` of an effect table entry.
pub fn effect_id_hash(effect_id: &str) -> u64 {
    let mut hasher = ContentHasher::new();
    hasher.update_str(effect_id);
    hasher.finalize_u64()
}

/// `signature_hash` of an effect table entry.
///
/// Host handlers are registered against this value, so any change to an
/// operation's declared shape invalidates previously written handlers.
pub fn signature_hash(
    label: &str,
    op_id: u32,
    op: &OpDecl,
    rows: &RowInterner,
    labels: &dyn Fn(&OpRef) -> String,
) -> u32 {
    let mut hasher = ContentHasher::new();
    hasher.update_u32(EFFECT_TABLE_VERSION);
    hasher.update_str(label);
    hasher.update_u32(op_id);
    hasher.update_u32(op.params.len() as u32);
    for param in &op.params {
        hasher.update_type(param, rows, labels);
    }
    hasher.update_type(&op.ret, rows, labels);
    hasher.update_u8(match op.resume_kind {
        ResumeKind::Resume => 0,
        ResumeKind::Tail => 1,
    });
    hasher.finalize_u32()
}
