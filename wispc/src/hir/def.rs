//! Definition identifiers for HIR.
//!
//! - [`DefId`] - Program-wide identifier for functions
//! - [`LocalId`] - Identifier for bindings within one body
//! - [`ExprId`] - Identifier for expressions within one body
//! - [`EffectId`] / [`OpRef`] - Identifiers for declared effects and their operations

use std::fmt;

use serde::{Deserialize, Serialize};

/// A program-wide identifier for a function definition.
///
/// DefIds are assigned by the producer of the program graph. Functions
/// synthesized during lowering receive fresh ids above the highest one in
/// the input.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DefId {
    pub index: u32,
}

impl DefId {
    pub const fn new(index: u32) -> Self {
        Self { index }
    }

    pub const fn index(self) -> u32 {
        self.index
    }
}

impl fmt::Debug for DefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DefId({})", self.index)
    }
}

impl fmt::Display for DefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "def{}", self.index)
    }
}

/// A local binding within a body.
///
/// LocalIds index `Body::locals`; the first `param_count` are parameters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalId {
    pub index: u32,
}

impl LocalId {
    pub const fn new(index: u32) -> Self {
        Self { index }
    }

    pub const fn index(self) -> u32 {
        self.index
    }
}

impl fmt::Debug for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "_{}", self.index)
    }
}

/// An expression within a body. Unique per body.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExprId {
    pub index: u32,
}

impl ExprId {
    pub const fn new(index: u32) -> Self {
        Self { index }
    }
}

impl fmt::Debug for ExprId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.index)
    }
}

/// A declared effect. Indexes `Program::effects`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EffectId {
    pub index: u32,
}

impl EffectId {
    pub const fn new(index: u32) -> Self {
        Self { index }
    }
}

impl fmt::Debug for EffectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Effect({})", self.index)
    }
}

/// One operation of a declared effect: `op` indexes the effect's `ops`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpRef {
    pub effect: EffectId,
    pub op: u32,
}

impl OpRef {
    pub const fn new(effect: EffectId, op: u32) -> Self {
        Self { effect, op }
    }
}
