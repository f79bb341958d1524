//! Trampoline calling convention shared by the code generator and the host.
//!
//! Every effectful function returns an `Outcome` struct. A suspended
//! computation carries a `Cont`: a singly linked chain of frames, innermost
//! first, each holding a resume entry and the environment it restores.
//!
//! ```text
//! wisp.outcome { tag, value, op, args, cont }
//! wisp.cont    { head, last, resumed }
//! wisp.frame   { entry, next, env, kind }
//! ```

/// Struct type name of an Outcome.
pub const OUTCOME_TYPE: &str = "wisp.outcome";
/// Outcome field: `TAG_VALUE` or `TAG_REQUEST`.
pub const OUTCOME_TAG: u32 = 0;
/// Outcome field: the completed value (Value outcomes only).
pub const OUTCOME_VALUE: u32 = 1;
/// Outcome field: requested operation index into the effect table.
pub const OUTCOME_OP: u32 = 2;
/// Outcome field: argument struct of the request.
pub const OUTCOME_ARGS: u32 = 3;
/// Outcome field: continuation of the request.
pub const OUTCOME_CONT: u32 = 4;
/// Field names of the Outcome struct, in order.
pub const OUTCOME_FIELDS: [&str; 5] = ["tag", "value", "op", "args", "cont"];

/// Tag of a completed outcome.
pub const TAG_VALUE: i64 = 0;
/// Tag of a suspended outcome.
pub const TAG_REQUEST: i64 = 1;

/// Struct type name of a continuation.
pub const CONT_TYPE: &str = "wisp.cont";
pub const CONT_HEAD: u32 = 0;
pub const CONT_LAST: u32 = 1;
/// Nonzero once the continuation has been resumed.
pub const CONT_RESUMED: u32 = 2;
/// Field names of the continuation struct, in order.
pub const CONT_FIELDS: [&str; 3] = ["head", "last", "resumed"];

/// Struct type name of a continuation frame.
pub const FRAME_TYPE: &str = "wisp.frame";
/// Frame field: resume entry, a function reference taking `(frame, value)`.
pub const FRAME_ENTRY: u32 = 0;
pub const FRAME_NEXT: u32 = 1;
pub const FRAME_ENV: u32 = 2;
/// Frame field: `FRAME_KIND_CALL` or `FRAME_KIND_HANDLE`.
pub const FRAME_KIND: u32 = 3;
/// Field names of the frame struct, in order.
pub const FRAME_FIELDS: [&str; 4] = ["entry", "next", "env", "kind"];

/// A frame resumed with the callee's value.
pub const FRAME_KIND_CALL: i64 = 0;
/// A frame resumed with the full outcome of the handled body.
pub const FRAME_KIND_HANDLE: i64 = 1;

/// Export name of the program-wide resume entry `(cont, value) -> outcome`.
pub const RESUME_EXPORT: &str = "wisp.resume";

/// Struct type name for an argument tuple of the given arity.
pub fn args_type_name(arity: usize) -> String {
    format!("wisp.args{}", arity)
}
