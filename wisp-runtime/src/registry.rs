//! Host handler registration.
//!
//! Handlers are registered against entries of the binary's effect table,
//! either precisely by `(effect_id, op_id, signature_hash)` or through the
//! label-suffix convenience surface. Registration resolves everything up
//! front into a dense vector indexed by `op_index`, so the host loop finds
//! the handler for a request in O(1).

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::continuation::Resumer;
use crate::error::RegistrationError;
use crate::table::{EffectTable, EffectTableEntry, ResumeKind};
use crate::value::HostValue;

/// A request as seen by a handler.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectCall {
    pub op_index: u32,
    pub effect_id: String,
    pub op_name: String,
    pub label: String,
    pub resume_kind: ResumeKind,
    pub args: Vec<HostValue>,
}

impl EffectCall {
    pub fn arg(&self, index: usize) -> Option<&HostValue> {
        self.args.get(index)
    }
}

type HandlerFn = dyn Fn(&EffectCall, Resumer) -> Option<HostValue> + Send + Sync;

/// A host handler.
///
/// The handler receives the decoded request and a [`Resumer`]. Its return
/// value is interpreted according to the operation's resume kind:
///
/// | Kind     | `Some(v)`                          | `None`                              |
/// |----------|------------------------------------|-------------------------------------|
/// | `tail`   | the operation's result is `v`      | the handler resumes through `Resumer` |
/// | `resume` | ignored; the handler must resume   | the handler resumes through `Resumer` |
///
/// A request whose tickets are all dropped without resuming ends the
/// execution with `MissingTailResume`.
#[derive(Clone)]
pub struct Handler(Arc<HandlerFn>);

impl Handler {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&EffectCall, Resumer) -> Option<HostValue> + Send + Sync + 'static,
    {
        Handler(Arc::new(f))
    }

    /// A handler that resumes synchronously with the computed value.
    pub fn resuming<F>(f: F) -> Self
    where
        F: Fn(&EffectCall) -> HostValue + Send + Sync + 'static,
    {
        Handler::new(move |call, resumer| {
            // A failed resume means the execution is already finished or
            // poisoned; the host loop reports that on its own.
            let _ = resumer.resume(f(call));
            None
        })
    }

    /// A handler that answers by returning a value and never resumes.
    pub fn returning<F>(f: F) -> Self
    where
        F: Fn(&EffectCall) -> HostValue + Send + Sync + 'static,
    {
        Handler::new(move |call, _resumer| Some(f(call)))
    }

    pub(crate) fn call(&self, call: &EffectCall, resumer: Resumer) -> Option<HostValue> {
        (self.0)(call, resumer)
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Handler(..)")
    }
}

/// Handlers indexed by operation.
#[derive(Debug, Clone)]
pub struct HandlerRegistry {
    table: Arc<EffectTable>,
    by_op: HashMap<(String, u32), u32>,
    handlers: Vec<Option<Handler>>,
}

impl HandlerRegistry {
    pub fn new(table: Arc<EffectTable>) -> Self {
        let by_op = table
            .entries()
            .iter()
            .map(|e| ((e.effect_id.clone(), e.op_id), e.op_index))
            .collect();
        let handlers = vec![None; table.len()];
        Self {
            table,
            by_op,
            handlers,
        }
    }

    pub fn table(&self) -> &EffectTable {
        &self.table
    }

    /// Register `handler` for one operation.
    ///
    /// `signature_hash` must equal the table's hash for the operation; a
    /// mismatch means the handler was written against a different
    /// declaration and is rejected.
    pub fn register(
        &mut self,
        effect_id: &str,
        op_id: u32,
        signature_hash: u32,
        handler: Handler,
    ) -> Result<u32, RegistrationError> {
        let op_index = *self
            .by_op
            .get(&(effect_id.to_string(), op_id))
            .ok_or_else(|| RegistrationError::UnknownOperation {
                effect_id: effect_id.to_string(),
                op_id,
            })?;
        let entry = &self.table.entries()[op_index as usize];
        if entry.signature_hash != signature_hash {
            return Err(RegistrationError::SignatureMismatch {
                label: entry.label.clone(),
                expected: entry.signature_hash,
                found: signature_hash,
            });
        }
        self.install(op_index, handler);
        Ok(op_index)
    }

    /// Register a handler for the operation whose label ends with `suffix`.
    pub fn register_label(&mut self, suffix: &str, handler: Handler) -> Result<u32, RegistrationError> {
        let effect_id = self.register_labels([(suffix, handler)])?;
        self.table
            .entries()
            .iter()
            .find(|e| e.effect_id == effect_id && label_matches(&e.label, suffix))
            .map(|e| e.op_index)
            .ok_or_else(|| RegistrationError::UnknownLabel(suffix.to_string()))
    }

    /// Register several handlers of one effect by label suffix.
    ///
    /// The effect is chosen as the one with the most labels matched by the
    /// given suffixes; a tie between effects is an error. Returns the
    /// chosen effect id.
    pub fn register_labels<'s, I>(&mut self, handlers: I) -> Result<String, RegistrationError>
    where
        I: IntoIterator<Item = (&'s str, Handler)>,
    {
        let handlers: Vec<(&str, Handler)> = handlers.into_iter().collect();
        let suffixes: Vec<&str> = handlers.iter().map(|(s, _)| *s).collect();

        let mut by_effect: BTreeMap<&str, Vec<&EffectTableEntry>> = BTreeMap::new();
        for entry in self.table.entries() {
            by_effect.entry(entry.effect_id.as_str()).or_default().push(entry);
        }

        let mut best: Vec<&str> = Vec::new();
        let mut best_score = 0;
        for (effect_id, entries) in &by_effect {
            let score = suffixes
                .iter()
                .filter(|s| entries.iter().any(|e| label_matches(&e.label, s)))
                .count();
            if score > best_score {
                best_score = score;
                best = vec![*effect_id];
            } else if score == best_score && score > 0 {
                best.push(*effect_id);
            }
        }

        let effect_id = match best.as_slice() {
            [] => {
                return Err(RegistrationError::UnknownLabel(
                    suffixes.first().copied().unwrap_or_default().to_string(),
                ))
            }
            [only] => only.to_string(),
            several => {
                return Err(RegistrationError::AmbiguousLabel {
                    suffix: suffixes.join(", "),
                    candidates: several.iter().map(|s| s.to_string()).collect(),
                })
            }
        };

        let mut resolved = Vec::with_capacity(handlers.len());
        for (suffix, handler) in handlers {
            let op_index = by_effect[effect_id.as_str()]
                .iter()
                .find(|e| label_matches(&e.label, suffix))
                .map(|e| e.op_index)
                .ok_or_else(|| RegistrationError::UnknownLabel(suffix.to_string()))?;
            resolved.push((op_index, handler));
        }
        for (op_index, handler) in resolved {
            self.install(op_index, handler);
        }
        Ok(effect_id)
    }

    pub fn lookup(&self, op_index: u32) -> Option<&Handler> {
        self.handlers.get(op_index as usize)?.as_ref()
    }

    pub fn unregister(&mut self, op_index: u32) -> Option<Handler> {
        self.handlers.get_mut(op_index as usize)?.take()
    }

    fn install(&mut self, op_index: u32, handler: Handler) {
        let slot = &mut self.handlers[op_index as usize];
        if slot.is_some() {
            tracing::warn!(
                label = %self.table.entries()[op_index as usize].label,
                "replacing previously registered handler"
            );
        }
        *slot = Some(handler);
    }
}

/// Whether `label` ends with `suffix` at a path boundary.
fn label_matches(label: &str, suffix: &str) -> bool {
    if suffix.is_empty() || !label.ends_with(suffix) {
        return false;
    }
    let cut = label.len() - suffix.len();
    cut == 0 || matches!(label.as_bytes()[cut - 1], b'.' | b':' | b'/')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(op_index: u32, effect: &str, op_id: u32, op: &str) -> EffectTableEntry {
        EffectTableEntry {
            op_index,
            effect_id: effect.to_string(),
            effect_id_hash: 0,
            op_id,
            resume_kind: ResumeKind::Resume,
            signature_hash: 100 + op_index,
            label: format!("{}.{}", effect, op),
        }
    }

    fn registry() -> HandlerRegistry {
        let table = EffectTable::new(vec![
            entry(0, "app::Log", 0, "write"),
            entry(1, "app::Log", 1, "flush"),
            entry(2, "app::Sink", 0, "write"),
            entry(3, "app::Test", 0, "effect"),
        ])
        .unwrap();
        HandlerRegistry::new(Arc::new(table))
    }

    fn noop() -> Handler {
        Handler::returning(|_| HostValue::Unit)
    }

    #[test]
    fn test_register_checks_signature() {
        let mut reg = registry();
        assert_eq!(reg.register("app::Test", 0, 103, noop()), Ok(3));
        assert!(reg.lookup(3).is_some());
        assert_eq!(
            reg.register("app::Test", 0, 999, noop()),
            Err(RegistrationError::SignatureMismatch {
                label: "app::Test.effect".to_string(),
                expected: 103,
                found: 999,
            })
        );
        assert!(matches!(
            reg.register("app::Test", 4, 103, noop()),
            Err(RegistrationError::UnknownOperation { .. })
        ));
    }

    #[test]
    fn test_label_suffix_boundaries() {
        assert!(label_matches("app::Test.effect", "effect"));
        assert!(label_matches("app::Test.effect", "Test.effect"));
        assert!(label_matches("app::Test.effect", "app::Test.effect"));
        assert!(!label_matches("app::Test.effect", "fect"));
        assert!(!label_matches("app::Test.effect", ""));
    }

    #[test]
    fn test_register_label_unique() {
        let mut reg = registry();
        assert_eq!(reg.register_label("effect", noop()), Ok(3));
        assert_eq!(reg.register_label("Sink.write", noop()), Ok(2));
    }

    #[test]
    fn test_most_matching_effect_wins() {
        let mut reg = registry();
        let effect = reg
            .register_labels([("write", noop()), ("flush", noop())])
            .unwrap();
        assert_eq!(effect, "app::Log");
        assert!(reg.lookup(0).is_some());
        assert!(reg.lookup(1).is_some());
        assert!(reg.lookup(2).is_none());
    }

    #[test]
    fn test_tie_is_ambiguous() {
        let mut reg = registry();
        let err = reg.register_label("write", noop()).unwrap_err();
        assert_eq!(
            err,
            RegistrationError::AmbiguousLabel {
                suffix: "write".to_string(),
                candidates: vec!["app::Log".to_string(), "app::Sink".to_string()],
            }
        );
        assert!(reg.lookup(0).is_none());
    }

    #[test]
    fn test_unknown_label() {
        let mut reg = registry();
        assert_eq!(
            reg.register_label("missing", noop()),
            Err(RegistrationError::UnknownLabel("missing".to_string()))
        );
    }
}
