//! Backward liveness over the structured body of one compiled function.
//!
//! The result is, for every call, `perform` and `handle` expression, the set
//! of slots that are read after the expression completes. A continuation
//! frame only has to preserve those.
//!
//! Loops are solved to a fixpoint. A `handle` is a loop too: after its body
//! or a clause finishes, control returns to the dispatch loop, which may run
//! any clause again. `return` kills everything.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use crate::hir::{Expr, ExprId, ExprKind, LocalId, Stmt};

/// A local variable slot of a compiled function. Source bindings come
/// first, spill temporaries after them.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Slot(pub u32);

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}", self.0)
    }
}

pub type SlotSet = BTreeSet<Slot>;

/// Layout facts the analysis needs about the function being compiled.
#[derive(Debug, Clone, Copy)]
pub struct LivenessInput<'a> {
    /// Slot of every source binding, indexed by `LocalId`.
    pub slots: &'a [Slot],
    /// Spill temporaries per operand list, one per spilled operand.
    pub spills: &'a HashMap<ExprId, Vec<Slot>>,
    /// Bindings passed to each lifted handled body.
    pub handle_captures: &'a HashMap<ExprId, Vec<LocalId>>,
}

/// Compute live-after sets of every call, `perform` and `handle` in `body`.
pub fn live_after_sites(body: &Expr, input: LivenessInput<'_>) -> HashMap<ExprId, SlotSet> {
    let mut analysis = Liveness {
        input,
        live_after: HashMap::new(),
    };
    analysis.live_in(body, SlotSet::new());
    analysis.live_after
}

struct Liveness<'a> {
    input: LivenessInput<'a>,
    live_after: HashMap<ExprId, SlotSet>,
}

impl Liveness<'_> {
    fn slot(&self, local: LocalId) -> Slot {
        self.input
            .slots
            .get(local.index as usize)
            .copied()
            .unwrap_or(Slot(local.index))
    }

    fn live_in(&mut self, expr: &Expr, out: SlotSet) -> SlotSet {
        match &expr.kind {
            ExprKind::Literal(_) | ExprKind::Def(_) => out,
            ExprKind::Local(id) => {
                let mut live = out;
                live.insert(self.slot(*id));
                live
            }
            ExprKind::Unary { operand, .. } => self.live_in(operand, out),
            ExprKind::Binary { left, right, .. } => {
                self.operands(expr.id, &[left.as_ref(), right.as_ref()], out)
            }
            ExprKind::Perform { args, .. } => {
                self.live_after.insert(expr.id, out.clone());
                let args: Vec<&Expr> = args.iter().collect();
                self.operands(expr.id, &args, out)
            }
            ExprKind::Call { callee, args } => {
                self.live_after.insert(expr.id, out.clone());
                // A local callee is read after the arguments.
                let mut live = out;
                if let ExprKind::Local(id) = &callee.kind {
                    live.insert(self.slot(*id));
                }
                let args: Vec<&Expr> = args.iter().collect();
                self.operands(expr.id, &args, live)
            }
            ExprKind::Block { stmts, expr: tail } => {
                let mut live = match tail {
                    Some(e) => self.live_in(e, out),
                    None => out,
                };
                for stmt in stmts.iter().rev() {
                    match stmt {
                        Stmt::Let { local, init } => {
                            live.remove(&self.slot(*local));
                            live = self.live_in(init, live);
                        }
                        Stmt::Expr(e) => live = self.live_in(e, live),
                    }
                }
                live
            }
            ExprKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                let mut branches = self.live_in(then_branch, out.clone());
                match else_branch {
                    Some(e) => branches.extend(self.live_in(e, out)),
                    None => branches.extend(out),
                }
                self.live_in(condition, branches)
            }
            ExprKind::While { condition, body } => {
                let mut head = SlotSet::new();
                loop {
                    let mut after_cond = out.clone();
                    after_cond.extend(self.live_in(body, head.clone()));
                    let next = self.live_in(condition, after_cond);
                    if next == head {
                        break head;
                    }
                    head = next;
                }
            }
            ExprKind::Assign { target, value } => {
                let mut live = out;
                live.remove(&self.slot(*target));
                self.live_in(value, live)
            }
            ExprKind::Return(value) => match value {
                Some(v) => self.live_in(v, SlotSet::new()),
                None => SlotSet::new(),
            },
            ExprKind::Resume { cont, value } => {
                let mut live = out;
                live.insert(self.slot(*cont));
                self.live_in(value, live)
            }
            ExprKind::Handle { clauses, .. } => {
                // `head` is live at the top of the dispatch loop.
                let mut head = out.clone();
                loop {
                    let mut next = out.clone();
                    for clause in clauses {
                        let k = self.slot(clause.cont);
                        let mut clause_out = head.clone();
                        clause_out.insert(k);
                        let mut live = self.live_in(&clause.body, clause_out);
                        live.remove(&k);
                        for param in &clause.params {
                            live.remove(&self.slot(*param));
                        }
                        next.extend(live);
                    }
                    if next == head {
                        break;
                    }
                    head = next;
                }
                self.live_after.insert(expr.id, head.clone());
                let mut live = head;
                if let Some(captures) = self.input.handle_captures.get(&expr.id) {
                    for local in captures {
                        live.insert(self.slot(*local));
                    }
                }
                live
            }
        }
    }

    /// Operands evaluated left to right, some of them into spill temporaries
    /// that are reloaded right before the operation.
    fn operands(&mut self, id: ExprId, operands: &[&Expr], out: SlotSet) -> SlotSet {
        let mut live = out;
        match self.input.spills.get(&id) {
            Some(temps) => {
                let spilled = temps.len().min(operands.len());
                for operand in operands[spilled..].iter().rev() {
                    live = self.live_in(operand, live);
                }
                live.extend(temps.iter().copied());
                for i in (0..spilled).rev() {
                    live.remove(&temps[i]);
                    live = self.live_in(operands[i], live);
                }
            }
            None => {
                for operand in operands.iter().rev() {
                    live = self.live_in(operand, live);
                }
            }
        }
        live
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hir::{BinOp, BodyBuilder, EffectId, OpRef, Type};

    fn identity_slots(n: u32) -> Vec<Slot> {
        (0..n).map(Slot).collect()
    }

    #[test]
    fn test_live_after_perform() {
        // let a = 1; let b = 2; let c = perform(); a + c
        let mut b = BodyBuilder::new();
        let a = b.local("a", Type::Int);
        let unused = b.local("b", Type::Int);
        let c = b.local("c", Type::Int);
        let one = b.int(1);
        let two = b.int(2);
        let perform = b.perform(OpRef::new(EffectId::new(0), 0), vec![], Type::Int);
        let perform_id = perform.id;
        let stmts = vec![b.let_stmt(a, one), b.let_stmt(unused, two), b.let_stmt(c, perform)];
        let get_a = b.local_ref(a);
        let get_c = b.local_ref(c);
        let sum = b.binary(BinOp::Add, get_a, get_c);
        let block = b.block(stmts, Some(sum));
        let body = b.finish(block);

        let slots = identity_slots(3);
        let spills = HashMap::new();
        let captures = HashMap::new();
        let live = live_after_sites(
            &body.expr,
            LivenessInput {
                slots: &slots,
                spills: &spills,
                handle_captures: &captures,
            },
        );
        assert_eq!(live[&perform_id], SlotSet::from([Slot(0)]));
    }

    #[test]
    fn test_loop_keeps_variables_live() {
        // while i < n { perform(); i = i + 1 }
        let mut b = BodyBuilder::new();
        let n = b.param("n", Type::Int);
        let i = b.local("i", Type::Int);
        let get_i = b.local_ref(i);
        let get_n = b.local_ref(n);
        let cond = b.binary(BinOp::Lt, get_i, get_n);
        let perform = b.perform(OpRef::new(EffectId::new(0), 0), vec![], Type::Unit);
        let perform_id = perform.id;
        let get_i = b.local_ref(i);
        let one = b.int(1);
        let inc = b.binary(BinOp::Add, get_i, one);
        let assign = b.assign(i, inc);
        let loop_body = b.block(vec![Stmt::Expr(perform), Stmt::Expr(assign)], None);
        let lp = b.while_loop(cond, loop_body);
        let body = b.finish(lp);

        let slots = identity_slots(2);
        let spills = HashMap::new();
        let captures = HashMap::new();
        let live = live_after_sites(
            &body.expr,
            LivenessInput {
                slots: &slots,
                spills: &spills,
                handle_captures: &captures,
            },
        );
        assert_eq!(live[&perform_id], SlotSet::from([Slot(0), Slot(1)]));
    }

    #[test]
    fn test_spilled_operand_is_live() {
        // x + perform()  with x spilled into slot 1
        let mut b = BodyBuilder::new();
        let x = b.param("x", Type::Int);
        let get_x = b.local_ref(x);
        let perform = b.perform(OpRef::new(EffectId::new(0), 0), vec![], Type::Int);
        let perform_id = perform.id;
        let sum = b.binary(BinOp::Add, get_x, perform);
        let sum_id = sum.id;
        let body = b.finish(sum);

        let slots = identity_slots(1);
        let spills = HashMap::from([(sum_id, vec![Slot(1), Slot(2)])]);
        let captures = HashMap::new();
        let live = live_after_sites(
            &body.expr,
            LivenessInput {
                slots: &slots,
                spills: &spills,
                handle_captures: &captures,
            },
        );
        assert_eq!(live[&perform_id], SlotSet::from([Slot(1)]));
    }
}
