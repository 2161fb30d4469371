//! Post-deoptimization type feedback repair
//!
//! Before a continuation is recompiled, feedback that the deoptimization
//! just proved wrong must not be fed to the optimizer again. The pass:
//!
//! 1. voids every piece of feedback if the deopt happened in a different
//!    source unit than the continuation's own, since nothing about it can be
//!    trusted;
//! 2. otherwise overwrites the feedback recorded at the failing pc with the
//!    falsifying fact, voids argument feedback contradicting the static
//!    argument type, and corrects variable loads whose feedback is disjoint
//!    from the type captured in the deopt environment;
//! 3. runs a worklist to a fixed point, re-inferring feedback for everything
//!    downstream of an affected instruction or reading an affected variable.
//!
//! Termination: every round that reports a change adds to either the
//! affected instruction set or the affected variable set, and both are
//! bounded by the continuation.

use super::{DeoptContext, DeoptReasonKind, DeoptTrigger};
use crate::ir::{ConstValue, Continuation, InstrId, Op, Operand, Symbol, TypeFeedback, TypeSet};
use rustc_hash::FxHashSet as HashSet;
use std::collections::BTreeSet;
use std::fmt;
use tracing::trace;

/// What the pass changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropagationReport {
    /// Any feedback was modified
    pub changed: bool,
    /// All feedback was dropped because the deopt came from another unit
    pub voided_all: bool,
    pub affected: BTreeSet<InstrId>,
    /// The variable whose load was the failing guard's subject
    pub changed_var: Option<String>,
    /// Variables tainted through stores and loads during propagation
    pub affected_vars: BTreeSet<String>,
    pub rounds: usize,
}

impl PropagationReport {
    pub fn is_affected(&self, id: InstrId) -> bool {
        self.affected.contains(&id)
    }
}

impl fmt::Display for PropagationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} instructions affected in {} rounds",
            self.affected.len(),
            self.rounds
        )?;
        if self.voided_all {
            write!(f, " (all feedback voided)")?;
        }
        if let Some(var) = &self.changed_var {
            write!(f, ", changed var {}", var)?;
        }
        if !self.affected_vars.is_empty() {
            let vars: Vec<&str> = self.affected_vars.iter().map(String::as_str).collect();
            write!(f, ", tainted vars {}", vars.join(","))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TypeFeedbackPropagator;

impl TypeFeedbackPropagator {
    pub fn new() -> Self {
        Self
    }

    /// Repair the feedback of `cont` given the deopt that led to it.
    pub fn apply(&self, cont: &mut Continuation, deopt: Option<&DeoptContext>) -> PropagationReport {
        let mut report = PropagationReport::default();
        let mut affected: HashSet<InstrId> = HashSet::default();
        let mut changed_var: Option<(Symbol, TypeFeedback)> = None;

        if let Some(ctx) = deopt {
            if ctx.reason.src() != cont.src {
                for instr in cont.instructions.iter_mut() {
                    if let Some(fb) = instr.feedback.as_mut() {
                        fb.ty = TypeSet::void();
                        report.changed = true;
                    }
                }
                report.voided_all = true;
            } else {
                changed_var = Self::seed(cont, ctx, &mut affected);
            }
        }
        if !affected.is_empty() {
            report.changed = true;
        }

        let mut other_vars: HashSet<Symbol> = HashSet::default();
        loop {
            report.rounds += 1;
            let changed = Self::round(cont, &mut affected, &changed_var, &mut other_vars);
            if changed {
                report.changed = true;
            } else {
                break;
            }
        }

        report.affected = affected.into_iter().collect();
        report.changed_var = changed_var.map(|(v, _)| cont.symbols.resolve(v).to_string());
        report.affected_vars = other_vars
            .into_iter()
            .map(|v| cont.symbols.resolve(v).to_string())
            .collect();
        report
    }

    /// Apply the deopt facts directly. Returns the variable whose load failed,
    /// with the corrected feedback for it.
    fn seed(
        cont: &mut Continuation,
        ctx: &DeoptContext,
        affected: &mut HashSet<InstrId>,
    ) -> Option<(Symbol, TypeFeedback)> {
        let mut changed_var: Option<(Symbol, TypeFeedback)> = None;
        let ids: Vec<InstrId> = cont.ids().collect();

        for id in ids {
            let Some(mut fb) = cont.get(id).feedback.clone() else {
                continue;
            };
            let mut touched = false;

            if fb.origin == Some(ctx.reason.origin) {
                match (ctx.reason.kind, ctx.trigger) {
                    (DeoptReasonKind::Typecheck, DeoptTrigger::Type(actual)) => fb.ty = actual,
                    (DeoptReasonKind::DeadBranchReached, DeoptTrigger::Branch(taken)) => {
                        fb.value = Some(ConstValue::Logical(taken))
                    }
                    // call target feedback carries no type to correct
                    _ => {}
                }
                let target = cont.follow_casts_and_force(id);
                if let Op::LdVar(var) = cont.get(target).op {
                    changed_var = Some((var, fb.clone()));
                }
                affected.insert(id);
                touched = true;
                trace!(instr = %id, ty = %fb.ty, "feedback at deopt pc replaced");
            }

            let instr = cont.get(id);
            if matches!(instr.op, Op::LdArg(_)) && !fb.ty.is_void() && (fb.ty & instr.ty).is_void() {
                fb.ty = TypeSet::void();
                affected.insert(id);
                touched = true;
                trace!(instr = %id, "stale argument feedback voided");
            }

            let mut target = cont.follow_casts_and_force(id);
            if matches!(instr.op, Op::Extract) {
                if let Some(vec) = instr.args.first().and_then(Operand::as_instr) {
                    target = cont.follow_casts_and_force(vec);
                }
            }
            if let Op::LdVar(var) = cont.get(target).op {
                let is_changed = changed_var.as_ref().map_or(false, |(v, _)| *v == var);
                if !fb.ty.is_void() && !is_changed {
                    if let Some(env_ty) = ctx.env_type(var) {
                        if env_ty != TypeSet::UNBOUND && (env_ty & fb.ty).is_void() {
                            fb.ty = env_ty;
                            affected.insert(id);
                            touched = true;
                            trace!(instr = %id, ty = %env_ty, "feedback corrected from deopt env");
                        }
                    }
                }
            }

            if touched {
                cont.get_mut(id).feedback = Some(fb);
            }
        }
        changed_var
    }

    /// One pass over the continuation. Returns whether anything changed.
    fn round(
        cont: &mut Continuation,
        affected: &mut HashSet<InstrId>,
        changed_var: &Option<(Symbol, TypeFeedback)>,
        other_vars: &mut HashSet<Symbol>,
    ) -> bool {
        let mut changed = false;
        let ids: Vec<InstrId> = cont.ids().collect();

        for id in ids {
            if affected.contains(&id) {
                continue;
            }
            let mut need_update = false;

            if let Some(var) = cont.loaded_variable(id) {
                if let Some((cv, cfb)) = changed_var {
                    if *cv == var {
                        let is_force = matches!(cont.get(id).op, Op::Force);
                        let mut fb = cfb.clone();
                        if is_force {
                            fb.ty = fb.ty.forced();
                        }
                        cont.get_mut(id).feedback = Some(fb);
                        affected.insert(id);
                        changed = true;
                        trace!(instr = %id, "load of changed variable updated");
                        continue;
                    }
                }
                if other_vars.contains(&var) {
                    need_update = true;
                }
            }

            let instr = cont.get(id);
            let mut all_inputs_have_feedback = true;
            for arg in &instr.args {
                match arg {
                    Operand::Instr(a) => {
                        if cont.get(*a).feedback_type().is_void() {
                            all_inputs_have_feedback = false;
                        }
                        if affected.contains(a) {
                            need_update = true;
                        }
                    }
                    Operand::Value(_) => all_inputs_have_feedback = false,
                }
            }

            if need_update {
                let var = match instr.op {
                    Op::StVar(v) | Op::LdVar(v) => Some(v),
                    _ => None,
                };
                if let Some(v) = var {
                    changed |= other_vars.insert(v);
                }
            }

            let has_feedback = instr.has_feedback();
            // leaves have nothing to re-infer from
            let stale = !instr.args.is_empty()
                && all_inputs_have_feedback
                && has_feedback
                && instr.feedback_type().is_void();
            if !((need_update && (has_feedback || matches!(instr.op, Op::Phi))) || stale) {
                continue;
            }

            affected.insert(id);
            let mut vals: HashSet<Option<ConstValue>> = HashSet::default();
            let inferred = instr.infer_type(|op| match op {
                Operand::Instr(a) => {
                    let input = cont.get(*a);
                    vals.insert(input.feedback.as_ref().and_then(|f| f.value.clone()));
                    let tf = input.feedback_type();
                    if tf.is_void() {
                        input.ty
                    } else {
                        tf
                    }
                }
                Operand::Value(v) => {
                    vals.insert(Some(v.clone()));
                    v.type_of()
                }
            });

            if need_update || !inferred.is_void() {
                let value = if vals.len() == 1 {
                    vals.into_iter().next().flatten()
                } else {
                    None
                };
                let fb = cont.get_mut(id).feedback_mut();
                fb.ty = inferred;
                fb.value = value;
                changed = true;
                trace!(instr = %id, ty = %inferred, "feedback re-inferred");
            }
        }
        changed
    }
}
