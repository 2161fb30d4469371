//! Deoptimization
//!
//! Deoptimization is ordinary control flow here: code that hits a failing
//! speculative guard returns [`ExecOutcome::Deoptimize`] with a
//! [`DeoptContext`], and every caller up the chain has to handle it.

mod propagate;

pub use propagate::{PropagationReport, TypeFeedbackPropagator};

use crate::dispatch::FunctionId;
use crate::ir::{FeedbackOrigin, Symbol, TypeSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeoptReasonKind {
    /// A type guard failed
    Typecheck,
    /// A branch assumed never taken was taken
    DeadBranchReached,
    /// The call target differs from the speculated one
    CallTarget,
    /// A call assumed unreachable was executed
    DeadCall,
    Unknown,
}

impl fmt::Display for DeoptReasonKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeoptReasonKind::Typecheck => write!(f, "Typecheck"),
            DeoptReasonKind::DeadBranchReached => write!(f, "DeadBranchReached"),
            DeoptReasonKind::CallTarget => write!(f, "CallTarget"),
            DeoptReasonKind::DeadCall => write!(f, "DeadCall"),
            DeoptReasonKind::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Why and where a guard failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeoptReason {
    pub kind: DeoptReasonKind,
    /// Source unit and pc of the feedback the failed guard was derived from
    pub origin: FeedbackOrigin,
}

impl DeoptReason {
    pub fn new(kind: DeoptReasonKind, origin: FeedbackOrigin) -> Self {
        Self { kind, origin }
    }

    pub fn src(&self) -> FunctionId {
        self.origin.src
    }

    pub fn pc(&self) -> u32 {
        self.origin.pc
    }
}

impl fmt::Display for DeoptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.kind, self.origin.src, self.origin.pc)
    }
}

/// The runtime fact that falsified the guard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeoptTrigger {
    Type(TypeSet),
    Branch(bool),
    Callee(FunctionId),
    None,
}

/// Everything known at the deoptimization point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeoptContext {
    pub reason: DeoptReason,
    pub trigger: DeoptTrigger,
    /// Types of the local variables captured at the deopt point
    pub env: Vec<(Symbol, TypeSet)>,
}

impl DeoptContext {
    pub fn new(reason: DeoptReason, trigger: DeoptTrigger) -> Self {
        Self {
            reason,
            trigger,
            env: Vec::new(),
        }
    }

    pub fn typecheck(origin: FeedbackOrigin, actual: TypeSet) -> Self {
        Self::new(
            DeoptReason::new(DeoptReasonKind::Typecheck, origin),
            DeoptTrigger::Type(actual),
        )
    }

    pub fn dead_branch(origin: FeedbackOrigin, taken: bool) -> Self {
        Self::new(
            DeoptReason::new(DeoptReasonKind::DeadBranchReached, origin),
            DeoptTrigger::Branch(taken),
        )
    }

    pub fn call_target(origin: FeedbackOrigin, callee: FunctionId) -> Self {
        Self::new(
            DeoptReason::new(DeoptReasonKind::CallTarget, origin),
            DeoptTrigger::Callee(callee),
        )
    }

    pub fn with_var(mut self, var: Symbol, ty: TypeSet) -> Self {
        self.env.push((var, ty));
        self
    }

    pub fn env_type(&self, var: Symbol) -> Option<TypeSet> {
        self.env.iter().find(|(v, _)| *v == var).map(|(_, t)| *t)
    }
}

/// Result of running speculatively compiled code
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum ExecOutcome<T> {
    Continue(T),
    Deoptimize(DeoptContext),
}

impl<T> ExecOutcome<T> {
    pub fn is_deopt(&self) -> bool {
        matches!(self, ExecOutcome::Deoptimize(_))
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> ExecOutcome<U> {
        match self {
            ExecOutcome::Continue(v) => ExecOutcome::Continue(f(v)),
            ExecOutcome::Deoptimize(ctx) => ExecOutcome::Deoptimize(ctx),
        }
    }

    /// Chain another step that only runs if this one did not deoptimize
    pub fn and_then<U, F: FnOnce(T) -> ExecOutcome<U>>(self, f: F) -> ExecOutcome<U> {
        match self {
            ExecOutcome::Continue(v) => f(v),
            ExecOutcome::Deoptimize(ctx) => ExecOutcome::Deoptimize(ctx),
        }
    }

    pub fn continued(self) -> Option<T> {
        match self {
            ExecOutcome::Continue(v) => Some(v),
            ExecOutcome::Deoptimize(_) => None,
        }
    }
}
