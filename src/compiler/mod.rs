//! Optimizing compilation
//!
//! The optimizer and the native backend are opaque collaborators behind the
//! [`Optimizer`] and [`Backend`] traits. [`CompilationPipeline`] drives them:
//! it decides what to compile, installs the results into version tables and
//! optionally persists them through the artifact store.

mod pipeline;

pub use pipeline::{CompilationPipeline, CompileEnv, CompileOutcome, CompileStats};

use crate::artifact::Hast;
use crate::config::{DebugOptions, Parameters};
use crate::context::ContextFingerprint;
use crate::dispatch::{CompiledVariant, FunctionId, NativeCode};
use crate::error::CompileFailure;
use crate::feedback::{FeedbackRef, ProfileStore};
use std::collections::BTreeSet;

/// Ask for `function` to be compiled under `context`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileRequest {
    pub function: FunctionId,
    pub context: ContextFingerprint,
}

impl CompileRequest {
    pub fn new(function: FunctionId, context: ContextFingerprint) -> Self {
        Self { function, context }
    }
}

/// Everything the optimizer may look at
#[derive(Debug)]
pub struct OptimizeRequest<'a> {
    pub function: FunctionId,
    pub name: &'a str,
    pub context: ContextFingerprint,
    pub baseline: &'a CompiledVariant,
    pub profiles: &'a ProfileStore,
    pub debug: &'a DebugOptions,
    pub parameters: &'a Parameters,
}

/// One closure version produced by the optimizer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosureVersion {
    pub function: FunctionId,
    pub context: ContextFingerprint,
    pub num_arguments: usize,
    /// Size of the optimized representation
    pub size: usize,
    /// Feedback slots the version speculated on. A version with speculation
    /// is installed behind a speculative gate.
    pub speculation: Vec<FeedbackRef>,
    /// Hasts of other units whose definitions the version relies on
    pub requests: BTreeSet<Hast>,
}

impl ClosureVersion {
    pub fn new(function: FunctionId, context: ContextFingerprint, num_arguments: usize) -> Self {
        Self {
            function,
            context,
            num_arguments,
            size: 0,
            speculation: Vec::new(),
            requests: BTreeSet::new(),
        }
    }

    pub fn is_speculative(&self) -> bool {
        !self.speculation.is_empty()
    }
}

/// Optimizer output: the requested version plus inner closures it compiled
/// along the way
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptimizedUnit {
    pub versions: Vec<ClosureVersion>,
}

pub trait Optimizer {
    fn optimize(&mut self, request: &OptimizeRequest<'_>) -> Result<OptimizedUnit, CompileFailure>;
}

pub trait Backend {
    /// Generate native code for one version.
    fn lower(&mut self, version: &ClosureVersion, name: &str) -> Result<NativeCode, CompileFailure>;

    /// Turn a persisted blob pair back into executable code.
    fn load(&mut self, symbol: &str, code: Vec<u8>, pool: Vec<u8>) -> Result<NativeCode, CompileFailure> {
        Ok(NativeCode {
            symbol: symbol.to_string(),
            code,
            pool,
        })
    }
}
