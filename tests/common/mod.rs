//! Shared test helpers for integration tests

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use tierjit::artifact::{Ast, Hast};
use tierjit::compiler::{Backend, ClosureVersion, OptimizeRequest, OptimizedUnit, Optimizer};
use tierjit::dispatch::{FunctionId, NativeCode};
use tierjit::error::CompileFailure;
use tierjit::feedback::FeedbackRef;
use tierjit::{ContextFingerprint, Jit, JitConfig};

/// What the scripted optimizer and backend do, editable after the JIT owns them
#[derive(Debug, Default)]
pub struct Script {
    /// Functions the optimizer refuses
    pub reject: BTreeSet<FunctionId>,
    /// Functions the backend cannot lower
    pub backend_fail: BTreeSet<FunctionId>,
    /// Extra versions emitted alongside the requested one
    pub inner: BTreeMap<FunctionId, Vec<ClosureVersion>>,
    /// Feedback the requested version speculates on
    pub speculate: BTreeMap<FunctionId, Vec<FeedbackRef>>,
    /// Hasts the requested version relies on
    pub requests: BTreeMap<FunctionId, BTreeSet<Hast>>,
    /// Every (function, context) the optimizer was asked for
    pub optimized: Vec<(FunctionId, ContextFingerprint)>,
    /// Every function the backend lowered
    pub lowered: Vec<FunctionId>,
    /// Every blob symbol the backend loaded back
    pub loaded: Vec<String>,
}

pub type SharedScript = Rc<RefCell<Script>>;

pub struct ScriptedOptimizer(pub SharedScript);

impl Optimizer for ScriptedOptimizer {
    fn optimize(&mut self, request: &OptimizeRequest<'_>) -> Result<OptimizedUnit, CompileFailure> {
        let mut script = self.0.borrow_mut();
        script.optimized.push((request.function, request.context));
        if script.reject.contains(&request.function) {
            return Err(CompileFailure::Rejected(format!("{} refused", request.name)));
        }

        let mut main = ClosureVersion::new(request.function, request.context, request.baseline.num_arguments);
        main.size = request.baseline.body.size / 2;
        if let Some(refs) = script.speculate.get(&request.function) {
            main.speculation = refs.clone();
        }
        if let Some(requests) = script.requests.get(&request.function) {
            main.requests = requests.clone();
        }
        let mut versions = vec![main];
        if let Some(inner) = script.inner.get(&request.function) {
            versions.extend(inner.iter().cloned());
        }
        Ok(OptimizedUnit { versions })
    }
}

pub struct ScriptedBackend(pub SharedScript);

impl Backend for ScriptedBackend {
    fn lower(&mut self, version: &ClosureVersion, name: &str) -> Result<NativeCode, CompileFailure> {
        let mut script = self.0.borrow_mut();
        if script.backend_fail.contains(&version.function) {
            return Err(CompileFailure::Backend(format!("cannot lower {}", name)));
        }
        script.lowered.push(version.function);
        Ok(NativeCode {
            symbol: format!("{}_{:x}", name, version.context.bits()),
            code: vec![0x55, 0x48, 0x89, 0xe5, 0xc3],
            pool: name.as_bytes().to_vec(),
        })
    }

    fn load(&mut self, symbol: &str, code: Vec<u8>, pool: Vec<u8>) -> Result<NativeCode, CompileFailure> {
        self.0.borrow_mut().loaded.push(symbol.to_string());
        Ok(NativeCode {
            symbol: symbol.to_string(),
            code,
            pool,
        })
    }
}

/// JIT driven by a fresh script
pub fn jit_with(config: JitConfig) -> (Jit, SharedScript) {
    let script = SharedScript::default();
    let jit = Jit::new(
        config,
        Box::new(ScriptedOptimizer(script.clone())),
        Box::new(ScriptedBackend(script.clone())),
    );
    (jit, script)
}

/// JIT with default settings and pinned eviction
#[allow(dead_code)]
pub fn jit() -> (Jit, SharedScript) {
    jit_with(JitConfig::new().with_eviction_seed(42))
}

/// `{arg0 eager, arg0 simpleInt}`
#[allow(dead_code)]
pub fn simple_int0() -> ContextFingerprint {
    ContextFingerprint::new().set_simple_int(0)
}

/// Source tree of a small top-level function named `name`
#[allow(dead_code)]
pub fn unit_ast(name: &str) -> Ast {
    Ast::call(
        Ast::sym("function"),
        vec![
            Ast::List(vec![Ast::sym("x")]),
            Ast::call(Ast::sym(name), vec![Ast::sym("x"), Ast::Int(1)]),
        ],
    )
}

/// Inner version the optimizer emits for `function`
#[allow(dead_code)]
pub fn inner_version(function: FunctionId, context: ContextFingerprint) -> ClosureVersion {
    let mut version = ClosureVersion::new(function, context, 1);
    version.size = 8;
    version
}
