//! JIT facade
//!
//! [`Jit`] owns every piece of tiered-compilation state (variants, version
//! tables, profiles, the hast registry, the artifact store) and exposes the
//! handful of operations the interpreter loop needs: create a closure,
//! dispatch a call, optimize, deoptimize, and query or mark variants.
//!
//! # Example
//! ```text
//! let mut jit = Jit::new(JitConfig::default(), Box::new(optimizer), Box::new(backend));
//! let f = jit.compile_closure(ClosureDef::new("f", 2, 40));
//! let ctx = ContextFingerprint::new().set_eager(0);
//! jit.optimize(f.function, ctx, |e| eprintln!("{}", e))?;
//! let variant = jit.call(f.function, ctx.set_eager(1))?;
//! ```

use crate::artifact::{
    hash_ast, ArtifactStore, Ast, CleanupMode, CleanupReport, HastRegistry, LinkOutcome,
    RegisterOutcome, RelinkReport,
};
use crate::compiler::{Backend, CompilationPipeline, CompileEnv, CompileOutcome, CompileRequest, CompileStats, Optimizer};
use crate::config::{DebugFlags, JitConfig, Parameters};
use crate::context::ContextFingerprint;
use crate::deopt::{DeoptContext, PropagationReport, TypeFeedbackPropagator};
use crate::dispatch::{
    CodeBody, CompiledVariant, DispatchEnv, FlagUpdate, FunctionId, GateInfo, HastInfo,
    LinkRequest, TableArena, Tier, VariantArena, VariantId, VersionTable,
};
use crate::error::{CompileError, Error, Result, SerializerReport};
use crate::feedback::{ProfileStore, SpeculativeContext};
use crate::ir::Continuation;
use crate::profiler::ContextualProfiler;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// A closure handed over by the baseline compiler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosureDef {
    pub name: String,
    pub num_arguments: usize,
    /// Size of the baseline representation
    pub size: usize,
    /// Source tree, when the closure is a top-level unit
    pub ast: Option<Ast>,
}

impl ClosureDef {
    pub fn new(name: impl Into<String>, num_arguments: usize, size: usize) -> Self {
        Self {
            name: name.into(),
            num_arguments,
            size,
            ast: None,
        }
    }

    pub fn with_ast(mut self, ast: Ast) -> Self {
        self.ast = Some(ast);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClosureHandle {
    pub function: FunctionId,
    pub baseline: VariantId,
}

/// Result of handling one deoptimization
#[derive(Debug, Clone)]
pub struct DeoptOutcome {
    pub variant: VariantId,
    pub deopt_count: u32,
    /// The variant hit the deopt limit and will no longer be dispatched to
    pub disabled: bool,
    pub report: PropagationReport,
    /// The continuation with repaired feedback, ready for recompilation
    pub continuation: Continuation,
}

pub struct Jit {
    config: JitConfig,
    variants: VariantArena,
    tables: TableArena,
    profiles: ProfileStore,
    registry: HastRegistry,
    store: ArtifactStore,
    report: SerializerReport,
    pipeline: CompilationPipeline,
    propagator: TypeFeedbackPropagator,
    profiler: ContextualProfiler,
    next_src: u32,
}

impl Jit {
    pub fn new(config: JitConfig, optimizer: Box<dyn Optimizer>, backend: Box<dyn Backend>) -> Self {
        let store = ArtifactStore::new(config.serializer.prefix.clone());
        Self {
            config,
            variants: VariantArena::new(),
            tables: TableArena::new(),
            profiles: ProfileStore::new(),
            registry: HastRegistry::new(),
            store,
            report: SerializerReport::new(),
            pipeline: CompilationPipeline::new(optimizer, backend),
            propagator: TypeFeedbackPropagator::new(),
            profiler: ContextualProfiler::new(),
            next_src: 0,
        }
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn parameters_mut(&mut self) -> &mut Parameters {
        &mut self.config.parameters
    }

    pub fn warmup_begin(&mut self) {
        self.config.parameters.warmup_begin();
    }

    pub fn warmup_end(&mut self) {
        self.config.parameters.warmup_end();
    }

    pub fn table(&self, function: FunctionId) -> Option<&VersionTable> {
        self.tables.get(function)
    }

    pub fn variant(&self, id: VariantId) -> Option<&CompiledVariant> {
        self.variants.get(id)
    }

    pub fn variants(&self) -> &VariantArena {
        &self.variants
    }

    pub fn profiles(&self) -> &ProfileStore {
        &self.profiles
    }

    pub fn profiles_mut(&mut self) -> &mut ProfileStore {
        &mut self.profiles
    }

    pub fn registry(&self) -> &HastRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut HastRegistry {
        &mut self.registry
    }

    pub fn serializer_report(&self) -> &SerializerReport {
        &self.report
    }

    pub fn profiler(&self) -> &ContextualProfiler {
        &self.profiler
    }

    pub fn stats(&self) -> CompileStats {
        self.pipeline.stats()
    }

    fn table_of(&self, function: FunctionId) -> Result<&VersionTable> {
        self.tables.get(function).ok_or(Error::UnknownFunction(function))
    }

    fn variant_of(&self, id: VariantId) -> Result<&CompiledVariant> {
        self.variants.get(id).ok_or(Error::UnknownVariant(id))
    }

    fn dispatch_env(&self) -> DispatchEnv<'_> {
        DispatchEnv {
            variants: &self.variants,
            profiles: &self.profiles,
            fast_case: self.config.fast_case_dispatch,
        }
    }

    fn new_table(&mut self, def: &ClosureDef) -> ClosureHandle {
        let function = self.tables.next_id();
        let src = self.next_src;
        self.next_src += 1;
        let baseline = self.variants.alloc(
            function,
            ContextFingerprint::BOTTOM,
            Tier::Baseline,
            def.num_arguments,
            CodeBody::baseline(src, def.size),
        );
        let seed = self.config.eviction_seed.map(|s| s.wrapping_add(function.0 as u64));
        let table = VersionTable::new(
            function,
            def.name.clone(),
            &self.variants[baseline],
            self.config.table_capacity,
            seed,
        );
        self.tables.add(table);
        ClosureHandle { function, baseline }
    }

    /// Register a closure compiled by the baseline tier and create its
    /// version table. A closure carrying its source tree gets a hast; with
    /// the serializer enabled, persisted code for it is linked right away.
    pub fn compile_closure(&mut self, def: ClosureDef) -> ClosureHandle {
        let handle = self.new_table(&def);
        let Some(ast) = def.ast.as_ref() else {
            return handle;
        };

        let hast = hash_ast(ast);
        match self.registry.register(hast, ast.digest(), handle.function, def.name.as_str()) {
            RegisterOutcome::Collision => {
                warn!(function = %def.name, hast = %hast, "hast collision, closure will not be persisted");
            }
            RegisterOutcome::Registered | RegisterOutcome::AlreadyRegistered(_) => {
                let info = HastInfo { hast, offset: 0 };
                self.tables[handle.function].set_hast(info);
                let src = self.variants[handle.baseline].body.src;
                self.registry.register_source(src, info);
                if self.config.serializer.enabled && self.registry.is_available(hast) {
                    self.link_persisted(handle.function);
                }
            }
        }
        handle
    }

    /// Register a closure defined at `offset` inside `parent`'s source unit.
    pub fn compile_inner_closure(
        &mut self,
        parent: FunctionId,
        offset: u32,
        def: ClosureDef,
    ) -> Result<ClosureHandle> {
        let parent_hast = self.table_of(parent)?.hast();
        let handle = self.new_table(&def);
        if let Some(parent_info) = parent_hast {
            let info = HastInfo {
                hast: parent_info.hast,
                offset,
            };
            self.tables[handle.function].set_hast(info);
            let src = self.variants[handle.baseline].body.src;
            self.registry.register_source(src, info);
            if self.config.serializer.enabled && self.registry.is_available(info.hast) {
                self.link_persisted(handle.function);
            }
        }
        Ok(handle)
    }

    /// Link every persisted variant available for `function`. Returns how
    /// many were installed. Code that speculated on feedback is guarded by
    /// its restored context and never runs while that speculation fails.
    /// An entry compiled from a different tree with the same hast gets the
    /// hast blacklisted and is deleted.
    fn link_persisted(&mut self, function: FunctionId) -> usize {
        let table = &self.tables[function];
        let Some(info) = table.hast() else {
            return 0;
        };
        let num_arguments = self.variants[table.baseline()].num_arguments;
        let src = self.variants[table.baseline()].body.src;
        let Some(meta) = self.store.lookup(info.hast) else {
            return 0;
        };
        if self.registry.digest_of(info.hast) != Some(meta.digest) {
            warn!(
                function = %function,
                hast = %info.hast,
                stored = %meta.name,
                "persisted code was compiled from a different tree, blacklisting"
            );
            self.registry.blacklist_hast(info.hast);
            if let Err(e) = self.store.remove(info.hast) {
                warn!(hast = %info.hast, error = %e, "cannot delete colliding artifact");
            }
            return 0;
        }
        let print = self.config.debug.includes(DebugFlags::PRINT_SERIALIZER);

        let mut linked = 0;
        for (offset, context) in self.registry.available_for(info.hast) {
            if offset != info.offset || context.is_bottom() {
                continue;
            }
            let request = LinkRequest {
                hast: info.hast,
                offset,
                context,
                num_arguments,
            };
            if self.registry.try_link(&request) != LinkOutcome::Linked {
                continue;
            }
            let Some(unit) = meta.get(offset, context.bits()) else {
                continue;
            };
            let Some(speculation) = SpeculativeContext::restore(
                function,
                &unit.tf_slots,
                &unit.binary.tv_data,
                &unit.fb_slots,
                &unit.binary.fb_data,
            ) else {
                warn!(hast = %info.hast, context = %context, "persisted feedback malformed, not linked");
                continue;
            };
            let stem = unit.binary.epoch.clone();
            let native = match self.store.read_blobs(&stem) {
                Ok((code, pool)) => self.pipeline.backend_mut().load(&stem, code, pool),
                Err(e) => {
                    warn!(hast = %info.hast, blob = %stem, error = %e, "persisted blob unreadable");
                    continue;
                }
            };
            let native = match native {
                Ok(native) => native,
                Err(reason) => {
                    warn!(hast = %info.hast, blob = %stem, error = %reason, "persisted blob rejected");
                    continue;
                }
            };
            let body = CodeBody::native(src, native.code.len(), native);
            let id = self
                .variants
                .alloc(function, context, Tier::Optimized, num_arguments, body);
            let speculative = !speculation.is_empty();
            if speculative {
                self.variants[id].speculation = Some(speculation);
                self.tables[function].insert_guarded(&mut self.variants, id);
            } else {
                self.tables[function].insert(&mut self.variants, id);
            }
            if print {
                info!(function = %function, blob = %stem, variant = %id, speculative, "serializer linked");
            }
            linked += 1;
        }
        if linked > 0 {
            info!(function = %function, hast = %info.hast, linked, "persisted variants linked");
        }
        linked
    }

    /// Pick the variant for a call presenting `context`.
    pub fn dispatch(&self, function: FunctionId, context: ContextFingerprint) -> Result<VariantId> {
        let table = self.table_of(function)?;
        Ok(table.dispatch(&self.dispatch_env(), context))
    }

    /// Dispatch and count the invocation.
    pub fn call(&mut self, function: FunctionId, context: ContextFingerprint) -> Result<VariantId> {
        let id = self.dispatch(function, context)?;
        self.variants.record_invocation(id);
        let dispatched = self.variants[id].context;
        let name = self.tables[function].name().to_string();
        self.profiler.record_call(function, &name, context, dispatched);
        if self.config.debug.includes(DebugFlags::PRINT_DISPATCH) {
            debug!(function = %name, context = %context, variant = %id, "dispatched");
        }
        Ok(id)
    }

    /// Compile `function` for `context` and install the result. Compilation
    /// failures go to `on_failure` and leave the table untouched.
    pub fn optimize<F>(&mut self, function: FunctionId, context: ContextFingerprint, on_failure: F) -> Result<CompileOutcome>
    where
        F: FnMut(&CompileError),
    {
        let name = self.table_of(function)?.name().to_string();
        let env = CompileEnv {
            tables: &mut self.tables,
            variants: &mut self.variants,
            profiles: &self.profiles,
            registry: &mut self.registry,
            store: &self.store,
            report: &mut self.report,
            config: &self.config,
        };
        let outcome = self
            .pipeline
            .compile(env, CompileRequest::new(function, context), on_failure);
        match &outcome {
            CompileOutcome::Installed { .. } | CompileOutcome::AlreadyCompiled(_) => {
                self.profiler.record_compilation(function, &name, context, true)
            }
            CompileOutcome::Failed(_) => self.profiler.record_compilation(function, &name, context, false),
            CompileOutcome::DryRun { .. } => {}
        }
        Ok(outcome)
    }

    /// Handle a failed speculative guard in `variant`: count the deopt,
    /// disable the variant at the limit and repair the continuation's
    /// feedback before it is recompiled.
    pub fn deoptimize(
        &mut self,
        variant: VariantId,
        mut continuation: Continuation,
        ctx: &DeoptContext,
    ) -> Result<DeoptOutcome> {
        self.variant_of(variant)?;
        let deopt_count = self.variants.record_deopt(variant, self.config.max_deopts);
        let disabled = self.variants[variant].disabled();
        let report = self.propagator.apply(&mut continuation, Some(ctx));

        if self.config.debug.includes(DebugFlags::PRINT_DEOPTS) {
            info!(variant = %variant, reason = %ctx.reason, deopt_count, disabled, "{}", report);
        } else {
            debug!(variant = %variant, reason = %ctx.reason, deopt_count, disabled, "deoptimized");
        }
        Ok(DeoptOutcome {
            variant,
            deopt_count,
            disabled,
            report,
            continuation,
        })
    }

    /// Returns whether the variant was enabled before.
    pub fn mark_variant_disabled(&mut self, id: VariantId) -> Result<bool> {
        self.variant_of(id)?;
        Ok(self.variants.disable(id))
    }

    pub fn invocation_count(&self, id: VariantId) -> Result<u64> {
        Ok(self.variant_of(id)?.invocation_count)
    }

    /// Invocation count of every slot, baseline first
    pub fn invocation_counts(&self, function: FunctionId) -> Result<Vec<u64>> {
        let table = self.table_of(function)?;
        let env = self.dispatch_env();
        Ok((0..table.size())
            .filter_map(|i| table.get(&env, i))
            .map(|id| self.variants[id].invocation_count)
            .collect())
    }

    pub fn mark_variant(&mut self, id: VariantId, update: FlagUpdate) -> Result<()> {
        self.variant_of(id)?;
        update.apply_to(&mut self.variants[id].flags);
        Ok(())
    }

    /// New function sharing `function`'s baseline and the variants that
    /// include every assumption of `udc`.
    pub fn with_user_context(&mut self, function: FunctionId, udc: ContextFingerprint) -> Result<FunctionId> {
        let id = self.tables.next_id();
        let clone = self.table_of(function)?.with_user_context(id, udc);
        Ok(self.tables.add(clone))
    }

    pub fn gate_info(&self, function: FunctionId, slot: usize) -> Option<GateInfo> {
        self.tables
            .get(function)?
            .gate(slot)
            .map(|g| g.info(&self.variants, &self.profiles))
    }

    /// Enable persisting compiled code, optionally under a new prefix.
    pub fn start_serializer(&mut self, prefix: Option<PathBuf>) {
        if let Some(prefix) = prefix {
            self.config.serializer.prefix = prefix;
        }
        self.config.serializer.enabled = true;
        self.store = ArtifactStore::new(self.config.serializer.prefix.clone());
        info!(prefix = %self.config.serializer.prefix.display(), "serializer started");
    }

    pub fn stop_serializer(&mut self) {
        self.config.serializer.enabled = false;
        info!("serializer stopped");
    }

    /// Delete persisted entries tainted by the registry's blacklist.
    pub fn cleanup_artifacts(&mut self, mode: CleanupMode) -> Result<CleanupReport> {
        self.store.cleanup(self.registry.blacklist(), mode)
    }

    /// Rescan the artifact directory and link what it holds into the
    /// existing tables.
    pub fn relink_artifacts(&mut self) -> Result<RelinkReport> {
        self.registry.clear_persisted();
        let report = self.store.relink(&mut self.registry)?;
        let candidates: Vec<FunctionId> = self
            .tables
            .iter()
            .filter(|t| t.hast().map_or(false, |h| self.registry.is_available(h.hast)))
            .map(|t| t.function())
            .collect();
        for function in candidates {
            self.link_persisted(function);
        }
        Ok(report)
    }
}
