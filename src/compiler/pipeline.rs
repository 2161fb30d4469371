//! Compilation pipeline
//!
//! `compile` runs the optimizer over a function's baseline, decides which of
//! the inner closures the optimizer produced are worth installing now,
//! lowers everything through the backend and only then touches the version
//! tables. A failure anywhere before installation leaves every table as it
//! was. Persisting the installed code is a side channel: its errors land in
//! the serializer report and never fail the compilation.

use super::{Backend, ClosureVersion, CompileRequest, OptimizeRequest, Optimizer};
use crate::artifact::{ArtifactStore, HastRegistry, StoreRequest};
use crate::config::{DebugFlags, JitConfig};
use crate::dispatch::{
    CodeBody, NativeCode, TableArena, Tier, VariantArena, VariantFlags, VariantId, VersionTable,
};
use crate::error::{CompileError, CompileFailure, SerializerError, SerializerReport};
use crate::feedback::{FeedbackSlot, ProfileStore, SpeculativeContext};
use std::fmt;
use tracing::{debug, info, trace, warn};

/// Mutable state a compilation may touch
pub struct CompileEnv<'a> {
    pub tables: &'a mut TableArena,
    pub variants: &'a mut VariantArena,
    pub profiles: &'a ProfileStore,
    pub registry: &'a mut HastRegistry,
    pub store: &'a ArtifactStore,
    pub report: &'a mut SerializerReport,
    pub config: &'a JitConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileOutcome {
    Installed {
        main: VariantId,
        inner: Vec<VariantId>,
    },
    /// An enabled native variant for the exact context already exists
    AlreadyCompiled(VariantId),
    /// Stopped after optimization
    DryRun { versions: usize },
    Failed(CompileError),
}

impl CompileOutcome {
    /// Variant now serving the requested context, if any
    pub fn variant(&self) -> Option<VariantId> {
        match self {
            CompileOutcome::Installed { main, .. } => Some(*main),
            CompileOutcome::AlreadyCompiled(id) => Some(*id),
            _ => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, CompileOutcome::Failed(_))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompileStats {
    pub attempts: u64,
    pub installed: u64,
    pub inner_installed: u64,
    pub inner_skipped: u64,
    pub already_compiled: u64,
    pub dry_runs: u64,
    pub failures: u64,
    pub persisted: u64,
}

impl fmt::Display for CompileStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Compilation Summary ===")?;
        writeln!(
            f,
            "Requests: {} total, {} installed, {} already compiled, {} dry runs, {} failed",
            self.attempts, self.installed, self.already_compiled, self.dry_runs, self.failures
        )?;
        writeln!(
            f,
            "Inner closures: {} installed, {} skipped",
            self.inner_installed, self.inner_skipped
        )?;
        writeln!(f, "Persisted: {}", self.persisted)?;
        Ok(())
    }
}

pub struct CompilationPipeline {
    optimizer: Box<dyn Optimizer>,
    backend: Box<dyn Backend>,
    stats: CompileStats,
}

impl CompilationPipeline {
    pub fn new(optimizer: Box<dyn Optimizer>, backend: Box<dyn Backend>) -> Self {
        Self {
            optimizer,
            backend,
            stats: CompileStats::default(),
        }
    }

    pub fn stats(&self) -> CompileStats {
        self.stats
    }

    pub fn backend_mut(&mut self) -> &mut dyn Backend {
        self.backend.as_mut()
    }

    fn fail<F>(&mut self, unit: &str, reason: CompileFailure, config: &JitConfig, on_failure: &mut F) -> CompileOutcome
    where
        F: FnMut(&CompileError),
    {
        self.stats.failures += 1;
        let error = CompileError::new(unit, reason);
        if config.debug.includes(DebugFlags::SHOW_WARNINGS) {
            warn!(unit, error = %error.reason, "compilation failed");
        } else {
            debug!(unit, error = %error.reason, "compilation failed");
        }
        on_failure(&error);
        CompileOutcome::Failed(error)
    }

    /// Compile `request` and install the result.
    ///
    /// # Panics
    ///
    /// When `request.function` has no version table.
    pub fn compile<F>(&mut self, env: CompileEnv<'_>, request: CompileRequest, mut on_failure: F) -> CompileOutcome
    where
        F: FnMut(&CompileError),
    {
        let CompileEnv {
            tables,
            variants,
            profiles,
            registry,
            store,
            report,
            config,
        } = env;
        self.stats.attempts += 1;

        let table = &tables[request.function];
        let name = table.name().to_string();
        let traced = config.debug.traces_function(&name);

        if let Some(existing) = table.find_native(variants, |c| c == request.context) {
            self.stats.already_compiled += 1;
            debug!(function = %request.function, context = %request.context, variant = %existing, "already compiled");
            return CompileOutcome::AlreadyCompiled(existing);
        }

        let baseline = &variants[table.baseline()];
        if baseline.flags.contains(VariantFlags::NOT_OPTIMIZABLE) {
            return self.fail(&name, CompileFailure::NotOptimizable, config, &mut on_failure);
        }
        if !config.parameters.admits(baseline.body.size) {
            let reason = CompileFailure::TooLarge {
                size: baseline.body.size,
                limit: config.parameters.max_input_size,
            };
            return self.fail(&name, reason, config, &mut on_failure);
        }

        let optimize = OptimizeRequest {
            function: request.function,
            name: &name,
            context: request.context,
            baseline,
            profiles,
            debug: &config.debug,
            parameters: &config.parameters,
        };
        let unit = match self.optimizer.optimize(&optimize) {
            Ok(unit) => unit,
            Err(reason) => return self.fail(&name, reason, config, &mut on_failure),
        };
        if traced && config.debug.includes(DebugFlags::PRINT_INTERMEDIATE) {
            for version in &unit.versions {
                debug!(
                    function = %version.function,
                    context = %version.context,
                    size = version.size,
                    speculation = version.speculation.len(),
                    requests = version.requests.len(),
                    "intermediate version"
                );
            }
        }
        if traced && config.debug.traces_pass("optimize") {
            debug!(pass = "optimize", function = %name, versions = unit.versions.len(), "pass done");
        }
        if traced && config.debug.includes(DebugFlags::PRINT_OPTIMIZED) {
            debug!(function = %name, context = %request.context, versions = unit.versions.len(), "optimized");
        }

        if config.debug.includes(DebugFlags::DRY_RUN) {
            self.stats.dry_runs += 1;
            info!(function = %name, context = %request.context, "dry run, nothing installed");
            return CompileOutcome::DryRun {
                versions: unit.versions.len(),
            };
        }

        let main_idx = unit
            .versions
            .iter()
            .position(|v| v.function == request.function && v.context == request.context);
        let Some(main_idx) = main_idx else {
            let reason = CompileFailure::Rejected(format!(
                "no version produced for context {}",
                request.context
            ));
            return self.fail(&name, reason, config, &mut on_failure);
        };

        let main_version = &unit.versions[main_idx];
        let main_code = match self.backend.lower(main_version, &name) {
            Ok(code) => code,
            Err(reason) => return self.fail(&name, reason, config, &mut on_failure),
        };

        let mut inner_code = Vec::new();
        for (i, version) in unit.versions.iter().enumerate() {
            if i == main_idx {
                continue;
            }
            let Some(inner_table) = tables.get(version.function) else {
                warn!(function = %version.function, "optimizer produced a version for an unknown function");
                continue;
            };
            if skip_inner(inner_table, variants, version, config.min_invocations_for_inner) {
                self.stats.inner_skipped += 1;
                trace!(function = %version.function, context = %version.context, "inner closure skipped");
                continue;
            }
            match self.backend.lower(version, inner_table.name()) {
                Ok(code) => inner_code.push((version, code)),
                Err(reason) => {
                    self.stats.inner_skipped += 1;
                    warn!(function = %version.function, error = %reason, "inner closure not lowered");
                }
            }
        }
        if traced && config.debug.traces_pass("lower") {
            debug!(pass = "lower", function = %name, inner = inner_code.len(), "pass done");
        }

        let mut installer = Installer {
            tables,
            variants,
            profiles,
            registry,
        };
        let main = installer.install(main_version, main_code);
        let mut installed = vec![(main_version, main)];
        for (version, code) in inner_code {
            let id = installer.install(version, code);
            installed.push((version, id));
        }
        let inner: Vec<VariantId> = installed[1..].iter().map(|(_, id)| *id).collect();
        self.stats.installed += 1;
        self.stats.inner_installed += inner.len() as u64;

        let chaos = config.parameters.serialize_chaos;
        let persist = config.serializer.enabled || (chaos > 0 && self.stats.installed % chaos as u64 == 0);
        if persist {
            let mut persisted = 0;
            let print = config.debug.includes(DebugFlags::PRINT_SERIALIZER);
            for (version, id) in &installed {
                let stored = persist_variant(&installer, store, report, version, *id, *id == main);
                if print {
                    info!(variant = %id, context = %version.context, stored, "serializer");
                }
                if stored {
                    persisted += 1;
                }
            }
            self.stats.persisted += persisted;
            report.stored += persisted as usize;
        }

        info!(
            function = %name,
            context = %request.context,
            variant = %main,
            inner = inner.len(),
            "compiled variant installed"
        );
        CompileOutcome::Installed { main, inner }
    }
}

/// Whether an inner closure version is not worth installing now
fn skip_inner(table: &VersionTable, variants: &VariantArena, version: &ClosureVersion, min_invocations: u64) -> bool {
    if table
        .find_native(variants, |c| version.context.smaller(&c))
        .is_some()
    {
        return true;
    }
    table.size() == 1 && variants[table.baseline()].invocation_count < min_invocations
}

struct Installer<'a> {
    tables: &'a mut TableArena,
    variants: &'a mut VariantArena,
    profiles: &'a ProfileStore,
    registry: &'a mut HastRegistry,
}

impl Installer<'_> {
    fn install(&mut self, version: &ClosureVersion, code: NativeCode) -> VariantId {
        let table = &mut self.tables[version.function];
        let src = self.variants[table.baseline()].body.src;
        let body = CodeBody::native(src, version.size, code);
        let id = self.variants.alloc(
            version.function,
            version.context,
            Tier::Optimized,
            version.num_arguments,
            body,
        );
        if version.is_speculative() {
            self.variants[id].speculation = Some(SpeculativeContext::capture(&version.speculation, self.profiles));
        }

        if let Some(info) = table.hast() {
            if self.registry.is_available(info.hast) {
                self.registry.mark_stale(info.hast);
            }
        }
        let outcome = if version.is_speculative() {
            table.insert_gated(self.variants, id)
        } else {
            table.insert(self.variants, id)
        };
        if let Some(link) = outcome.link {
            let linked = self.registry.try_link(&link);
            trace!(hast = %link.hast, outcome = ?linked, "link attempt");
        }
        if let Some(evicted) = outcome.evicted {
            debug!(function = %version.function, context = %evicted, "specialization evicted");
        }
        id
    }
}

/// Store one installed variant. Returns whether it was written.
fn persist_variant(
    installer: &Installer<'_>,
    store: &ArtifactStore,
    report: &mut SerializerReport,
    version: &ClosureVersion,
    id: VariantId,
    is_main: bool,
) -> bool {
    let variant = &installer.variants[id];
    let name = installer.tables[variant.function].name();
    let Some(info) = installer.registry.hast_info(variant.body.src) else {
        if is_main {
            report.record(SerializerError::UnavailableHast {
                unit: name.to_string(),
            });
        }
        return false;
    };
    if let Some(bad) = version
        .requests
        .iter()
        .copied()
        .find(|h| installer.registry.is_blacklisted(*h))
    {
        report.record(SerializerError::Blacklisted(bad));
        return false;
    }
    let Some(code) = variant.body.native.as_ref() else {
        return false;
    };
    let Some(digest) = installer.registry.digest_of(info.hast) else {
        return false;
    };
    // persisted speculation is restored against the linking function's own slots
    if let Some(foreign) = version.speculation.iter().find(|r| r.function != variant.function) {
        debug!(function = %name, slot = %foreign, "speculates on another function's feedback, not persisted");
        return false;
    }

    let mut request = StoreRequest {
        hast: info.hast,
        digest,
        name,
        offset: info.offset,
        context: variant.context,
        mask: 0,
        code,
        requests: version.requests.clone(),
        tf_slots: Vec::new(),
        tv_data: Vec::new(),
        fb_slots: Vec::new(),
        fb_data: Vec::new(),
    };
    for r in &version.speculation {
        match installer.profiles.get(*r) {
            Some(FeedbackSlot::Type(v)) => {
                request.tf_slots.push(r.slot);
                request.tv_data.push(v.encode());
            }
            Some(slot) => {
                if let Some(raw) = slot.value().encode_branch() {
                    request.fb_slots.push(r.slot);
                    request.fb_data.push(raw);
                }
            }
            None => {}
        }
    }

    match store.store(request) {
        Ok(_) => true,
        Err(e) => {
            report.record(e);
            false
        }
    }
}
