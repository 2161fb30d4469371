//! Compiled function variants and the arena that owns them

use super::{FunctionId, VariantId};
use crate::context::ContextFingerprint;
use crate::feedback::SpeculativeContext;
use bitflags::bitflags;
use std::fmt;
use std::ops::{Index, IndexMut};

bitflags! {
    /// Per-variant optimizer hints
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct VariantFlags: u16 {
        /// Compile at the next opportunity
        const MARK_OPT = 1 << 0;
        const NOT_OPTIMIZABLE = 1 << 1;
        const FORCE_INLINE = 1 << 2;
        const DISABLE_INLINE = 1 << 3;
        const DISABLE_ALL_SPECIALIZATION = 1 << 4;
        const DISABLE_ARGUMENT_TYPE_SPECIALIZATION = 1 << 5;
        const DISABLE_NUM_ARGUMENTS_SPECIALIZATION = 1 << 6;
        const DEPROMISE_ARGS = 1 << 7;
    }
}

impl VariantFlags {
    /// Apply a tri-state update: `Some(true)` sets, `Some(false)` clears,
    /// `None` leaves the flag alone.
    pub fn apply(&mut self, flag: VariantFlags, update: Option<bool>) {
        match update {
            Some(true) => {
                self.insert(flag);
                if flag.contains(VariantFlags::MARK_OPT) {
                    self.remove(VariantFlags::NOT_OPTIMIZABLE);
                }
            }
            Some(false) => self.remove(flag),
            None => {}
        }
    }
}

/// Tri-state updates applied by [`VariantFlags::apply`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlagUpdate {
    pub mark_opt: Option<bool>,
    pub not_optimizable: Option<bool>,
    pub force_inline: Option<bool>,
    pub disable_inline: Option<bool>,
    pub disable_all_specialization: Option<bool>,
    pub disable_argument_type_specialization: Option<bool>,
    pub disable_num_arguments_specialization: Option<bool>,
    pub depromise_args: Option<bool>,
}

impl FlagUpdate {
    pub fn apply_to(&self, flags: &mut VariantFlags) {
        flags.apply(VariantFlags::NOT_OPTIMIZABLE, self.not_optimizable);
        flags.apply(VariantFlags::MARK_OPT, self.mark_opt);
        flags.apply(VariantFlags::FORCE_INLINE, self.force_inline);
        flags.apply(VariantFlags::DISABLE_INLINE, self.disable_inline);
        flags.apply(VariantFlags::DISABLE_ALL_SPECIALIZATION, self.disable_all_specialization);
        flags.apply(
            VariantFlags::DISABLE_ARGUMENT_TYPE_SPECIALIZATION,
            self.disable_argument_type_specialization,
        );
        flags.apply(
            VariantFlags::DISABLE_NUM_ARGUMENTS_SPECIALIZATION,
            self.disable_num_arguments_specialization,
        );
        flags.apply(VariantFlags::DEPROMISE_ARGS, self.depromise_args);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tier {
    Baseline,
    Optimized,
}

/// Native code produced by the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeCode {
    /// Linker symbol of the entry point
    pub symbol: String,
    pub code: Vec<u8>,
    /// Constant pool companion of `code`
    pub pool: Vec<u8>,
}

/// Executable body of a variant
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CodeBody {
    /// Index of the defining source in the source pool
    pub src: u32,
    /// Size of the baseline representation, used for optimizer admission
    pub size: usize,
    pub native: Option<NativeCode>,
}

impl CodeBody {
    pub fn baseline(src: u32, size: usize) -> Self {
        Self {
            src,
            size,
            native: None,
        }
    }

    pub fn native(src: u32, size: usize, native: NativeCode) -> Self {
        Self {
            src,
            size,
            native: Some(native),
        }
    }
}

/// One compiled version of a function
#[derive(Debug, Clone)]
pub struct CompiledVariant {
    pub id: VariantId,
    pub function: FunctionId,
    pub context: ContextFingerprint,
    pub tier: Tier,
    pub num_arguments: usize,
    pub body: CodeBody,
    pub invocation_count: u64,
    pub flags: VariantFlags,
    pub speculation: Option<SpeculativeContext>,
    deopt_count: u32,
    disabled: bool,
}

impl CompiledVariant {
    pub fn is_baseline(&self) -> bool {
        self.tier == Tier::Baseline
    }

    pub fn is_native(&self) -> bool {
        self.body.native.is_some()
    }

    pub fn disabled(&self) -> bool {
        self.disabled
    }

    pub fn deopt_count(&self) -> u32 {
        self.deopt_count
    }

    /// Carry deopt history over from a variant this one replaces
    pub fn add_deopt_count(&mut self, n: u32) {
        self.deopt_count = self.deopt_count.saturating_add(n);
    }

    /// Whether the live profile still matches what this variant speculated on
    pub fn matches_speculation(&self, profiles: &crate::feedback::ProfileStore) -> bool {
        self.speculation.as_ref().map_or(true, |s| s.matches(profiles))
    }
}

impl fmt::Display for CompiledVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({} {:?} calls={} deopts={}{})",
            self.id,
            self.context,
            self.tier,
            self.invocation_count,
            self.deopt_count,
            if self.disabled { " disabled" } else { "" }
        )
    }
}

/// Owner of every variant. Tables and gates refer to variants by id.
#[derive(Debug, Clone, Default)]
pub struct VariantArena {
    variants: Vec<CompiledVariant>,
    /// Bumped on every enabled-to-disabled transition
    disable_epoch: u64,
}

impl VariantArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(
        &mut self,
        function: FunctionId,
        context: ContextFingerprint,
        tier: Tier,
        num_arguments: usize,
        body: CodeBody,
    ) -> VariantId {
        let id = VariantId(self.variants.len() as u32);
        self.variants.push(CompiledVariant {
            id,
            function,
            context,
            tier,
            num_arguments,
            body,
            invocation_count: 0,
            flags: VariantFlags::empty(),
            speculation: None,
            deopt_count: 0,
            disabled: false,
        });
        id
    }

    pub fn get(&self, id: VariantId) -> Option<&CompiledVariant> {
        self.variants.get(id.0 as usize)
    }

    pub fn get_mut(&mut self, id: VariantId) -> Option<&mut CompiledVariant> {
        self.variants.get_mut(id.0 as usize)
    }

    pub fn len(&self) -> usize {
        self.variants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }

    pub fn disable_epoch(&self) -> u64 {
        self.disable_epoch
    }

    /// Disable a variant. Returns true on an actual transition.
    pub fn disable(&mut self, id: VariantId) -> bool {
        match self.variants.get_mut(id.0 as usize) {
            Some(v) if !v.disabled => {
                v.disabled = true;
                self.disable_epoch += 1;
                true
            }
            _ => false,
        }
    }

    pub fn record_invocation(&mut self, id: VariantId) {
        if let Some(v) = self.variants.get_mut(id.0 as usize) {
            v.invocation_count += 1;
        }
    }

    /// Count one deopt; disables the variant once `max_deopts` is reached.
    /// Returns the new count.
    pub fn record_deopt(&mut self, id: VariantId, max_deopts: u32) -> u32 {
        let count = match self.variants.get_mut(id.0 as usize) {
            Some(v) => {
                v.add_deopt_count(1);
                v.deopt_count
            }
            None => return 0,
        };
        if count >= max_deopts {
            self.disable(id);
        }
        count
    }

    pub fn iter(&self) -> impl Iterator<Item = &CompiledVariant> {
        self.variants.iter()
    }
}

impl Index<VariantId> for VariantArena {
    type Output = CompiledVariant;

    fn index(&self, id: VariantId) -> &CompiledVariant {
        &self.variants[id.0 as usize]
    }
}

impl IndexMut<VariantId> for VariantArena {
    fn index_mut(&mut self, id: VariantId) -> &mut CompiledVariant {
        &mut self.variants[id.0 as usize]
    }
}
