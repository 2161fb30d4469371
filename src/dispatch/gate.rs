//! Speculative gate
//!
//! Second dispatch level behind a version table slot. Candidates are
//! variants compiled against runtime feedback rather than caller-declared
//! assumptions; each is admissible only while the live profile still
//! matches its speculative context. The gate always has a fallback, the
//! variant the table slot would have held on its own, or the baseline for
//! code relinked from disk.
//!
//! With fast-case dispatch enabled the gate remembers its last decision and
//! returns it without re-checking predicates until the next structural
//! change: an insert, a fallback replacement, or any variant being disabled.

use super::{DispatchEnv, VariantArena, VariantId};
use crate::context::ContextFingerprint;
use crate::feedback::ProfileStore;
use std::cell::Cell;
use std::fmt;
use tracing::debug;

/// Storage grows by at least this many candidates at a time
const GROWTH_RATE: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateChoice {
    Candidate(VariantId),
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CachedDecision {
    choice: GateChoice,
    /// Arena disable epoch the decision was made under
    epoch: u64,
}

#[derive(Debug, Clone)]
pub struct SpeculativeGate {
    context: ContextFingerprint,
    fallback: VariantId,
    candidates: Vec<VariantId>,
    cache: Cell<Option<CachedDecision>>,
}

impl SpeculativeGate {
    pub fn new(context: ContextFingerprint, fallback: VariantId) -> Self {
        Self {
            context,
            fallback,
            candidates: Vec::with_capacity(GROWTH_RATE),
            cache: Cell::new(None),
        }
    }

    pub fn context(&self) -> ContextFingerprint {
        self.context
    }

    pub fn fallback(&self) -> VariantId {
        self.fallback
    }

    /// Replace the fallback, keeping the candidates.
    pub fn set_fallback(&mut self, fallback: VariantId) {
        self.fallback = fallback;
        self.invalidate();
    }

    pub fn candidates(&self) -> &[VariantId] {
        &self.candidates
    }

    /// Every variant reachable through the gate, fallback first
    pub fn variants(&self) -> impl Iterator<Item = VariantId> + '_ {
        std::iter::once(self.fallback).chain(self.candidates.iter().copied())
    }

    pub fn contains(&self, id: VariantId) -> bool {
        self.fallback == id || self.candidates.contains(&id)
    }

    /// Add a candidate, reusing the newest disabled slot when there is one.
    pub fn insert(&mut self, variants: &VariantArena, id: VariantId) {
        assert!(
            !variants[id].is_baseline(),
            "baseline variant cannot be a speculative candidate"
        );
        let reusable = (0..self.candidates.len())
            .rev()
            .find(|&i| variants[self.candidates[i]].disabled());
        match reusable {
            Some(i) => self.candidates[i] = id,
            None => {
                if self.candidates.len() == self.candidates.capacity() {
                    self.candidates.reserve(self.candidates.len().max(GROWTH_RATE));
                }
                self.candidates.push(id);
            }
        }
        self.invalidate();
    }

    /// Drop a candidate. The fallback cannot be removed.
    pub fn remove_candidate(&mut self, id: VariantId) -> bool {
        let before = self.candidates.len();
        self.candidates.retain(|c| *c != id);
        let removed = self.candidates.len() != before;
        if removed {
            self.invalidate();
        }
        removed
    }

    pub fn invalidate(&self) {
        self.cache.set(None);
    }

    /// Whether a decision is cached and still valid under `variants`
    pub fn is_cached(&self, variants: &VariantArena) -> bool {
        matches!(self.cache.get(), Some(c) if c.epoch == variants.disable_epoch())
    }

    fn resolve(&self, choice: GateChoice) -> VariantId {
        match choice {
            GateChoice::Candidate(id) => id,
            GateChoice::Fallback => self.fallback,
        }
    }

    /// Pick a variant. The result may be a disabled fallback; callers then
    /// have no usable code behind this slot.
    pub fn dispatch(&self, env: &DispatchEnv<'_>) -> VariantId {
        self.decide(env).1
    }

    /// Like [`dispatch`](Self::dispatch), also reporting how the choice was made.
    pub fn decide(&self, env: &DispatchEnv<'_>) -> (GateChoice, VariantId) {
        let epoch = env.variants.disable_epoch();

        if env.fast_case {
            if let Some(cached) = self.cache.get() {
                if cached.epoch == epoch {
                    let id = self.resolve(cached.choice);
                    debug!(
                        event = "l2_fast_cached",
                        context = %self.context,
                        variant = %id,
                        disabled = env.variants[id].disabled(),
                    );
                    return (cached.choice, id);
                }
            }
        }

        let mut misses = Vec::new();
        for &id in self.candidates.iter().rev() {
            let variant = &env.variants[id];
            if variant.disabled() {
                misses.push(format!("{}:disabled", id));
                continue;
            }
            match variant.speculation.as_ref().and_then(|s| s.mismatch(env.profiles)) {
                None => {
                    let choice = GateChoice::Candidate(id);
                    if env.fast_case {
                        self.cache.set(Some(CachedDecision { choice, epoch }));
                    }
                    debug!(event = "l2_slow", context = %self.context, variant = %id);
                    return (choice, id);
                }
                Some(slot) => misses.push(format!("{}:feedback#{}", id, slot)),
            }
        }

        if env.fast_case {
            self.cache.set(Some(CachedDecision {
                choice: GateChoice::Fallback,
                epoch,
            }));
        }
        debug!(
            event = "l2_miss",
            context = %self.context,
            fallback = %self.fallback,
            reason = %misses.join("|"),
        );
        (GateChoice::Fallback, self.fallback)
    }

    pub fn info(&self, variants: &VariantArena, profiles: &ProfileStore) -> GateInfo {
        let mut info = GateInfo {
            fallback: self.fallback,
            fallback_disabled: variants[self.fallback].disabled(),
            total: self.candidates.len(),
            disabled: 0,
            matching: 0,
        };
        for &id in &self.candidates {
            let v = &variants[id];
            if v.disabled() {
                info.disabled += 1;
            } else if v.matches_speculation(profiles) {
                info.matching += 1;
            }
        }
        info
    }
}

/// Candidate summary of a gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateInfo {
    pub fallback: VariantId,
    pub fallback_disabled: bool,
    pub total: usize,
    pub disabled: usize,
    /// Enabled candidates whose speculation currently holds
    pub matching: usize,
}

impl fmt::Display for GateInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fallback={}{} total={} disabled={} matching={}",
            self.fallback,
            if self.fallback_disabled { "(disabled)" } else { "" },
            self.total,
            self.disabled,
            self.matching
        )
    }
}
