//! Hast registry
//!
//! Explicitly owned bookkeeping shared by the compilation pipeline and the
//! artifact store: which source unit owns a hast, where inner closures sit
//! inside it, what is blacklisted or stale, and which persisted artifacts
//! are available for linking. Tests build a fresh registry each.

use super::Hast;
use crate::context::ContextFingerprint;
use crate::dispatch::{FunctionId, HastInfo, LinkRequest};
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use std::collections::BTreeSet;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
struct HastEntry {
    function: FunctionId,
    name: String,
    digest: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Registered,
    /// Same tree registered again
    AlreadyRegistered(FunctionId),
    /// A different tree produced the same hast; the hast is now blacklisted
    Collision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    Linked,
    AlreadyLinked,
    NotAvailable,
    /// A newer compilation superseded the persisted code
    Stale,
    Blacklisted,
}

#[derive(Debug, Clone, Default)]
pub struct HastRegistry {
    entries: HashMap<Hast, HastEntry>,
    src_map: HashMap<u32, HastInfo>,
    blacklist: BTreeSet<Hast>,
    stale: HashSet<Hast>,
    dependencies: HashMap<Hast, BTreeSet<Hast>>,
    available: HashSet<(Hast, u32, u64)>,
    linked: HashSet<(Hast, u32, u64)>,
}

impl HastRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the owner of `hast`. `digest` is the full structural digest
    /// of the tree, used to detect collisions.
    pub fn register(
        &mut self,
        hast: Hast,
        digest: u64,
        function: FunctionId,
        name: impl Into<String>,
    ) -> RegisterOutcome {
        if let Some(existing) = self.entries.get(&hast) {
            if existing.digest == digest {
                return RegisterOutcome::AlreadyRegistered(existing.function);
            }
            warn!(hast = %hast, first = %existing.name, "hast collision, blacklisting");
            self.blacklist.insert(hast);
            return RegisterOutcome::Collision;
        }
        self.entries.insert(
            hast,
            HastEntry {
                function,
                name: name.into(),
                digest,
            },
        );
        RegisterOutcome::Registered
    }

    pub fn function_of(&self, hast: Hast) -> Option<FunctionId> {
        self.entries.get(&hast).map(|e| e.function)
    }

    /// Structural digest the owner of `hast` was registered with
    pub fn digest_of(&self, hast: Hast) -> Option<u64> {
        self.entries.get(&hast).map(|e| e.digest)
    }

    pub fn name_of(&self, hast: Hast) -> Option<&str> {
        self.entries.get(&hast).map(|e| e.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Map a source pool index to its position inside a hashed unit.
    pub fn register_source(&mut self, src: u32, info: HastInfo) {
        self.src_map.insert(src, info);
    }

    /// Position of `src` inside its hashed unit, unless that unit is blacklisted
    pub fn hast_info(&self, src: u32) -> Option<HastInfo> {
        self.src_map
            .get(&src)
            .copied()
            .filter(|info| !self.blacklist.contains(&info.hast))
    }

    pub fn blacklist_hast(&mut self, hast: Hast) -> bool {
        self.blacklist.insert(hast)
    }

    pub fn is_blacklisted(&self, hast: Hast) -> bool {
        self.blacklist.contains(&hast)
    }

    pub fn blacklist(&self) -> &BTreeSet<Hast> {
        &self.blacklist
    }

    pub fn mark_stale(&mut self, hast: Hast) {
        if self.stale.insert(hast) {
            debug!(hast = %hast, "persisted code marked stale");
        }
    }

    pub fn is_stale(&self, hast: Hast) -> bool {
        self.stale.contains(&hast)
    }

    pub fn set_dependencies(&mut self, hast: Hast, deps: BTreeSet<Hast>) {
        self.dependencies.insert(hast, deps);
    }

    pub fn dependencies(&self, hast: Hast) -> Option<&BTreeSet<Hast>> {
        self.dependencies.get(&hast)
    }

    /// Record that persisted code exists for `(hast, offset, context)`.
    pub fn record_available(&mut self, hast: Hast, offset: u32, context: ContextFingerprint) {
        self.available.insert((hast, offset, context.bits()));
    }

    pub fn is_available(&self, hast: Hast) -> bool {
        self.available.iter().any(|(h, _, _)| *h == hast)
    }

    /// Persisted (offset, context) pairs for `hast`, sorted
    pub fn available_for(&self, hast: Hast) -> Vec<(u32, ContextFingerprint)> {
        let mut out: Vec<(u32, ContextFingerprint)> = self
            .available
            .iter()
            .filter(|(h, _, _)| *h == hast)
            .filter_map(|(_, offset, bits)| ContextFingerprint::from_bits(*bits).map(|c| (*offset, c)))
            .collect();
        out.sort_by_key(|(offset, ctx)| (*offset, ctx.bits()));
        out
    }

    /// Decide whether persisted code may be linked for `request`.
    pub fn try_link(&mut self, request: &LinkRequest) -> LinkOutcome {
        let key = (request.hast, request.offset, request.context.bits());
        if self.blacklist.contains(&request.hast) {
            return LinkOutcome::Blacklisted;
        }
        if !self.available.contains(&key) {
            return LinkOutcome::NotAvailable;
        }
        if self.stale.contains(&request.hast) {
            return LinkOutcome::Stale;
        }
        let tainted = self
            .dependencies
            .get(&request.hast)
            .map_or(false, |deps| deps.iter().any(|d| self.blacklist.contains(d)));
        if tainted {
            return LinkOutcome::Blacklisted;
        }
        if !self.linked.insert(key) {
            return LinkOutcome::AlreadyLinked;
        }
        debug!(hast = %request.hast, offset = request.offset, context = %request.context, "linked");
        LinkOutcome::Linked
    }

    /// Forget what the last directory scan reported. What this run already
    /// linked or superseded stays recorded, so a rescan never loads the same
    /// code twice.
    pub fn clear_persisted(&mut self) {
        self.dependencies.clear();
        self.available.clear();
    }
}
