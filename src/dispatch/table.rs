//! Version table
//!
//! Per-function list of compiled variants keyed by calling context. Slot 0
//! always holds the baseline. The remaining slots are kept in a linear
//! extension of the fingerprint order with the most specialized variants
//! first: no slot precedes a slot whose fingerprint strictly dominates its
//! own. Dispatch returns the first enabled slot the call satisfies, so the
//! winner is never strictly dominated by another applicable enabled slot.
//!
//! Code relinked from disk with a speculative context sits behind a gate
//! whose fallback is the baseline. Such a slot holds no usable code while
//! the speculation fails, and dispatch moves on to the next slot.

use super::{DispatchEnv, FunctionId, SpeculativeGate, Tier, VariantArena, VariantId};
use crate::artifact::Hast;
use crate::context::ContextFingerprint;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::ops::{Index, IndexMut};
use tracing::{debug, trace};

/// Source identity of a top-level closure: its hast and the offset of the
/// closure inside the hashed unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HastInfo {
    pub hast: Hast,
    pub offset: u32,
}

/// Emitted when a table carrying a hast changes, so the artifact registry
/// can try to link persisted code for it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkRequest {
    pub hast: Hast,
    pub offset: u32,
    pub context: ContextFingerprint,
    pub num_arguments: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertOutcome {
    pub slot: usize,
    /// Fingerprint of a slot evicted to make room
    pub evicted: Option<ContextFingerprint>,
    pub link: Option<LinkRequest>,
}

#[derive(Debug, Clone)]
enum SlotEntry {
    Plain(VariantId),
    Gated(SpeculativeGate),
}

#[derive(Debug, Clone)]
struct Slot {
    context: ContextFingerprint,
    entry: SlotEntry,
}

enum Negotiated {
    Existing(usize),
    Vacant(usize),
}

#[derive(Debug, Clone)]
pub struct VersionTable {
    function: FunctionId,
    name: String,
    slots: Vec<Slot>,
    capacity: usize,
    user_context: ContextFingerprint,
    hast: Option<HastInfo>,
    rng: StdRng,
    evicted: Option<ContextFingerprint>,
}

impl VersionTable {
    /// Create a table around its baseline. `capacity` counts the baseline
    /// and must leave room for at least one specialized slot.
    pub fn new(
        function: FunctionId,
        name: impl Into<String>,
        baseline: &super::CompiledVariant,
        capacity: usize,
        seed: Option<u64>,
    ) -> Self {
        assert!(capacity >= 2, "version table needs room for one specialized slot");
        assert!(baseline.is_baseline(), "table must be created around a baseline variant");
        assert!(
            baseline.context.is_bottom(),
            "baseline must be compiled for the bottom fingerprint"
        );
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            function,
            name: name.into(),
            slots: vec![Slot {
                context: ContextFingerprint::BOTTOM,
                entry: SlotEntry::Plain(baseline.id),
            }],
            capacity,
            user_context: ContextFingerprint::BOTTOM,
            hast: None,
            rng,
            evicted: None,
        }
    }

    pub fn function(&self) -> FunctionId {
        self.function
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn baseline(&self) -> VariantId {
        match &self.slots[0].entry {
            SlotEntry::Plain(id) => *id,
            SlotEntry::Gated(gate) => gate.fallback(),
        }
    }

    /// Replace the baseline variant, also behind guarded slots.
    pub fn set_baseline(&mut self, variants: &VariantArena, id: VariantId) {
        assert!(variants[id].is_baseline(), "replacement baseline is not a baseline variant");
        let old = self.baseline();
        self.slots[0].entry = SlotEntry::Plain(id);
        for slot in self.slots.iter_mut().skip(1) {
            if let SlotEntry::Gated(gate) = &mut slot.entry {
                if gate.fallback() == old {
                    gate.set_fallback(id);
                }
            }
        }
    }

    pub fn hast(&self) -> Option<HastInfo> {
        self.hast
    }

    pub fn set_hast(&mut self, info: HastInfo) {
        self.hast = Some(info);
    }

    pub fn user_context(&self) -> ContextFingerprint {
        self.user_context
    }

    pub fn combine_context_with(&self, other: ContextFingerprint) -> ContextFingerprint {
        self.user_context | other
    }

    /// Fingerprints of all slots in order, baseline first
    pub fn contexts(&self) -> Vec<ContextFingerprint> {
        self.slots.iter().map(|s| s.context).collect()
    }

    /// Every variant held by the table, gate members included
    pub fn variants(&self) -> Vec<VariantId> {
        let mut out = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            match &slot.entry {
                SlotEntry::Plain(id) => out.push(*id),
                SlotEntry::Gated(gate) => out.extend(gate.variants()),
            }
        }
        out
    }

    /// Variants of slot `i`: the plain variant, or the gate's fallback and candidates
    pub fn slot_variants(&self, i: usize) -> Vec<VariantId> {
        match self.slots.get(i).map(|s| &s.entry) {
            Some(SlotEntry::Plain(id)) => vec![*id],
            Some(SlotEntry::Gated(gate)) => gate.variants().collect(),
            None => Vec::new(),
        }
    }

    pub fn gate(&self, i: usize) -> Option<&SpeculativeGate> {
        match self.slots.get(i).map(|s| &s.entry) {
            Some(SlotEntry::Gated(gate)) => Some(gate),
            _ => None,
        }
    }

    pub fn is_gated(&self, i: usize) -> bool {
        self.gate(i).is_some()
    }

    /// Variant at slot `i`, resolving a gated slot through its gate
    pub fn get(&self, env: &DispatchEnv<'_>, i: usize) -> Option<VariantId> {
        self.slots.get(i).map(|slot| match &slot.entry {
            SlotEntry::Plain(id) => *id,
            SlotEntry::Gated(gate) => gate.dispatch(env),
        })
    }

    /// Most specialized variant, or the baseline when there is none
    pub fn best(&self, env: &DispatchEnv<'_>) -> VariantId {
        if self.size() > 1 {
            self.get(env, 1).unwrap_or_else(|| self.baseline())
        } else {
            self.baseline()
        }
    }

    fn slot_enabled(&self, variants: &VariantArena, slot: &Slot) -> bool {
        match &slot.entry {
            SlotEntry::Plain(id) => !variants[*id].disabled(),
            SlotEntry::Gated(gate) => gate
                .variants()
                .any(|id| !variants[id].disabled() && !variants[id].is_baseline()),
        }
    }

    /// Whether a slot for exactly `context` exists and is enabled
    pub fn contains(&self, variants: &VariantArena, context: ContextFingerprint) -> bool {
        self.slots
            .iter()
            .find(|s| s.context == context)
            .map_or(false, |s| self.slot_enabled(variants, s))
    }

    /// Whether an enabled native variant for exactly `context` exists
    pub fn contains_native(&self, variants: &VariantArena, context: ContextFingerprint) -> bool {
        self.find_native(variants, |c| c == context).is_some()
    }

    /// First enabled native variant whose slot fingerprint satisfies `pred`
    pub fn find_native<P>(&self, variants: &VariantArena, pred: P) -> Option<VariantId>
    where
        P: Fn(ContextFingerprint) -> bool,
    {
        self.slots.iter().skip(1).filter(|s| pred(s.context)).find_map(|s| {
            let ids: Vec<VariantId> = match &s.entry {
                SlotEntry::Plain(id) => vec![*id],
                SlotEntry::Gated(gate) => gate.variants().collect(),
            };
            ids.into_iter()
                .find(|id| !variants[*id].disabled() && variants[*id].is_native())
        })
    }

    /// Select the variant for a call presenting `requested`.
    ///
    /// # Panics
    ///
    /// When `requested` does not include the table's user-defined context.
    pub fn dispatch(&self, env: &DispatchEnv<'_>, requested: ContextFingerprint) -> VariantId {
        assert!(
            self.user_context.smaller(&requested),
            "context {} does not satisfy user defined context {}",
            requested,
            self.user_context
        );
        for (i, slot) in self.slots.iter().enumerate().skip(1) {
            if !slot.context.smaller(&requested) {
                continue;
            }
            let id = match &slot.entry {
                SlotEntry::Plain(id) => *id,
                SlotEntry::Gated(gate) => gate.dispatch(env),
            };
            if env.variants[id].is_baseline() {
                trace!(function = %self.function, slot = i, "guarded slot missed");
                continue;
            }
            if !env.variants[id].disabled() {
                trace!(function = %self.function, slot = i, variant = %id, "dispatch hit");
                return id;
            }
        }
        self.baseline()
    }

    /// Install a specialized variant.
    ///
    /// A variant for an existing fingerprint replaces the old one and
    /// inherits its deopt count. A full table evicts a random specialized
    /// slot first.
    pub fn insert(&mut self, variants: &mut VariantArena, id: VariantId) -> InsertOutcome {
        let context = variants[id].context;
        assert!(
            variants[id].tier != Tier::Baseline,
            "baseline variant inserted as specialized"
        );
        self.evicted = None;
        let slot = match self.negotiate_slot(context) {
            Negotiated::Vacant(i) => {
                self.slots.insert(
                    i,
                    Slot {
                        context,
                        entry: SlotEntry::Plain(id),
                    },
                );
                i
            }
            Negotiated::Existing(i) => {
                match &mut self.slots[i].entry {
                    SlotEntry::Plain(old) => {
                        let old = *old;
                        if old != id {
                            let inherited = variants[old].deopt_count();
                            variants[id].add_deopt_count(inherited);
                        }
                        self.slots[i].entry = SlotEntry::Plain(id);
                    }
                    SlotEntry::Gated(gate) if variants[gate.fallback()].is_baseline() => {
                        gate.set_fallback(id)
                    }
                    SlotEntry::Gated(gate) => gate.insert(variants, id),
                }
                i
            }
        };
        debug!(function = %self.function, context = %context, slot, variant = %id, "variant installed");
        self.outcome(slot, context, variants[id].num_arguments)
    }

    /// Install a variant behind a speculative gate at its slot.
    pub fn insert_gated(&mut self, variants: &mut VariantArena, id: VariantId) -> InsertOutcome {
        let context = variants[id].context;
        assert!(
            variants[id].tier != Tier::Baseline,
            "baseline variant inserted as specialized"
        );
        self.evicted = None;
        let slot = match self.negotiate_slot(context) {
            Negotiated::Vacant(i) => {
                self.slots.insert(
                    i,
                    Slot {
                        context,
                        entry: SlotEntry::Gated(SpeculativeGate::new(context, id)),
                    },
                );
                i
            }
            Negotiated::Existing(i) => {
                let entry = &mut self.slots[i].entry;
                match entry {
                    SlotEntry::Plain(old) => {
                        let mut gate = SpeculativeGate::new(context, *old);
                        gate.insert(variants, id);
                        *entry = SlotEntry::Gated(gate);
                    }
                    SlotEntry::Gated(gate) => gate.insert(variants, id),
                }
                i
            }
        };
        debug!(function = %self.function, context = %context, slot, variant = %id, "gated variant installed");
        self.outcome(slot, context, variants[id].num_arguments)
    }

    /// Install a variant that may only run while its speculation holds.
    /// Unlike [`insert_gated`](Self::insert_gated), a fresh slot falls back
    /// to the baseline, so a failed speculation never reaches the variant.
    pub fn insert_guarded(&mut self, variants: &mut VariantArena, id: VariantId) -> InsertOutcome {
        let context = variants[id].context;
        assert!(
            variants[id].tier != Tier::Baseline,
            "baseline variant inserted as specialized"
        );
        let baseline = self.baseline();
        self.evicted = None;
        let slot = match self.negotiate_slot(context) {
            Negotiated::Vacant(i) => {
                let mut gate = SpeculativeGate::new(context, baseline);
                gate.insert(variants, id);
                self.slots.insert(
                    i,
                    Slot {
                        context,
                        entry: SlotEntry::Gated(gate),
                    },
                );
                i
            }
            Negotiated::Existing(i) => {
                let entry = &mut self.slots[i].entry;
                match entry {
                    SlotEntry::Plain(old) => {
                        let mut gate = SpeculativeGate::new(context, *old);
                        gate.insert(variants, id);
                        *entry = SlotEntry::Gated(gate);
                    }
                    SlotEntry::Gated(gate) => gate.insert(variants, id),
                }
                i
            }
        };
        debug!(function = %self.function, context = %context, slot, variant = %id, "guarded variant installed");
        self.outcome(slot, context, variants[id].num_arguments)
    }

    fn outcome(&self, slot: usize, context: ContextFingerprint, num_arguments: usize) -> InsertOutcome {
        InsertOutcome {
            slot,
            evicted: self.evicted,
            link: self.hast.map(|info| LinkRequest {
                hast: info.hast,
                offset: info.offset,
                context,
                num_arguments,
            }),
        }
    }

    /// Find or make the slot for `context`.
    fn negotiate_slot(&mut self, context: ContextFingerprint) -> Negotiated {
        assert!(!self.slots.is_empty(), "version table without baseline");
        if let Some(i) = (1..self.slots.len()).find(|&i| self.slots[i].context == context) {
            return Negotiated::Existing(i);
        }

        if self.slots.len() == self.capacity {
            let pos = 1 + self.rng.gen_range(0..self.slots.len() - 1);
            let victim = self.slots.remove(pos);
            debug!(
                function = %self.function,
                evicted = %victim.context,
                slot = pos,
                "version table full, evicting slot"
            );
            self.evicted = Some(victim.context);
        }

        let mut pos = 1;
        for i in (1..self.slots.len()).rev() {
            if context.strictly_smaller(&self.slots[i].context) {
                pos = i + 1;
                break;
            }
        }
        Negotiated::Vacant(pos)
    }

    /// Drop `id` from the table. Removing a gate's fallback drops the whole slot.
    pub fn remove(&mut self, id: VariantId) -> bool {
        for i in 1..self.slots.len() {
            match &mut self.slots[i].entry {
                SlotEntry::Plain(v) if *v == id => {
                    self.slots.remove(i);
                    return true;
                }
                SlotEntry::Gated(gate) if gate.fallback() == id => {
                    self.slots.remove(i);
                    return true;
                }
                SlotEntry::Gated(gate) => {
                    if gate.remove_candidate(id) {
                        return true;
                    }
                }
                _ => {}
            }
        }
        false
    }

    /// Clone keeping the baseline and the slots that include every assumption of `udc`.
    pub fn with_user_context(&self, function: FunctionId, udc: ContextFingerprint) -> VersionTable {
        let mut clone = self.clone();
        clone.function = function;
        clone.slots = self
            .slots
            .iter()
            .enumerate()
            .filter(|(i, s)| *i == 0 || udc.smaller(&s.context))
            .map(|(_, s)| s.clone())
            .collect();
        clone.user_context = udc;
        clone
    }
}

impl fmt::Display for VersionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== {} ({}/{}) ===", self.name, self.size(), self.capacity)?;
        for (i, slot) in self.slots.iter().enumerate() {
            match &slot.entry {
                SlotEntry::Plain(id) => writeln!(f, "  [{}] {} -> {}", i, slot.context, id)?,
                SlotEntry::Gated(gate) => writeln!(
                    f,
                    "  [{}] {} -> gate(fallback {}, {} candidates)",
                    i,
                    slot.context,
                    gate.fallback(),
                    gate.candidates().len()
                )?,
            }
        }
        Ok(())
    }
}

/// Owner of all version tables, indexed by function id
#[derive(Debug, Clone, Default)]
pub struct TableArena {
    tables: Vec<VersionTable>,
}

impl TableArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id the next added table will get
    pub fn next_id(&self) -> FunctionId {
        FunctionId(self.tables.len() as u32)
    }

    pub fn add(&mut self, table: VersionTable) -> FunctionId {
        let id = self.next_id();
        assert_eq!(table.function(), id, "table built for a different function id");
        self.tables.push(table);
        id
    }

    pub fn get(&self, id: FunctionId) -> Option<&VersionTable> {
        self.tables.get(id.0 as usize)
    }

    pub fn get_mut(&mut self, id: FunctionId) -> Option<&mut VersionTable> {
        self.tables.get_mut(id.0 as usize)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &VersionTable> {
        self.tables.iter()
    }
}

impl Index<FunctionId> for TableArena {
    type Output = VersionTable;

    fn index(&self, id: FunctionId) -> &VersionTable {
        &self.tables[id.0 as usize]
    }
}

impl IndexMut<FunctionId> for TableArena {
    fn index_mut(&mut self, id: FunctionId) -> &mut VersionTable {
        &mut self.tables[id.0 as usize]
    }
}
