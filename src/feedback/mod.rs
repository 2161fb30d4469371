//! Runtime profiling feedback
//!
//! The interpreter records what it observes (value types, branch outcomes,
//! call targets) into slots of a [`ProfileStore`]. Compiled variants
//! capture a [`SpeculativeContext`] over some of those slots; the
//! speculative gate later asks whether the live profile still matches what
//! the variant was compiled against.

use crate::dispatch::FunctionId;
use crate::ir::TypeSet;
use rustc_hash::FxHashMap as HashMap;
use std::fmt;

/// Distinct types observed before a type slot goes megamorphic
pub const MAX_OBSERVED_TYPES: u32 = 3;

/// Distinct call targets remembered before a callee slot is invalidated
pub const MAX_OBSERVED_CALLEES: usize = 3;

/// Marks persisted branch feedback that holds a call target
const CALLEE_TAG: u32 = 1 << 31;

/// Persisted call target of a megamorphic site
const NO_CALLEE: u32 = !CALLEE_TAG;

/// Types observed at one program point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ObservedValues {
    pub seen: TypeSet,
    pub megamorphic: bool,
}

impl ObservedValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, ty: TypeSet) {
        if self.megamorphic {
            return;
        }
        self.seen |= ty;
        if self.seen.bits().count_ones() > MAX_OBSERVED_TYPES {
            self.megamorphic = true;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_void() && !self.megamorphic
    }

    /// Type the optimizer may speculate on; megamorphic slots give no type.
    pub fn speculated_type(&self) -> TypeSet {
        if self.megamorphic {
            TypeSet::void()
        } else {
            self.seen
        }
    }

    /// Compact encoding used by persisted metadata
    pub fn encode(&self) -> u32 {
        (self.seen.bits() as u32) | ((self.megamorphic as u32) << 16)
    }

    pub fn decode(raw: u32) -> Self {
        Self {
            seen: TypeSet::from_bits_truncate(raw as u16),
            megamorphic: raw & (1 << 16) != 0,
        }
    }
}

/// Branch outcomes observed at one conditional
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ObservedTest {
    #[default]
    None,
    OnlyTrue,
    OnlyFalse,
    Both,
}

impl ObservedTest {
    pub fn record(&mut self, outcome: bool) {
        *self = match (*self, outcome) {
            (ObservedTest::None, true) | (ObservedTest::OnlyTrue, true) => ObservedTest::OnlyTrue,
            (ObservedTest::None, false) | (ObservedTest::OnlyFalse, false) => {
                ObservedTest::OnlyFalse
            }
            _ => ObservedTest::Both,
        };
    }

    pub fn encode(&self) -> u32 {
        match self {
            ObservedTest::None => 0,
            ObservedTest::OnlyTrue => 1,
            ObservedTest::OnlyFalse => 2,
            ObservedTest::Both => 3,
        }
    }

    pub fn decode(raw: u32) -> Self {
        match raw {
            1 => ObservedTest::OnlyTrue,
            2 => ObservedTest::OnlyFalse,
            3 => ObservedTest::Both,
            _ => ObservedTest::None,
        }
    }
}

impl fmt::Display for ObservedTest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObservedTest::None => write!(f, "None"),
            ObservedTest::OnlyTrue => write!(f, "OnlyTrue"),
            ObservedTest::OnlyFalse => write!(f, "OnlyFalse"),
            ObservedTest::Both => write!(f, "Both"),
        }
    }
}

/// Call targets observed at one call site
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ObservedCallees {
    pub targets: Vec<FunctionId>,
    /// Too many distinct targets; the site is megamorphic
    pub invalid: bool,
}

impl ObservedCallees {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, callee: FunctionId) {
        if self.invalid || self.targets.contains(&callee) {
            return;
        }
        if self.targets.len() == MAX_OBSERVED_CALLEES {
            self.invalid = true;
            return;
        }
        self.targets.push(callee);
    }

    /// Most recently observed target, if the site is still monitorable
    pub fn last_target(&self) -> Option<FunctionId> {
        if self.invalid {
            return None;
        }
        self.targets.last().copied()
    }
}

/// One profiling slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedbackSlot {
    Type(ObservedValues),
    Test(ObservedTest),
    Callees(ObservedCallees),
}

impl FeedbackSlot {
    /// Current value of the slot, in the form speculation compares
    pub fn value(&self) -> FeedbackValue {
        match self {
            FeedbackSlot::Type(v) => FeedbackValue::Type(*v),
            FeedbackSlot::Test(t) => FeedbackValue::Test(*t),
            FeedbackSlot::Callees(c) => FeedbackValue::Callee(c.last_target()),
        }
    }
}

/// Address of a slot in the profile store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeedbackRef {
    pub function: FunctionId,
    pub slot: u32,
}

impl fmt::Display for FeedbackRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.function, self.slot)
    }
}

/// Profiling data of every function, owned by the runtime
#[derive(Debug, Clone, Default)]
pub struct ProfileStore {
    slots: HashMap<FunctionId, Vec<FeedbackSlot>>,
}

impl ProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_slot(&mut self, function: FunctionId, slot: FeedbackSlot) -> FeedbackRef {
        let slots = self.slots.entry(function).or_default();
        slots.push(slot);
        FeedbackRef {
            function,
            slot: (slots.len() - 1) as u32,
        }
    }

    pub fn add_type_slot(&mut self, function: FunctionId) -> FeedbackRef {
        self.add_slot(function, FeedbackSlot::Type(ObservedValues::new()))
    }

    pub fn add_test_slot(&mut self, function: FunctionId) -> FeedbackRef {
        self.add_slot(function, FeedbackSlot::Test(ObservedTest::None))
    }

    pub fn add_callee_slot(&mut self, function: FunctionId) -> FeedbackRef {
        self.add_slot(function, FeedbackSlot::Callees(ObservedCallees::new()))
    }

    pub fn get(&self, r: FeedbackRef) -> Option<&FeedbackSlot> {
        self.slots.get(&r.function)?.get(r.slot as usize)
    }

    fn get_mut(&mut self, r: FeedbackRef) -> Option<&mut FeedbackSlot> {
        self.slots.get_mut(&r.function)?.get_mut(r.slot as usize)
    }

    /// Record an observed type. Returns false when `r` is not a type slot.
    pub fn record_type(&mut self, r: FeedbackRef, ty: TypeSet) -> bool {
        match self.get_mut(r) {
            Some(FeedbackSlot::Type(v)) => {
                v.record(ty);
                true
            }
            _ => false,
        }
    }

    pub fn record_test(&mut self, r: FeedbackRef, outcome: bool) -> bool {
        match self.get_mut(r) {
            Some(FeedbackSlot::Test(t)) => {
                t.record(outcome);
                true
            }
            _ => false,
        }
    }

    pub fn record_callee(&mut self, r: FeedbackRef, callee: FunctionId) -> bool {
        match self.get_mut(r) {
            Some(FeedbackSlot::Callees(c)) => {
                c.record(callee);
                true
            }
            _ => false,
        }
    }

    /// Current value behind `r`; dangling references read as `None`.
    pub fn value(&self, r: FeedbackRef) -> FeedbackValue {
        self.get(r).map_or(FeedbackValue::None, FeedbackSlot::value)
    }

    pub fn slots(&self, function: FunctionId) -> &[FeedbackSlot] {
        self.slots.get(&function).map(|s| s.as_slice()).unwrap_or(&[])
    }

    pub fn refs(&self, function: FunctionId) -> Vec<FeedbackRef> {
        (0..self.slots(function).len() as u32)
            .map(|slot| FeedbackRef { function, slot })
            .collect()
    }
}

/// A materialized feedback observation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedbackValue {
    Type(ObservedValues),
    Test(ObservedTest),
    /// Last monitored call target; `None` when the site is megamorphic
    Callee(Option<FunctionId>),
    /// Nothing recorded
    None,
}

impl fmt::Display for FeedbackValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedbackValue::Type(v) => write!(f, "<{}>", v.seen),
            FeedbackValue::Test(t) => write!(f, "<Branch[{}]>", t),
            FeedbackValue::Callee(Some(c)) => write!(f, "<CalleeAt[{}]>", c),
            FeedbackValue::Callee(None) => write!(f, "<CalleeAt[0]>"),
            FeedbackValue::None => write!(f, "?"),
        }
    }
}

impl FeedbackValue {
    /// Compact encoding of branch or call-target feedback, as persisted next
    /// to the code that speculated on it
    pub fn encode_branch(&self) -> Option<u32> {
        match self {
            FeedbackValue::Test(t) => Some(t.encode()),
            FeedbackValue::Callee(c) => {
                Some(CALLEE_TAG | c.map_or(NO_CALLEE, |FunctionId(f)| f & NO_CALLEE))
            }
            FeedbackValue::Type(_) | FeedbackValue::None => None,
        }
    }

    pub fn decode_branch(raw: u32) -> Self {
        if raw & CALLEE_TAG == 0 {
            return FeedbackValue::Test(ObservedTest::decode(raw));
        }
        match raw & NO_CALLEE {
            NO_CALLEE => FeedbackValue::Callee(None),
            f => FeedbackValue::Callee(Some(FunctionId(f))),
        }
    }
}

/// Feedback held by a speculative context: either captured eagerly or read
/// through to the live profile at the moment it is asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeculativeFeedback {
    Snapshot(FeedbackValue),
    Live(FeedbackRef),
}

impl SpeculativeFeedback {
    pub fn resolve(&self, profiles: &ProfileStore) -> FeedbackValue {
        match self {
            SpeculativeFeedback::Snapshot(v) => *v,
            SpeculativeFeedback::Live(r) => profiles.value(*r),
        }
    }

    pub fn type_feedback(&self, profiles: &ProfileStore) -> Option<ObservedValues> {
        match self.resolve(profiles) {
            FeedbackValue::Type(v) => Some(v),
            _ => None,
        }
    }

    pub fn test_feedback(&self, profiles: &ProfileStore) -> Option<ObservedTest> {
        match self.resolve(profiles) {
            FeedbackValue::Test(t) => Some(t),
            _ => None,
        }
    }

    pub fn callee(&self, profiles: &ProfileStore) -> Option<FunctionId> {
        match self.resolve(profiles) {
            FeedbackValue::Callee(c) => c,
            _ => None,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, SpeculativeFeedback::Live(_))
    }
}

/// Feedback a variant was compiled against, paired with where to re-read it
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SpeculativeContext {
    expected: Vec<SpeculativeFeedback>,
    observed: Vec<SpeculativeFeedback>,
}

impl SpeculativeContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the current values of `refs` and keep live handles to them.
    pub fn capture(refs: &[FeedbackRef], profiles: &ProfileStore) -> Self {
        let mut ctx = Self::new();
        for r in refs {
            ctx.push(SpeculativeFeedback::Snapshot(profiles.value(*r)), SpeculativeFeedback::Live(*r));
        }
        ctx
    }

    /// Rebuild the context of persisted code for `function`: the stored
    /// values become snapshots, the stored slot indices live handles into
    /// this run's profile. `None` when slot and value lists disagree.
    pub fn restore(
        function: FunctionId,
        tf_slots: &[u32],
        tv_data: &[u32],
        fb_slots: &[u32],
        fb_data: &[u32],
    ) -> Option<Self> {
        if tf_slots.len() != tv_data.len() || fb_slots.len() != fb_data.len() {
            return None;
        }
        let types = tf_slots
            .iter()
            .zip(tv_data)
            .map(|(slot, raw)| (*slot, FeedbackValue::Type(ObservedValues::decode(*raw))));
        let branches = fb_slots
            .iter()
            .zip(fb_data)
            .map(|(slot, raw)| (*slot, FeedbackValue::decode_branch(*raw)));
        let mut ctx = Self::new();
        for (slot, value) in types.chain(branches) {
            ctx.push(
                SpeculativeFeedback::Snapshot(value),
                SpeculativeFeedback::Live(FeedbackRef { function, slot }),
            );
        }
        Some(ctx)
    }

    pub fn push(&mut self, expected: SpeculativeFeedback, observed: SpeculativeFeedback) {
        self.expected.push(expected);
        self.observed.push(observed);
    }

    pub fn len(&self) -> usize {
        self.expected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.expected.is_empty()
    }

    pub fn expected(&self) -> &[SpeculativeFeedback] {
        &self.expected
    }

    pub fn observed(&self) -> &[SpeculativeFeedback] {
        &self.observed
    }

    /// Index of the first entry whose live value moved away from the expected one
    pub fn mismatch(&self, profiles: &ProfileStore) -> Option<usize> {
        self.expected
            .iter()
            .zip(&self.observed)
            .position(|(e, o)| e.resolve(profiles) != o.resolve(profiles))
    }

    pub fn matches(&self, profiles: &ProfileStore) -> bool {
        self.mismatch(profiles).is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observed_values_goes_megamorphic() {
        let mut v = ObservedValues::new();
        v.record(TypeSet::INTEGER);
        v.record(TypeSet::REAL);
        v.record(TypeSet::STRING);
        assert!(!v.megamorphic);
        v.record(TypeSet::LIST);
        assert!(v.megamorphic);
        assert!(v.speculated_type().is_void());
        assert_eq!(ObservedValues::decode(v.encode()), v);
    }

    #[test]
    fn test_observed_test_lattice() {
        let mut t = ObservedTest::None;
        t.record(true);
        assert_eq!(t, ObservedTest::OnlyTrue);
        t.record(true);
        assert_eq!(t, ObservedTest::OnlyTrue);
        t.record(false);
        assert_eq!(t, ObservedTest::Both);
        assert_eq!(ObservedTest::decode(t.encode()), t);
    }

    #[test]
    fn test_callees_invalidate_past_limit() {
        let mut c = ObservedCallees::new();
        for i in 0..3 {
            c.record(FunctionId(i));
        }
        assert_eq!(c.last_target(), Some(FunctionId(2)));
        c.record(FunctionId(1));
        assert!(!c.invalid);
        c.record(FunctionId(9));
        assert!(c.invalid);
        assert_eq!(c.last_target(), None);
    }

    #[test]
    fn test_store_records_by_kind() {
        let mut store = ProfileStore::new();
        let f = FunctionId(1);
        let ty = store.add_type_slot(f);
        let test = store.add_test_slot(f);
        assert!(store.record_type(ty, TypeSet::INTEGER));
        assert!(!store.record_type(test, TypeSet::INTEGER));
        assert!(store.record_test(test, false));
        assert_eq!(store.value(test), FeedbackValue::Test(ObservedTest::OnlyFalse));
        assert_eq!(store.refs(f).len(), 2);
        assert_eq!(
            store.value(FeedbackRef { function: f, slot: 7 }),
            FeedbackValue::None
        );
    }

    #[test]
    fn test_speculative_feedback_accessors() {
        let mut store = ProfileStore::new();
        let f = FunctionId(0);
        let site = store.add_callee_slot(f);
        store.record_callee(site, FunctionId(4));

        let live = SpeculativeFeedback::Live(site);
        assert!(live.is_live());
        assert_eq!(live.callee(&store), Some(FunctionId(4)));
        assert_eq!(live.type_feedback(&store), None);

        let snap = SpeculativeFeedback::Snapshot(FeedbackValue::Test(ObservedTest::OnlyTrue));
        assert_eq!(snap.test_feedback(&store), Some(ObservedTest::OnlyTrue));
    }

    #[test]
    fn test_context_detects_drift() {
        let mut store = ProfileStore::new();
        let f = FunctionId(0);
        let a = store.add_type_slot(f);
        let b = store.add_test_slot(f);
        store.record_type(a, TypeSet::INTEGER);
        store.record_test(b, true);

        let ctx = SpeculativeContext::capture(&[a, b], &store);
        assert!(ctx.matches(&store));

        store.record_test(b, false);
        assert_eq!(ctx.mismatch(&store), Some(1));
        assert!(!ctx.matches(&store));
    }

    #[test]
    fn test_branch_encoding_keeps_kind() {
        let values = [
            FeedbackValue::Test(ObservedTest::OnlyFalse),
            FeedbackValue::Callee(Some(FunctionId(7))),
            FeedbackValue::Callee(None),
        ];
        for value in values {
            let raw = value.encode_branch().unwrap();
            assert_eq!(FeedbackValue::decode_branch(raw), value);
        }
        assert_eq!(FeedbackValue::None.encode_branch(), None);
    }

    #[test]
    fn test_restored_context_reads_live_profile() {
        let mut profiles = ProfileStore::new();
        let f = FunctionId(2);
        let ty = profiles.add_type_slot(f);
        let test = profiles.add_test_slot(f);

        let mut expected = ObservedValues::new();
        expected.record(TypeSet::INTEGER);
        let ctx = SpeculativeContext::restore(
            f,
            &[ty.slot],
            &[expected.encode()],
            &[test.slot],
            &[ObservedTest::OnlyTrue.encode()],
        )
        .unwrap();
        assert_eq!(ctx.len(), 2);
        assert_eq!(ctx.mismatch(&profiles), Some(0));

        profiles.record_type(ty, TypeSet::INTEGER);
        profiles.record_test(test, true);
        assert!(ctx.matches(&profiles));

        profiles.record_type(ty, TypeSet::REAL);
        assert_eq!(ctx.mismatch(&profiles), Some(0));

        assert!(SpeculativeContext::restore(f, &[0], &[], &[], &[]).is_none());
    }
}
