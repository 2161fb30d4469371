//! Calling-context fingerprints
//!
//! A [`ContextFingerprint`] is the bit-packed set of guarantees a call site
//! gives about its arguments. Fingerprints form a partial order by
//! implication strength: `a.smaller(&b)` holds when every assumption in `a`
//! is also asserted by `b`, so `a` is the weaker, more general context.
//! The empty fingerprint is the bottom element and is what the baseline
//! variant of every function is compiled for.
//!
//! # Layout
//!
//! ```text
//!  63      48 47     40 39 38 37                          8 7        0
//! +----------+---------+-----+----------------------------+----------+
//! | reserved | missing | res | 6 x 5 bit arg assumptions  | call     |
//! +----------+---------+-----+----------------------------+----------+
//! ```

use bitflags::bitflags;
use std::cmp::Ordering;
use std::fmt;
use std::ops::BitOr;

/// Number of leading arguments that carry their own assumptions
pub const MAX_TRACKED_ARGS: usize = 6;

const CALL_MASK: u64 = 0xFF;
const ARG_SHIFT: u32 = 8;
const ARG_WIDTH: u32 = 5;
const ARG_MASK: u64 = (1 << ARG_WIDTH) - 1;
const MISSING_SHIFT: u32 = 40;
const MISSING_MASK: u64 = 0xFF;

const VALID_BITS: u64 = CALL_MASK
    | (((1u64 << (ARG_WIDTH * MAX_TRACKED_ARGS as u32)) - 1) << ARG_SHIFT)
    | (MISSING_MASK << MISSING_SHIFT);

bitflags! {
    /// Call-site level assumptions
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CallAssumptions: u8 {
        /// Arguments are passed in the callee's formal order
        const CORRECT_ORDER_OF_ARGUMENTS = 1 << 0;
        /// Argument matching was resolved at compile time
        const STATICALLY_ARGMATCHED = 1 << 1;
        /// No argument is explicitly passed as missing
        const NO_EXPLICITLY_MISSING_ARGS = 1 << 2;
        /// The call passes no more arguments than the callee has formals
        const NOT_TOO_MANY_ARGUMENTS = 1 << 3;
    }
}

bitflags! {
    /// Per-argument assumptions
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ArgAssumptions: u8 {
        /// The argument is already evaluated (not a lazy promise)
        const EAGER = 1 << 0;
        /// Forcing the argument cannot reflect on the caller environment
        const NON_REFLECTIVE = 1 << 1;
        /// The argument carries no class attribute
        const NOT_OBJECT = 1 << 2;
        /// The argument is a scalar integer without attributes
        const SIMPLE_INT = 1 << 3;
        /// The argument is a scalar double without attributes
        const SIMPLE_REAL = 1 << 4;
    }
}

/// Bit-packed calling-context record
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ContextFingerprint(u64);

impl ContextFingerprint {
    /// The weakest fingerprint, satisfied by every call
    pub const BOTTOM: ContextFingerprint = ContextFingerprint(0);

    pub fn new() -> Self {
        Self::BOTTOM
    }

    /// Rebuild a fingerprint from its packed representation.
    ///
    /// Returns `None` when reserved bits are set or when a missing-argument
    /// count is present without `STATICALLY_ARGMATCHED`.
    pub fn from_bits(bits: u64) -> Option<Self> {
        if bits & !VALID_BITS != 0 {
            return None;
        }
        let fp = Self(bits);
        if fp.missing() != 0 && !fp.call().contains(CallAssumptions::STATICALLY_ARGMATCHED) {
            return None;
        }
        Some(fp)
    }

    pub fn bits(&self) -> u64 {
        self.0
    }

    pub fn is_bottom(&self) -> bool {
        self.0 == 0
    }

    pub fn call(&self) -> CallAssumptions {
        CallAssumptions::from_bits_truncate((self.0 & CALL_MASK) as u8)
    }

    /// Replace the call-site assumptions.
    ///
    /// Dropping `STATICALLY_ARGMATCHED` also drops the missing-argument count.
    pub fn with_call(mut self, call: CallAssumptions) -> Self {
        self.0 = (self.0 & !CALL_MASK) | call.bits() as u64;
        if !call.contains(CallAssumptions::STATICALLY_ARGMATCHED) {
            self.0 &= !(MISSING_MASK << MISSING_SHIFT);
        }
        self
    }

    /// Assumptions recorded for argument `index`; untracked arguments have none.
    pub fn arg(&self, index: usize) -> ArgAssumptions {
        if index >= MAX_TRACKED_ARGS {
            return ArgAssumptions::empty();
        }
        let shift = ARG_SHIFT + ARG_WIDTH * index as u32;
        ArgAssumptions::from_bits_truncate(((self.0 >> shift) & ARG_MASK) as u8)
    }

    /// Add assumptions for argument `index`. Arguments past
    /// [`MAX_TRACKED_ARGS`] cannot carry assumptions and are ignored.
    pub fn with_arg(mut self, index: usize, flags: ArgAssumptions) -> Self {
        if index < MAX_TRACKED_ARGS {
            let shift = ARG_SHIFT + ARG_WIDTH * index as u32;
            self.0 |= (flags.bits() as u64 & ARG_MASK) << shift;
        }
        self
    }

    pub fn without_arg(mut self, index: usize, flags: ArgAssumptions) -> Self {
        if index < MAX_TRACKED_ARGS {
            let shift = ARG_SHIFT + ARG_WIDTH * index as u32;
            self.0 &= !((flags.bits() as u64 & ARG_MASK) << shift);
        }
        self
    }

    pub fn set_eager(self, index: usize) -> Self {
        self.with_arg(index, ArgAssumptions::EAGER)
    }

    /// Mark argument `index` as an eager, non-object scalar integer.
    pub fn set_simple_int(self, index: usize) -> Self {
        self.with_arg(
            index,
            ArgAssumptions::EAGER | ArgAssumptions::NOT_OBJECT | ArgAssumptions::SIMPLE_INT,
        )
    }

    pub fn set_simple_real(self, index: usize) -> Self {
        self.with_arg(
            index,
            ArgAssumptions::EAGER | ArgAssumptions::NOT_OBJECT | ArgAssumptions::SIMPLE_REAL,
        )
    }

    /// Number of trailing missing arguments.
    pub fn missing(&self) -> u8 {
        ((self.0 >> MISSING_SHIFT) & MISSING_MASK) as u8
    }

    /// Record the number of missing arguments. The count only means something
    /// for statically matched calls, so this asserts `STATICALLY_ARGMATCHED`.
    pub fn with_missing(mut self, missing: u8) -> Self {
        self.0 = (self.0 & !(MISSING_MASK << MISSING_SHIFT)) | ((missing as u64) << MISSING_SHIFT);
        self.0 |= CallAssumptions::STATICALLY_ARGMATCHED.bits() as u64;
        self
    }

    /// Whether every assumption of `self` is also asserted by `other`.
    pub fn smaller(&self, other: &ContextFingerprint) -> bool {
        let call = self.call();
        if !other.call().contains(call) {
            return false;
        }
        for i in 0..MAX_TRACKED_ARGS {
            if !other.arg(i).contains(self.arg(i)) {
                return false;
            }
        }
        if call.contains(CallAssumptions::STATICALLY_ARGMATCHED) && self.missing() != other.missing() {
            return false;
        }
        true
    }

    /// `other` asserts everything `self` does and more.
    pub fn strictly_smaller(&self, other: &ContextFingerprint) -> bool {
        self != other && self.smaller(other)
    }

    /// Remove every assumption named in `mask`.
    pub fn without(self, mask: ContextFingerprint) -> Self {
        let mut call = self.call();
        call.remove(mask.call());
        let mut out = ContextFingerprint(self.0 & (MISSING_MASK << MISSING_SHIFT)).with_call(call);
        for i in 0..MAX_TRACKED_ARGS {
            let mut arg = self.arg(i);
            arg.remove(mask.arg(i));
            out = out.with_arg(i, arg);
        }
        out
    }
}

impl BitOr for ContextFingerprint {
    type Output = ContextFingerprint;

    fn bitor(self, rhs: ContextFingerprint) -> ContextFingerprint {
        let mut out = ContextFingerprint(
            (self.0 | rhs.0) & !(MISSING_MASK << MISSING_SHIFT),
        );
        if out.call().contains(CallAssumptions::STATICALLY_ARGMATCHED) {
            out = out.with_missing(self.missing().max(rhs.missing()));
        }
        out
    }
}

impl PartialOrd for ContextFingerprint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self == other {
            Some(Ordering::Equal)
        } else if self.smaller(other) {
            Some(Ordering::Less)
        } else if other.smaller(self) {
            Some(Ordering::Greater)
        } else {
            None
        }
    }
}

impl fmt::Debug for ContextFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContextFingerprint({:#x} {})", self.0, self)
    }
}

impl fmt::Display for ContextFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = Vec::new();
        let call = self.call();
        if call.contains(CallAssumptions::CORRECT_ORDER_OF_ARGUMENTS) {
            parts.push("CorrOrd".into());
        }
        if call.contains(CallAssumptions::STATICALLY_ARGMATCHED) {
            parts.push("Stat".into());
        }
        if call.contains(CallAssumptions::NO_EXPLICITLY_MISSING_ARGS) {
            parts.push("!ExpMi".into());
        }
        if call.contains(CallAssumptions::NOT_TOO_MANY_ARGUMENTS) {
            parts.push("!TMany".into());
        }
        for i in 0..MAX_TRACKED_ARGS {
            let arg = self.arg(i);
            if arg.is_empty() {
                continue;
            }
            let mut tags = Vec::new();
            if arg.contains(ArgAssumptions::EAGER) {
                tags.push("eager");
            }
            if arg.contains(ArgAssumptions::NON_REFLECTIVE) {
                tags.push("nonRefl");
            }
            if arg.contains(ArgAssumptions::NOT_OBJECT) {
                tags.push("nonObj");
            }
            if arg.contains(ArgAssumptions::SIMPLE_INT) {
                tags.push("simpleInt");
            }
            if arg.contains(ArgAssumptions::SIMPLE_REAL) {
                tags.push("simpleReal");
            }
            parts.push(format!("arg{}:{}", i, tags.join(",")));
        }
        if self.missing() > 0 {
            parts.push(format!("miss:{}", self.missing()));
        }
        write!(f, "[{}]", parts.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eager_int0() -> ContextFingerprint {
        ContextFingerprint::new().with_arg(0, ArgAssumptions::EAGER | ArgAssumptions::SIMPLE_INT)
    }

    #[test]
    fn test_bottom_is_smaller_than_everything() {
        let fp = eager_int0().with_call(CallAssumptions::CORRECT_ORDER_OF_ARGUMENTS);
        assert!(ContextFingerprint::BOTTOM.smaller(&fp));
        assert!(ContextFingerprint::BOTTOM.smaller(&ContextFingerprint::BOTTOM));
        assert!(!fp.smaller(&ContextFingerprint::BOTTOM));
    }

    #[test]
    fn test_arg_flags_are_independent() {
        let fp = ContextFingerprint::new()
            .set_eager(0)
            .set_simple_int(2)
            .with_arg(5, ArgAssumptions::NON_REFLECTIVE);
        assert_eq!(fp.arg(0), ArgAssumptions::EAGER);
        assert_eq!(fp.arg(1), ArgAssumptions::empty());
        assert!(fp.arg(2).contains(ArgAssumptions::SIMPLE_INT));
        assert_eq!(fp.arg(5), ArgAssumptions::NON_REFLECTIVE);
        assert_eq!(fp.arg(6), ArgAssumptions::empty());
    }

    #[test]
    fn test_untracked_args_are_ignored() {
        let fp = ContextFingerprint::new().set_eager(MAX_TRACKED_ARGS);
        assert!(fp.is_bottom());
    }

    #[test]
    fn test_partial_order() {
        let a = ContextFingerprint::new().set_eager(0);
        let b = eager_int0();
        let c = ContextFingerprint::new().set_eager(1);
        assert!(a < b);
        assert!(b > a);
        assert_eq!(a.partial_cmp(&c), None);
        assert!(a.strictly_smaller(&b));
        assert!(!a.strictly_smaller(&a));
    }

    #[test]
    fn test_missing_binds_only_when_statically_matched() {
        let two = ContextFingerprint::new().with_missing(2);
        let one = ContextFingerprint::new().with_missing(1);
        assert!(two.call().contains(CallAssumptions::STATICALLY_ARGMATCHED));
        assert!(!two.smaller(&one));
        assert!(two.smaller(&two.set_eager(0)));
        // a caller without static matching says nothing about missing args
        assert!(ContextFingerprint::new().smaller(&two));
    }

    #[test]
    fn test_with_call_drops_missing_without_static_matching() {
        let fp = ContextFingerprint::new().with_missing(3).with_call(CallAssumptions::CORRECT_ORDER_OF_ARGUMENTS);
        assert_eq!(fp.missing(), 0);
    }

    #[test]
    fn test_from_bits_validates() {
        let fp = eager_int0().with_missing(1);
        assert_eq!(ContextFingerprint::from_bits(fp.bits()), Some(fp));
        assert_eq!(ContextFingerprint::from_bits(1 << 63), None);
        assert_eq!(ContextFingerprint::from_bits(1 << MISSING_SHIFT), None);
    }

    #[test]
    fn test_union_and_mask() {
        let a = ContextFingerprint::new().set_eager(0);
        let b = ContextFingerprint::new().set_simple_int(1);
        let both = a | b;
        assert!(a.smaller(&both));
        assert!(b.smaller(&both));
        assert_eq!(both.without(b), a);
    }

    #[test]
    fn test_display() {
        let fp = eager_int0().with_call(CallAssumptions::CORRECT_ORDER_OF_ARGUMENTS);
        assert_eq!(fp.to_string(), "[CorrOrd arg0:eager,simpleInt]");
        assert_eq!(ContextFingerprint::BOTTOM.to_string(), "[]");
    }
}
