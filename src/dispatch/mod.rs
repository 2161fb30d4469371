//! Multi-version dispatch
//!
//! Every function owns a [`VersionTable`] whose slots map calling-context
//! fingerprints to compiled variants. A slot may hold a single variant or a
//! [`SpeculativeGate`] choosing among variants by runtime feedback.
//! Variants live in a [`VariantArena`] and are referred to by [`VariantId`],
//! so tables and gates only ever store small copyable handles.

mod gate;
mod table;
mod variant;

pub use gate::{GateChoice, GateInfo, SpeculativeGate};
pub use table::{HastInfo, InsertOutcome, LinkRequest, TableArena, VersionTable};
pub use variant::{
    CodeBody, CompiledVariant, FlagUpdate, NativeCode, Tier, VariantArena, VariantFlags,
};

use crate::feedback::ProfileStore;
use std::fmt;

/// Identifies a function and its version table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(pub u32);

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn{}", self.0)
    }
}

/// Identifies one compiled variant in the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VariantId(pub u32);

impl fmt::Display for VariantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// What a dispatch decision may read
#[derive(Debug, Clone, Copy)]
pub struct DispatchEnv<'a> {
    pub variants: &'a VariantArena,
    pub profiles: &'a ProfileStore,
    /// Reuse cached gate decisions
    pub fast_case: bool,
}
