//! Persistent compilation artifacts
//!
//! Compiled native code is cached on disk keyed by the structural hash
//! ("hast") of the defining source unit so later runs can relink it instead
//! of recompiling. See [`ArtifactStore`] for the directory layout and
//! [`HastRegistry`] for the in-memory side.

mod hast;
mod metadata;
mod registry;
mod store;

pub use hast::{hash_ast, Ast, Hast};
pub use metadata::{ArtifactMetadata, BinaryUnit, ContextUnit, OffsetUnit};
pub use registry::{HastRegistry, LinkOutcome, RegisterOutcome};
pub use store::{ArtifactStore, CleanupMode, CleanupReport, RelinkReport, StoreRequest};
