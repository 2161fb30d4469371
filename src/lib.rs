//! tierjit: the tiered-compilation core of a JIT for a dynamic language runtime
//!
//! The crate selects, compiles, caches and retires specialized versions of
//! functions. The interpreter loop, parser, garbage collector and native
//! instruction selection live elsewhere and reach this core through the
//! [`Jit`] facade and the [`Optimizer`](compiler::Optimizer) and
//! [`Backend`](compiler::Backend) traits.
//!
//! # Quick Start
//!
//! ```no_run
//! use tierjit::compiler::{Backend, ClosureVersion, OptimizeRequest, OptimizedUnit, Optimizer};
//! use tierjit::dispatch::NativeCode;
//! use tierjit::error::CompileFailure;
//! use tierjit::{ClosureDef, ContextFingerprint, Jit, JitConfig};
//!
//! struct Identity;
//!
//! impl Optimizer for Identity {
//!     fn optimize(&mut self, r: &OptimizeRequest<'_>) -> Result<OptimizedUnit, CompileFailure> {
//!         Ok(OptimizedUnit {
//!             versions: vec![ClosureVersion::new(r.function, r.context, r.baseline.num_arguments)],
//!         })
//!     }
//! }
//!
//! impl Backend for Identity {
//!     fn lower(&mut self, _: &ClosureVersion, name: &str) -> Result<NativeCode, CompileFailure> {
//!         Ok(NativeCode { symbol: name.to_string(), code: vec![0xc3], pool: vec![] })
//!     }
//! }
//!
//! fn main() -> tierjit::Result<()> {
//!     let mut jit = Jit::new(JitConfig::from_env()?, Box::new(Identity), Box::new(Identity));
//!     let f = jit.compile_closure(ClosureDef::new("f", 1, 32));
//!     let ctx = ContextFingerprint::new().set_simple_int(0);
//!     jit.optimize(f.function, ctx, |e| eprintln!("{}", e))?;
//!     let variant = jit.call(f.function, ctx)?;
//!     println!("dispatched to {}", variant);
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! | Category | Modules |
//! |----------|---------|
//! | **Dispatch** | [`context`], [`dispatch`], [`feedback`] |
//! | **Compilation** | [`compiler`], [`deopt`], [`ir`] |
//! | **Persistence** | [`artifact`] |
//! | **Support** | [`config`], [`profiler`], [`error`](Error) |

pub mod artifact;
pub mod compiler;
pub mod config;
pub mod context;
pub mod deopt;
pub mod dispatch;
pub mod error;
pub mod feedback;
pub mod ir;
pub mod jit;
pub mod profiler;

pub use config::JitConfig;
pub use context::ContextFingerprint;
pub use error::{Error, Result};
pub use jit::{ClosureDef, ClosureHandle, DeoptOutcome, Jit};

/// tierjit version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
