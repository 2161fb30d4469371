//! Error types for the tiered compilation core
//!
//! Only recoverable conditions live here. Contract violations (a table
//! without a baseline, an empty speculative gate, a call that does not
//! satisfy a table's user-defined context) panic instead.

use crate::artifact::Hast;
use crate::dispatch::{FunctionId, VariantId};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for tierjit
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IOError: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },

    /// Metadata could not be encoded or decoded
    #[error("CodecError: {0}")]
    CodecError(String),

    /// Bad configuration value (unknown debug flag, malformed filter regex)
    #[error("ConfigError: {0}")]
    InvalidConfig(String),

    /// Artifact store failure surfaced to a caller that asked for it
    #[error("SerializerError: {0}")]
    Serializer(#[from] SerializerError),

    #[error("UnknownFunction: {0}")]
    UnknownFunction(FunctionId),

    #[error("UnknownVariant: {0}")]
    UnknownVariant(VariantId),
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::CodecError(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::CodecError(e.to_string())
    }
}

impl From<regex::Error> for Error {
    fn from(e: regex::Error) -> Self {
        Error::InvalidConfig(format!("invalid filter: {}", e))
    }
}

/// Result type alias for tierjit operations
pub type Result<T> = std::result::Result<T, Error>;

/// Why a compilation attempt did not produce code
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileFailure {
    /// The unit exceeds the optimizer's admission ceiling
    TooLarge { size: usize, limit: usize },
    /// The function is marked as not optimizable
    NotOptimizable,
    /// The optimizer rejected the requested assumptions
    Rejected(String),
    /// Native code generation failed
    Backend(String),
}

impl fmt::Display for CompileFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileFailure::TooLarge { size, limit } => {
                write!(f, "unit size {} exceeds limit {}", size, limit)
            }
            CompileFailure::NotOptimizable => write!(f, "function is marked not optimizable"),
            CompileFailure::Rejected(reason) => write!(f, "optimizer rejected: {}", reason),
            CompileFailure::Backend(reason) => write!(f, "backend failed: {}", reason),
        }
    }
}

/// Compilation failure handed to the caller's failure callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    /// Name of the unit that failed
    pub unit: String,
    pub reason: CompileFailure,
}

impl CompileError {
    pub fn new(unit: impl Into<String>, reason: CompileFailure) -> Self {
        Self {
            unit: unit.into(),
            reason,
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.unit, self.reason)
    }
}

impl std::error::Error for CompileError {}

/// Artifact store failures. These are recorded, never thrown past `compile`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SerializerError {
    #[error("cannot write {path}: {message}")]
    Write { path: PathBuf, message: String },

    #[error("cannot rename {from} to {to}: {message}")]
    Rename {
        from: PathBuf,
        to: PathBuf,
        message: String,
    },

    /// The enclosing source unit has no registered hast
    #[error("no hast registered for unit {unit}")]
    UnavailableHast { unit: String },

    #[error("cannot encode metadata: {0}")]
    Encode(String),

    #[error("hast {0} is blacklisted")]
    Blacklisted(Hast),
}

/// Error flag plus log of serializer failures observed during a session
#[derive(Debug, Clone, Default)]
pub struct SerializerReport {
    pub errors: Vec<SerializerError>,
    /// Variants persisted successfully
    pub stored: usize,
}

impl SerializerReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, error: SerializerError) {
        tracing::warn!(error = %error, "serializer error");
        self.errors.push(error);
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    pub fn clear(&mut self) {
        self.errors.clear();
        self.stored = 0;
    }
}

impl fmt::Display for SerializerReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "serializer: {} stored, {} errors", self.stored, self.errors.len())?;
        for e in &self.errors {
            write!(f, "\n  {}", e)?;
        }
        Ok(())
    }
}
