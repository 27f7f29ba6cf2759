//! Domain model for fgraph
//!
//! This module contains core domain types and errors that provide:
//! - Compile-time safety via newtype pattern
//! - Self-documenting function signatures
//! - Structured error handling

pub mod errors;
pub mod types;

// Re-export common types for convenience
pub use types::{ArgPayload, Pid, ProbeKind, Tid, TraceEvent};

pub use errors::{
    BackendError, FetchError, ImageError, ReconstructError, ResolutionError, SpliceError,
};
