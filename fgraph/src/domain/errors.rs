//! Structured error types for fgraph
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! Each subsystem has its own enum so callers can tell a recoverable
//! per-function [`ResolutionError`] from a fatal [`BackendError`].

use super::types::{ProbeKind, Tid};
use thiserror::Error;

/// Failure to open or parse the target binary
#[derive(Error, Debug)]
pub enum ImageError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse object file: {0}")]
    Parse(#[from] object::Error),

    #[error("Unsupported architecture {0}, only x86-64 images can be traced")]
    UnsupportedArchitecture(String),

    #[error("Failed to read debug info: {0}")]
    Dwarf(#[from] gimli::Error),
}

/// Lookup failure for one function
///
/// Recovered locally: the function is dropped from the probe set and the
/// call-graph traversal continues with its siblings.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("no symbol covers address 0x{0:x}")]
    AddressNotFound(u64),

    #[error("invalid address range for {name}: 0x{low:x}..0x{high:x}")]
    InvalidRange { name: String, low: u64, high: u64 },

    #[error("frame pointer link not found in {0}")]
    FrameLinkNotFound(String),

    #[error("no return instruction found in {0}")]
    ReturnNotFound(String),

    #[error("excluded by pattern")]
    Excluded,
}

/// Malformed pattern or fetch expression
///
/// Fatal, and always reported before anything is loaded into the kernel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("type not found: {0}")]
    MissingType(String),

    #[error("only u/s/c types are supported: {0}")]
    UnsupportedType(String),

    #[error("unsupported width for {0}: u/s take 8/16/32/64 bits, c takes 8..512")]
    UnsupportedWidth(String),

    #[error("unsupported register: {0}")]
    UnsupportedRegister(String),

    #[error("invalid offset {0:?}")]
    InvalidOffset(String),

    #[error("empty fetch chain: {0}")]
    EmptyChain(String),

    #[error("innermost term of {0} must be a register")]
    BaseNotRegister(String),

    #[error("{expression} has {rules} read steps, at most {max} are supported")]
    ChainTooLong { expression: String, rules: usize, max: usize },

    #[error("{function} has {count} fetch args, at most {max} are supported")]
    TooManyArgs { function: String, count: usize, max: usize },

    #[error("imbalanced parentheses: {0}")]
    UnbalancedParentheses(String),

    #[error("invalid variable statement: {0}")]
    InvalidStatement(String),

    #[error("invalid pattern: {0}")]
    InvalidPattern(String),
}

/// Bytecode could not be inserted into a host program
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpliceError {
    #[error("insertion point {at} is outside a program of {len} instructions")]
    OutOfBounds { at: usize, len: usize },

    #[error("insertion point {at} splits a wide instruction")]
    SplitsWideInstruction { at: usize },

    #[error("branch at instruction {index} no longer fits its offset field")]
    OffsetOverflow { index: usize },

    #[error("bytecode length {0} is not a multiple of 8")]
    Truncated(usize),
}

/// The probe backend rejected a program or a probe placement
///
/// Fatal for the whole session; nothing stays attached after one of these.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Failed to load {program}: {error}")]
    LoadFailed { program: String, error: String },

    #[error("Failed to attach {probe} at offset 0x{offset:x} to {binary}: {error}")]
    ProbeAttachFailed { probe: String, offset: u64, binary: String, error: String },

    #[error("{0} not found in the probe object")]
    NotFound(String),

    #[error("Failed to rewrite probe object: {0}")]
    ObjectRewrite(String),

    #[error("probe programs are not loaded")]
    NotLoaded,

    #[error(transparent)]
    Splice(#[from] SpliceError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Ebpf(#[from] aya::EbpfError),

    #[error(transparent)]
    Program(#[from] aya::programs::ProgramError),

    #[error(transparent)]
    Map(#[from] aya::maps::MapError),
}

/// Fatal failure while rebuilding call trees from the event stream
#[derive(Error, Debug)]
pub enum ReconstructError {
    #[error("event error: {errno} ({context})")]
    EventError { context: Tid, errno: i32 },

    #[error("timed out after {waited_ms}ms waiting for {wanted} argument payloads for {context} ({available} queued)")]
    ArgTimeout { context: Tid, wanted: usize, available: usize, waited_ms: u128 },

    #[error("no {kind} probe at 0x{ip:x}")]
    UnknownProbe { kind: ProbeKind, ip: u64 },

    #[error("not a valid __call__ target: 0x{0:x}")]
    CallTarget(u64),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Output(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_error_display() {
        let err = ReconstructError::EventError { context: Tid(12), errno: -14 };
        assert_eq!(err.to_string(), "event error: -14 (TID:12)");
    }

    #[test]
    fn test_probe_attach_error() {
        let err = BackendError::ProbeAttachFailed {
            probe: "main.handler+4".to_string(),
            offset: 0x1234,
            binary: "/usr/bin/my-app".to_string(),
            error: "permission denied".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("main.handler+4"));
        assert!(text.contains("0x1234"));
        assert!(text.contains("/usr/bin/my-app"));
    }

    #[test]
    fn test_fetch_error_names_expression() {
        let err = FetchError::ChainTooLong { expression: "+0(%rax):u8".into(), rules: 9, max: 8 };
        assert!(err.to_string().starts_with("+0(%rax):u8 has 9"));
    }
}
