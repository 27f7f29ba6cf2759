//! Domain types providing compile-time safety and self-documentation
//!
//! Newtypes keep process and thread ids apart, and the trace records here are
//! the userspace view of what the probe backend delivers.

use std::fmt;

use fgraph_common::{LOCATION_CUSTOM, LOCATION_ENTRY, LOCATION_RETURN};

/// Process ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID:{}", self.0)
    }
}

/// Thread ID
///
/// Native binaries are traced per OS thread, so the thread id is the
/// execution context key of the reconstructor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tid(pub u32);

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TID:{}", self.0)
    }
}

/// Where a probe sits inside its function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProbeKind {
    Entry,
    Return,
    Custom,
}

impl ProbeKind {
    /// Decode the kernel's location constant
    #[must_use]
    pub fn from_location(location: u32) -> Option<Self> {
        match location {
            LOCATION_ENTRY => Some(Self::Entry),
            LOCATION_RETURN => Some(Self::Return),
            LOCATION_CUSTOM => Some(Self::Custom),
            _ => None,
        }
    }

    #[must_use]
    pub fn location(self) -> u32 {
        match self {
            Self::Entry => LOCATION_ENTRY,
            Self::Return => LOCATION_RETURN,
            Self::Custom => LOCATION_CUSTOM,
        }
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Entry => "entry",
            Self::Return => "return",
            Self::Custom => "custom",
        };
        f.pad(name)
    }
}

/// One probe firing, as delivered by the backend
///
/// Addresses are runtime addresses of the traced process. The reconstructor
/// translates them to link-time addresses before symbol lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEvent {
    pub context: Tid,
    pub pid: Pid,
    pub kind: ProbeKind,
    pub ip: u64,
    pub caller_ip: u64,
    /// Frame-pointer value at the probe; distinguishes re-armed prologues
    pub frame: u64,
    /// Monotonic nanoseconds since boot
    pub time_ns: u64,
    pub errno: i32,
    /// Return addresses above the caller, without the zero sentinel
    pub backtrace: Vec<u64>,
    /// Payload records the kernel pushed for this firing
    pub arg_count: u32,
}

/// One captured argument value from the payload stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgPayload {
    pub context: Tid,
    pub index: u32,
    pub data: Vec<u8>,
}
