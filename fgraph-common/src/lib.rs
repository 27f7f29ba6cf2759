//! # Shared Data Structures (eBPF ↔ Userspace)
//!
//! Records exchanged between the uprobe programs in `fgraph-ebpf` and the
//! userspace tracer. All types are `#[repr(C)]` so both sides agree on layout.
//!
//! ## Streams
//!
//! Two ring buffers leave the kernel:
//!
//! 1. `EVENTS` - one [`Event`] per probe firing (entry, return or custom)
//! 2. `ARGS` - zero or more [`ArgPayload`] records per firing, pushed
//!    *before* the matching event, in argument order
//!
//! Userspace correlates the two by thread id and per-thread FIFO order.
//!
//! ## Argument scratch
//!
//! Fetch bytecode spliced in front of a program writes captured values into
//! the per-CPU [`ArgScratch`] slot. The program body then copies each slot
//! into an [`ArgPayload`]. The byte offsets of [`ArgScratch`] are baked into
//! generated bytecode, so [`ARG_COUNT_OFFSET`] and [`ARG_DATA_OFFSET`] must
//! track the struct definition.

#![no_std]

// ============================================================================
// Probe Locations
// ============================================================================

/// Function entry, fired at the post-prologue offset
pub const LOCATION_ENTRY: u32 = 0;

/// Return instruction
pub const LOCATION_RETURN: u32 = 1;

/// Any other user-chosen point, e.g. an indirect call site
pub const LOCATION_CUSTOM: u32 = 2;

// ============================================================================
// Capacities
// ============================================================================

/// Maximum return addresses walked through the frame-pointer chain
pub const MAX_BACKTRACE_DEPTH: usize = 50;

/// Maximum fetch args per probe
pub const MAX_FETCH_ARGS: usize = 8;

/// Bytes reserved for one captured argument (the widest `c512` type)
pub const ARG_SLOT_SIZE: usize = 64;

/// Byte offset of [`ArgScratch::arg_count`]
pub const ARG_COUNT_OFFSET: i16 = 0;

/// Byte offset of [`ArgScratch::data`]
pub const ARG_DATA_OFFSET: i16 = 8;

// ============================================================================
// Shared Data Structures
// ============================================================================

/// Probe firing sent from eBPF to userspace via the `EVENTS` ring buffer
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Event {
    /// Process ID (TGID)
    pub pid: u32,

    /// Thread ID; the execution context key
    pub tid: u32,

    /// Runtime address of the probed instruction
    pub ip: u64,

    /// Return address read from `rbp + 8` (0 for return probes)
    pub caller_ip: u64,

    /// Value of `rbp` when the probe fired
    ///
    /// Two entry firings at the same `ip` with different frames mean the
    /// probed prologue ran twice for one logical call.
    pub frame: u64,

    /// `bpf_ktime_get_ns()` at the firing
    pub time_ns: u64,

    /// One of `LOCATION_ENTRY`, `LOCATION_RETURN`, `LOCATION_CUSTOM`
    pub location: u32,

    /// Nonzero when the kernel side failed to capture this firing
    pub errno: i32,

    /// Number of [`ArgPayload`] records pushed ahead of this event
    pub arg_count: u32,

    #[allow(clippy::pub_underscore_fields)]
    pub _padding: u32,

    /// Return addresses above the caller, zero terminated
    pub backtrace: [u64; MAX_BACKTRACE_DEPTH],
}

/// One captured argument value, sent via the `ARGS` ring buffer
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ArgPayload {
    /// Thread ID; must match the following [`Event::tid`]
    pub tid: u32,

    /// Position of the argument in the probe's fetch list
    pub index: u32,

    pub data: [u8; ARG_SLOT_SIZE],
}

/// Per-CPU landing area written by spliced fetch bytecode
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ArgScratch {
    pub arg_count: u64,
    pub data: [[u8; ARG_SLOT_SIZE]; MAX_FETCH_ARGS],
}

#[cfg(feature = "user")]
use aya::Pod;

// Pod lets aya copy these records to and from map memory as plain bytes
#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for Event {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for ArgPayload {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for ArgScratch {}
