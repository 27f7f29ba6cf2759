//! # fgraph - Function Call Graph Tracer
//!
//! fgraph prints the call stacks of functions inside a native x86-64 binary
//! while it runs. It reads the binary's symbols, debug info and machine code
//! to find where functions begin and return, attaches uprobes there, and
//! rebuilds each thread's nested calls from the events the probes emit.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Traced Binary                           │
//! └───────────────────────┬──────────────────────────────────────┘
//!                         │ uprobes at entry / return / custom offsets
//!                         ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                 eBPF Programs (Kernel)                       │
//! │  • ent, ent_bt, ret, custom: one event per firing            │
//! │  • spliced prelude per probe: fetch args into ARG_SCRATCH    │
//! └───────────────────────┬──────────────────────────────────────┘
//!                         │ EVENTS / ARGS ring buffers
//!                         ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    fgraph (This Crate)                       │
//! │                                                              │
//! │  ┌────────────┐   ┌────────────┐   ┌──────────────────┐      │
//! │  │  Analyzer  │──▶│   Fetch    │──▶│     Backend      │      │
//! │  │ (ELF/DWARF)│   │ (compiler) │   │ (aya, splicing)  │      │
//! │  └────────────┘   └────────────┘   └────────┬─────────┘      │
//! │                                             ▼                │
//! │                                    ┌──────────────────┐      │
//! │                                    │  Reconstructor   │      │
//! │                                    │ (stacks, render) │      │
//! │                                    └──────────────────┘      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`binary`]: ELF image, symbol table and DWARF subprogram ranges
//! - [`disasm`]: x86-64 decoding of function bodies
//! - [`registers`]: register names and their `pt_regs` offsets
//! - [`analyzer`]: frame-pointer setup, returns, call trees and probes
//! - [`patterns`]: command-line function patterns
//! - [`fetch`]: fetch expressions, compiled to BPF and spliced into programs
//! - [`backend`]: the [`backend::ProbeBackend`] seam and its eBPF implementation
//! - [`reconstruct`]: per-thread stacks rebuilt from events, then printed
//! - [`tracer`]: one tracing session from plan to detach
//! - [`cli`]: command-line arguments
//! - [`preflight`]: privilege, kernel and binary checks before loading
//! - [`domain`]: shared types and errors
//!
//! ## Typical Usage
//!
//! ```bash
//! # Trace handle_request and everything it calls, two levels deep
//! sudo fgraph -d 2 ./server 'handle_request(fd=%rdi:s32)'
//!
//! # Only print what would be instrumented
//! fgraph --dry-run ./server 'handle_*' '!log_*'
//! ```

pub mod analyzer;
pub mod backend;
pub mod binary;
pub mod cli;
pub mod disasm;
pub mod domain;
pub mod fetch;
pub mod patterns;
pub mod preflight;
pub mod reconstruct;
pub mod registers;
pub mod tracer;
