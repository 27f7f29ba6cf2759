//! # eBPF Kernel-Side Instrumentation
//!
//! Uprobe programs attached by fgraph at function entries, returns and custom
//! offsets. Every firing pushes its captured arguments to `ARGS`, then one
//! [`Event`] to `EVENTS`.
//!
//! ## Programs
//!
//! - `ent` - function entry, after the frame pointer is set up
//! - `ent_bt` - entry that also walks the frame-pointer chain
//! - `ret` - return instruction
//! - `custom` - any other offset
//!
//! Userspace may splice a fetch prelude in front of any of these. The prelude
//! fills `ARG_SCRATCH` and sets its `arg_count`; the program drains it.
//!
//! ## Maps (Shared with Userspace)
//!
//! All maps are pinned so every patched copy of this object shares them.
//!
//! - `EVENTS` - Ring buffer of [`Event`]
//! - `ARGS` - Ring buffer of [`ArgPayload`]
//! - `ARG_SCRATCH` - Per-CPU [`ArgScratch`]
//!
//! ## Build
//!
//! ```bash
//! cargo xtask build-ebpf --release
//! ```

#![no_std]
#![no_main]
#![allow(unused_unsafe)]

use aya_ebpf::{
    helpers::{bpf_get_current_pid_tgid, bpf_ktime_get_ns, bpf_probe_read_user},
    macros::{map, uprobe},
    maps::{PerCpuArray, RingBuf},
    programs::ProbeContext,
};
use aya_log_ebpf::warn;
use fgraph_common::{
    ArgPayload, ArgScratch, Event, LOCATION_CUSTOM, LOCATION_ENTRY, LOCATION_RETURN,
    MAX_BACKTRACE_DEPTH, MAX_FETCH_ARGS,
};

// ============================================================================
// Constants
// ============================================================================

/// Reported in [`Event::errno`] when an argument payload could not be queued
const ENOSPC: i32 = 28;

/// Reported in [`Event::errno`] when the return address could not be read
const EFAULT: i32 = 14;

// ============================================================================
// eBPF Maps
// ============================================================================

/// Probe firings, one [`Event`] each
#[map]
static EVENTS: RingBuf = RingBuf::pinned(4 * 1024 * 1024, 0);

/// Captured argument values, queued ahead of their event
#[map]
static ARGS: RingBuf = RingBuf::pinned(4 * 1024 * 1024, 0);

/// Landing area for spliced fetch bytecode; key 0 only
#[map]
static ARG_SCRATCH: PerCpuArray<ArgScratch> = PerCpuArray::pinned(1, 0);

// ============================================================================
// Programs
// ============================================================================

#[uprobe]
pub fn ent(ctx: ProbeContext) -> u32 {
    emit(&ctx, LOCATION_ENTRY, false)
}

#[uprobe]
pub fn ent_bt(ctx: ProbeContext) -> u32 {
    emit(&ctx, LOCATION_ENTRY, true)
}

#[uprobe]
pub fn ret(ctx: ProbeContext) -> u32 {
    emit(&ctx, LOCATION_RETURN, false)
}

#[uprobe]
pub fn custom(ctx: ProbeContext) -> u32 {
    emit(&ctx, LOCATION_CUSTOM, false)
}

#[inline(always)]
fn emit(ctx: &ProbeContext, location: u32, backtrace: bool) -> u32 {
    let pid_tgid = unsafe { bpf_get_current_pid_tgid() };
    let pid = (pid_tgid >> 32) as u32;
    let tid = pid_tgid as u32;

    let regs = ctx.regs;
    let (ip, frame) = unsafe { ((*regs).rip, (*regs).rbp) };

    // Reserve first so payloads are never queued for an event that is lost
    let Some(mut entry) = EVENTS.reserve::<Event>(0) else {
        discard_args();
        warn!(ctx, "EVENTS full, dropped firing at 0x{:x}", ip);
        return 1;
    };
    let event = entry.as_mut_ptr();
    let (arg_count, mut errno) = drain_args(tid);

    // Entry probes sit after `mov %rsp,%rbp`, so the return address is one
    // word above the frame
    let caller_ip = if location == LOCATION_RETURN { 0 } else { read_word(frame + 8).unwrap_or(0) };
    if location != LOCATION_RETURN && caller_ip == 0 {
        errno = EFAULT;
    }

    unsafe {
        (*event).pid = pid;
        (*event).tid = tid;
        (*event).ip = ip;
        (*event).caller_ip = caller_ip;
        (*event).frame = frame;
        (*event).time_ns = bpf_ktime_get_ns();
        (*event).location = location;
        (*event).errno = errno;
        (*event).arg_count = arg_count;
        (*event)._padding = 0;

        let mut fp = if backtrace { read_word(frame).unwrap_or(0) } else { 0 };
        for i in 0..MAX_BACKTRACE_DEPTH {
            let ret = if fp == 0 { 0 } else { read_word(fp + 8).unwrap_or(0) };
            (*event).backtrace[i] = ret;
            if ret == 0 {
                fp = 0;
            } else {
                fp = read_word(fp).unwrap_or(0);
            }
        }
    }

    entry.submit(0);
    0
}

/// Move whatever the prelude captured into `ARGS` and reset the scratch
///
/// Returns the number of payloads queued and the errno for the event.
#[inline(always)]
fn drain_args(tid: u32) -> (u32, i32) {
    let Some(scratch) = ARG_SCRATCH.get_ptr_mut(0) else {
        return (0, 0);
    };

    let count = unsafe { (*scratch).arg_count };
    if count == 0 {
        return (0, 0);
    }
    unsafe { (*scratch).arg_count = 0 };

    let mut queued = 0u32;
    for i in 0..MAX_FETCH_ARGS {
        if i as u64 >= count {
            break;
        }
        let Some(mut entry) = ARGS.reserve::<ArgPayload>(0) else {
            return (queued, ENOSPC);
        };
        let payload = entry.as_mut_ptr();
        unsafe {
            (*payload).tid = tid;
            (*payload).index = i as u32;
            (*payload).data = (*scratch).data[i];
        }
        entry.submit(0);
        queued += 1;
    }
    (queued, 0)
}

#[inline(always)]
fn discard_args() {
    if let Some(scratch) = ARG_SCRATCH.get_ptr_mut(0) {
        unsafe { (*scratch).arg_count = 0 };
    }
}

#[inline(always)]
fn read_word(addr: u64) -> Option<u64> {
    unsafe { bpf_probe_read_user(addr as *const u64).ok() }
}

#[cfg(all(not(test), target_os = "none"))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
