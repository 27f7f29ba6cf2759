//! Pre-flight checks for fgraph
//!
//! Validates system requirements before any probe program is loaded, with
//! messages that say what to fix.

#![allow(unsafe_code)] // geteuid() and setrlimit() require unsafe

use anyhow::{bail, Context, Result};
use log::{debug, warn};
use object::{Architecture, Object, ObjectSection};
use std::path::Path;

use crate::domain::Pid;

/// Ring buffer maps arrived in 5.8
const MIN_KERNEL_VERSION: (u32, u32) = (5, 8);

/// Run all checks that must pass before loading probes
///
/// # Errors
/// Returns the first failed requirement
pub fn run_preflight_checks(binary: &Path, pid: Option<Pid>) -> Result<()> {
    check_privileges()?;
    check_kernel_version()?;
    check_binary_exists(binary)?;
    check_binary_format(binary)?;
    if let Some(pid) = pid {
        check_process_exists(pid)?;
    }
    raise_memlock_limit();
    Ok(())
}

fn check_privileges() -> Result<()> {
    if unsafe { libc::geteuid() } == 0 {
        return Ok(());
    }

    bail!(
        "Permission denied: fgraph requires root privileges to attach uprobes.\n\n\
         Run with: sudo fgraph ..."
    );
}

fn check_kernel_version() -> Result<()> {
    let version = std::fs::read_to_string("/proc/version")
        .context("Failed to read kernel version from /proc/version")?;
    // "Linux version 6.1.0-arch1-1 ..."
    let release = version.split_whitespace().nth(2).unwrap_or("unknown");

    let Some((major, minor)) = parse_release(release) else {
        debug!("Cannot parse kernel release {release}, assuming it is recent enough");
        return Ok(());
    };

    if (major, minor) < MIN_KERNEL_VERSION {
        bail!(
            "Kernel version {major}.{minor} is too old.\n\n\
             fgraph requires Linux {}.{} or newer for eBPF ring buffer support.\n\
             Current kernel: {release}",
            MIN_KERNEL_VERSION.0,
            MIN_KERNEL_VERSION.1,
        );
    }
    Ok(())
}

/// `6.1.0-arch1-1` -> (6, 1)
fn parse_release(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor: String = parts.next()?.chars().take_while(char::is_ascii_digit).collect();
    Some((major, minor.parse().ok()?))
}

fn check_binary_exists(binary: &Path) -> Result<()> {
    if !binary.exists() {
        bail!(
            "Binary not found: {}\n\n\
             Make sure the path is correct and the binary exists.",
            binary.display()
        );
    }
    if !binary.is_file() {
        bail!("Not a file: {}\n\nThe traced binary must be an executable file.", binary.display());
    }
    Ok(())
}

/// x86-64 ELF with a symbol table; debug info is optional
fn check_binary_format(binary: &Path) -> Result<()> {
    let data = std::fs::read(binary).with_context(|| format!("Failed to read binary: {}", binary.display()))?;
    let obj = object::File::parse(&*data)
        .with_context(|| format!("{} is not an object file", binary.display()))?;

    if obj.format() != object::BinaryFormat::Elf || obj.architecture() != Architecture::X86_64 {
        bail!(
            "{} is a {:?} {:?} image, fgraph traces x86-64 ELF binaries only",
            binary.display(),
            obj.format(),
            obj.architecture()
        );
    }

    let has_symtab = obj.section_by_name(".symtab").is_some_and(|s| s.size() > 0);
    let has_dynsym = obj.section_by_name(".dynsym").is_some_and(|s| s.size() > 0);
    if !has_symtab && !has_dynsym {
        bail!(
            "{} has no symbol table.\n\n\
             Functions cannot be located in a stripped binary; rebuild without stripping.",
            binary.display()
        );
    }
    if !has_symtab {
        warn!("{} has only dynamic symbols, most functions will not be found", binary.display());
    }
    if !obj.section_by_name(".debug_info").is_some_and(|s| s.size() > 0) {
        warn!("No DWARF debug info, function ranges come from the symbol table");
    }
    Ok(())
}

fn check_process_exists(pid: Pid) -> Result<()> {
    let proc_path = format!("/proc/{}", pid.0);
    if !Path::new(&proc_path).exists() {
        bail!(
            "Process {} not found.\n\n\
             Is the process still running? Check with: ps -p {}",
            pid.0,
            pid.0
        );
    }
    Ok(())
}

/// Older kernels charge BPF maps against `RLIMIT_MEMLOCK`
fn raise_memlock_limit() {
    let limit = libc::rlimit { rlim_cur: libc::RLIM_INFINITY, rlim_max: libc::RLIM_INFINITY };
    if unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &limit) } != 0 {
        warn!("Failed to raise RLIMIT_MEMLOCK: {}", std::io::Error::last_os_error());
    }
}
