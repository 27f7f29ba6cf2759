//! Runtime to link-time address translation
//!
//! Position-independent executables are mapped at a per-process bias. The
//! bias is the lowest mapping of the binary in `/proc/<pid>/maps` minus the
//! image's lowest `PT_LOAD` address. Fixed-address executables have bias 0.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, warn};

use crate::binary::{BinaryImage, ImageKind};
use crate::domain::Pid;

/// Maps addresses reported by probes back to the addresses in the image
pub trait AddressTranslator: Send {
    fn to_link(&mut self, pid: Pid, addr: u64) -> u64;
}

/// For fixed-address images and replayed traces
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityTranslator;

impl AddressTranslator for IdentityTranslator {
    fn to_link(&mut self, _pid: Pid, addr: u64) -> u64 {
        addr
    }
}

/// Memory range of a loaded binary in a process's address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRange {
    pub start: u64,
    pub end: u64,
}

impl MemoryRange {
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// Find the span covered by every mapping of `binary` in a maps listing
#[must_use]
pub fn find_mapping(maps: &str, binary: &Path) -> Option<MemoryRange> {
    let mut range: Option<MemoryRange> = None;

    // "start-end perms offset dev inode pathname"
    for line in maps.lines() {
        let mut fields = line.split_whitespace();
        let Some(span) = fields.next() else {
            continue;
        };
        let Some(path) = fields.nth(4) else {
            continue;
        };
        if Path::new(path) != binary {
            continue;
        }
        let Some((start, end)) = span.split_once('-') else {
            continue;
        };
        let (Ok(start), Ok(end)) = (u64::from_str_radix(start, 16), u64::from_str_radix(end, 16)) else {
            continue;
        };

        range = Some(match range {
            Some(r) => MemoryRange { start: r.start.min(start), end: r.end.max(end) },
            None => MemoryRange { start, end },
        });
    }
    range
}

/// Read `/proc/<pid>/maps` and locate `binary`
///
/// # Errors
/// Returns an error if the maps cannot be read or the binary is not mapped
pub fn parse_memory_maps(pid: Pid, binary: &Path) -> Result<MemoryRange> {
    let maps_path = format!("/proc/{}/maps", pid.0);
    let maps = fs::read_to_string(&maps_path).with_context(|| format!("Failed to read {maps_path}"))?;
    find_mapping(&maps, binary)
        .with_context(|| format!("{} is not mapped in {pid}", binary.display()))
}

/// Per-process bias lookup through procfs
pub struct ProcessMaps {
    binary: PathBuf,
    link_base: u64,
    relocated: bool,
    biases: HashMap<Pid, u64>,
}

impl ProcessMaps {
    #[must_use]
    pub fn new(image: &BinaryImage) -> Self {
        let binary = fs::canonicalize(image.path()).unwrap_or_else(|_| image.path().to_path_buf());
        Self {
            binary,
            link_base: image.load_address(),
            relocated: image.kind() == ImageKind::PositionIndependent,
            biases: HashMap::new(),
        }
    }

    fn bias(&mut self, pid: Pid) -> u64 {
        if !self.relocated {
            return 0;
        }
        if let Some(&bias) = self.biases.get(&pid) {
            return bias;
        }

        let bias = match parse_memory_maps(pid, &self.binary) {
            Ok(range) => {
                let bias = range.start.wrapping_sub(self.link_base);
                debug!("{pid}: {} mapped at 0x{:x}, bias 0x{bias:x}", self.binary.display(), range.start);
                bias
            }
            Err(e) => {
                warn!("{e:#}; addresses of {pid} are used unrelocated");
                0
            }
        };
        self.biases.insert(pid, bias);
        bias
    }
}

impl AddressTranslator for ProcessMaps {
    fn to_link(&mut self, pid: Pid, addr: u64) -> u64 {
        if addr == 0 {
            return 0;
        }
        addr.wrapping_sub(self.bias(pid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPS: &str = "\
55d4c0a00000-55d4c0a2c000 r--p 00000000 fd:01 1234 /usr/bin/target
55d4c0a2c000-55d4c0b00000 r-xp 0002c000 fd:01 1234 /usr/bin/target
55d4c0b00000-55d4c0b10000 rw-p 00100000 fd:01 1234 /usr/bin/target
7f0000000000-7f0000100000 r-xp 00000000 fd:01 99 /usr/lib/libc.so.6
7ffd00000000-7ffd00021000 rw-p 00000000 00:00 0 [stack]
55d4c0c00000-55d4c0c21000 rw-p 00000000 00:00 0
";

    #[test]
    fn test_memory_range_contains() {
        let range = MemoryRange { start: 0x1000, end: 0x2000 };
        assert!(range.contains(0x1000));
        assert!(range.contains(0x1fff));
        assert!(!range.contains(0x0fff));
        assert!(!range.contains(0x2000));
    }

    #[test]
    fn test_find_mapping_spans_all_segments() {
        let range = find_mapping(MAPS, Path::new("/usr/bin/target")).unwrap();
        assert_eq!(range, MemoryRange { start: 0x55d4_c0a0_0000, end: 0x55d4_c0b1_0000 });
    }

    #[test]
    fn test_find_mapping_exact_path() {
        assert!(find_mapping(MAPS, Path::new("/usr/bin/targ")).is_none());
        assert!(find_mapping(MAPS, Path::new("/usr/lib/libc.so.6")).is_some());
    }

    #[test]
    fn test_identity() {
        assert_eq!(IdentityTranslator.to_link(Pid(1), 0x1234), 0x1234);
    }
}
