//! Flatten call trees into the probe set handed to the backend
//!
//! Each instrumentable function yields one entry probe, one return probe per
//! `ret`, and one custom probe per custom offset. A function reachable from
//! several roots is instrumented once.

use std::collections::HashSet;

use log::{debug, warn};

use super::{wildcard, FuncTree};
use crate::domain::{FetchError, ProbeKind};
use crate::fetch::FetchArg;
use crate::patterns::FunctionPattern;
use fgraph_common::MAX_FETCH_ARGS;

/// Name under which an indirect call target is captured
pub const CALL_TARGET_ARG: &str = "__call__";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    pub function: String,
    pub display: String,
    pub kind: ProbeKind,
    /// Link-time address of the probed instruction
    pub address: u64,
    /// File offset the uprobe attaches at
    pub offset: u64,
    /// Offset from the function's first byte
    pub rel_offset: u64,
    /// The function matched a user pattern
    pub root: bool,
    pub backtrace: bool,
    pub fetch_args: Vec<FetchArg>,
}

impl Probe {
    /// `name+rel`, as used in log lines and attach errors
    #[must_use]
    pub fn label(&self) -> String {
        format!("{}+{}", self.display, self.rel_offset)
    }
}

/// What to instrument beyond the bare trees
#[derive(Debug, Clone, Copy)]
pub struct ProbeRequest<'a> {
    pub patterns: &'a [FunctionPattern],
    /// Capture a return-address chain on root entries
    pub backtrace: bool,
    /// Add a custom probe at every register-indirect call site
    pub indirect_calls: bool,
}

fn pattern_matches(pattern: &FunctionPattern, node: &FuncTree) -> bool {
    wildcard::matches(&pattern.name, &node.name) || wildcard::matches(&pattern.name, &node.display_name)
}

/// Record `name+N` offsets and, if asked for, indirect-call sites as custom
/// offsets on every instrumentable node
pub fn annotate_custom_offsets(trees: &mut [FuncTree], request: &ProbeRequest<'_>) {
    for tree in trees {
        tree.walk_mut(&mut |node| {
            if !node.is_instrumentable() {
                return;
            }
            let mut customs: Vec<u64> = request
                .patterns
                .iter()
                .filter(|p| pattern_matches(p, node))
                .filter_map(|p| p.offset)
                .map(|rel| node.file_offset + rel)
                .collect();
            if request.indirect_calls {
                customs.extend(node.indirect_calls.keys().copied());
            }
            customs.extend(node.custom_offsets.iter().copied());
            customs.sort_unstable();
            customs.dedup();
            // One uprobe per file offset; the entry or return probe already sits there
            customs.retain(|&offset| {
                let taken = offset == node.entry_offset || node.return_offsets.contains(&offset);
                if taken {
                    warn!(
                        "{}+{}: already probed as entry or return, custom probe skipped",
                        node.display_name,
                        node.relative(offset)
                    );
                }
                !taken
            });
            node.custom_offsets = customs;
        });
    }
}

/// Flatten `trees` into probes
///
/// # Errors
/// Returns `TooManyArgs` if a probe point collects more fetch args than the
/// kernel record can carry
pub fn build_probes(trees: &[FuncTree], request: &ProbeRequest<'_>) -> Result<Vec<Probe>, FetchError> {
    let mut seen = HashSet::new();
    let mut nodes = Vec::new();
    for tree in trees {
        tree.walk(&mut |node| {
            if node.is_instrumentable() && seen.insert(node.name.as_str()) {
                nodes.push(node);
            }
        });
    }

    let mut probes = Vec::new();
    for node in nodes {
        let probe = |kind: ProbeKind, offset: u64, fetch_args: Vec<FetchArg>| Probe {
            function: node.name.clone(),
            display: node.display_name.clone(),
            kind,
            address: node.address + node.relative(offset),
            offset,
            rel_offset: node.relative(offset),
            root: node.root,
            backtrace: request.backtrace && node.root && kind == ProbeKind::Entry,
            fetch_args,
        };

        let entry_args = collect_args(node, request, None)?;
        probes.push(probe(ProbeKind::Entry, node.entry_offset, entry_args));

        for &offset in &node.return_offsets {
            probes.push(probe(ProbeKind::Return, offset, Vec::new()));
        }

        for &offset in &node.custom_offsets {
            let mut args = collect_args(node, request, Some(node.relative(offset)))?;
            if request.indirect_calls {
                if let Some(reg) = node.indirect_calls.get(&offset) {
                    args.push(FetchArg::parse(CALL_TARGET_ARG, &format!("%{reg}:u64"))?);
                }
            }
            check_arg_count(node, args.len())?;
            probes.push(probe(ProbeKind::Custom, offset, args));
        }
    }

    debug!("{} probes over {} functions", probes.len(), seen.len());
    Ok(probes)
}

fn collect_args(
    node: &FuncTree,
    request: &ProbeRequest<'_>,
    offset: Option<u64>,
) -> Result<Vec<FetchArg>, FetchError> {
    let args: Vec<FetchArg> = request
        .patterns
        .iter()
        .filter(|p| p.offset == offset && pattern_matches(p, node))
        .flat_map(|p| p.args.iter().cloned())
        .collect();
    check_arg_count(node, args.len())?;
    Ok(args)
}

fn check_arg_count(node: &FuncTree, count: usize) -> Result<(), FetchError> {
    if count > MAX_FETCH_ARGS {
        return Err(FetchError::TooManyArgs {
            function: node.display_name.clone(),
            count,
            max: MAX_FETCH_ARGS,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ResolutionError;
    use crate::registers::Register;

    fn node(name: &str, base: u64) -> FuncTree {
        let mut node = FuncTree::new(name, name);
        node.address = 0x400000 + base;
        node.file_offset = base;
        node.entry_offset = base + 4;
        node.return_offsets = vec![base + 10];
        node
    }

    fn pattern(name: &str, offset: Option<u64>, args: &[(&str, &str)]) -> FunctionPattern {
        FunctionPattern {
            name: name.to_string(),
            offset,
            args: args.iter().map(|(n, e)| FetchArg::parse(n, e).unwrap()).collect(),
        }
    }

    /// root -> {a, b}, a -> c, b -> c (pruned)
    fn diamond() -> FuncTree {
        let mut root = node("root", 0x100);
        root.root = true;
        let mut a = node("a", 0x200);
        let mut b = node("b", 0x300);
        a.children.push(node("c", 0x400));
        let mut c_again = FuncTree::new("c", "c");
        c_again.pruned = true;
        b.children.push(c_again);
        root.children = vec![a, b];
        root
    }

    #[test]
    fn test_diamond_instruments_shared_callee_once() {
        let patterns = [pattern("root", None, &[])];
        let request = ProbeRequest { patterns: &patterns, backtrace: false, indirect_calls: false };
        let probes = build_probes(&[diamond()], &request).unwrap();

        let c_entries = probes
            .iter()
            .filter(|p| p.function == "c" && p.kind == ProbeKind::Entry)
            .count();
        assert_eq!(c_entries, 1);
        // 4 functions, entry + one return each
        assert_eq!(probes.len(), 8);
    }

    #[test]
    fn test_errored_nodes_produce_no_probes() {
        let mut root = node("foo", 0x100);
        let mut bar = FuncTree::new("bar", "bar");
        bar.error = Some(ResolutionError::Excluded);
        root.children.push(bar);

        let patterns = [pattern("foo", None, &[])];
        let request = ProbeRequest { patterns: &patterns, backtrace: false, indirect_calls: false };
        let probes = build_probes(&[root], &request).unwrap();
        assert!(probes.iter().all(|p| p.function == "foo"));
        assert_eq!(probes.len(), 2);
    }

    #[test]
    fn test_entry_offsets_and_backtrace_on_roots() {
        let patterns = [pattern("root", None, &[("x", "%rdi:u64")])];
        let request = ProbeRequest { patterns: &patterns, backtrace: true, indirect_calls: false };
        let probes = build_probes(&[diamond()], &request).unwrap();

        let entry = &probes[0];
        assert_eq!(entry.kind, ProbeKind::Entry);
        assert_eq!(entry.offset, 0x104);
        assert_eq!(entry.rel_offset, 4);
        assert_eq!(entry.address, 0x400104);
        assert!(entry.backtrace);
        assert_eq!(entry.fetch_args.len(), 1);

        let ret = &probes[1];
        assert_eq!(ret.kind, ProbeKind::Return);
        assert!(!ret.backtrace);
        assert!(ret.fetch_args.is_empty());

        let a_entry = probes.iter().find(|p| p.function == "a").unwrap();
        assert!(!a_entry.backtrace);
        assert!(a_entry.fetch_args.is_empty());
    }

    #[test]
    fn test_custom_offsets_and_indirect_calls() {
        let mut root = node("foo", 0x100);
        root.root = true;
        root.indirect_calls.insert(0x108, Register::Rax);
        let mut trees = vec![root];

        let patterns = [pattern("foo", None, &[]), pattern("foo", Some(6), &[("n", "%rsi:s32")])];
        let request = ProbeRequest { patterns: &patterns, backtrace: false, indirect_calls: true };
        annotate_custom_offsets(&mut trees, &request);
        assert_eq!(trees[0].custom_offsets, [0x106, 0x108]);

        let probes = build_probes(&trees, &request).unwrap();
        let customs: Vec<_> = probes.iter().filter(|p| p.kind == ProbeKind::Custom).collect();
        assert_eq!(customs.len(), 2);
        assert_eq!(customs[0].rel_offset, 6);
        assert_eq!(customs[0].fetch_args[0].name, "n");
        assert_eq!(customs[1].rel_offset, 8);
        assert_eq!(customs[1].fetch_args[0].name, CALL_TARGET_ARG);
    }

    #[test]
    fn test_custom_offsets_skip_entry_and_return() {
        let mut trees = vec![node("foo", 0x100)];
        let patterns = [
            pattern("foo", None, &[]),
            pattern("foo", Some(4), &[]),
            pattern("foo", Some(7), &[]),
            pattern("foo", Some(10), &[]),
        ];
        let request = ProbeRequest { patterns: &patterns, backtrace: false, indirect_calls: false };
        annotate_custom_offsets(&mut trees, &request);
        assert_eq!(trees[0].custom_offsets, [0x107]);
    }

    #[test]
    fn test_too_many_args() {
        let args: Vec<(String, String)> = (0..9).map(|i| (format!("v{i}"), "%rdi:u8".to_string())).collect();
        let borrowed: Vec<(&str, &str)> = args.iter().map(|(n, e)| (n.as_str(), e.as_str())).collect();
        let patterns = [pattern("foo", None, &borrowed)];
        let request = ProbeRequest { patterns: &patterns, backtrace: false, indirect_calls: false };
        let err = build_probes(&[node("foo", 0)], &request).unwrap_err();
        assert!(matches!(err, FetchError::TooManyArgs { count: 9, .. }));
    }
}
