//! # Trace Session
//!
//! Ties the three stages together:
//!
//! 1. [`plan`] - parse patterns, build call trees, flatten them into probes
//! 2. [`trace`] - compile fetch args, load and attach through a
//!    [`ProbeBackend`], reconstruct stacks until cancelled, detach
//!
//! Everything up to and including [`plan`] is pure analysis and runs the same
//! under `--dry-run`.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{info, warn};

use crate::analyzer::probes::annotate_custom_offsets;
use crate::analyzer::{build_probes, Analyzer, FuncTree, Probe, ProbeRequest};
use crate::backend::{compile_probes, CancellationToken, ProbeBackend, ProcessMaps};
use crate::domain::Pid;
use crate::patterns::PatternSet;
use crate::reconstruct::{args, ArgQueues, Reconstructor};

/// Session settings, independent of how they were given
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceConfig {
    pub binary: PathBuf,
    pub patterns: Vec<String>,
    pub depth: usize,
    pub backtrace: bool,
    pub indirect_calls: bool,
    pub pid: Option<Pid>,
    pub arg_timeout: Duration,
    pub dry_run: bool,
}

impl TraceConfig {
    #[must_use]
    pub fn new<P: Into<PathBuf>>(binary: P, patterns: &[&str]) -> Self {
        Self {
            binary: binary.into(),
            patterns: patterns.iter().map(ToString::to_string).collect(),
            depth: 3,
            backtrace: false,
            indirect_calls: false,
            pid: None,
            arg_timeout: crate::reconstruct::DEFAULT_ARG_TIMEOUT,
            dry_run: false,
        }
    }
}

/// What analysis decided to instrument
#[derive(Debug)]
pub struct TracePlan {
    pub patterns: PatternSet,
    pub trees: Vec<FuncTree>,
    pub probes: Vec<Probe>,
}

/// Analyze the binary and decide on probes
///
/// Call trees are logged as they are built. Functions that fail to resolve
/// stay in the trees with their error and produce no probes.
///
/// # Errors
/// Fails on a malformed pattern, when no function matches, or when a probe
/// collects more fetch args than the kernel record holds
pub fn plan(analyzer: &Analyzer, config: &TraceConfig) -> Result<TracePlan> {
    let patterns = PatternSet::parse(&config.patterns)?;
    if patterns.includes.is_empty() {
        bail!("No function to trace: every pattern is an exclusion");
    }

    let roots = patterns.root_names();
    let mut trees = analyzer.call_graph(&roots, &patterns.excludes, config.depth);
    if trees.is_empty() {
        bail!("No function in {} matches {}", config.binary.display(), roots.join(", "));
    }

    let request = ProbeRequest {
        patterns: &patterns.includes,
        backtrace: config.backtrace,
        indirect_calls: config.indirect_calls,
    };
    annotate_custom_offsets(&mut trees, &request);
    for tree in &trees {
        tree.print();
    }

    let probes = build_probes(&trees, &request)?;
    if probes.is_empty() {
        bail!("Nothing to instrument: every matched function failed to resolve");
    }
    info!("Found {} uprobes in {} trees", probes.len(), trees.len());

    Ok(TracePlan { patterns, trees, probes })
}

/// Call trees followed by the probes they produced, for `--dry-run`
///
/// # Errors
/// Returns any write error
pub fn print_plan(plan: &TracePlan, mut out: impl Write) -> io::Result<()> {
    for tree in &plan.trees {
        print_tree(tree, 0, &mut out)?;
    }
    writeln!(out)?;
    print_probes(&plan.probes, out)
}

fn print_tree(tree: &FuncTree, depth: usize, out: &mut impl Write) -> io::Result<()> {
    writeln!(out, "{}{}", "  ".repeat(depth), tree.describe())?;
    for child in &tree.children {
        print_tree(child, depth + 1, out)?;
    }
    Ok(())
}

/// One line per probe
///
/// # Errors
/// Returns any write error
pub fn print_probes(probes: &[Probe], mut out: impl Write) -> io::Result<()> {
    for probe in probes {
        let args: Vec<String> = probe
            .fetch_args
            .iter()
            .map(|a| format!("{}={}", a.name, a.expression))
            .collect();
        write!(out, "{:<6} {:<40} 0x{:x}", probe.kind, probe.label(), probe.offset)?;
        if !args.is_empty() {
            write!(out, " ({})", args.join(", "))?;
        }
        if probe.backtrace {
            write!(out, " [backtrace]")?;
        }
        writeln!(out)?;
    }
    Ok(())
}

/// Instrument, reconstruct until `cancel` fires or the backend stops, detach
///
/// # Errors
/// Fails if the probes cannot be compiled, loaded or attached, or if
/// reconstruction hits a fatal event. Probes are detached in every case.
pub fn trace<B: ProbeBackend>(
    analyzer: &Analyzer,
    plan: &TracePlan,
    config: &TraceConfig,
    backend: &mut B,
    cancel: &CancellationToken,
    out: impl Write,
) -> Result<()> {
    let compiled = compile_probes(&plan.probes)?;
    let binary = std::fs::canonicalize(&config.binary).unwrap_or_else(|_| config.binary.clone());

    if let Err(e) = backend.load(&compiled) {
        backend.detach();
        return Err(e).context("Failed to load probes");
    }
    backend
        .attach(&binary, &compiled)
        .context("Failed to attach probes")?;
    info!("Start tracing");

    let result = reconstruct(analyzer, plan, config, backend, cancel, out);
    cancel.cancel();
    info!("Detaching uprobes");
    backend.detach();
    result
}

fn reconstruct<B: ProbeBackend>(
    analyzer: &Analyzer,
    plan: &TracePlan,
    config: &TraceConfig,
    backend: &mut B,
    cancel: &CancellationToken,
    out: impl Write,
) -> Result<()> {
    let payloads = backend.poll_arg_payloads(cancel)?;
    let events = backend.poll_events(cancel)?;

    let queues = Arc::new(ArgQueues::new());
    let collector = args::spawn_collector(Arc::clone(&queues), payloads)
        .context("Failed to start argument collector")?;

    let mut reconstructor = Reconstructor::new(analyzer, &plan.probes, queues, out)
        .with_translator(ProcessMaps::new(analyzer.image()))
        .with_arg_timeout(config.arg_timeout);
    let result = reconstructor.run(&events, cancel);

    // Stops the poll threads, which closes the payload stream
    cancel.cancel();
    drop(events);
    if collector.join().is_err() {
        warn!("Argument collector panicked");
    }

    result.map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ProbeKind;
    use crate::fetch::FetchArg;

    #[test]
    fn test_print_probes() {
        let probe = Probe {
            function: "foo".to_string(),
            display: "foo".to_string(),
            kind: ProbeKind::Entry,
            address: 0x401004,
            offset: 0x1004,
            rel_offset: 4,
            root: true,
            backtrace: true,
            fetch_args: vec![FetchArg::parse("n", "%rdi:u32").unwrap()],
        };
        let mut out = Vec::new();
        print_probes(&[probe], &mut out).unwrap();
        let line = String::from_utf8(out).unwrap();
        assert!(line.starts_with("entry  foo+4 "));
        assert!(line.trim_end().ends_with("0x1004 (n=%rdi:u32) [backtrace]"));
    }

    #[test]
    fn test_config_defaults() {
        let config = TraceConfig::new("/bin/true", &["main"]);
        assert_eq!(config.depth, 3);
        assert_eq!(config.patterns, ["main"]);
        assert!(config.pid.is_none());
    }
}
