//! # fgraph - Main Entry Point
//!
//! Analyze the binary, print the plan under `--dry-run`, otherwise attach
//! uprobes and print call stacks until Ctrl+C (or until `--pid` exits).

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::time::Duration;

use fgraph::analyzer::Analyzer;
use fgraph::backend::{CancellationToken, EbpfBackend};
use fgraph::cli::Args;
use fgraph::preflight::run_preflight_checks;
use fgraph::tracer;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_NOPERM: i32 = 77;

/// How often a traced `--pid` is checked for liveness
const LIVENESS_INTERVAL: Duration = Duration::from_millis(500);

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let msg = format!("{err:#}").to_lowercase();
    if msg.contains("permission denied") || msg.contains("requires root") {
        EXIT_NOPERM
    } else if msg.contains("missing required argument") || msg.contains("invalid pattern") {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    let args = Args::parse();
    let quiet = args.quiet;
    let config = args.into_config();

    if !quiet {
        println!("fgraph v{}", env!("CARGO_PKG_VERSION"));
        println!("binary: {}", config.binary.display());
        if let Some(pid) = config.pid {
            println!("pid: {pid}");
        }
    }

    let analyzer = Analyzer::open(&config.binary)
        .with_context(|| format!("Failed to analyze {}", config.binary.display()))?;
    let plan = tracer::plan(&analyzer, &config)?;

    if config.dry_run {
        tracer::print_plan(&plan, std::io::stdout().lock())?;
        return Ok(());
    }

    run_preflight_checks(&config.binary, config.pid)?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted");
                cancel.cancel();
            }
        });
    }
    if let Some(pid) = config.pid {
        let cancel = cancel.clone();
        let proc_path = format!("/proc/{pid}");
        tokio::spawn(async move {
            while !cancel.is_cancelled() {
                if !std::path::Path::new(&proc_path).exists() {
                    info!("Process {pid} exited");
                    cancel.cancel();
                    break;
                }
                tokio::time::sleep(LIVENESS_INTERVAL).await;
            }
        });
    }

    if !quiet {
        println!("probes: {}", plan.probes.len());
        eprintln!("Tracing, press Ctrl+C to stop");
    }

    let mut backend = EbpfBackend::new(config.pid);
    tokio::task::block_in_place(|| {
        tracer::trace(&analyzer, &plan, &config, &mut backend, &cancel, std::io::stdout().lock())
    })
}
