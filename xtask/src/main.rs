use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Package holding the uprobe programs
const EBPF_PACKAGE: &str = "fgraph-ebpf";
/// Binary name of that package; `fgraph/build.rs` stages it from here
const EBPF_BIN: &str = "fgraph";

#[derive(Parser)]
struct Args {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Parser)]
enum Cmd {
    /// Cross-compile the uprobe programs for the userspace build to embed
    BuildEbpf {
        #[arg(long, default_value = "bpfel-unknown-none")]
        target: String,
    },
}

fn main() -> Result<()> {
    match Args::parse().command {
        Cmd::BuildEbpf { target } => build_ebpf(&target),
    }
}

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

fn build_ebpf(target: &str) -> Result<()> {
    let root = workspace_root();

    // Debug builds pull in formatting code the BPF linker rejects
    let status = Command::new("cargo")
        .current_dir(&root)
        .args(["+nightly", "build", "--package", EBPF_PACKAGE, "--target", target])
        .args(["-Z", "build-std=core", "--release"])
        .status()
        .context("Failed to run cargo for the eBPF build")?;
    if !status.success() {
        bail!("Building {EBPF_PACKAGE} for {target} failed");
    }

    let object = root.join("target").join(target).join("release").join(EBPF_BIN);
    let size = std::fs::metadata(&object)
        .with_context(|| format!("Build succeeded but {} is missing", object.display()))?
        .len();

    println!("✓ uprobe programs built: {} ({size} bytes)", object.display());
    println!("  Rebuild fgraph to embed them");
    Ok(())
}
