//! Stage the probe object built by `cargo xtask build-ebpf`
//!
//! A missing object is replaced by an empty placeholder so the userspace
//! crate still builds and tests; loading then fails with a hint.

use std::path::PathBuf;
use std::{env, fs};

const OBJECT: &str = "../target/bpfel-unknown-none/release/fgraph";

fn main() -> std::io::Result<()> {
    println!("cargo:rerun-if-changed={OBJECT}");

    let manifest = PathBuf::from(env::var_os("CARGO_MANIFEST_DIR").unwrap_or_default());
    let out_dir = PathBuf::from(env::var_os("OUT_DIR").unwrap_or_default());
    let src = manifest.join(OBJECT);
    let dst = out_dir.join("fgraph.bpf.o");

    match fs::read(&src) {
        Ok(bytes) if bytes.starts_with(b"\x7fELF") => fs::write(&dst, bytes)?,
        Ok(_) => {
            println!("cargo:warning={} is not an ELF object, probes cannot be loaded", src.display());
            fs::write(&dst, [])?;
        }
        Err(_) => {
            println!(
                "cargo:warning=No probe object at {}; run `cargo xtask build-ebpf` before tracing",
                src.display()
            );
            fs::write(&dst, [])?;
        }
    }
    Ok(())
}
