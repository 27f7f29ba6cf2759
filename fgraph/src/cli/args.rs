//! CLI argument definitions

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::domain::Pid;
use crate::tracer::TraceConfig;

#[derive(Parser, Debug)]
#[command(
    name = "fgraph",
    version,
    about = "Trace function call graphs of native binaries with uprobes",
    after_help = "\
PATTERNS:
    name                     trace functions matching name (`*` is a wildcard)
    name(var=expr, ...)      also capture values at entry
    name+N(var=expr, ...)    custom probe N bytes into the function
    !name                    exclude from the call graph

FETCH EXPRESSIONS:
    %rdi:u64                 register, as unsigned 64-bit
    -8(%rbp):s32             4 bytes at rbp-8, signed
    +0(+16(%rdi)):c64        8 bytes behind the pointer at rdi+16, as text

EXAMPLES:
    sudo fgraph ./server 'handle_*'
    sudo fgraph -d 2 ./server 'handle_request(fd=%rdi:s32)' '!log_*'
    sudo fgraph -b -p 1234 ./server 'parse+24(len=%rsi:u64)'"
)]
pub struct Args {
    /// Binary to trace
    #[arg(value_name = "BINARY")]
    pub binary: PathBuf,

    /// Function patterns
    #[arg(value_name = "PATTERN", required = true)]
    pub patterns: Vec<String>,

    /// Call-graph search depth below each matched function
    #[arg(short, long, default_value = "3")]
    pub depth: usize,

    /// Capture a return-address chain on requested functions
    #[arg(short, long)]
    pub backtrace: bool,

    /// Probe register-indirect call sites and show their targets
    #[arg(short, long)]
    pub indirect_calls: bool,

    /// Only trace this process
    #[arg(short, long)]
    pub pid: Option<u32>,

    /// Give up after waiting this long for captured argument values
    #[arg(long, value_name = "MS", default_value = "5000")]
    pub arg_timeout: u64,

    /// Analyze and print probes without attaching them
    #[arg(long)]
    pub dry_run: bool,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    #[must_use]
    pub fn into_config(self) -> TraceConfig {
        TraceConfig {
            binary: self.binary,
            patterns: self.patterns,
            depth: self.depth,
            backtrace: self.backtrace,
            indirect_calls: self.indirect_calls,
            pid: self.pid.map(Pid),
            arg_timeout: Duration::from_millis(self.arg_timeout),
            dry_run: self.dry_run,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_command_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_full() {
        let args = Args::try_parse_from([
            "fgraph",
            "-d",
            "2",
            "-b",
            "--pid",
            "42",
            "--arg-timeout",
            "250",
            "./server",
            "handle(fd=%rdi:s32)",
            "!log_*",
        ])
        .unwrap();
        let config = args.into_config();
        assert_eq!(config.binary, PathBuf::from("./server"));
        assert_eq!(config.patterns, ["handle(fd=%rdi:s32)", "!log_*"]);
        assert_eq!(config.depth, 2);
        assert!(config.backtrace);
        assert!(!config.indirect_calls);
        assert_eq!(config.pid, Some(Pid(42)));
        assert_eq!(config.arg_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_defaults() {
        let config = Args::try_parse_from(["fgraph", "./server", "main"]).unwrap().into_config();
        assert_eq!(config.depth, 3);
        assert_eq!(config.arg_timeout, Duration::from_secs(5));
        assert!(!config.dry_run);
    }

    #[test]
    fn test_pattern_required() {
        let err = Args::try_parse_from(["fgraph", "./server"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }
}
