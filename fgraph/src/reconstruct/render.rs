//! Trace lines for a finished stack
//!
//! ```text
//! 05 10:00:00.0001   0.0000  main.handler+4(fd=3) { main.serve+112
//! 05 10:00:00.0002   0.0001    main.read+4 { main.handler+37
//! 05 10:00:00.0004   0.0002    } main.read+52
//! 05 10:00:00.0004   0.0003  } main.handler+90
//! ```
//!
//! Columns: wall-clock time, seconds since the previous event (or spent in
//! the call, for returns), indentation, location. Each stack is preceded by a
//! blank line.

use std::io::Write;

use super::clock::seconds_between;
use super::{Reconstructor, Record};
use crate::analyzer::probes::CALL_TARGET_ARG;
use crate::analyzer::Probe;
use crate::binary::SymbolKind;
use crate::domain::{ArgPayload, Pid, ProbeKind, ReconstructError, Tid};

const INDENT: &str = "  ";

fn call_target(data: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    let n = data.len().min(8);
    raw[..n].copy_from_slice(&data[..n]);
    u64::from_le_bytes(raw)
}

impl<W: Write> Reconstructor<'_, W> {
    /// Print the records of one stack
    ///
    /// # Errors
    /// Fails if an address matches no probe, a `__call__` value is not a
    /// function start, or the output cannot be written
    pub(super) fn render_stack(&mut self, context: Tid, records: &[Record]) -> Result<(), ReconstructError> {
        writeln!(self.out)?;

        let mut depth = 0usize;
        let mut starts: Vec<u64> = Vec::new();
        let mut previous: Option<u64> = None;

        for record in records {
            let event = &record.event;
            let time = self.clock.format(event.time_ns);
            let since = previous.map_or(0.0, |prev| seconds_between(prev, event.time_ns));
            let indent = INDENT.repeat(depth);

            match event.kind {
                ProbeKind::Entry => {
                    let probe = self.probe_at(event.kind, event.ip)?;
                    let args = self.sprint_args(event.pid, probe, &record.args)?;
                    let chain = self.call_chain(probe, event.caller_ip, &event.backtrace);
                    writeln!(self.out, "{time} {since:8.4} {indent} {}{args} {{ {chain}", probe.label())?;
                    starts.push(event.time_ns);
                    depth += 1;
                }
                ProbeKind::Return => {
                    if depth == 0 {
                        continue;
                    }
                    depth -= 1;
                    let elapsed = starts.pop().map_or(0.0, |start| seconds_between(start, event.time_ns));
                    let indent = INDENT.repeat(depth);
                    let location = self.analyzer.describe_address(event.ip);
                    writeln!(self.out, "{time} {elapsed:8.4} {indent} }} {location}")?;
                }
                ProbeKind::Custom => {
                    if depth == 0 {
                        continue;
                    }
                    let probe = self.probe_at(event.kind, event.ip)?;
                    let args = self.sprint_args(event.pid, probe, &record.args)?;
                    writeln!(self.out, "{time} {since:8.4} {indent} {}{args}", probe.label())?;
                }
            }
            previous = Some(event.time_ns);
        }

        log::trace!("{context}: rendered {} records", records.len());
        Ok(())
    }

    /// `(a=1, b=2)`, or nothing for a probe without fetch args
    fn sprint_args(&mut self, pid: Pid, probe: &Probe, payloads: &[ArgPayload]) -> Result<String, ReconstructError> {
        if probe.fetch_args.is_empty() {
            return Ok(String::new());
        }

        let mut values = Vec::with_capacity(probe.fetch_args.len());
        for (arg, payload) in probe.fetch_args.iter().zip(payloads) {
            if arg.name == CALL_TARGET_ARG {
                let target = self.translator.to_link(pid, call_target(&payload.data));
                let (symbols, offset) = self.analyzer.resolve_address(target)?;
                if offset != 0 {
                    return Err(ReconstructError::CallTarget(target));
                }
                let name = symbols
                    .iter()
                    .find(|s| s.kind == SymbolKind::Function)
                    .or_else(|| symbols.first())
                    .map_or("?", |s| s.display_name.as_str());
                values.push(format!("{CALL_TARGET_ARG}={name}"));
            } else {
                values.push(arg.sprint(&payload.data));
            }
        }
        for arg in probe.fetch_args.iter().skip(payloads.len()) {
            values.push(format!("{}=?", arg.name));
        }
        Ok(format!("({})", values.join(", ")))
    }

    /// Caller, then the captured return addresses when the probe asked for them
    fn call_chain(&self, probe: &Probe, caller_ip: u64, backtrace: &[u64]) -> String {
        let mut chain = vec![self.analyzer.describe_address(caller_ip)];
        if probe.backtrace {
            chain.extend(backtrace.iter().map(|&addr| self.analyzer.describe_address(addr)));
        }
        chain.join(" > ")
    }
}
