//! # Event Reconstructor
//!
//! Rebuilds per-thread call trees from the probe event stream and prints each
//! one when it closes.
//!
//! - [`state`] - per-context open stacks and their transitions
//! - [`args`] - payload queues filled by a collector thread
//! - [`render`] - trace line formatting
//! - [`clock`] - probe timestamps to wall-clock time
//!
//! Events are handled on one thread. Payloads for an event are taken from its
//! context's queue when the event is recorded, so a slow payload stream only
//! stalls the context that is waiting on it, up to the argument timeout.

pub mod args;
pub mod clock;
pub mod render;
pub mod state;

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{debug, warn};

use crate::analyzer::{Analyzer, Probe};
use crate::backend::{AddressTranslator, CancellationToken, IdentityTranslator};
use crate::domain::{ProbeKind, ReconstructError, Tid, TraceEvent};

pub use args::ArgQueues;
pub use clock::BootClock;
pub use state::{OpenStack, Record, StackTable, Transition};

pub const DEFAULT_ARG_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the event loop blocks before checking for cancellation
const RECV_INTERVAL: Duration = Duration::from_millis(100);

pub struct Reconstructor<'a, W: Write> {
    analyzer: &'a Analyzer,
    /// Probes by link-time address and kind
    probes: HashMap<(u64, ProbeKind), &'a Probe>,
    translator: Box<dyn AddressTranslator + 'a>,
    args: Arc<ArgQueues>,
    arg_timeout: Duration,
    clock: BootClock,
    stacks: StackTable,
    out: W,
}

impl<'a, W: Write> Reconstructor<'a, W> {
    #[must_use]
    pub fn new(analyzer: &'a Analyzer, probes: &'a [Probe], args: Arc<ArgQueues>, out: W) -> Self {
        Self {
            analyzer,
            probes: probes.iter().map(|p| ((p.address, p.kind), p)).collect(),
            translator: Box::new(IdentityTranslator),
            args,
            arg_timeout: DEFAULT_ARG_TIMEOUT,
            clock: BootClock::new(),
            stacks: StackTable::new(),
            out,
        }
    }

    #[must_use]
    pub fn with_translator(mut self, translator: impl AddressTranslator + 'a) -> Self {
        self.translator = Box::new(translator);
        self
    }

    #[must_use]
    pub fn with_arg_timeout(mut self, timeout: Duration) -> Self {
        self.arg_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: BootClock) -> Self {
        self.clock = clock;
        self
    }

    /// Stacks still open
    #[must_use]
    pub fn open_contexts(&self) -> usize {
        self.stacks.len()
    }

    pub fn into_output(self) -> W {
        self.out
    }

    fn probe_at(&self, kind: ProbeKind, ip: u64) -> Result<&'a Probe, ReconstructError> {
        self.probes
            .get(&(ip, kind))
            .copied()
            .ok_or(ReconstructError::UnknownProbe { kind, ip })
    }

    /// Record one event, printing its stack if the event closes it
    ///
    /// # Errors
    /// Fails on an event carrying an errno, an address matching no probe, a
    /// payload wait that times out, or a write error
    pub fn handle(&mut self, mut event: TraceEvent) -> Result<(), ReconstructError> {
        if event.errno != 0 {
            return Err(ReconstructError::EventError { context: event.context, errno: event.errno });
        }

        let pid = event.pid;
        event.ip = self.translator.to_link(pid, event.ip);
        event.caller_ip = self.translator.to_link(pid, event.caller_ip);
        for addr in &mut event.backtrace {
            *addr = self.translator.to_link(pid, *addr);
        }

        let probe = self.probe_at(event.kind, event.ip)?;
        let wanted = event.arg_count as usize;
        if wanted != probe.fetch_args.len() {
            warn!(
                "{}: {} captured {wanted} args, {} configured",
                event.context,
                probe.label(),
                probe.fetch_args.len()
            );
        }
        let args = self.args.take(event.context, wanted, self.arg_timeout)?;

        let context = event.context;
        match self.stacks.add(event, args) {
            Transition::Discarded => debug!("{context}: no open stack, dropped {} event", probe.kind),
            Transition::Replaced => debug!("{context}: collapsed duplicate entry of {}", probe.label()),
            Transition::Open => {}
            Transition::Closed => {
                if let Some(stack) = self.stacks.take(context) {
                    if self.is_rooted(&stack)? {
                        self.render_stack(context, &stack.records)?;
                    } else {
                        debug!("{context}: stack not rooted at a requested function, dropped");
                    }
                }
            }
        }
        Ok(())
    }

    fn is_rooted(&self, stack: &OpenStack) -> Result<bool, ReconstructError> {
        match stack.records.first() {
            Some(first) => Ok(self.probe_at(first.event.kind, first.event.ip)?.root),
            None => Ok(false),
        }
    }

    /// Print every stack still open, ordered by context id
    ///
    /// # Errors
    /// Fails on a render or write error
    pub fn flush(&mut self) -> Result<(), ReconstructError> {
        for (context, stack) in self.stacks.drain_sorted() {
            debug!("{context}: flushing unbalanced stack (depth {})", stack.depth);
            self.render_stack(context, &stack.records)?;
        }
        self.out.flush()?;
        Ok(())
    }

    /// Consume `events` until cancelled or the stream ends, then flush
    ///
    /// # Errors
    /// Stops at the first event [`handle`](Self::handle) rejects
    pub fn run(&mut self, events: &Receiver<TraceEvent>, cancel: &CancellationToken) -> Result<(), ReconstructError> {
        while !cancel.is_cancelled() {
            match events.recv_timeout(RECV_INTERVAL) {
                Ok(event) => self.handle(event)?,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.flush()
    }

    #[cfg(test)]
    fn stack(&self, context: Tid) -> Option<&OpenStack> {
        self.stacks.get(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::BinaryImage;
    use crate::domain::{ArgPayload, Pid};
    use crate::fetch::FetchArg;
    use chrono::{FixedOffset, TimeZone};

    /// An analyzer with no symbols; rendering falls back to hex addresses
    fn analyzer() -> Analyzer {
        let mut obj = object::write::Object::new(
            object::BinaryFormat::Elf,
            object::Architecture::X86_64,
            object::Endianness::Little,
        );
        let text = obj.add_section(Vec::new(), b".text".to_vec(), object::write::SectionKind::Text);
        obj.append_section_data(text, &[0xc3], 16);
        let image = BinaryImage::from_bytes("/tmp/empty", obj.write().unwrap()).unwrap();
        Analyzer::new(image)
    }

    fn probe(name: &str, kind: ProbeKind, address: u64, root: bool, args: &[(&str, &str)]) -> Probe {
        Probe {
            function: name.to_string(),
            display: name.to_string(),
            kind,
            address,
            offset: address - 0x400000,
            rel_offset: 0,
            root,
            backtrace: false,
            fetch_args: args.iter().map(|(n, e)| FetchArg::parse(n, e).unwrap()).collect(),
        }
    }

    fn event(kind: ProbeKind, ip: u64, time_ns: u64, arg_count: u32) -> TraceEvent {
        TraceEvent {
            context: Tid(1),
            pid: Pid(1),
            kind,
            ip,
            caller_ip: 0,
            frame: 0x7000,
            time_ns,
            errno: 0,
            backtrace: Vec::new(),
            arg_count,
        }
    }

    fn clock() -> BootClock {
        BootClock::starting_at(FixedOffset::east_opt(0).unwrap().with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap())
    }

    #[test]
    fn test_errno_is_fatal() {
        let analyzer = analyzer();
        let probes = [probe("foo", ProbeKind::Entry, 0x401000, true, &[])];
        let mut r = Reconstructor::new(&analyzer, &probes, Arc::new(ArgQueues::new()), Vec::new());
        let mut bad = event(ProbeKind::Entry, 0x401000, 0, 0);
        bad.errno = -14;
        assert!(matches!(r.handle(bad), Err(ReconstructError::EventError { errno: -14, .. })));
    }

    #[test]
    fn test_unknown_probe_is_fatal() {
        let analyzer = analyzer();
        let probes = [probe("foo", ProbeKind::Entry, 0x401000, true, &[])];
        let mut r = Reconstructor::new(&analyzer, &probes, Arc::new(ArgQueues::new()), Vec::new());
        assert!(matches!(
            r.handle(event(ProbeKind::Entry, 0x402000, 0, 0)),
            Err(ReconstructError::UnknownProbe { ip: 0x402000, .. })
        ));
    }

    #[test]
    fn test_closed_root_stack_is_printed() {
        let analyzer = analyzer();
        let probes = [
            probe("foo", ProbeKind::Entry, 0x401004, true, &[("n", "%rdi:u32")]),
            probe("foo", ProbeKind::Return, 0x401010, true, &[]),
        ];
        let args = Arc::new(ArgQueues::new());
        let mut data = vec![0u8; 64];
        data[0] = 42;
        args.push(ArgPayload { context: Tid(1), index: 0, data });

        let mut r = Reconstructor::new(&analyzer, &probes, Arc::clone(&args), Vec::new()).with_clock(clock());
        r.handle(event(ProbeKind::Entry, 0x401004, 1_000_000, 1)).unwrap();
        assert_eq!(r.stack(Tid(1)).unwrap().records[0].args.len(), 1);
        r.handle(event(ProbeKind::Return, 0x401010, 3_000_000, 0)).unwrap();
        assert_eq!(r.open_contexts(), 0);

        let out = String::from_utf8(r.into_output()).unwrap();
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines[0], "");
        assert_eq!(lines[1], "02 03:04:05.0010   0.0000  foo+0(n=42) { 0x0");
        assert_eq!(lines[2], "02 03:04:05.0030   0.0020  } 0x401010");
    }

    #[test]
    fn test_probes_sharing_an_address_resolve_by_kind() {
        let analyzer = analyzer();
        let probes = [
            probe("foo", ProbeKind::Entry, 0x401004, true, &[("n", "%rdi:u32")]),
            probe("foo", ProbeKind::Custom, 0x401004, false, &[]),
        ];
        let args = Arc::new(ArgQueues::new());
        args.push(ArgPayload { context: Tid(1), index: 0, data: vec![0; 64] });

        let mut r = Reconstructor::new(&analyzer, &probes, Arc::clone(&args), Vec::new());
        r.handle(event(ProbeKind::Entry, 0x401004, 0, 1)).unwrap();
        r.handle(event(ProbeKind::Custom, 0x401004, 10, 0)).unwrap();

        let stack = r.stack(Tid(1)).unwrap();
        assert_eq!(stack.records.len(), 2);
        assert_eq!(stack.records[0].args.len(), 1);
        assert!(stack.records[1].args.is_empty());
    }

    #[test]
    fn test_non_root_stack_is_dropped() {
        let analyzer = analyzer();
        let probes = [
            probe("bar", ProbeKind::Entry, 0x402004, false, &[]),
            probe("bar", ProbeKind::Return, 0x402010, false, &[]),
        ];
        let mut r = Reconstructor::new(&analyzer, &probes, Arc::new(ArgQueues::new()), Vec::new());
        r.handle(event(ProbeKind::Entry, 0x402004, 0, 0)).unwrap();
        r.handle(event(ProbeKind::Return, 0x402010, 10, 0)).unwrap();
        assert_eq!(r.open_contexts(), 0);
        assert!(r.into_output().is_empty());
    }

    #[test]
    fn test_discarded_custom_still_consumes_args() {
        let analyzer = analyzer();
        let probes = [probe("foo", ProbeKind::Custom, 0x401008, true, &[("x", "%rax:u64")])];
        let args = Arc::new(ArgQueues::new());
        args.push(ArgPayload { context: Tid(1), index: 0, data: vec![0; 64] });

        let mut r = Reconstructor::new(&analyzer, &probes, Arc::clone(&args), Vec::new());
        r.handle(event(ProbeKind::Custom, 0x401008, 0, 1)).unwrap();
        assert_eq!(args.pending(Tid(1)), 0);
        assert_eq!(r.open_contexts(), 0);
    }

    #[test]
    fn test_flush_renders_unbalanced_stacks() {
        let analyzer = analyzer();
        let probes = [probe("foo", ProbeKind::Entry, 0x401004, true, &[])];
        let mut r = Reconstructor::new(&analyzer, &probes, Arc::new(ArgQueues::new()), Vec::new()).with_clock(clock());
        r.handle(event(ProbeKind::Entry, 0x401004, 0, 0)).unwrap();
        r.flush().unwrap();
        assert_eq!(r.open_contexts(), 0);
        let out = String::from_utf8(r.into_output()).unwrap();
        assert!(out.contains("foo+0 { 0x0"));
    }
}
