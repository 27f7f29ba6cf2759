//! # aya Probe Backend
//!
//! Loads the uprobe programs from the embedded probe object and attaches
//! them at file offsets of the traced binary.
//!
//! Probes without fetch args share the programs of one base object. Each
//! probe with fetch args gets its own copy of the object with the fetch
//! prelude spliced into its program. All copies load with the same pin path,
//! so `EVENTS`, `ARGS` and `ARG_SCRATCH` resolve to one set of kernel maps.

use std::collections::HashSet;
use std::fs;
use std::mem::size_of;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use aya::maps::{MapData, RingBuf};
use aya::programs::UProbe;
use aya::{include_bytes_aligned, Ebpf, EbpfLoader};
use aya_log::EbpfLogger;
use crossbeam_channel::Receiver;
use fgraph_common::{ArgPayload as RawArgPayload, Event as RawEvent};
use log::{debug, info, warn};

use super::{object_patch, CancellationToken, CompiledProbe, ProbeBackend};
use crate::domain::{ArgPayload, BackendError, Pid, ProbeKind, Tid, TraceEvent};

/// Staged by the build script; empty when `cargo xtask build-ebpf` has not run
static PROBE_OBJECT: &[u8] = include_bytes_aligned!(concat!(env!("OUT_DIR"), "/fgraph.bpf.o"));

const EVENTS_MAP: &str = "EVENTS";
const ARGS_MAP: &str = "ARGS";

/// Records buffered per stream before the poll thread blocks
const CHANNEL_CAPACITY: usize = 1000;

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const DETACH_TIMEOUT: Duration = Duration::from_secs(5);

/// Object bytes with the 8-byte alignment the ELF parser expects
struct AlignedObject {
    words: Vec<u64>,
    len: usize,
}

impl AlignedObject {
    fn new(bytes: &[u8]) -> Self {
        let words = bytes
            .chunks(8)
            .map(|chunk| {
                let mut word = [0u8; 8];
                word[..chunk.len()].copy_from_slice(chunk);
                u64::from_ne_bytes(word)
            })
            .collect();
        Self { words, len: bytes.len() }
    }

    fn as_bytes(&self) -> &[u8] {
        #[allow(unsafe_code)]
        // SAFETY: `len` never exceeds the byte size of `words`, and u8 has
        // no alignment requirement
        unsafe {
            std::slice::from_raw_parts(self.words.as_ptr().cast::<u8>(), self.len)
        }
    }
}

pub struct EbpfBackend {
    pid: Option<i32>,
    pin_dir: PathBuf,
    base: Option<Ebpf>,
    /// Patched copies, keyed by the index of their probe
    patched: Vec<(usize, Ebpf)>,
}

impl EbpfBackend {
    /// Restrict probes to `pid`, or trace every process running the binary
    #[must_use]
    pub fn new(pid: Option<Pid>) -> Self {
        Self {
            pid: pid.and_then(|p| i32::try_from(p.0).ok()),
            pin_dir: PathBuf::from(format!("/sys/fs/bpf/fgraph-{}", std::process::id())),
            base: None,
            patched: Vec::new(),
        }
    }

    fn loader(&self) -> EbpfLoader<'_> {
        let mut loader = EbpfLoader::new();
        loader.map_pin_path(&self.pin_dir);
        loader
    }

    fn attach_all(&mut self, binary: &Path, probes: &[CompiledProbe]) -> Result<(), BackendError> {
        let pid = self.pid;
        let base = self.base.as_mut().ok_or(BackendError::NotLoaded)?;

        for (index, compiled) in probes.iter().enumerate() {
            let bpf: &mut Ebpf = match self.patched.iter_mut().find(|(i, _)| *i == index) {
                Some((_, bpf)) => bpf,
                None => &mut *base,
            };
            let name = compiled.program_name();
            let program: &mut UProbe = bpf
                .program_mut(name)
                .ok_or_else(|| BackendError::NotFound(name.to_string()))?
                .try_into()?;

            program
                .attach(None, compiled.probe.offset, binary, pid)
                .map_err(|e| BackendError::ProbeAttachFailed {
                    probe: compiled.probe.label(),
                    offset: compiled.probe.offset,
                    binary: binary.display().to_string(),
                    error: e.to_string(),
                })?;
            debug!("Attached {} ({name}) at 0x{:x}", compiled.probe.label(), compiled.probe.offset);
        }
        Ok(())
    }

    fn take_ring(&mut self, name: &str) -> Result<RingBuf<MapData>, BackendError> {
        let base = self.base.as_mut().ok_or(BackendError::NotLoaded)?;
        let map = base
            .take_map(name)
            .ok_or_else(|| BackendError::NotFound(name.to_string()))?;
        Ok(RingBuf::try_from(map)?)
    }
}

fn load_program(bpf: &mut Ebpf, compiled: &CompiledProbe) -> Result<(), BackendError> {
    let name = compiled.program_name();
    let program: &mut UProbe = bpf
        .program_mut(name)
        .ok_or_else(|| BackendError::NotFound(name.to_string()))?
        .try_into()?;
    program.load().map_err(|e| BackendError::LoadFailed {
        program: format!("{name} for {}", compiled.probe.label()),
        error: e.to_string(),
    })
}

impl ProbeBackend for EbpfBackend {
    fn load(&mut self, probes: &[CompiledProbe]) -> Result<(), BackendError> {
        if PROBE_OBJECT.is_empty() {
            return Err(BackendError::LoadFailed {
                program: "probe object".to_string(),
                error: "not built, run `cargo xtask build-ebpf` first".to_string(),
            });
        }
        fs::create_dir_all(&self.pin_dir)?;

        let mut base = self.loader().load(PROBE_OBJECT)?;
        if let Err(e) = EbpfLogger::init(&mut base) {
            warn!("Failed to initialize eBPF logger: {e}");
        }

        let mut loaded = HashSet::new();
        for (index, compiled) in probes.iter().enumerate() {
            match &compiled.prelude {
                None => {
                    if loaded.insert(compiled.program_name()) {
                        load_program(&mut base, compiled)?;
                    }
                }
                Some(prelude) => {
                    let bytes = object_patch::patch_program(PROBE_OBJECT, compiled.program_name(), prelude)?;
                    let object = AlignedObject::new(&bytes);
                    let mut bpf = self.loader().load(object.as_bytes())?;
                    load_program(&mut bpf, compiled)?;
                    self.patched.push((index, bpf));
                }
            }
        }

        info!(
            "Loaded {} shared programs and {} patched copies",
            loaded.len(),
            self.patched.len()
        );
        self.base = Some(base);
        Ok(())
    }

    fn attach(&mut self, binary: &Path, probes: &[CompiledProbe]) -> Result<(), BackendError> {
        let result = self.attach_all(binary, probes);
        match &result {
            Ok(()) => info!("Attached {} probes to {}", probes.len(), binary.display()),
            Err(_) => self.detach(),
        }
        result
    }

    fn detach(&mut self) {
        let mut objects: Vec<Ebpf> = self.patched.drain(..).map(|(_, bpf)| bpf).collect();
        objects.extend(self.base.take());

        if !objects.is_empty() {
            let count = objects.len();
            let (done_tx, done_rx) = crossbeam_channel::bounded(1);
            // Dropping an object detaches its links and unloads its programs
            let spawned = thread::Builder::new().name("fgraph-detach".to_string()).spawn(move || {
                drop(objects);
                let _ = done_tx.send(());
            });
            match spawned {
                Ok(_) => {
                    if done_rx.recv_timeout(DETACH_TIMEOUT).is_err() {
                        warn!("Detaching {count} probe objects timed out after {DETACH_TIMEOUT:?}, abandoning");
                    } else {
                        debug!("Detached {count} probe objects");
                    }
                }
                Err(e) => warn!("Failed to spawn detach thread: {e}"),
            }
        }

        if self.pin_dir.exists() {
            if let Err(e) = fs::remove_dir_all(&self.pin_dir) {
                warn!("Failed to remove {}: {e}", self.pin_dir.display());
            }
        }
    }

    fn poll_events(&mut self, cancel: &CancellationToken) -> Result<Receiver<TraceEvent>, BackendError> {
        let ring = self.take_ring(EVENTS_MAP)?;
        spawn_poller("fgraph-events", ring, cancel.clone(), decode_event)
    }

    fn poll_arg_payloads(&mut self, cancel: &CancellationToken) -> Result<Receiver<ArgPayload>, BackendError> {
        let ring = self.take_ring(ARGS_MAP)?;
        spawn_poller("fgraph-args", ring, cancel.clone(), decode_payload)
    }
}

impl Drop for EbpfBackend {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Drain `ring` into a bounded channel until cancelled or the receiver goes
fn spawn_poller<T, F>(
    name: &str,
    mut ring: RingBuf<MapData>,
    cancel: CancellationToken,
    decode: F,
) -> Result<Receiver<T>, BackendError>
where
    T: Send + 'static,
    F: Fn(&[u8]) -> Option<T> + Send + 'static,
{
    let (tx, rx) = crossbeam_channel::bounded(CHANNEL_CAPACITY);
    thread::Builder::new().name(name.to_string()).spawn(move || {
        while !cancel.is_cancelled() {
            let mut idle = true;
            while let Some(item) = ring.next() {
                idle = false;
                let bytes: &[u8] = &item;
                let Some(record) = decode(bytes) else {
                    continue;
                };
                if tx.send(record).is_err() {
                    return;
                }
            }
            if idle {
                thread::sleep(POLL_INTERVAL);
            }
        }
    })?;
    Ok(rx)
}

fn read_record<T: Copy>(bytes: &[u8]) -> Option<T> {
    if bytes.len() < size_of::<T>() {
        warn!("Record too small: {} bytes, expected {}", bytes.len(), size_of::<T>());
        return None;
    }
    #[allow(unsafe_code)]
    // SAFETY: length checked above; records are repr(C) plain data
    let record = unsafe { std::ptr::read_unaligned(bytes.as_ptr().cast::<T>()) };
    Some(record)
}

fn decode_event(bytes: &[u8]) -> Option<TraceEvent> {
    let event: RawEvent = read_record(bytes)?;
    let Some(kind) = ProbeKind::from_location(event.location) else {
        warn!("Unknown probe location {} from TID:{}", event.location, event.tid);
        return None;
    };
    Some(TraceEvent {
        context: Tid(event.tid),
        pid: Pid(event.pid),
        kind,
        ip: event.ip,
        caller_ip: event.caller_ip,
        frame: event.frame,
        time_ns: event.time_ns,
        errno: event.errno,
        backtrace: event.backtrace.iter().copied().take_while(|&addr| addr != 0).collect(),
        arg_count: event.arg_count,
    })
}

fn decode_payload(bytes: &[u8]) -> Option<ArgPayload> {
    let payload: RawArgPayload = read_record(bytes)?;
    Some(ArgPayload {
        context: Tid(payload.tid),
        index: payload.index,
        data: payload.data.to_vec(),
    })
}
