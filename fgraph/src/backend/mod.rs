//! # Probe Backend
//!
//! Everything that touches the kernel sits behind [`ProbeBackend`]: loading
//! the uprobe programs (with fetch bytecode spliced in), attaching them at
//! file offsets, and delivering the two record streams.
//!
//! - [`ebpf::EbpfBackend`] - the aya implementation
//! - [`object_patch`] - rewrites a program section of the probe object
//! - [`address`] - runtime to link-time address translation
//!
//! Tests drive the reconstructor through their own implementations of the
//! trait that replay canned records.

pub mod address;
pub mod ebpf;
pub mod object_patch;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::Receiver;

use crate::analyzer::Probe;
use crate::domain::{ArgPayload, BackendError, FetchError, ProbeKind, TraceEvent};
use crate::fetch::prelude::{self, Prelude};

pub use address::{AddressTranslator, IdentityTranslator, ProcessMaps};
pub use ebpf::EbpfBackend;

/// Cooperative stop signal shared by the poll threads and the session loop
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A probe together with the bytecode that captures its fetch args
#[derive(Debug, Clone)]
pub struct CompiledProbe {
    pub probe: Probe,
    /// `None` when the probe captures nothing
    pub prelude: Option<Prelude>,
}

impl CompiledProbe {
    /// Kernel program serving this probe
    #[must_use]
    pub fn program_name(&self) -> &'static str {
        match self.probe.kind {
            ProbeKind::Entry if self.probe.backtrace => "ent_bt",
            ProbeKind::Entry => "ent",
            ProbeKind::Return => "ret",
            ProbeKind::Custom => "custom",
        }
    }
}

/// Compile the fetch args of every probe
///
/// Runs before anything is loaded so a bad expression never leaves a
/// partially attached session behind.
///
/// # Errors
/// Returns the first probe whose args exceed the scratch record
pub fn compile_probes(probes: &[Probe]) -> Result<Vec<CompiledProbe>, FetchError> {
    probes
        .iter()
        .map(|probe| {
            let prelude = if probe.fetch_args.is_empty() {
                None
            } else {
                Some(prelude::build(&probe.label(), &probe.fetch_args)?)
            };
            Ok(CompiledProbe { probe: probe.clone(), prelude })
        })
        .collect()
}

/// Kernel probe collaborator
pub trait ProbeBackend {
    /// Load one program instance per probe
    ///
    /// # Errors
    /// Any program the verifier rejects fails the whole set
    fn load(&mut self, probes: &[CompiledProbe]) -> Result<(), BackendError>;

    /// Attach every loaded probe to `binary`
    ///
    /// # Errors
    /// On the first failure everything already attached is detached again
    fn attach(&mut self, binary: &Path, probes: &[CompiledProbe]) -> Result<(), BackendError>;

    /// Best-effort teardown; never blocks indefinitely
    fn detach(&mut self);

    /// Stream of probe firings until `cancel` fires
    ///
    /// # Errors
    /// Fails if called before [`load`](Self::load) or more than once
    fn poll_events(&mut self, cancel: &CancellationToken) -> Result<Receiver<TraceEvent>, BackendError>;

    /// Stream of captured argument values until `cancel` fires
    ///
    /// # Errors
    /// Fails if called before [`load`](Self::load) or more than once
    fn poll_arg_payloads(&mut self, cancel: &CancellationToken) -> Result<Receiver<ArgPayload>, BackendError>;
}
