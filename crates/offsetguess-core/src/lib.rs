//! # offsetguess-core
//!
//! Runtime discovery of kernel structure field offsets.
//!
//! Network tracing probes need to know where fields such as the source
//! address, ports, network namespace or round trip time live inside
//! `struct sock`, `struct flowi4/6`, `struct sk_buff` and `struct nf_conn`.
//! Those offsets differ between kernel builds, so they are found at runtime
//! by generating known traffic and scanning the structures for the values
//! that traffic must produce.
//!
//! This crate provides:
//! - Shared guess records and the field vocabulary ([`guess`])
//! - The in-hook probes that test one candidate offset per event ([`probe`])
//! - Hook dispatch and gating ([`hooks`])
//! - The userland driver that walks candidates until every field is found
//!   ([`driver`])
//! - Configuration ([`config`])
//!
//! ## Feature Flags
//!
//! - `simulation`: Enables [`sim`], a simulated kernel whose layout is
//!   known, for running calibrations without a live system.

pub mod config;
pub mod driver;
pub mod error;
pub mod guess;
pub mod hooks;
pub mod map;
pub mod memory;
pub mod probe;
#[cfg(any(test, feature = "simulation"))]
pub mod sim;

pub use config::{GuessConfig, GuessConfigBuilder, KernelVersion};
pub use driver::{
    ConntrackGuesser, ConstantEditor, EventGenerator, GuessField, GuessFields, TracerGuesser,
    find_constant, iterate, run_offset_guessing,
};
pub use error::{Error, Result};
pub use guess::{
    ConntrackOffsets, ConntrackStatus, ConntrackValues, GuessHeader, GuessPhase, GuessRecord,
    GuessWhat, ProcessName, SubjectKind, TracerOffsets, TracerStatus, TracerValues,
    next_aligned_offset,
};
pub use hooks::{HookEvent, HookPoint, OffsetGuessProgram, conntrack_hooks, enabled_hooks};
pub use map::{ConnectStash, GuessMap};
pub use memory::{MemoryImage, MemoryImageBuilder, ReadMemory};
pub use probe::{ProbeOutcome, TaskContext, guess_conntrack_offsets, guess_tracer_offsets};
#[cfg(any(test, feature = "simulation"))]
pub use sim::{KernelLayout, SimulatedHost};
