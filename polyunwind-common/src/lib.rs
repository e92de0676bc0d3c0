//! Shared data structures and pure algorithms between the in-kernel unwinder
//! (`polyunwind-ebpf`) and its userspace collaborator (`polyunwind`).
//!
//! Everything in this crate that touches memory is expressed against the
//! [`Memory`] and [`Tables`] trait boundary rather than against `aya-ebpf`
//! helpers directly, so the dispatcher and every per-language unwinder can be
//! exercised with a plain mock on the host. `polyunwind-ebpf` supplies the
//! real implementations of those traits over `bpf_probe_read_user` and BPF
//! maps; this crate's own tests supply in-memory ones.
#![cfg_attr(not(test), no_std)]

pub mod dedup;
pub mod error;
pub mod events;
pub mod frame;
pub mod hasher;
pub mod introspection;
pub mod lang;
pub mod memory;
pub mod native;
pub mod pac;
pub mod pid_trie;
pub mod stack_delta;
pub mod state;
pub mod trace;
pub mod trampoline;
pub mod unwind_opcode;

pub use dedup::{DedupOutcome, DedupTables};
pub use error::{MetricId, UnwindError};
pub use events::{MunmapEvent, PidEvent, PidEventType};
pub use frame::{Frame, FrameKind, FrameList, MAX_FRAME_LIST_SIZE, MAX_FRAME_UNWINDS};
pub use memory::{Memory, Tables};
pub use pid_trie::{find_interp_loop, InterpLoopRange, PidPageEntry, PidPageKey};
pub use stack_delta::{StackDelta, StackDeltaCommand, StackDeltaPageInfo, UnwindInfo};
pub use state::{PerCpuRecord, UnwindState};
pub use trace::TraceHeader;
pub use trampoline::{Program, StepOutcome};

#[cfg(feature = "user")]
use aya::Pod;

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for frame::FrameList {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for trace::TraceHeader {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for events::PidEvent {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for events::MunmapEvent {}
