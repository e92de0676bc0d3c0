//! The host/kernel memory and lookup-table boundary. Every unwinder in this
//! crate is written against [`Memory`] and [`Tables`] rather than against
//! `aya-ebpf::helpers::bpf_probe_read_user` or BPF map types directly, so
//! the same step functions run under `cargo test` against mocks and under
//! the real `polyunwind-ebpf` binary against actual helpers/maps.

use crate::pid_trie::PidPageEntry;
use crate::stack_delta::{StackDelta, StackDeltaPageInfo, UnwindInfo};

/// A read from remote (userspace) process memory failed: wraps whatever the
/// real implementation considers its failure reason (an errno on the BPF
/// side, an I/O error on a hosted mock).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadError;

/// Stands in for `bpf_probe_read_user`: read raw bytes or fixed-width
/// integers out of a traced process's address space.
pub trait Memory {
    fn read(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), ReadError>;

    fn read_u64(&mut self, addr: u64) -> Result<u64, ReadError> {
        let mut buf = [0u8; 8];
        self.read(addr, &mut buf)?;
        Ok(u64::from_ne_bytes(buf))
    }

    fn read_u32(&mut self, addr: u64) -> Result<u32, ReadError> {
        let mut buf = [0u8; 4];
        self.read(addr, &mut buf)?;
        Ok(u32::from_ne_bytes(buf))
    }
}

/// The lookup-table collaborators a real loader installs as BPF maps
/// (`pid_page_to_mapping_info`, `stack_delta_page_to_info`, the bucketed
/// `exe_id_to_*_stack_deltas` arrays, `unwind_info_array`, and the
/// interpreter-loop range table) and this crate's tests install as mocks.
pub trait Tables {
    /// Longest-prefix-match lookup of `(pid, page)` in the PID+page trie.
    fn lookup_pid_page(&self, pid: u32, page: u64) -> Option<PidPageEntry>;

    /// Page-granularity index into a file's bucketed stack-delta array.
    fn lookup_stack_delta_page(&self, file_id: u64, page: u64) -> Option<StackDeltaPageInfo>;

    /// The bucketed delta run itself, `first..first+num` of `file_id`'s array.
    fn stack_deltas(&self, file_id: u64, bucket_id: u16, first: u32, num: u16) -> &[StackDelta];

    /// Resolve an `UnwindInfo` by its index into the shared array.
    fn unwind_info(&self, index: u16) -> Option<UnwindInfo>;

    /// Whether `pc` falls inside a known interpreter dispatch loop, used to
    /// decide whether a native return address is actually an interpreter
    /// re-entry point rather than a plain native frame.
    fn in_interpreter_loop(&self, pc: u64) -> Option<crate::pid_trie::UnwindProgram>;

    /// Whether userland has ever registered PID+page trie entries for `pid`
    /// at all, distinct from a miss on one specific `(pid, page)` pair: the
    /// dispatcher's "is this PID new" check (§4.1) needs to tell "never seen
    /// this process" apart from "seen this process, but not this page".
    fn pid_known(&self, pid: u32) -> bool;
}
