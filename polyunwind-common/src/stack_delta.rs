//! Stack-delta page index and bucketed delta arrays (§4.1/§4.3), grounded on
//! `types.h`'s `StackDeltaPageKey`/`StackDeltaPageInfo`/`StackDelta` layouts
//! and `native_stack_trace.ebpf.c`'s bounded binary search.

use crate::unwind_opcode::{apply_merge_adjustment, unwind_register_address, RegisterFile};

/// Size, in bits, of the page granularity a single `StackDeltaPageInfo`
/// entry covers (64 KiB pages).
pub const STACK_DELTA_PAGE_BITS: u32 = 16;
pub const STACK_DELTA_PAGE_SIZE: u64 = 1 << STACK_DELTA_PAGE_BITS;

/// High bit of `StackDelta::unwind_info`: when set, the remaining 15 bits
/// name a [`StackDeltaCommand`] instead of indexing the `UnwindInfo` array.
pub const STACK_DELTA_COMMAND_FLAG: u16 = 0x8000;

/// Upper bound on the binary search inside one page's delta run; the
/// largest bucket holds `2^21` entries, `log2` of which is 21, rounded up
/// generously to stay inside the verifier's instruction budget.
pub const MAX_BSEARCH_ITERATIONS: u32 = 24;

/// `(file_id, 64KiB-page) -> index run` entry of the page-level index.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StackDeltaPageInfo {
    pub first_delta: u32,
    pub num_deltas: u16,
    pub bucket_id: u16,
}

/// A single entry in a bucketed delta array: offset within the page plus
/// either an `UnwindInfo` index or a command (high bit of `unwind_info`).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StackDelta {
    pub addr_low: u16,
    pub unwind_info: u16,
}

impl StackDelta {
    pub const fn is_command(self) -> bool {
        self.unwind_info & STACK_DELTA_COMMAND_FLAG != 0
    }

    pub const fn command(self) -> Option<StackDeltaCommand> {
        if !self.is_command() {
            return None;
        }
        StackDeltaCommand::from_u16(self.unwind_info & !STACK_DELTA_COMMAND_FLAG)
    }

    pub const fn info_index(self) -> Option<u16> {
        if self.is_command() {
            None
        } else {
            Some(self.unwind_info)
        }
    }
}

/// Special stack-delta entries that short-circuit `UnwindInfo` lookup.
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StackDeltaCommand {
    Invalid = 0,
    Stop = 1,
    Plt = 2,
}

impl StackDeltaCommand {
    pub const fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            0 => Self::Invalid,
            1 => Self::Stop,
            2 => Self::Plt,
            _ => return None,
        })
    }
}

/// A resolved unwind rule: how to recompute CFA, how to recover the caller's
/// FP/RA, and the merge-adjustment bookkeeping for neighboring deltas.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnwindInfo {
    pub opcode: u8,
    pub fp_opcode: u8,
    pub merge_opcode: u8,
    _reserved: u8,
    pub param: i32,
    pub fp_param: i32,
}

impl UnwindInfo {
    pub const fn new(opcode: u8, fp_opcode: u8, merge_opcode: u8, param: i32, fp_param: i32) -> Self {
        Self { opcode, fp_opcode, merge_opcode, _reserved: 0, param, fp_param }
    }

    /// Resolve the new CFA for this unwind step. `offset`/`addr_low` are the
    /// page-relative lookup offset and the matched delta's own `addr_low`,
    /// feeding the merge-opcode adjustment (§4.3) before `param` is used.
    pub fn resolve_cfa<E>(
        &self,
        regs: RegisterFile,
        offset: u16,
        addr_low: u16,
        read_u64: impl FnMut(u64) -> Result<u64, E>,
    ) -> Result<Option<u64>, E> {
        let param = apply_merge_adjustment(self.merge_opcode, offset, addr_low, self.param);
        unwind_register_address(regs, self.opcode, param, read_u64)
    }

    /// Resolve the caller's saved frame pointer, when this unwind step
    /// carries FP-recovery information. Same merge-opcode adjustment as
    /// [`Self::resolve_cfa`], applied to `fp_param`.
    pub fn resolve_fp<E>(
        &self,
        regs: RegisterFile,
        offset: u16,
        addr_low: u16,
        read_u64: impl FnMut(u64) -> Result<u64, E>,
    ) -> Result<Option<u64>, E> {
        let param = apply_merge_adjustment(self.merge_opcode, offset, addr_low, self.fp_param);
        unwind_register_address(regs, self.fp_opcode, param, read_u64)
    }
}

/// Closed-form CFA for a PLT stub on x86-64 (`native_stack_trace.ebpf.c`):
/// `cfa = sp + 8 + (((pc & 15) >= 11) ? 8 : 0)`.
pub const fn plt_cfa_x86_64(sp: u64, pc: u64) -> u64 {
    let extra = if (pc & 15) >= 11 { 8 } else { 0 };
    sp + 8 + extra
}

/// Bounded binary search over one page's delta run for the first entry with
/// `addr_low > offset`, then the caller backs up by one to get the
/// equal-or-less match (mirrors `native_stack_trace.ebpf.c`'s `bsearch_step`
/// loop capped at `MAX_BSEARCH_ITERATIONS`).
///
/// `offset` is the byte offset within the 64 KiB page. Returns the index
/// (within `deltas`) of the applicable entry, or `None` if every entry in
/// the page precedes `offset` (the caller should fall back to the previous
/// page's tail entry, adjusting `addr_low` by `STACK_DELTA_PAGE_SIZE`).
pub fn find_stack_delta(deltas: &[StackDelta], offset: u16) -> Option<usize> {
    if deltas.is_empty() {
        return None;
    }
    let (mut lo, mut hi) = (0usize, deltas.len());
    let mut iterations = 0;
    while lo < hi && iterations < MAX_BSEARCH_ITERATIONS {
        let mid = lo + (hi - lo) / 2;
        if deltas[mid].addr_low > offset {
            hi = mid;
        } else {
            lo = mid + 1;
        }
        iterations += 1;
    }
    if lo == 0 {
        None
    } else {
        Some(lo - 1)
    }
}
