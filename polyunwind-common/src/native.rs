//! The native (C/C++/Rust, non-interpreted) unwinder and PC dispatch (§4.1,
//! §4.3), grounded on `native_stack_trace.ebpf.c`'s `resolve_unwind_mapping`
//! and the main unwind loop.

use crate::error::{BudgetError, LookupError, ReaderError, UnwindError};
use crate::memory::{Memory, Tables};
use crate::pac::normalize_pac_ptr;
use crate::pid_trie::UnwindProgram;
use crate::stack_delta::{find_stack_delta, plt_cfa_x86_64, StackDeltaCommand, STACK_DELTA_PAGE_SIZE};
use crate::state::UnwindState;
use crate::unwind_opcode::RegisterFile;

/// Kernel addresses set the top byte; any PC with a high bit in this mask is
/// rejected outright rather than looked up.
pub const KERNEL_ADDRESS_MASK: u64 = 0xFF00_0000_0000_0000;
/// PCs below this are never valid user code (null-pointer-ish calls).
pub const MIN_VALID_PC: u64 = 0x1000;

/// Target architecture, since x86-64 and aarch64 disagree on how the return
/// address is recovered and on PAC stripping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Arch {
    X86_64,
    Aarch64 { inverse_pac_mask: u64 },
}

/// The outcome of resolving one PC against the PID+page trie: which file
/// and unwind program own it, and the in-file offset to use for delta
/// lookups.
#[derive(Clone, Copy, Debug)]
pub struct ResolvedPc {
    pub file_id: u64,
    pub program: UnwindProgram,
    pub in_file_offset: u64,
    pub bias: u64,
}

/// Reject obviously-invalid PCs and resolve the rest against the PID+page
/// trie, mirroring `resolve_unwind_mapping`/`resolve_pc`.
pub fn resolve_pc<T: Tables>(tables: &T, pid: u32, pc: u64) -> Result<ResolvedPc, UnwindError> {
    if pc & KERNEL_ADDRESS_MASK != 0 {
        return Err(UnwindError::Reader(ReaderError::KernelAddress));
    }
    if pc < MIN_VALID_PC {
        return Err(UnwindError::Reader(ReaderError::SmallPc));
    }
    let page = pc & !(STACK_DELTA_PAGE_SIZE - 1);
    let entry = tables
        .lookup_pid_page(pid, page)
        .ok_or(UnwindError::Lookup(LookupError::WrongTextSection))?;
    let program = entry.program().ok_or(UnwindError::Lookup(LookupError::WrongTextSection))?;
    let in_file_offset = pc.wrapping_sub(entry.bias());

    // If this PC falls inside a registered interpreter dispatch loop,
    // unwinding must switch to that interpreter's program even though the
    // trie itself only knows the section as native code (§4.1/§9, the
    // "mixed native/interpreter" boundary case).
    let program = tables.in_interpreter_loop(pc).unwrap_or(program);

    Ok(ResolvedPc { file_id: entry.file_id, program, in_file_offset, bias: entry.bias() })
}

/// Outcome of a single native-unwinder step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepResult {
    /// A caller frame was recovered; `state` has been updated to describe it.
    Continue,
    /// Reached the bottom of the native stack (a `STOP` stack delta).
    StackBottom,
}

/// Apply one native unwind step: locate the stack delta covering `state.pc`
/// (adjusting for the cross-page fixup when the match falls in the
/// previous page), resolve CFA/FP via its `UnwindInfo` (or the PLT
/// closed-form), and recompute the caller's PC.
pub fn step<M: Memory, T: Tables>(
    mem: &mut M,
    tables: &T,
    arch: Arch,
    pid: u32,
    frame_idx: u32,
    state: &mut UnwindState,
) -> Result<StepResult, UnwindError> {
    let resolved = resolve_pc(tables, pid, state.pc)?;
    state.text_section_id = resolved.file_id;
    state.text_section_offset = resolved.in_file_offset;
    state.text_section_bias = resolved.bias;

    let page = resolved.in_file_offset & !(STACK_DELTA_PAGE_SIZE - 1);
    let page_info = tables
        .lookup_stack_delta_page(resolved.file_id, page)
        .ok_or(UnwindError::Lookup(LookupError::StackDeltaInvalid))?;

    let deltas = tables.stack_deltas(
        resolved.file_id,
        page_info.bucket_id,
        page_info.first_delta,
        page_info.num_deltas,
    );
    let page_offset = (resolved.in_file_offset & (STACK_DELTA_PAGE_SIZE - 1)) as u16;
    let delta = match find_stack_delta(deltas, page_offset) {
        Some(idx) => deltas[idx],
        None if page > 0 => {
            // Every entry in this page comes after our offset: the match is
            // the last delta of the previous page.
            let prev_page = page - STACK_DELTA_PAGE_SIZE;
            let prev_info = tables
                .lookup_stack_delta_page(resolved.file_id, prev_page)
                .ok_or(UnwindError::Lookup(LookupError::BsearchFailed))?;
            let prev_deltas = tables.stack_deltas(
                resolved.file_id,
                prev_info.bucket_id,
                prev_info.first_delta,
                prev_info.num_deltas,
            );
            *prev_deltas.last().ok_or(UnwindError::Lookup(LookupError::BsearchFailed))?
        }
        None => return Err(UnwindError::Lookup(LookupError::BsearchFailed)),
    };

    if let Some(command) = delta.command() {
        return match command {
            StackDeltaCommand::Stop => Ok(StepResult::StackBottom),
            StackDeltaCommand::Invalid => Err(UnwindError::Lookup(LookupError::StackDeltaInvalid)),
            StackDeltaCommand::Plt => {
                let cfa = plt_cfa_x86_64(state.sp, state.pc);
                advance_from_cfa(mem, arch, frame_idx, state, cfa, None)
            }
        };
    }

    let info_idx = delta.info_index().ok_or(UnwindError::Lookup(LookupError::StackDeltaInvalid))?;
    let info = tables
        .unwind_info(info_idx)
        .ok_or(UnwindError::Lookup(LookupError::StackDeltaInvalid))?;

    let regs = RegisterFile { cfa: 0, fp: state.fp, sp: state.sp, lr: state.r13_or_lr };
    let cfa = info
        .resolve_cfa(regs, page_offset, delta.addr_low, |addr| {
            mem.read_u64(addr).map_err(|_| UnwindError::Reader(ReaderError::ProbeReadFailed))
        })?
        .ok_or(UnwindError::Lookup(LookupError::StackDeltaInvalid))?;

    let regs_with_cfa = RegisterFile { cfa, ..regs };
    let new_fp = info.resolve_fp(regs_with_cfa, page_offset, delta.addr_low, |addr| {
        mem.read_u64(addr).map_err(|_| UnwindError::Reader(ReaderError::ProbeReadFailed))
    })?;

    advance_from_cfa(mem, arch, frame_idx, state, cfa, new_fp)
}

fn advance_from_cfa<M: Memory>(
    mem: &mut M,
    arch: Arch,
    frame_idx: u32,
    state: &mut UnwindState,
    cfa: u64,
    new_fp: Option<u64>,
) -> Result<StepResult, UnwindError> {
    let new_pc = match arch {
        Arch::X86_64 => mem
            .read_u64(cfa.wrapping_sub(8))
            .map_err(|_| UnwindError::Reader(ReaderError::ProbeReadFailed))?,
        Arch::Aarch64 { inverse_pac_mask } => {
            // LR-based unwind is only trustworthy for the top frame; every
            // other frame must read the saved return address off the stack.
            if frame_idx == 0 && state.r13_or_lr != 0 {
                normalize_pac_ptr(state.r13_or_lr, inverse_pac_mask)
            } else {
                let raw = mem
                    .read_u64(cfa.wrapping_sub(8))
                    .map_err(|_| UnwindError::Reader(ReaderError::ProbeReadFailed))?;
                normalize_pac_ptr(raw, inverse_pac_mask)
            }
        }
    };

    if new_pc == 0 {
        return Ok(StepResult::StackBottom);
    }

    state.sp = cfa;
    state.fp = new_fp.unwrap_or(state.fp);
    state.pc = new_pc;
    Ok(StepResult::Continue)
}

/// Enforce the `MAX_FRAME_UNWINDS` budget (§5): once hit, unwinding must
/// terminate rather than keep tail-calling.
pub fn check_frame_budget(frame_idx: u32) -> Result<(), UnwindError> {
    if frame_idx as usize >= crate::frame::MAX_FRAME_UNWINDS {
        return Err(UnwindError::Budget(BudgetError::MaxFrames));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ReadError;
    use crate::pid_trie::{PidPageEntry, PidPageKey};
    use crate::stack_delta::{StackDelta, StackDeltaPageInfo, UnwindInfo, STACK_DELTA_COMMAND_FLAG};
    use crate::unwind_opcode::UNWIND_OPCODE_BASE_SP;
    use std::collections::HashMap;

    struct MockMemory {
        words: HashMap<u64, u64>,
    }

    impl Memory for MockMemory {
        fn read(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), ReadError> {
            let word = self.words.get(&addr).copied().ok_or(ReadError)?;
            buf.copy_from_slice(&word.to_ne_bytes()[..buf.len()]);
            Ok(())
        }
    }

    struct MockTables {
        pages: HashMap<(u32, u64), PidPageEntry>,
        delta_pages: HashMap<(u64, u64), StackDeltaPageInfo>,
        deltas: Vec<StackDelta>,
        infos: Vec<UnwindInfo>,
        interp_loops: HashMap<u64, UnwindProgram>,
    }

    impl MockTables {
        fn new(pages: HashMap<(u32, u64), PidPageEntry>, delta_pages: HashMap<(u64, u64), StackDeltaPageInfo>, deltas: Vec<StackDelta>, infos: Vec<UnwindInfo>) -> Self {
            Self { pages, delta_pages, deltas, infos, interp_loops: HashMap::new() }
        }
    }

    impl Tables for MockTables {
        fn lookup_pid_page(&self, pid: u32, page: u64) -> Option<PidPageEntry> {
            let _ = PidPageKey::exact(pid, page);
            self.pages.get(&(pid, page)).copied()
        }
        fn lookup_stack_delta_page(&self, file_id: u64, page: u64) -> Option<StackDeltaPageInfo> {
            self.delta_pages.get(&(file_id, page)).copied()
        }
        fn stack_deltas(&self, _file_id: u64, _bucket_id: u16, first: u32, num: u16) -> &[StackDelta] {
            &self.deltas[first as usize..(first + u32::from(num)) as usize]
        }
        fn unwind_info(&self, index: u16) -> Option<UnwindInfo> {
            self.infos.get(index as usize).copied()
        }
        fn in_interpreter_loop(&self, pc: u64) -> Option<UnwindProgram> {
            self.interp_loops.get(&pc).copied()
        }
        fn pid_known(&self, pid: u32) -> bool {
            self.pages.keys().any(|&(p, _)| p == pid)
        }
    }

    #[test]
    fn resolve_pc_rejects_kernel_addresses() {
        let tables = MockTables::new(HashMap::new(), HashMap::new(), vec![], vec![]);
        let err = resolve_pc(&tables, 1, 0xFFFF_0000_0000_0000).unwrap_err();
        assert_eq!(err, UnwindError::Reader(ReaderError::KernelAddress));
    }

    #[test]
    fn resolve_pc_rejects_small_pc() {
        let tables = MockTables::new(HashMap::new(), HashMap::new(), vec![], vec![]);
        let err = resolve_pc(&tables, 1, 0x10).unwrap_err();
        assert_eq!(err, UnwindError::Reader(ReaderError::SmallPc));
    }

    #[test]
    fn resolve_pc_misses_report_wrong_text_section() {
        let tables = MockTables::new(HashMap::new(), HashMap::new(), vec![], vec![]);
        let err = resolve_pc(&tables, 1, 0x5000).unwrap_err();
        assert_eq!(err, UnwindError::Lookup(LookupError::WrongTextSection));
    }

    #[test]
    fn resolve_pc_switches_to_interpreter_program_inside_a_registered_loop() {
        let mut pages = HashMap::new();
        pages.insert((1u32, 0u64), PidPageEntry::new(7, 0, UnwindProgram::Native));
        let mut tables = MockTables::new(pages, HashMap::new(), vec![], vec![]);
        tables.interp_loops.insert(0x5000, UnwindProgram::Python);

        let resolved = resolve_pc(&tables, 1, 0x5000).unwrap();
        assert_eq!(resolved.program, UnwindProgram::Python);
    }

    #[test]
    fn step_recovers_caller_frame_via_cfa_plus_offset() {
        let mut pages = HashMap::new();
        pages.insert((1u32, 0u64), PidPageEntry::new(7, 0, UnwindProgram::Native));
        let mut delta_pages = HashMap::new();
        delta_pages.insert((7u64, 0u64), StackDeltaPageInfo { first_delta: 0, num_deltas: 1, bucket_id: 0 });
        let deltas = vec![StackDelta { addr_low: 0, unwind_info: 0 }];
        let infos = vec![UnwindInfo::new(UNWIND_OPCODE_BASE_SP, UNWIND_OPCODE_BASE_SP, 0, 16, 0)];
        let tables = MockTables::new(pages, delta_pages, deltas, infos);

        let mut words = HashMap::new();
        words.insert(0x1000u64 + 16 - 8, 0x2000u64);
        let mut mem = MockMemory { words };

        let mut state = UnwindState::new(0x5000, 0x1000, 0);
        let result = step(&mut mem, &tables, Arch::X86_64, 1, 0, &mut state).unwrap();
        assert_eq!(result, StepResult::Continue);
        assert_eq!(state.pc, 0x2000);
        assert_eq!(state.sp, 0x1010);
    }

    #[test]
    fn step_applies_merge_opcode_adjustment_once_threshold_is_reached() {
        let mut pages = HashMap::new();
        pages.insert((1u32, 0u64), PidPageEntry::new(7, 0, UnwindProgram::Native));
        let mut delta_pages = HashMap::new();
        delta_pages.insert((7u64, 0u64), StackDeltaPageInfo { first_delta: 0, num_deltas: 1, bucket_id: 0 });
        // addr_low = 0x4000, page_offset (from pc=0x5000) = 0x5000: the gap of
        // 0x1000 clears the merge_opcode=0x05 threshold, so +8 lands on `param`.
        let deltas = vec![StackDelta { addr_low: 0x4000, unwind_info: 0 }];
        let infos = vec![UnwindInfo::new(UNWIND_OPCODE_BASE_SP, UNWIND_OPCODE_BASE_SP, 0x05, 16, 0)];
        let tables = MockTables::new(pages, delta_pages, deltas, infos);

        let mut words = HashMap::new();
        words.insert(0x1000u64 + 24 - 8, 0x2000u64);
        let mut mem = MockMemory { words };

        let mut state = UnwindState::new(0x5000, 0x1000, 0);
        let result = step(&mut mem, &tables, Arch::X86_64, 1, 0, &mut state).unwrap();
        assert_eq!(result, StepResult::Continue);
        assert_eq!(state.sp, 0x1018, "cfa = sp + (param 16 adjusted by +8)");
        assert_eq!(state.pc, 0x2000);
    }

    #[test]
    fn step_stops_at_stack_bottom_command() {
        let mut pages = HashMap::new();
        pages.insert((1u32, 0u64), PidPageEntry::new(7, 0, UnwindProgram::Native));
        let mut delta_pages = HashMap::new();
        delta_pages.insert((7u64, 0u64), StackDeltaPageInfo { first_delta: 0, num_deltas: 1, bucket_id: 0 });
        let deltas = vec![StackDelta { addr_low: 0, unwind_info: STACK_DELTA_COMMAND_FLAG | 1 }];
        let tables = MockTables::new(pages, delta_pages, deltas, vec![]);
        let mut mem = MockMemory { words: HashMap::new() };

        let mut state = UnwindState::new(0x5000, 0x1000, 0);
        let result = step(&mut mem, &tables, Arch::X86_64, 1, 0, &mut state).unwrap();
        assert_eq!(result, StepResult::StackBottom);
    }

    #[test]
    fn frame_budget_rejects_past_max_unwinds() {
        assert!(check_frame_budget(0).is_ok());
        assert!(check_frame_budget(crate::frame::MAX_FRAME_UNWINDS as u32).is_err());
    }
}
