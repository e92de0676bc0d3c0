//! # polyunwind-ebpf — in-kernel mixed-language stack unwinder
//!
//! This binary is the dispatcher, per-language frame walkers, and
//! lookup-table glue described by `polyunwind-common`, wired onto real
//! `aya-ebpf` maps and a `ProgramArray`-based tail-call chain.
//!
//! ## Entry points
//!
//! - `on_cpu_sample` (`perf_event`): the profiling timer. Builds a pristine
//!   per-CPU scratch record, captures the kernel stack id, resolves the
//!   user PC, and tail-calls into whichever unwind program owns the page
//!   the PC falls in (native by default, or a per-language program the
//!   PID+page trie names).
//! - `unwind_native`, `unwind_python`, `unwind_php`, `unwind_php_jit`,
//!   `unwind_ruby`, `unwind_perl`, `unwind_v8`, `unwind_hotspot`
//!   (`ProgramArray` targets, one per [`UnwindProgram`] discriminant): one
//!   verifier-legal unit of work each — every invocation unwinds a bounded
//!   number of frames (`FRAMES_PER_CALL`) off the per-CPU scratch state,
//!   then either tail-calls itself or finalizes the trace. Each
//!   per-language program reads its runtime's introspection snapshot
//!   (`PY_PROC_INFO`, `PHP_PROC_INFO`, ...) to know where the interpreter's
//!   frame chain starts; populating those snapshots is a real loader's job,
//!   out of scope here.
//! - `interpreter_tracer_entry` (`perf_event`): the dispatch entry point for
//!   a probe placed directly on a known interpreter's bytecode dispatch
//!   loop, for a native PC that doesn't fall in a registered mapping. Skips
//!   `native::resolve_pc` entirely and tail-calls straight into whichever
//!   language program's introspection table names this pid.
//! - `report_new_pid`, called from `on_cpu_sample`/`interpreter_tracer_entry`
//!   once `Tables::pid_known` says a pid is new: emits `NEW` and throttles
//!   repeat sends via `REPORTED_PIDS`.
//! - `sched_process_exit` (`tracepoint`): thread-group-leader exit emits
//!   `EXIT` and clears the pid's throttle state.
//! - `munmap_enter` / `munmap_exit` (`kprobe`/`kretprobe`): stage the
//!   unmapped address on entry if the trie tracks it, emit `MunmapEvent` on
//!   a successful return, always clear the scratch entry.
//!
//! ## Maps
//!
//! `PID_PAGE_TRIE` (LPM trie), `STACK_DELTA_PAGES` (page index),
//! `exe_id_to_{8..21}_stack_deltas` (bucketed delta arrays),
//! `UNWIND_INFO_ARRAY`, `METRICS`, `PERCPU_RECORD` (per-CPU scratch),
//! `EVENTS` (ring buffer), `INHIBIT_EVENTS` (latch table), `REPORTED_PIDS`
//! (NEW-event throttle), `MUNMAP_SCRATCH` (enter→exit handoff),
//! `KNOWN_TRACES`/`HASH_TO_TRACE`/`HASH_TO_COUNT`/`HASH_TO_HEADER`/
//! `HASH_TO_FRAMELIST` (trace dedup and storage), `{PY,PHP,PHP_JIT,RUBY,
//! PERL,V8,HOTSPOT}_PROC_INFO` (per-runtime introspection snapshots),
//! `INTERP_LOOP_RANGES` (registered interpreter dispatch loops), `PID_KNOWN`
//! (pid-ever-registered presence set), and `UNWIND_PROGS` (the tail-call
//! `ProgramArray`).

#![no_std]
#![no_main]
#![allow(unused_unsafe)]

use aya_ebpf::{
    helpers::{bpf_get_current_pid_tgid, bpf_ktime_get_ns, bpf_probe_read_user_buf, bpf_tail_call},
    macros::{kprobe, kretprobe, map, perf_event, tracepoint},
    maps::{lpm_trie::Key as LpmKey, Array, HashMap, LpmTrie, PerCpuArray, ProgramArray, RingBuf, StackTrace},
    programs::{PerfEventContext, ProbeContext, RetProbeContext, TracePointContext},
    EbpfContext,
};
use aya_log_ebpf::{debug, error};

use polyunwind_common::dedup::{self, DedupOutcome, DedupTables};
use polyunwind_common::error::MetricId;
use polyunwind_common::events::{MunmapEvent, PidEvent, PidEventType};
use polyunwind_common::frame::FrameList;
use polyunwind_common::introspection::{
    HotspotProcInfo, PerlProcInfo, PhpJitProcInfo, PhpProcInfo, PyProcInfo, RubyProcInfo, Snapshot,
    V8ProcInfo,
};
use polyunwind_common::lang::{self, WalkStep};
use polyunwind_common::memory::{Memory, ReadError, Tables};
use polyunwind_common::native::{self, Arch, StepResult};
use polyunwind_common::pid_trie::{find_interp_loop, InterpLoopRange, PidPageEntry, UnwindProgram, PID_PAGE_PREFIX_LEN};
use polyunwind_common::stack_delta::{StackDelta, StackDeltaPageInfo, UnwindInfo};
use polyunwind_common::state::PerCpuRecord;
use polyunwind_common::trace::{TraceHeader, TASK_COMM_LEN};

// ============================================================================
// eBPF Maps
// ============================================================================

/// PID+page longest-prefix-match trie (§3/§4.1): `(pid, page) -> (file_id, bias|program)`.
#[map]
static PID_PAGE_TRIE: LpmTrie<[u8; 12], PidPageEntry> = LpmTrie::with_max_entries(65536, 0);

/// `(file_id, 64KiB page) -> delta run` page index (§4.1), keyed by the
/// packed `file_id << 16 | page_number`.
#[map]
static STACK_DELTA_PAGES: HashMap<u64, StackDeltaPageInfo> = HashMap::with_max_entries(65536, 0);

/// `UnwindInfo` table shared across every bucketed delta array.
#[map]
static UNWIND_INFO_ARRAY: Array<UnwindInfo> = Array::with_max_entries(1 << 18, 0);

macro_rules! stack_delta_bucket {
    ($name:ident, $bits:literal) => {
        #[map]
        static $name: Array<StackDelta> = Array::with_max_entries(1 << $bits, 0);
    };
}

stack_delta_bucket!(EXE_ID_TO_8_STACK_DELTAS, 8);
stack_delta_bucket!(EXE_ID_TO_9_STACK_DELTAS, 9);
stack_delta_bucket!(EXE_ID_TO_10_STACK_DELTAS, 10);
stack_delta_bucket!(EXE_ID_TO_11_STACK_DELTAS, 11);
stack_delta_bucket!(EXE_ID_TO_12_STACK_DELTAS, 12);
stack_delta_bucket!(EXE_ID_TO_13_STACK_DELTAS, 13);
stack_delta_bucket!(EXE_ID_TO_14_STACK_DELTAS, 14);
stack_delta_bucket!(EXE_ID_TO_15_STACK_DELTAS, 15);
stack_delta_bucket!(EXE_ID_TO_16_STACK_DELTAS, 16);
stack_delta_bucket!(EXE_ID_TO_17_STACK_DELTAS, 17);
stack_delta_bucket!(EXE_ID_TO_18_STACK_DELTAS, 18);
stack_delta_bucket!(EXE_ID_TO_19_STACK_DELTAS, 19);
stack_delta_bucket!(EXE_ID_TO_20_STACK_DELTAS, 20);
stack_delta_bucket!(EXE_ID_TO_21_STACK_DELTAS, 21);

/// Per-CPU scratch record, reset at the top of every sample.
#[map]
static PERCPU_RECORD: PerCpuArray<PerCpuRecord> = PerCpuArray::with_max_entries(1, 0);

/// Kernel-side half of a captured stack (the native unwinder only resolves
/// userspace frames; the kernel portion is captured once via
/// `bpf_get_stackid` and referenced by id on the trace header).
#[map]
static KERNEL_STACKS: StackTrace = StackTrace::with_max_entries(4096, 0);

/// Monotonic error/attempt counters, one slot per [`MetricId`].
#[map]
static METRICS: Array<u64> = Array::with_max_entries(MetricId::COUNT as u32, 0);

/// Event channel: `PidEvent`/`MunmapEvent` records for userland.
#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(256 * 1024, 0);

/// Latch table: suppresses repeat `TracesReady`/`UnknownPc` events for a
/// PID until userland clears the corresponding entry.
#[map]
static INHIBIT_EVENTS: HashMap<u64, u8> = HashMap::with_max_entries(8192, 0);

/// Tail-call chain: slot `N` is the unwind program for [`UnwindProgram`]
/// discriminant `N`.
#[map]
static UNWIND_PROGS: ProgramArray = ProgramArray::with_max_entries(8, 0);

/// Registered interpreter dispatch loops (§4.1/§4.3): a small, fixed-size
/// table a real loader installs once per traced binary. Scanned with a
/// bounded, compile-time-known-length loop, the same pattern `DELTA_SCRATCH`
/// uses for its per-CPU staging buffer.
const MAX_INTERP_LOOPS: usize = 16;
#[map]
static INTERP_LOOP_RANGES: Array<InterpLoopRange> = Array::with_max_entries(MAX_INTERP_LOOPS as u32, 0);

/// Throttle map for the `NEW` event (§4.7/§8 property 6): a pid is inserted
/// create-if-absent on its first sample, and removed on thread-group-leader
/// exit so a later re-exec gets reported again.
#[map]
static REPORTED_PIDS: HashMap<u32, u64> = HashMap::with_max_entries(65536, 0);

/// Presence set a loader populates the moment it installs this pid's first
/// `PID_PAGE_TRIE` entry (§4.1): the LPM trie itself has no "does this pid
/// have any entry at all" query, only longest-prefix-match on a concrete
/// page, so the dispatcher's "is this pid new" check needs this separate
/// map rather than a miss on `PID_PAGE_TRIE`.
#[map]
static PID_KNOWN: HashMap<u32, u8> = HashMap::with_max_entries(65536, 0);

/// `munmap()` enter→exit scratch, keyed by `pid_tgid` so two threads of the
/// same process unmapping concurrently don't clobber each other (§4.6/§8
/// scenario f).
#[map]
static MUNMAP_SCRATCH: HashMap<u64, u64> = HashMap::with_max_entries(4096, 0);

/// Per-CPU staging buffer `Tables::stack_deltas` copies into: BPF array
/// maps hand back one element at a time, not an owned slice, so the
/// bounded-size copy below is how this crate's slice-returning trait gets
/// satisfied without an unbounded loop. Caps a page's delta run at 64
/// entries, comfortably above `MAX_BSEARCH_ITERATIONS`'s working set.
const DELTA_SCRATCH_LEN: usize = 64;
#[map]
static DELTA_SCRATCH: PerCpuArray<[StackDelta; DELTA_SCRATCH_LEN]> = PerCpuArray::with_max_entries(1, 0);

/// Dedup maps (§4.5/§5): `known_traces` and `hash_to_trace` are presence
/// sets, `hash_to_count` the per-hash occurrence counter.
#[map]
static KNOWN_TRACES: HashMap<u64, u8> = HashMap::with_max_entries(65536, 0);
#[map]
static HASH_TO_TRACE: HashMap<u64, u8> = HashMap::with_max_entries(65536, 0);
#[map]
static HASH_TO_COUNT: HashMap<u64, u64> = HashMap::with_max_entries(65536, 0);
/// Reported trace headers and their frame lists, keyed by hash /
/// `(hash, list_index)` — the payload the reporter writes exactly once
/// per distinct trace.
#[map]
static HASH_TO_HEADER: HashMap<u64, TraceHeader> = HashMap::with_max_entries(65536, 0);
#[map]
static HASH_TO_FRAMELIST: HashMap<u64, FrameList> = HashMap::with_max_entries(65536 * 8, 0);

/// Packs `(hash, list_index)` into one `HASH_TO_FRAMELIST` key;
/// `MAX_FRAME_LISTS` is 6, well under the 3 bits the low end reserves.
fn pack_framelist_key(hash: u64, list_index: usize) -> u64 {
    (hash << 3) | (list_index as u64 & 0x7)
}

/// Per-language introspection tables (§3/§9): one `pid -> Snapshot<ProcInfo>`
/// map per runtime. A real loader installs/invalidates these entries; the
/// offset-extraction that produces the `ProcInfo` payload itself is out of
/// scope here, this crate only ever reads what is already installed.
#[map]
static PY_PROC_INFO: HashMap<u32, Snapshot<PyProcInfo>> = HashMap::with_max_entries(4096, 0);
#[map]
static PHP_PROC_INFO: HashMap<u32, Snapshot<PhpProcInfo>> = HashMap::with_max_entries(4096, 0);
#[map]
static PHP_JIT_PROC_INFO: HashMap<u32, Snapshot<PhpJitProcInfo>> = HashMap::with_max_entries(4096, 0);
#[map]
static RUBY_PROC_INFO: HashMap<u32, Snapshot<RubyProcInfo>> = HashMap::with_max_entries(4096, 0);
#[map]
static PERL_PROC_INFO: HashMap<u32, Snapshot<PerlProcInfo>> = HashMap::with_max_entries(4096, 0);
#[map]
static V8_PROC_INFO: HashMap<u32, Snapshot<V8ProcInfo>> = HashMap::with_max_entries(4096, 0);
#[map]
static HOTSPOT_PROC_INFO: HashMap<u32, Snapshot<HotspotProcInfo>> = HashMap::with_max_entries(4096, 0);

// ============================================================================
// Metrics helper
// ============================================================================

fn bump_metric(id: MetricId) {
    let idx = id.index() as u32;
    if let Some(counter) = unsafe { METRICS.get_ptr_mut(idx) } {
        unsafe { *counter += 1 };
    }
}

// ============================================================================
// Memory/Tables trait adapters over real BPF helpers and maps
// ============================================================================

struct BpfMemory;

impl Memory for BpfMemory {
    fn read(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), ReadError> {
        unsafe { bpf_probe_read_user_buf(addr as *const u8, buf) }.map_err(|_| ReadError)
    }
}

struct BpfTables;

fn pack_page_key(file_id: u64, page: u64) -> u64 {
    // 64KiB page granularity leaves 48 usable bits of page number; more
    // than enough to stay collision-free against realistic file_id counts.
    (file_id << 48) ^ (page >> 16)
}

impl Tables for BpfTables {
    fn lookup_pid_page(&self, pid: u32, page: u64) -> Option<PidPageEntry> {
        let mut data = [0u8; 12];
        data[0..4].copy_from_slice(&pid.to_be_bytes());
        data[4..12].copy_from_slice(&page.to_be_bytes());
        let key = LpmKey::new(PID_PAGE_PREFIX_LEN, data);
        unsafe { PID_PAGE_TRIE.get(&key) }.copied()
    }

    fn lookup_stack_delta_page(&self, file_id: u64, page: u64) -> Option<StackDeltaPageInfo> {
        unsafe { STACK_DELTA_PAGES.get(&pack_page_key(file_id, page)) }.copied()
    }

    fn stack_deltas(&self, _file_id: u64, bucket_id: u16, first: u32, num: u16) -> &[StackDelta] {
        // Array maps hand back one element at a time; stage up to
        // DELTA_SCRATCH_LEN of them into the per-CPU scratch buffer so the
        // bsearch in `native::step` can index a real slice. The loop bound
        // is the fixed, compile-time-known DELTA_SCRATCH_LEN so the
        // verifier can see it terminates.
        let count = (num as usize).min(DELTA_SCRATCH_LEN);
        let Some(scratch_ptr) = DELTA_SCRATCH.get_ptr_mut(0) else {
            return &[];
        };
        let scratch = unsafe { &mut *scratch_ptr };
        for i in 0..DELTA_SCRATCH_LEN {
            if i >= count {
                break;
            }
            scratch[i] = stack_delta_at(bucket_id, first + i as u32).unwrap_or_default();
        }
        &scratch[..count]
    }

    fn unwind_info(&self, index: u16) -> Option<UnwindInfo> {
        unsafe { UNWIND_INFO_ARRAY.get(u32::from(index)) }.copied()
    }

    fn in_interpreter_loop(&self, pc: u64) -> Option<UnwindProgram> {
        let mut ranges = [InterpLoopRange::default(); MAX_INTERP_LOOPS];
        for (i, slot) in ranges.iter_mut().enumerate() {
            *slot = unsafe { INTERP_LOOP_RANGES.get(i as u32) }.copied().unwrap_or_default();
        }
        find_interp_loop(&ranges, pc)
    }

    fn pid_known(&self, pid: u32) -> bool {
        unsafe { PID_KNOWN.get(&pid) }.is_some()
    }
}

struct BpfDedup;

impl DedupTables for BpfDedup {
    fn known_traces_contains(&self, hash: u64) -> bool {
        unsafe { KNOWN_TRACES.get(&hash) }.is_some()
    }

    fn hash_to_trace_contains(&self, hash: u64) -> bool {
        unsafe { HASH_TO_TRACE.get(&hash) }.is_some()
    }

    fn mark_hash_to_trace(&mut self, hash: u64) {
        let _ = HASH_TO_TRACE.insert(&hash, &1u8, 0);
    }

    fn bump_hash_to_count(&mut self, hash: u64) {
        if let Some(counter) = unsafe { HASH_TO_COUNT.get_ptr_mut(&hash) } {
            unsafe { *counter += 1 };
        } else {
            let _ = HASH_TO_COUNT.insert(&hash, &1u64, 0);
        }
    }

    fn insert_known_trace(&mut self, hash: u64) {
        let _ = KNOWN_TRACES.insert(&hash, &1u8, 0);
    }
}

/// Fetch one `StackDelta` by absolute index from the bucket named by
/// `bucket_id`, the BPF-map equivalent of indexing the slice
/// `Tables::stack_deltas` would return on the host.
fn stack_delta_at(bucket_id: u16, index: u32) -> Option<StackDelta> {
    let entry = match bucket_id {
        8 => unsafe { EXE_ID_TO_8_STACK_DELTAS.get(index) },
        9 => unsafe { EXE_ID_TO_9_STACK_DELTAS.get(index) },
        10 => unsafe { EXE_ID_TO_10_STACK_DELTAS.get(index) },
        11 => unsafe { EXE_ID_TO_11_STACK_DELTAS.get(index) },
        12 => unsafe { EXE_ID_TO_12_STACK_DELTAS.get(index) },
        13 => unsafe { EXE_ID_TO_13_STACK_DELTAS.get(index) },
        14 => unsafe { EXE_ID_TO_14_STACK_DELTAS.get(index) },
        15 => unsafe { EXE_ID_TO_15_STACK_DELTAS.get(index) },
        16 => unsafe { EXE_ID_TO_16_STACK_DELTAS.get(index) },
        17 => unsafe { EXE_ID_TO_17_STACK_DELTAS.get(index) },
        18 => unsafe { EXE_ID_TO_18_STACK_DELTAS.get(index) },
        19 => unsafe { EXE_ID_TO_19_STACK_DELTAS.get(index) },
        20 => unsafe { EXE_ID_TO_20_STACK_DELTAS.get(index) },
        21 => unsafe { EXE_ID_TO_21_STACK_DELTAS.get(index) },
        _ => None,
    };
    entry.copied()
}

// ============================================================================
// Dispatcher entry point
// ============================================================================

#[perf_event]
pub fn on_cpu_sample(ctx: PerfEventContext) -> u32 {
    match try_on_cpu_sample(&ctx) {
        Ok(_) => 0,
        Err(_) => 1,
    }
}

fn try_on_cpu_sample(ctx: &PerfEventContext) -> Result<(), i64> {
    let pid_tgid = unsafe { bpf_get_current_pid_tgid() };
    let pid = (pid_tgid >> 32) as u32;
    if pid == 0 {
        return Ok(());
    }

    // Capture only the kernel half here (no BPF_F_USER_STACK): user frames
    // are walked explicitly by the unwind programs below.
    let kernel_stack_id = unsafe { KERNEL_STACKS.get_stackid(ctx, 0) }.unwrap_or(-1);

    let record_ptr = PERCPU_RECORD.get_ptr_mut(0).ok_or(1i64)?;
    let record = unsafe { &mut *record_ptr };
    let comm = ctx.command().unwrap_or([0u8; TASK_COMM_LEN]);
    *record = PerCpuRecord::pristine(pid, comm, kernel_stack_id);

    let (pc, sp, fp) = read_user_regs(ctx);
    record.state = polyunwind_common::state::UnwindState::new(pc, sp, fp);

    let tables = BpfTables;

    // §4.1: a pid absent from the PID+page trie entirely is unrelated to a
    // miss on one specific page — it means userland hasn't installed this
    // process's mappings yet, so there is nothing to resolve against. Emit
    // NEW and stop the sample here rather than chase a resolve that can
    // only fail.
    if !tables.pid_known(pid) {
        return report_new_pid(pid, unsafe { bpf_ktime_get_ns() });
    }

    let next_program = match native::resolve_pc(&tables, pid, pc) {
        Ok(resolved) => {
            record.state.text_section_id = resolved.file_id;
            record.state.text_section_offset = resolved.in_file_offset;
            record.state.text_section_bias = resolved.bias;
            resolved.program as u32
        }
        Err(err) => {
            bump_metric(err.as_metric_id());
            debug!(ctx, "unresolved pc for pid {}", pid);
            return finalize_unknown_pc(pid);
        }
    };

    unsafe {
        let _ = bpf_tail_call(ctx.as_ptr(), &raw mut UNWIND_PROGS as *mut _, next_program);
    }
    // Tail call only returns on failure (missing/unloaded program slot).
    error!(ctx, "tail call into unwind program {} failed", next_program);
    Ok(())
}

/// Read the sampled thread's user-mode PC/SP/FP out of the `pt_regs`
/// embedded in the perf sample, architecture-specific the same way
/// `native_stack_trace.ebpf.c` reads the initial unwind state off `pt_regs`.
#[cfg(target_arch = "x86_64")]
fn read_user_regs(ctx: &PerfEventContext) -> (u64, u64, u64) {
    const RIP_OFFSET: usize = 16 * 8; // x86_64 pt_regs: ip is the 17th qword
    const RSP_OFFSET: usize = 19 * 8;
    const RBP_OFFSET: usize = 4 * 8;
    unsafe { read_three_regs(ctx, RIP_OFFSET, RSP_OFFSET, RBP_OFFSET) }
}

#[cfg(target_arch = "aarch64")]
fn read_user_regs(ctx: &PerfEventContext) -> (u64, u64, u64) {
    const PC_OFFSET: usize = 33 * 8; // aarch64 user_pt_regs: pc follows regs[0..31], sp
    const SP_OFFSET: usize = 31 * 8;
    const FP_OFFSET: usize = 29 * 8; // x29
    unsafe { read_three_regs(ctx, PC_OFFSET, SP_OFFSET, FP_OFFSET) }
}

unsafe fn read_three_regs(ctx: &PerfEventContext, pc_off: usize, sp_off: usize, fp_off: usize) -> (u64, u64, u64) {
    let base = ctx.as_ptr() as *const u8;
    let read = |off: usize| (base.add(off) as *const u64).read_unaligned();
    (read(pc_off), read(sp_off), read(fp_off))
}

fn finalize_unknown_pc(pid: u32) -> Result<(), i64> {
    send_latched_event(pid, PidEventType::UnknownPc)
}

// ============================================================================
// Interpreter dispatch entry point
// ============================================================================

/// A second dispatcher entry point for a known interpreter process whose
/// native PC does not (yet) fall inside a registered `PID_PAGE_TRIE`
/// mapping — e.g. a probe placed directly on the interpreter's own bytecode
/// dispatch loop. Unlike `on_cpu_sample`, this never calls
/// `native::resolve_pc`: it looks the pid up directly against each
/// language's introspection table and tail-calls the owning unwind program.
#[perf_event]
pub fn interpreter_tracer_entry(ctx: PerfEventContext) -> u32 {
    match try_interpreter_tracer_entry(&ctx) {
        Ok(_) => 0,
        Err(_) => 1,
    }
}

fn try_interpreter_tracer_entry(ctx: &PerfEventContext) -> Result<(), i64> {
    let pid_tgid = unsafe { bpf_get_current_pid_tgid() };
    let pid = (pid_tgid >> 32) as u32;
    if pid == 0 {
        return Ok(());
    }

    let tables = BpfTables;
    if !tables.pid_known(pid) {
        return report_new_pid(pid, unsafe { bpf_ktime_get_ns() });
    }

    let next_program = [
        (unsafe { PERL_PROC_INFO.get(&pid) }.is_some(), UnwindProgram::Perl),
        (unsafe { PY_PROC_INFO.get(&pid) }.is_some(), UnwindProgram::Python),
        (unsafe { RUBY_PROC_INFO.get(&pid) }.is_some(), UnwindProgram::Ruby),
        (unsafe { PHP_JIT_PROC_INFO.get(&pid) }.is_some(), UnwindProgram::PhpJit),
        (unsafe { PHP_PROC_INFO.get(&pid) }.is_some(), UnwindProgram::Php),
        (unsafe { V8_PROC_INFO.get(&pid) }.is_some(), UnwindProgram::V8),
        (unsafe { HOTSPOT_PROC_INFO.get(&pid) }.is_some(), UnwindProgram::Hotspot),
    ]
    .into_iter()
    .find_map(|(present, program)| present.then_some(program));

    let Some(program) = next_program else {
        return Ok(());
    };

    let kernel_stack_id = unsafe { KERNEL_STACKS.get_stackid(ctx, 0) }.unwrap_or(-1);
    let record_ptr = PERCPU_RECORD.get_ptr_mut(0).ok_or(1i64)?;
    let record = unsafe { &mut *record_ptr };
    let comm = ctx.command().unwrap_or([0u8; TASK_COMM_LEN]);
    *record = PerCpuRecord::pristine(pid, comm, kernel_stack_id);

    let (pc, sp, fp) = read_user_regs(ctx);
    record.state = polyunwind_common::state::UnwindState::new(pc, sp, fp);

    unsafe {
        let _ = bpf_tail_call(ctx.as_ptr(), &raw mut UNWIND_PROGS as *mut _, program as u32);
    }
    error!(ctx, "tail call into interpreter unwind program {} failed", program as u32);
    Ok(())
}

/// `tracemgmt.h`'s `report_new_pid`: create-if-absent insert into
/// `REPORTED_PIDS`; only a genuinely new pid gets a `NEW` event, a
/// recently-reported one is silently skipped. Called only once the
/// dispatcher has already decided this pid is new via `Tables::pid_known`;
/// `REPORTED_PIDS` exists purely to throttle repeat `NEW` sends for the
/// same pid across that pid's (still-unmapped) samples, not to make the
/// new/known decision itself.
const BPF_NOEXIST: u64 = 1;

fn report_new_pid(pid: u32, now_ns: u64) -> Result<(), i64> {
    match REPORTED_PIDS.insert(&pid, &now_ns, BPF_NOEXIST) {
        Ok(()) => send_latched_event(pid, PidEventType::New),
        Err(_) => Ok(()), // already reported; not an error
    }
}

// ============================================================================
// Native unwinder program (ProgramArray slot 0)
// ============================================================================

#[perf_event]
pub fn unwind_native(ctx: PerfEventContext) -> u32 {
    match try_unwind_native(&ctx) {
        Ok(_) => 0,
        Err(_) => 1,
    }
}

fn try_unwind_native(ctx: &PerfEventContext) -> Result<(), i64> {
    let pid_tgid = unsafe { bpf_get_current_pid_tgid() };
    let pid = (pid_tgid >> 32) as u32;

    let record_ptr = PERCPU_RECORD.get_ptr_mut(0).ok_or(1i64)?;
    let record = unsafe { &mut *record_ptr };

    let arch = native_arch();
    let tables = BpfTables;
    let mut mem = BpfMemory;

    // One tail call unwinds a bounded run of frames before re-entering
    // itself, keeping each individual invocation under the verifier's
    // instruction budget (§5, §9 DESIGN NOTES).
    const FRAMES_PER_CALL: u32 = 8;
    for _ in 0..FRAMES_PER_CALL {
        let frame_idx = record.total_frames() as u32;
        if native::check_frame_budget(frame_idx).is_err() {
            bump_metric(MetricId::UnwindTruncated);
            return finalize_trace(pid, record);
        }

        let file_id = record.state.text_section_id;
        let offset = record.state.text_section_offset;
        let _ = (file_id, offset);

        match native::step(&mut mem, &tables, arch, pid, frame_idx, &mut record.state) {
            Ok(StepResult::Continue) => {
                record.push_frame(polyunwind_common::frame::Frame::native(
                    record.state.text_section_id,
                    record.state.text_section_offset,
                ));
            }
            Ok(StepResult::StackBottom) => return finalize_trace(pid, record),
            Err(err) => {
                bump_metric(err.as_metric_id());
                return finalize_trace(pid, record);
            }
        }
    }

    unsafe {
        let _ = bpf_tail_call(ctx.as_ptr(), &raw mut UNWIND_PROGS as *mut _, UnwindProgram::Native as u32);
    }
    finalize_trace(pid, record)
}

fn native_arch() -> Arch {
    // Target architecture is fixed at compile time for a given BPF object;
    // `cfg(target_arch)` picks the right variant without a runtime branch.
    #[cfg(target_arch = "aarch64")]
    {
        Arch::Aarch64 { inverse_pac_mask: 0 }
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        Arch::X86_64
    }
}

fn finalize_trace(pid: u32, record: &mut PerCpuRecord) -> Result<(), i64> {
    // `trace_hash` takes a slice of references; MAX_FRAME_LISTS is small
    // (6) so a fixed-size local array avoids needing a heap allocation.
    let mut refs: [&polyunwind_common::frame::FrameList; polyunwind_common::frame::MAX_FRAME_LISTS] =
        [&record.frame_lists[0]; polyunwind_common::frame::MAX_FRAME_LISTS];
    for (i, slot) in refs.iter_mut().enumerate().take(record.frame_list_count as usize) {
        *slot = &record.frame_lists[i];
    }
    let hash = polyunwind_common::hasher::trace_hash(
        record.trace.kernel_stack_id,
        &refs[..record.frame_list_count as usize],
        pid,
    );
    record.trace.hash = hash;
    record.trace.stack_len = record.total_frames() as u16;

    bump_metric(MetricId::TraceAttempted);

    // §4.5 step 3: known_traces first, then hash_to_trace for an in-flight
    // report from another CPU; only a full miss runs the reporter.
    let mut dedup = BpfDedup;
    match dedup::record_trace(&mut dedup, hash) {
        DedupOutcome::AlreadyReported | DedupOutcome::ReportInFlight => Ok(()),
        DedupOutcome::NeedsReport => {
            report_trace(record, hash);
            dedup::finish_report(&mut dedup, hash);
            if record.ha_symbolization_needed {
                send_latched_event(pid, PidEventType::TracesReady)
            } else {
                Ok(())
            }
        }
    }
}

/// §4.5 step 4: write each `FrameList` under `(hash, list_index)`, then the
/// trace header under `hash`. Runs at most once per distinct hash — the
/// caller only reaches here on [`DedupOutcome::NeedsReport`].
fn report_trace(record: &PerCpuRecord, hash: u64) {
    for i in 0..record.frame_list_count as usize {
        let key = pack_framelist_key(hash, i);
        let _ = HASH_TO_FRAMELIST.insert(&key, &record.frame_lists[i], 0);
    }
    let _ = HASH_TO_HEADER.insert(&hash, &record.trace, 0);
}

// ============================================================================
// Per-language interpreter unwind programs (ProgramArray slots 1..7)
// ============================================================================

const FRAMES_PER_CALL: u32 = 8;

/// Shared epilogue every per-language program runs after one `walk_one_frame`
/// call: push the frame if one was produced, finalize on `Done`, or bump the
/// matching metric and finalize on error. Returns `Some(())` once the caller
/// should stop looping (trace finalized one way or another).
fn step_outcome(
    record: &mut PerCpuRecord,
    pid: u32,
    outcome: Result<(WalkStep, Option<polyunwind_common::frame::Frame>), polyunwind_common::error::UnwindError>,
) -> Option<Result<(), i64>> {
    match outcome {
        Ok((WalkStep::Frame, Some(frame))) => {
            record.push_frame(frame);
            None
        }
        Ok((WalkStep::Frame, None)) => None,
        Ok((WalkStep::Done, _)) => Some(finalize_trace(pid, record)),
        Err(err) => {
            bump_metric(err.as_metric_id());
            Some(finalize_trace(pid, record))
        }
    }
}

#[perf_event]
pub fn unwind_python(ctx: PerfEventContext) -> u32 {
    match try_unwind_python(&ctx) {
        Ok(_) => 0,
        Err(_) => 1,
    }
}

fn try_unwind_python(ctx: &PerfEventContext) -> Result<(), i64> {
    let pid_tgid = unsafe { bpf_get_current_pid_tgid() };
    let pid = (pid_tgid >> 32) as u32;
    let record_ptr = PERCPU_RECORD.get_ptr_mut(0).ok_or(1i64)?;
    let record = unsafe { &mut *record_ptr };

    let Some(info) = (unsafe { PY_PROC_INFO.get(&pid) }).map(|s| s.record) else {
        bump_metric(MetricId::UnwindPythonErrNoProcInfo);
        return finalize_trace(pid, record);
    };

    let mut mem = BpfMemory;
    if record.python.frames_done == 0 && record.python.frame_addr == 0 {
        record.python.frame_addr =
            mem.read_u64(info.thread_state_addr + u64::from(info.frame_offset)).unwrap_or(0);
    }

    for _ in 0..FRAMES_PER_CALL {
        if native::check_frame_budget(record.total_frames() as u32).is_err() {
            bump_metric(MetricId::UnwindTruncated);
            return finalize_trace(pid, record);
        }
        let outcome = lang::python::walk_one_frame(&mut mem, &info, &mut record.python);
        if let Some(result) = step_outcome(record, pid, outcome) {
            return result;
        }
    }

    unsafe {
        let _ = bpf_tail_call(ctx.as_ptr(), &raw mut UNWIND_PROGS as *mut _, UnwindProgram::Python as u32);
    }
    finalize_trace(pid, record)
}

#[perf_event]
pub fn unwind_php(ctx: PerfEventContext) -> u32 {
    match try_unwind_php(&ctx) {
        Ok(_) => 0,
        Err(_) => 1,
    }
}

fn try_unwind_php(ctx: &PerfEventContext) -> Result<(), i64> {
    let pid_tgid = unsafe { bpf_get_current_pid_tgid() };
    let pid = (pid_tgid >> 32) as u32;
    let record_ptr = PERCPU_RECORD.get_ptr_mut(0).ok_or(1i64)?;
    let record = unsafe { &mut *record_ptr };

    let Some(info) = (unsafe { PHP_PROC_INFO.get(&pid) }).map(|s| s.record) else {
        bump_metric(MetricId::UnwindPhpErrBadFrame);
        return finalize_trace(pid, record);
    };

    let mut mem = BpfMemory;
    if record.php.frames_done == 0 && record.php.execute_data == 0 {
        record.php.execute_data = mem
            .read_u64(info.globals_addr + u64::from(info.current_execute_data_offset))
            .unwrap_or(0);
    }

    for _ in 0..FRAMES_PER_CALL {
        if native::check_frame_budget(record.total_frames() as u32).is_err() {
            bump_metric(MetricId::UnwindTruncated);
            return finalize_trace(pid, record);
        }
        let outcome = lang::php::walk_one_frame(&mut mem, &info, &mut record.php);
        if let Some(result) = step_outcome(record, pid, outcome) {
            return result;
        }
    }

    unsafe {
        let _ = bpf_tail_call(ctx.as_ptr(), &raw mut UNWIND_PROGS as *mut _, UnwindProgram::Php as u32);
    }
    finalize_trace(pid, record)
}

/// PHP-JIT frames are owned by a compiled region rather than the
/// interpreter loop (§4.2); resolve the region once, then fall back to the
/// same `execute_data` chain walk as interpreted PHP.
#[perf_event]
pub fn unwind_php_jit(ctx: PerfEventContext) -> u32 {
    match try_unwind_php_jit(&ctx) {
        Ok(_) => 0,
        Err(_) => 1,
    }
}

fn try_unwind_php_jit(ctx: &PerfEventContext) -> Result<(), i64> {
    let pid_tgid = unsafe { bpf_get_current_pid_tgid() };
    let pid = (pid_tgid >> 32) as u32;
    let record_ptr = PERCPU_RECORD.get_ptr_mut(0).ok_or(1i64)?;
    let record = unsafe { &mut *record_ptr };

    let Some(info) = (unsafe { PHP_JIT_PROC_INFO.get(&pid) }).map(|s| s.record) else {
        bump_metric(MetricId::UnwindPhpJitErrNoRegion);
        return finalize_trace(pid, record);
    };

    if record.php.frames_done == 0 && record.php.jit_region_id == 0 {
        if let Err(err) = lang::php::resolve_jit_execute_data(&info, record.state.pc) {
            bump_metric(err.as_metric_id());
            return finalize_trace(pid, record);
        }
        record.php.jit_region_id = 1;
        let mut mem = BpfMemory;
        record.php.execute_data = mem
            .read_u64(info.base.globals_addr + u64::from(info.base.current_execute_data_offset))
            .unwrap_or(0);
    }

    let mut mem = BpfMemory;
    for _ in 0..FRAMES_PER_CALL {
        if native::check_frame_budget(record.total_frames() as u32).is_err() {
            bump_metric(MetricId::UnwindTruncated);
            return finalize_trace(pid, record);
        }
        let outcome = lang::php::walk_one_frame(&mut mem, &info.base, &mut record.php);
        if let Some(result) = step_outcome(record, pid, outcome) {
            return result;
        }
    }

    unsafe {
        let _ = bpf_tail_call(ctx.as_ptr(), &raw mut UNWIND_PROGS as *mut _, UnwindProgram::PhpJit as u32);
    }
    finalize_trace(pid, record)
}

#[perf_event]
pub fn unwind_ruby(ctx: PerfEventContext) -> u32 {
    match try_unwind_ruby(&ctx) {
        Ok(_) => 0,
        Err(_) => 1,
    }
}

/// Size of `rb_control_frame_t` on a 64-bit MRI build; control frames grow
/// downward by this fixed stride (§4.2).
const RB_CONTROL_FRAME_SIZE: u64 = 0x38;

fn try_unwind_ruby(ctx: &PerfEventContext) -> Result<(), i64> {
    let pid_tgid = unsafe { bpf_get_current_pid_tgid() };
    let pid = (pid_tgid >> 32) as u32;
    let record_ptr = PERCPU_RECORD.get_ptr_mut(0).ok_or(1i64)?;
    let record = unsafe { &mut *record_ptr };

    let Some(info) = (unsafe { RUBY_PROC_INFO.get(&pid) }).map(|s| s.record) else {
        bump_metric(MetricId::UnwindRubyErrBadFrame);
        return finalize_trace(pid, record);
    };

    let mut mem = BpfMemory;
    if record.ruby.frames_done == 0 && record.ruby.cfp == 0 {
        let ec_addr = mem.read_u64(info.globals_addr + u64::from(info.current_ec_offset)).unwrap_or(0);
        record.ruby.cfp = if ec_addr == 0 { 0 } else { mem.read_u64(ec_addr + u64::from(info.cfp_offset)).unwrap_or(0) };
    }

    for _ in 0..FRAMES_PER_CALL {
        if native::check_frame_budget(record.total_frames() as u32).is_err() {
            bump_metric(MetricId::UnwindTruncated);
            return finalize_trace(pid, record);
        }
        let outcome = lang::ruby::walk_one_frame(&mut mem, &info, RB_CONTROL_FRAME_SIZE, &mut record.ruby);
        if let Some(result) = step_outcome(record, pid, outcome) {
            return result;
        }
    }

    unsafe {
        let _ = bpf_tail_call(ctx.as_ptr(), &raw mut UNWIND_PROGS as *mut _, UnwindProgram::Ruby as u32);
    }
    finalize_trace(pid, record)
}

#[perf_event]
pub fn unwind_perl(ctx: PerfEventContext) -> u32 {
    match try_unwind_perl(&ctx) {
        Ok(_) => 0,
        Err(_) => 1,
    }
}

fn try_unwind_perl(ctx: &PerfEventContext) -> Result<(), i64> {
    let pid_tgid = unsafe { bpf_get_current_pid_tgid() };
    let pid = (pid_tgid >> 32) as u32;
    let record_ptr = PERCPU_RECORD.get_ptr_mut(0).ok_or(1i64)?;
    let record = unsafe { &mut *record_ptr };

    let Some(info) = (unsafe { PERL_PROC_INFO.get(&pid) }).map(|s| s.record) else {
        bump_metric(MetricId::UnwindPerlErrBadFrame);
        return finalize_trace(pid, record);
    };

    let mut mem = BpfMemory;
    if record.perl.frames_done == 0 && record.perl.cx_addr == 0 {
        record.perl.cx_addr = info.interpreter_addr + u64::from(info.cxstack_offset);
        record.perl.cx_index = mem.read_u32(info.interpreter_addr + u64::from(info.cxstack_ix_offset)).unwrap_or(0) as i32;
    }

    for _ in 0..FRAMES_PER_CALL {
        if native::check_frame_budget(record.total_frames() as u32).is_err() {
            bump_metric(MetricId::UnwindTruncated);
            return finalize_trace(pid, record);
        }
        let outcome = lang::perl::walk_one_frame(&mut mem, &info, &mut record.perl);
        if let Some(result) = step_outcome(record, pid, outcome) {
            return result;
        }
    }

    unsafe {
        let _ = bpf_tail_call(ctx.as_ptr(), &raw mut UNWIND_PROGS as *mut _, UnwindProgram::Perl as u32);
    }
    finalize_trace(pid, record)
}

#[perf_event]
pub fn unwind_v8(ctx: PerfEventContext) -> u32 {
    match try_unwind_v8(&ctx) {
        Ok(_) => 0,
        Err(_) => 1,
    }
}

fn try_unwind_v8(ctx: &PerfEventContext) -> Result<(), i64> {
    let pid_tgid = unsafe { bpf_get_current_pid_tgid() };
    let pid = (pid_tgid >> 32) as u32;
    let record_ptr = PERCPU_RECORD.get_ptr_mut(0).ok_or(1i64)?;
    let record = unsafe { &mut *record_ptr };

    let Some(info) = (unsafe { V8_PROC_INFO.get(&pid) }).map(|s| s.record) else {
        bump_metric(MetricId::UnwindV8ErrBadFrame);
        return finalize_trace(pid, record);
    };

    if record.v8.frames_done == 0 && record.v8.fp == 0 {
        record.v8.fp = record.state.fp;
    }

    let mut mem = BpfMemory;
    for _ in 0..FRAMES_PER_CALL {
        if native::check_frame_budget(record.total_frames() as u32).is_err() {
            bump_metric(MetricId::UnwindTruncated);
            return finalize_trace(pid, record);
        }
        let outcome = lang::v8::walk_one_frame(&mut mem, &info, &mut record.v8);
        if let Some(result) = step_outcome(record, pid, outcome) {
            return result;
        }
    }

    unsafe {
        let _ = bpf_tail_call(ctx.as_ptr(), &raw mut UNWIND_PROGS as *mut _, UnwindProgram::V8 as u32);
    }
    finalize_trace(pid, record)
}

#[perf_event]
pub fn unwind_hotspot(ctx: PerfEventContext) -> u32 {
    match try_unwind_hotspot(&ctx) {
        Ok(_) => 0,
        Err(_) => 1,
    }
}

fn try_unwind_hotspot(ctx: &PerfEventContext) -> Result<(), i64> {
    let pid_tgid = unsafe { bpf_get_current_pid_tgid() };
    let pid = (pid_tgid >> 32) as u32;
    let record_ptr = PERCPU_RECORD.get_ptr_mut(0).ok_or(1i64)?;
    let record = unsafe { &mut *record_ptr };

    let Some(info) = (unsafe { HOTSPOT_PROC_INFO.get(&pid) }).map(|s| s.record) else {
        bump_metric(MetricId::UnwindHotspotErrBadFrame);
        return finalize_trace(pid, record);
    };

    if record.hotspot.frames_done == 0 && record.hotspot.fp == 0 && record.hotspot.pc == 0 {
        record.hotspot.fp = record.state.fp;
        record.hotspot.sp = record.state.sp;
        record.hotspot.pc = record.state.pc;
        record.hotspot.lr = record.state.r13_or_lr;
    }

    // A codeblob's epilogue tail isn't safely walkable via scopes data;
    // fall back to interpreter-style frame-pointer recovery there (§9).
    if lang::hotspot::in_epilogue(record.hotspot.pc, info.codecache_end) {
        bump_metric(MetricId::UnwindHotspotErrEpilogue);
    }

    // The dispatcher pins these at the first frame's PC resolution
    // (`text_section_id`/`text_section_bias` repurposed as segmap base and
    // codecache bias for a HotSpot pid); every sub-frame in this sample
    // reuses them rather than re-resolving per frame.
    let segmap_start = record.state.text_section_id;
    let codecache_bias = record.state.text_section_bias;
    let arch = native_arch();

    let mut mem = BpfMemory;
    for _ in 0..FRAMES_PER_CALL {
        if native::check_frame_budget(record.total_frames() as u32).is_err() {
            bump_metric(MetricId::UnwindTruncated);
            return finalize_trace(pid, record);
        }
        let outcome =
            lang::hotspot::walk_one_frame(&mut mem, &info, arch, segmap_start, codecache_bias, &mut record.hotspot);
        if let Some(result) = step_outcome(record, pid, outcome) {
            return result;
        }
    }

    unsafe {
        let _ = bpf_tail_call(ctx.as_ptr(), &raw mut UNWIND_PROGS as *mut _, UnwindProgram::Hotspot as u32);
    }
    finalize_trace(pid, record)
}

fn send_latched_event(pid: u32, event_type: PidEventType) -> Result<(), i64> {
    let latch_key = (u64::from(pid) << 8) | u64::from(event_type as u8);
    if event_type.is_latched() {
        let already_sent = unsafe { INHIBIT_EVENTS.get(&latch_key) }.is_some();
        if already_sent {
            return Ok(());
        }
        unsafe {
            INHIBIT_EVENTS.insert(&latch_key, &1u8, 0).map_err(|_| 1i64)?;
        }
    }

    let event = PidEvent::new(pid, event_type);
    let buf = event.encode();
    if EVENTS.output(&buf, 0).is_err() {
        bump_metric(MetricId::ErrLostEvents);
    }
    Ok(())
}

// ============================================================================
// PID lifecycle probes
// ============================================================================

#[tracepoint]
pub fn sched_process_exit(ctx: TracePointContext) -> u32 {
    let _ = ctx;
    let pid_tgid = unsafe { bpf_get_current_pid_tgid() };
    let pid = (pid_tgid >> 32) as u32;
    let tid = pid_tgid as u32;

    // §4.6: only the thread-group leader's exit tears down the pid's
    // throttle/report state; other thread exits are not process exits.
    if pid != tid {
        return 0;
    }

    let _ = REPORTED_PIDS.remove(&pid);
    match send_latched_event(pid, PidEventType::Exit) {
        Ok(_) => 0,
        Err(_) => 1,
    }
}

/// `munmap()` entry: userland needs to know which address ranges were
/// unmapped so it can invalidate any introspection offsets anchored there.
/// Only addresses the PID-page trie actually tracks are worth staging —
/// anything else can't be stale in a table we never populated for it.
#[kprobe]
pub fn munmap_enter(ctx: ProbeContext) -> u32 {
    match try_munmap_enter(&ctx) {
        Ok(_) => 0,
        Err(_) => 1,
    }
}

fn try_munmap_enter(ctx: &ProbeContext) -> Result<(), i64> {
    let pid_tgid = unsafe { bpf_get_current_pid_tgid() };
    let pid = (pid_tgid >> 32) as u32;
    let addr: u64 = unsafe { ctx.arg(0).ok_or(1i64)? };

    let tables = BpfTables;
    let page = addr & !(polyunwind_common::stack_delta::STACK_DELTA_PAGE_SIZE - 1);
    if tables.lookup_pid_page(pid, page).is_some() {
        let _ = MUNMAP_SCRATCH.insert(&pid_tgid, &addr, 0);
    }
    Ok(())
}

/// `munmap()` return: emit the event only if the syscall actually
/// succeeded, then always clear the scratch entry regardless of outcome.
#[kretprobe]
pub fn munmap_exit(ctx: RetProbeContext) -> u32 {
    match try_munmap_exit(&ctx) {
        Ok(_) => 0,
        Err(_) => 1,
    }
}

fn try_munmap_exit(ctx: &RetProbeContext) -> Result<(), i64> {
    let pid_tgid = unsafe { bpf_get_current_pid_tgid() };
    let pid = (pid_tgid >> 32) as u32;
    let ret: i64 = unsafe { ctx.ret::<i64>().unwrap_or(-1) };

    if let Some(&addr) = unsafe { MUNMAP_SCRATCH.get(&pid_tgid) } {
        if ret == 0 {
            let event = MunmapEvent::new(pid, addr);
            let buf = event.encode();
            if EVENTS.output(&buf, 0).is_err() {
                bump_metric(MetricId::ErrLostEvents);
            }
        }
    }
    let _ = MUNMAP_SCRATCH.remove(&pid_tgid);
    Ok(())
}

#[cfg(all(not(test), target_os = "none"))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
