//! Per-PID introspection records (§3), grounded on `types.h`'s
//! `PyProcInfo`/`PHPProcInfo`/`PHPJITProcInfo`/`HotspotProcInfo`/
//! `RubyProcInfo`/`V8ProcInfo`/`PerlProcInfo`. Userland populates these
//! before a traced PID's frames can be decoded; this module only carries
//! the record layouts and the "immutable snapshot under a generation
//! counter" collaborator boundary (§9 DESIGN NOTES) — the out-of-scope
//! offset-extraction logic itself lives entirely in userland.

/// CPython struct-field offsets needed to walk a thread's frame chain.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct PyProcInfo {
    pub version: u32,
    pub thread_state_addr: u64,
    pub frame_offset: u16,
    pub f_back_offset: u16,
    pub f_code_offset: u16,
    pub f_lasti_offset: u16,
    pub co_firstlineno_offset: u16,
    pub co_flags_offset: u16,
    pub co_argcount_offset: u16,
    pub co_kwonlyargcount_offset: u16,
}

/// Zend VM struct-field offsets for the interpreted (non-JIT) PHP unwinder.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct PhpProcInfo {
    pub version: u32,
    /// Resolved absolute address of the executor globals struct that owns
    /// `current_execute_data_offset` below (TSRM-resolved by the loader;
    /// out of scope here).
    pub globals_addr: u64,
    pub current_execute_data_offset: u16,
    pub execute_data_prev_offset: u16,
    pub execute_data_func_offset: u16,
    pub execute_data_opline_offset: u16,
    pub function_name_offset: u16,
}

/// PHP JIT additionally needs the compiled-region table to map a native PC
/// back onto its owning `execute_data`/opline pair.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct PhpJitProcInfo {
    pub base: PhpProcInfo,
    pub jit_region_start: u64,
    pub jit_region_end: u64,
}

/// HotSpot JVM struct-field offsets (`CodeBlob`/`Method`/`nmethod`). The
/// `segment_shift`/`heapblock_size` pair plus the PID+page trie's `file_id`/
/// bias (repurposed by the loader to carry the segmap base address and the
/// codecache segment bias for this PID, rather than a conventional file id)
/// are what `lang::hotspot::find_codeblob_address` needs to walk the JVM's
/// segmap and land on a CodeBlob.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct HotspotProcInfo {
    pub version: u32,
    /// `<= 8` switches on the JDK7/8 quirk where several CodeBlob fields are
    /// stored as 32-bit offsets from the blob's own address rather than
    /// absolute pointers.
    pub jvm_version: u16,
    pub codecache_start: u64,
    pub codecache_end: u64,
    pub segment_shift: u16,
    pub heapblock_size: u16,
    pub codeblob_name_offset: u16,
    pub codeblob_codestart_offset: u16,
    pub codeblob_codeend_offset: u16,
    pub codeblob_framesize_offset: u16,
    pub codeblob_framecomplete_offset: u16,
    pub compiledmethod_deopt_handler_offset: u16,
    pub nmethod_compileid_offset: u16,
    pub nmethod_orig_pc_offset: u16,
    pub nmethod_method_offset: u16,
    pub method_constmethod_offset: u16,
}

/// Ruby VM struct-field offsets (`rb_execution_context_t`/`rb_control_frame_t`).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct RubyProcInfo {
    pub version: u32,
    /// Resolved absolute address of the thread-local `rb_execution_context_t*`
    /// slot `current_ec_offset` is read from.
    pub globals_addr: u64,
    pub current_ec_offset: u16,
    pub cfp_offset: u16,
    pub cfp_pc_offset: u16,
    pub cfp_iseq_offset: u16,
    pub cfp_ep_offset: u16,
}

/// V8 isolate struct-field offsets.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct V8ProcInfo {
    pub version: u32,
    pub isolate_addr: u64,
    pub embedded_blob_start: u64,
    pub embedded_blob_end: u64,
}

/// Perl interpreter struct-field offsets (`PERL_CONTEXT`/`COP` chain).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct PerlProcInfo {
    pub version: u32,
    pub interpreter_addr: u64,
    pub cxstack_offset: u16,
    pub cxstack_ix_offset: u16,
    pub cop_line_offset: u16,
}

/// Generation-tagged snapshot wrapper: userland bumps `generation` every
/// time it re-installs a record so readers can detect a stale read without
/// needing a lock (§9: "treat introspection records as immutable snapshots
/// under a generation counter").
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct Snapshot<T> {
    pub generation: u32,
    pub record: T,
}

/// The collaborator boundary a real loader implements: install a snapshot
/// for a PID, or invalidate it once the PID has exited or been re-exec'd.
pub trait IntrospectionSource<T: Copy> {
    fn install(&mut self, pid: u32, record: T);
    fn invalidate(&mut self, pid: u32);
    fn lookup(&self, pid: u32) -> Option<Snapshot<T>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MockSource<T> {
        table: HashMap<u32, Snapshot<T>>,
        next_generation: u32,
    }

    impl<T: Copy> IntrospectionSource<T> for MockSource<T> {
        fn install(&mut self, pid: u32, record: T) {
            self.next_generation += 1;
            self.table.insert(pid, Snapshot { generation: self.next_generation, record });
        }

        fn invalidate(&mut self, pid: u32) {
            self.table.remove(&pid);
        }

        fn lookup(&self, pid: u32) -> Option<Snapshot<T>> {
            self.table.get(&pid).copied()
        }
    }

    #[test]
    fn install_bumps_generation_on_reinstall() {
        let mut src: MockSource<PyProcInfo> = MockSource::default();
        src.install(1, PyProcInfo::default());
        let gen1 = src.lookup(1).unwrap().generation;
        src.install(1, PyProcInfo::default());
        let gen2 = src.lookup(1).unwrap().generation;
        assert!(gen2 > gen1);
    }

    #[test]
    fn invalidate_removes_the_snapshot() {
        let mut src: MockSource<RubyProcInfo> = MockSource::default();
        src.install(42, RubyProcInfo::default());
        assert!(src.lookup(42).is_some());
        src.invalidate(42);
        assert!(src.lookup(42).is_none());
    }
}
