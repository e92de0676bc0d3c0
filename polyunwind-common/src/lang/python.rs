//! CPython frame walker, grounded on `python_tracer.ebpf.c`'s
//! `process_python_frame`/`walk_python_stack`/`py_encode_lineno`.

use super::WalkStep;
use crate::error::{ReaderError, UnwindError};
use crate::frame::{encode_python_line, Frame, FrameKind};
use crate::hasher::hash32;
use crate::introspection::PyProcInfo;
use crate::memory::Memory;
use crate::state::PythonUnwindState;

/// `codeobject_hash = hash32(firstlineno) + hash32(flags) + hash32(kwonlyargcount)
/// + hash32(argcount)`, a sum (not xor) of four Murmur3-32 finalizer mixes,
/// confirmed against the C source rather than the narrative's "xor-sum" phrasing.
fn codeobject_hash<M: Memory>(mem: &mut M, info: &PyProcInfo, code_addr: u64) -> Result<u32, UnwindError> {
    let read_field = |mem: &mut M, offset: u16| -> Result<u32, UnwindError> {
        mem.read_u32(code_addr + u64::from(offset))
            .map_err(|_| UnwindError::Reader(ReaderError::ProbeReadFailed))
    };
    let firstlineno = read_field(mem, info.co_firstlineno_offset)?;
    let flags = read_field(mem, info.co_flags_offset)?;
    let kwonlyargcount = read_field(mem, info.co_kwonlyargcount_offset)?;
    let argcount = read_field(mem, info.co_argcount_offset)?;
    Ok(hash32(firstlineno)
        .wrapping_add(hash32(flags))
        .wrapping_add(hash32(kwonlyargcount))
        .wrapping_add(hash32(argcount)))
}

/// Decode one `PyFrameObject` into a [`Frame`] and advance `state` to its
/// `f_back` caller, mirroring `process_python_frame`.
pub fn walk_one_frame<M: Memory>(
    mem: &mut M,
    info: &PyProcInfo,
    state: &mut PythonUnwindState,
) -> Result<(WalkStep, Option<Frame>), UnwindError> {
    if state.frame_addr == 0 {
        return Ok((WalkStep::Done, None));
    }

    let code_addr = mem
        .read_u64(state.frame_addr + u64::from(info.f_code_offset))
        .map_err(|_| UnwindError::Reader(ReaderError::ProbeReadFailed))?;
    let f_lasti = mem
        .read_u32(state.frame_addr + u64::from(info.f_lasti_offset))
        .map_err(|_| UnwindError::Reader(ReaderError::ProbeReadFailed))?;
    let hash = codeobject_hash(mem, info, code_addr)?;
    let line = encode_python_line(hash, f_lasti);
    let frame = Frame { file: code_addr, line, kind: FrameKind::Python };

    let f_back = mem
        .read_u64(state.frame_addr + u64::from(info.f_back_offset))
        .map_err(|_| UnwindError::Reader(ReaderError::ProbeReadFailed))?;
    state.frame_addr = f_back;
    state.frames_done += 1;
    Ok((WalkStep::Frame, Some(frame)))
}

/// Whether the interpreter's GIL is currently held by the sampled thread;
/// recorded on the trace header so userland can weight samples taken while
/// another thread holds the GIL differently.
pub fn gil_held<M: Memory>(mem: &mut M, thread_state_addr: u64, gil_holder_offset: u16) -> bool {
    mem.read_u64(thread_state_addr + u64::from(gil_holder_offset))
        .map(|holder| holder == thread_state_addr)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ReadError;
    use std::collections::HashMap;

    struct MockMemory(HashMap<u64, u64>);

    impl Memory for MockMemory {
        fn read(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), ReadError> {
            let word = self.0.get(&addr).copied().ok_or(ReadError)?;
            buf.copy_from_slice(&word.to_ne_bytes()[..buf.len()]);
            Ok(())
        }
    }

    fn info() -> PyProcInfo {
        PyProcInfo {
            version: 1,
            thread_state_addr: 0,
            frame_offset: 0,
            f_back_offset: 8,
            f_code_offset: 16,
            f_lasti_offset: 24,
            co_firstlineno_offset: 0,
            co_flags_offset: 4,
            co_argcount_offset: 8,
            co_kwonlyargcount_offset: 12,
        }
    }

    #[test]
    fn walk_one_frame_advances_to_f_back() {
        let info = info();
        let mut words = HashMap::new();
        words.insert(0x100 + 16, 0x5000u64); // f_code
        words.insert(0x100 + 24, 42u64); // f_lasti
        words.insert(0x100 + 8, 0x200u64); // f_back
        words.insert(0x5000, 10u64); // firstlineno
        words.insert(0x5004, 0u64); // flags
        words.insert(0x5008, 2u64); // argcount
        words.insert(0x500C, 0u64); // kwonlyargcount
        let mut mem = MockMemory(words);

        let mut state = PythonUnwindState { frame_addr: 0x100, thread_state_addr: 0, frames_done: 0 };
        let (step, frame) = walk_one_frame(&mut mem, &info, &mut state).unwrap();
        assert_eq!(step, WalkStep::Frame);
        let frame = frame.unwrap();
        assert_eq!(frame.file, 0x5000);
        assert_eq!(frame.kind, FrameKind::Python);
        assert_eq!(state.frame_addr, 0x200);
        assert_eq!(state.frames_done, 1);
    }

    #[test]
    fn walk_stops_when_frame_addr_is_null() {
        let info = info();
        let mut mem = MockMemory(HashMap::new());
        let mut state = PythonUnwindState { frame_addr: 0, thread_state_addr: 0, frames_done: 0 };
        let (step, frame) = walk_one_frame(&mut mem, &info, &mut state).unwrap();
        assert_eq!(step, WalkStep::Done);
        assert!(frame.is_none());
    }
}
