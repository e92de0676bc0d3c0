//! Ruby VM frame walker, grounded on the `rb_control_frame_t` chain shape
//! described in §4.2 and `types.h`'s `RubyProcInfo`.

use super::WalkStep;
use crate::error::{ReaderError, UnwindError};
use crate::frame::{Frame, FrameKind};
use crate::introspection::RubyProcInfo;
use crate::memory::Memory;
use crate::state::RubyUnwindState;

/// Decode one `rb_control_frame_t` into a [`Frame`] and advance the cursor
/// towards the caller (control frames grow downward, so "advance" means
/// incrementing the pointer by the frame's fixed size).
pub fn walk_one_frame<M: Memory>(
    mem: &mut M,
    info: &RubyProcInfo,
    cfp_size: u64,
    state: &mut RubyUnwindState,
) -> Result<(WalkStep, Option<Frame>), UnwindError> {
    if state.cfp == 0 {
        return Ok((WalkStep::Done, None));
    }

    let iseq = mem
        .read_u64(state.cfp + u64::from(info.cfp_iseq_offset))
        .map_err(|_| UnwindError::Reader(ReaderError::ProbeReadFailed))?;
    let pc = mem
        .read_u64(state.cfp + u64::from(info.cfp_pc_offset))
        .map_err(|_| UnwindError::Reader(ReaderError::ProbeReadFailed))?;

    if iseq == 0 {
        // Native (cfunc) control frame: no iseq to report, just ascend.
        state.cfp += cfp_size;
        state.frames_done += 1;
        return Ok((WalkStep::Frame, None));
    }

    let frame = Frame { file: iseq, line: pc, kind: FrameKind::Ruby };
    state.cfp += cfp_size;
    state.frames_done += 1;
    Ok((WalkStep::Frame, Some(frame)))
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

    fn info() -> RubyProcInfo {
        RubyProcInfo {
            version: 1,
            globals_addr: 0,
            current_ec_offset: 0,
            cfp_offset: 0,
            cfp_pc_offset: 0,
            cfp_iseq_offset: 8,
            cfp_ep_offset: 16,
        }
    }

    #[test]
    fn walk_one_frame_advances_cfp_by_frame_size() {
        let info = info();
        let mut words = HashMap::new();
        words.insert(0x100, 0x900u64); // pc
        words.insert(0x100 + 8, 0x7000u64); // iseq
        let mut mem = MockMemory(words);

        let mut state = RubyUnwindState { cfp: 0x100, frames_done: 0 };
        let (step, frame) = walk_one_frame(&mut mem, &info, 0x40, &mut state).unwrap();
        assert_eq!(step, WalkStep::Frame);
        assert_eq!(frame.unwrap().file, 0x7000);
        assert_eq!(state.cfp, 0x140);
    }

    #[test]
    fn native_cfunc_frame_has_no_reported_frame() {
        let info = info();
        let mut words = HashMap::new();
        words.insert(0x100, 0u64);
        words.insert(0x100 + 8, 0u64); // iseq == 0 means native
        let mut mem = MockMemory(words);

        let mut state = RubyUnwindState { cfp: 0x100, frames_done: 0 };
        let (step, frame) = walk_one_frame(&mut mem, &info, 0x40, &mut state).unwrap();
        assert_eq!(step, WalkStep::Frame);
        assert!(frame.is_none());
    }
}
