//! Perl interpreter frame walker, grounded on the `PERL_CONTEXT`/`COP`
//! context-stack chain described in §4.2 and `types.h`'s `PerlProcInfo`.

use super::WalkStep;
use crate::error::{ReaderError, UnwindError};
use crate::frame::{Frame, FrameKind};
use crate::introspection::PerlProcInfo;
use crate::memory::Memory;
use crate::state::PerlUnwindState;

const CONTEXT_STRUCT_SIZE: u64 = 0x40;

/// Decode one `PERL_CONTEXT` entry into a [`Frame`] and step down the
/// context stack (`cx_index` decreases towards the caller, mirroring
/// `cxstack[cxstack_ix]`).
pub fn walk_one_frame<M: Memory>(
    mem: &mut M,
    info: &PerlProcInfo,
    state: &mut PerlUnwindState,
) -> Result<(WalkStep, Option<Frame>), UnwindError> {
    if state.cx_index < 0 {
        return Ok((WalkStep::Done, None));
    }

    let cx_addr = state.cx_addr + (state.cx_index as u64) * CONTEXT_STRUCT_SIZE;
    let cop_line = mem
        .read_u32(cx_addr + u64::from(info.cop_line_offset))
        .map_err(|_| UnwindError::Reader(ReaderError::ProbeReadFailed))?;

    let frame = Frame { file: cx_addr, line: u64::from(cop_line), kind: FrameKind::Perl };
    state.cx_index -= 1;
    state.frames_done += 1;
    Ok((WalkStep::Frame, Some(frame)))
}
