//! V8 frame-pointer walker, grounded on §4.2's description of a fixed-size
//! JS frame layout (`fp[-1]` = marker/JSFunction, `fp[0]` = caller fp).
//!
//! Open question (§9): on non-x86-64 architectures V8 sometimes needs a
//! three-slot search stride to find the context slot rather than a fixed
//! offset. This walker always uses the fixed one-slot offset; the
//! three-slot stride fallback is recorded as a decision in DESIGN.md rather
//! than implemented, since the retained source gives no concrete trigger
//! condition for when the wider stride applies.

use super::WalkStep;
use crate::error::{ReaderError, UnwindError};
use crate::frame::{encode_v8_native, Frame, FrameKind};
use crate::introspection::V8ProcInfo;
use crate::memory::Memory;
use crate::state::V8UnwindState;

const FP_MARKER_OFFSET: u64 = 8;
const FP_CALLER_OFFSET: u64 = 0;
const FP_FUNCTION_OFFSET: u64 = 16;

/// Decode one JS frame into a [`Frame`] and advance `fp` to the caller's
/// frame pointer.
pub fn walk_one_frame<M: Memory>(
    mem: &mut M,
    info: &V8ProcInfo,
    state: &mut V8UnwindState,
) -> Result<(WalkStep, Option<Frame>), UnwindError> {
    if state.fp == 0 {
        return Ok((WalkStep::Done, None));
    }

    let marker = mem
        .read_u64(state.fp + FP_MARKER_OFFSET)
        .map_err(|_| UnwindError::Reader(ReaderError::ProbeReadFailed))?;

    let in_embedded_blob = marker >= info.embedded_blob_start && marker < info.embedded_blob_end;
    let frame = if in_embedded_blob {
        Frame { file: marker, line: encode_v8_native(marker, 0), kind: FrameKind::V8 }
    } else {
        let js_function = mem
            .read_u64(state.fp + FP_FUNCTION_OFFSET)
            .map_err(|_| UnwindError::Reader(ReaderError::ProbeReadFailed))?;
        Frame { file: js_function, line: marker, kind: FrameKind::V8 }
    };

    let caller_fp = mem
        .read_u64(state.fp + FP_CALLER_OFFSET)
        .map_err(|_| UnwindError::Reader(ReaderError::ProbeReadFailed))?;
    state.fp = caller_fp;
    state.frames_done += 1;
    Ok((WalkStep::Frame, Some(frame)))
}
