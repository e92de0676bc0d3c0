//! Decodes a captured event stream for the `replay` subcommand.
//!
//! A live loader's ring buffer consumer sees each `PidEvent`/`MunmapEvent`
//! as a self-delimited item (the kernel ring buffer hands back one record
//! at a time, as `hud`'s main loop reads one `TaskEvent` per `ring_buf.next()`
//! call). A capture file has no such framing for free, so records here are
//! stored as `[u32 length littleendian][payload]`, and dispatched to
//! `PidEvent` or `MunmapEvent` by the declared length — this framing is the
//! companion's own, not a kernel wire format.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use polyunwind_common::events::{MunmapEvent, PidEvent};

use crate::domain::errors::ReplayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "kind")]
pub enum ReplayRecord {
    Pid {
        pid: u32,
        #[serde(serialize_with = "serialize_event_type")]
        event_type: u32,
    },
    Munmap {
        pid: u32,
        addr: u64,
    },
}

fn serialize_event_type<S: serde::Serializer>(v: &u32, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u32(*v)
}

/// Read every framed record out of `path`, in order.
pub fn read_records(path: &Path) -> Result<Vec<ReplayRecord>, ReplayError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    let mut offset = 0usize;
    let mut len_buf = [0u8; 4];

    loop {
        if !read_exact_or_eof(&mut reader, &mut len_buf)? {
            break;
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                ReplayError::Truncated { offset: offset + 4, expected: len, found: 0 }
            } else {
                ReplayError::Io(e)
            }
        })?;

        records.push(decode_record(offset + 4, &payload)?);
        offset += 4 + len;
    }

    Ok(records)
}

fn decode_record(offset: usize, payload: &[u8]) -> Result<ReplayRecord, ReplayError> {
    match payload.len() {
        PidEvent::WIRE_SIZE => {
            let ev = PidEvent::decode(payload)
                .ok_or(ReplayError::Truncated { offset, expected: PidEvent::WIRE_SIZE, found: payload.len() })?;
            Ok(ReplayRecord::Pid { pid: ev.pid, event_type: ev.event_type })
        }
        MunmapEvent::WIRE_SIZE => {
            let ev = MunmapEvent::decode(payload).ok_or(ReplayError::Truncated {
                offset,
                expected: MunmapEvent::WIRE_SIZE,
                found: payload.len(),
            })?;
            Ok(ReplayRecord::Munmap { pid: ev.pid, addr: ev.addr })
        }
        len => Err(ReplayError::UnknownRecordLength {
            offset,
            len,
            pid_event: PidEvent::WIRE_SIZE,
            munmap_event: MunmapEvent::WIRE_SIZE,
        }),
    }
}

fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool, ReplayError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(ReplayError::Truncated { offset: 0, expected: buf.len(), found: filled })
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ReplayError::Io(e)),
        }
    }
    Ok(true)
}

/// Frame a record the same way a capture tool would, for tests and for any
/// future capture-side implementation to reuse.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}
