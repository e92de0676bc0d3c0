//! PID-lifecycle event channel wire formats (§6): the 8-byte `PidEvent` and
//! 12-byte `MunmapEvent` records sent over the ring buffer, plus the
//! latch-inhibition bookkeeping described in `tracemgmt.h`'s
//! `report_new_pid`/`maybe_send_unknown_pc` pattern.

/// Lifecycle event discriminants. `NEW`/`EXIT` always fire; `TRACES_READY`
/// and `UNKNOWN_PC` are latch-inhibited until userland clears the flag.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PidEventType {
    New = 1,
    Exit = 2,
    TracesReady = 3,
    UnknownPc = 4,
}

impl PidEventType {
    pub const fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            1 => Self::New,
            2 => Self::Exit,
            3 => Self::TracesReady,
            4 => Self::UnknownPc,
            _ => return None,
        })
    }

    /// Whether this event type is subject to inhibit-until-cleared latching,
    /// as opposed to firing unconditionally every time.
    pub const fn is_latched(self) -> bool {
        matches!(self, Self::TracesReady | Self::UnknownPc)
    }
}

/// 8-byte wire record: `pid: u32, event_type: u32`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PidEvent {
    pub pid: u32,
    pub event_type: u32,
}

impl PidEvent {
    pub const WIRE_SIZE: usize = 8;

    pub const fn new(pid: u32, event_type: PidEventType) -> Self {
        Self { pid, event_type: event_type as u32 }
    }

    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..4].copy_from_slice(&self.pid.to_le_bytes());
        buf[4..8].copy_from_slice(&self.event_type.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::WIRE_SIZE {
            return None;
        }
        let pid = u32::from_le_bytes(buf[0..4].try_into().ok()?);
        let event_type = u32::from_le_bytes(buf[4..8].try_into().ok()?);
        Some(Self { pid, event_type })
    }

    pub fn kind(&self) -> Option<PidEventType> {
        PidEventType::from_u32(self.event_type)
    }
}

/// 12-byte wire record for a userspace `munmap()` notification:
/// `pid: u32, addr: u64`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MunmapEvent {
    pub pid: u32,
    pub addr: u64,
}

impl MunmapEvent {
    pub const WIRE_SIZE: usize = 12;

    pub const fn new(pid: u32, addr: u64) -> Self {
        Self { pid, addr }
    }

    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..4].copy_from_slice(&self.pid.to_le_bytes());
        buf[4..12].copy_from_slice(&self.addr.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::WIRE_SIZE {
            return None;
        }
        let pid = u32::from_le_bytes(buf[0..4].try_into().ok()?);
        let addr = u64::from_le_bytes(buf[4..12].try_into().ok()?);
        Some(Self { pid, addr })
    }
}
