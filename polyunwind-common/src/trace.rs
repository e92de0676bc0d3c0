//! Trace header (§3/§6): the fixed-size record identifying one captured
//! stack sample, grounded on `types.h`'s `Trace` struct.

pub const TASK_COMM_LEN: usize = 16;

/// One captured stack sample's metadata, sent alongside its `FrameList`
/// chain. `hash` is the deduplication key computed by [`crate::hasher`].
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TraceHeader {
    pub pid: u32,
    pub comm: [u8; TASK_COMM_LEN],
    pub hash: u64,
    pub kernel_stack_id: i64,
    pub stack_len: u16,
    pub python_gil_held: u8,
    _padding: [u8; 5],
}

impl TraceHeader {
    pub fn new(pid: u32, comm: [u8; TASK_COMM_LEN], kernel_stack_id: i64) -> Self {
        Self {
            pid,
            comm,
            hash: 0,
            kernel_stack_id,
            stack_len: 0,
            python_gil_held: 0,
            _padding: [0; 5],
        }
    }

    pub fn comm_str(&self) -> &str {
        let len = self.comm.iter().position(|&b| b == 0).unwrap_or(TASK_COMM_LEN);
        core::str::from_utf8(&self.comm[..len]).unwrap_or("")
    }
}
