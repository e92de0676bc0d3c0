//! Structured error types for the polyunwind companion.
//!
//! Using thiserror for automatic Display implementation and error chaining,
//! same as the teacher's domain error modules.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("record at offset {offset} has length {len}, which matches neither the PidEvent ({pid_event}) nor MunmapEvent ({munmap_event}) wire size")]
    UnknownRecordLength { offset: usize, len: usize, pid_event: usize, munmap_event: usize },

    #[error("truncated record at offset {offset}: expected {expected} bytes, found {found}")]
    Truncated { offset: usize, expected: usize, found: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_length_display_names_the_offending_size() {
        let err = ReplayError::UnknownRecordLength { offset: 16, len: 5, pid_event: 8, munmap_event: 12 };
        assert!(err.to_string().contains("length 5"));
        assert!(err.to_string().contains("offset 16"));
    }
}
