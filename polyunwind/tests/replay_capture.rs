//! Integration tests for decoding a captured event stream through the
//! public API, complementing `replay.rs`'s own inline unit tests with a
//! larger, out-of-crate capture scenario closer to what the `replay`
//! subcommand actually does against a file on disk.

use std::fs::File;
use std::io::Write;

use polyunwind::replay::{encode_frame, read_records, ReplayRecord};
use polyunwind_common::events::{MunmapEvent, PidEvent, PidEventType};

#[test]
fn decodes_a_realistic_session_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.bin");
    let mut file = File::create(&path).unwrap();

    let events: Vec<Vec<u8>> = vec![
        encode_frame(&PidEvent::new(100, PidEventType::New).encode()),
        encode_frame(&PidEvent::new(100, PidEventType::TracesReady).encode()),
        encode_frame(&MunmapEvent::new(100, 0x7f0000001000).encode()),
        encode_frame(&PidEvent::new(100, PidEventType::Exit).encode()),
    ];
    for frame in &events {
        file.write_all(frame).unwrap();
    }
    drop(file);

    let records = read_records(&path).unwrap();
    assert_eq!(
        records,
        vec![
            ReplayRecord::Pid { pid: 100, event_type: PidEventType::New as u32 },
            ReplayRecord::Pid { pid: 100, event_type: PidEventType::TracesReady as u32 },
            ReplayRecord::Munmap { pid: 100, addr: 0x7f0000001000 },
            ReplayRecord::Pid { pid: 100, event_type: PidEventType::Exit as u32 },
        ]
    );
}

#[test]
fn a_truncated_final_record_is_reported_rather_than_silently_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("truncated.bin");
    let mut file = File::create(&path).unwrap();

    file.write_all(&encode_frame(&PidEvent::new(1, PidEventType::New).encode())).unwrap();
    // A declared length with no payload bytes behind it at all.
    file.write_all(&(PidEvent::WIRE_SIZE as u32).to_le_bytes()).unwrap();
    drop(file);

    let err = read_records(&path).unwrap_err();
    assert!(matches!(err, polyunwind::domain::errors::ReplayError::Truncated { .. }));
}

#[test]
fn json_serialization_round_trips_through_serde() {
    let record = ReplayRecord::Munmap { pid: 42, addr: 0xdead_beef };
    let json = serde_json::to_string(&record).unwrap();
    assert!(json.contains("\"pid\":42"));
    assert!(json.contains("\"kind\":\"Munmap\""));
}
