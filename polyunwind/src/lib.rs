//! Userspace companion for the in-kernel unwinder.
//!
//! This crate does not load or attach BPF programs, and it does not
//! symbolize addresses into file/line — both are out of scope here. What it
//! owns is the userland side of the event channel: decoding the wire
//! records a loader's ring buffer consumer would see, and the collaborator
//! traits a real loader implements to keep the lookup tables and
//! introspection snapshots populated.

pub mod cli;
pub mod collaborators;
pub mod domain;
pub mod replay;
