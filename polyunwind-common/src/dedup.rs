//! Trace hash dedup/reporting sequence (§4.5, component C6): decides
//! whether a freshly-hashed trace has already been reported, is currently
//! being reported by another CPU, or needs a fresh report — the
//! at-most-one-report semantics the spec's concurrency model relies on.
//!
//! `known_traces`/`hash_to_trace`/`hash_to_count` are cross-CPU shared maps
//! in the real kernel build; [`DedupTables`] is the trait boundary that
//! lets the decision logic run identically against a host-side mock and
//! real BPF hash maps, the same split `memory::Tables` uses for lookups.

/// What the caller should do after consulting the dedup maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    /// `known_traces[hash]` was already present: just bump the count.
    AlreadyReported,
    /// Another CPU's report for this hash is in flight: bump the count,
    /// but do not duplicate the reporter work.
    ReportInFlight,
    /// Neither map held this hash: the caller must run the reporter
    /// (write frame lists, insert the trace header, bump the count).
    NeedsReport,
}

/// The three dedup maps named in §4.5/§5, behind one trait so a test can
/// provide an in-memory mock and the real crate can provide BPF hash maps.
pub trait DedupTables {
    fn known_traces_contains(&self, hash: u64) -> bool;
    fn hash_to_trace_contains(&self, hash: u64) -> bool;
    fn mark_hash_to_trace(&mut self, hash: u64);
    fn bump_hash_to_count(&mut self, hash: u64);
    fn insert_known_trace(&mut self, hash: u64);
}

/// Implements §4.5 step 3 verbatim: check `known_traces` first, then
/// `hash_to_trace` for an in-flight report from another CPU, bumping the
/// count on either hit and only asking the caller to report on a full miss.
pub fn record_trace<T: DedupTables>(tables: &mut T, hash: u64) -> DedupOutcome {
    if tables.known_traces_contains(hash) {
        tables.bump_hash_to_count(hash);
        return DedupOutcome::AlreadyReported;
    }

    if tables.hash_to_trace_contains(hash) {
        tables.bump_hash_to_count(hash);
        return DedupOutcome::ReportInFlight;
    }

    tables.mark_hash_to_trace(hash);
    DedupOutcome::NeedsReport
}

/// §4.5 step 4: once the caller has written the frame lists and the trace
/// header, finalize bookkeeping so subsequent occurrences hit the
/// `AlreadyReported` fast path instead of re-running the reporter.
pub fn finish_report<T: DedupTables>(tables: &mut T, hash: u64) {
    tables.insert_known_trace(hash);
    tables.bump_hash_to_count(hash);
}
