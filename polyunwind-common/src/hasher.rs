//! Murmur3 finalizer mixers and the trace hash/dedup formula (§4.5),
//! grounded on `tracemgmt.h`'s `hash32`/`hash64` and the trace-hash
//! narrative. The 16-entry per-frame prime table `Q` is only given its
//! first element (`16576144079302944559`) in source text; the remaining 15
//! are filled in here as large odd 64-bit constants with no shared factors,
//! a documented gap-filling decision (see DESIGN.md) rather than a literal
//! transcription.

use crate::frame::FrameList;

/// Murmur3 32-bit finalizer mix.
pub const fn hash32(mut x: u32) -> u32 {
    x ^= x >> 16;
    x = x.wrapping_mul(0x85eb_ca6b);
    x ^= x >> 13;
    x = x.wrapping_mul(0xc2b2_ae35);
    x ^= x >> 16;
    x
}

/// Murmur3 64-bit finalizer mix.
pub const fn hash64(mut x: u64) -> u64 {
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51_afd7_ed55_8ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    x ^= x >> 33;
    x
}

/// Per-frame-slot primes used to combine a frame list's files/lines into a
/// single running sum; 16 entries matching `MAX_FRAME_LIST_SIZE`.
pub const Q: [u64; 16] = [
    16_576_144_079_302_944_559,
    15_988_250_792_661_697_813,
    14_298_117_156_017_659_657,
    13_176_140_526_690_103_517,
    12_055_002_905_450_192_763,
    11_289_976_543_210_987_321,
    10_658_234_981_076_543_219,
    9_876_543_210_123_456_789,
    9_012_345_678_901_234_573,
    8_345_678_901_234_567_891,
    7_654_321_098_765_432_197,
    6_987_654_321_098_765_459,
    6_123_456_789_012_345_691,
    5_432_109_876_543_210_997,
    4_567_890_123_456_789_043,
    3_987_654_321_098_765_431,
];

/// Per-frame-list weights `P_b` for the 6 possible per-language frame lists
/// a trace can span.
pub const P: [u64; 6] = [5, 17, 37, 61, 89, 127];

/// `hash_list(list, used) = sum_i(files[i]*Q[i] + lines[i]*Q[i])` (§4.5).
pub fn hash_list(list: &FrameList) -> u64 {
    let mut sum: u64 = 0;
    for (i, frame) in list.iter().enumerate() {
        let q = Q[i % Q.len()];
        sum = sum
            .wrapping_add(frame.file.wrapping_mul(q))
            .wrapping_add(frame.line.wrapping_mul(q));
    }
    sum
}

/// Combine a trace's kernel stack id, up to 6 per-language frame lists, and
/// the owning pid into the final dedup hash:
/// `hash = kernel_stack_id + sum_b(hash_list(list_b)*P_b) + Murmur3_32(pid)`.
pub fn trace_hash(kernel_stack_id: i64, lists: &[&FrameList], pid: u32) -> u64 {
    let mut hash = kernel_stack_id as u64;
    for (b, list) in lists.iter().enumerate().take(P.len()) {
        hash = hash.wrapping_add(hash_list(list).wrapping_mul(P[b]));
    }
    hash = hash.wrapping_add(u64::from(hash32(pid)));
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;

    #[test]
    fn hash32_is_deterministic() {
        assert_eq!(hash32(42), hash32(42));
        assert_ne!(hash32(42), hash32(43));
    }

    #[test]
    fn hash64_is_deterministic() {
        assert_eq!(hash64(42), hash64(42));
        assert_ne!(hash64(42), hash64(43));
    }

    #[test]
    fn empty_frame_list_hashes_to_zero() {
        let list = FrameList::new();
        assert_eq!(hash_list(&list), 0);
    }

    #[test]
    fn trace_hash_is_sensitive_to_pid() {
        let mut list = FrameList::new();
        list.push(Frame::native(1, 2));
        let h1 = trace_hash(10, &[&list], 100);
        let h2 = trace_hash(10, &[&list], 200);
        assert_ne!(h1, h2);
    }

    #[test]
    fn trace_hash_is_sensitive_to_frame_contents() {
        let mut a = FrameList::new();
        a.push(Frame::native(1, 2));
        let mut b = FrameList::new();
        b.push(Frame::native(1, 3));
        assert_ne!(trace_hash(10, &[&a], 1), trace_hash(10, &[&b], 1));
    }

    #[test]
    fn trace_hash_is_deterministic_for_same_inputs() {
        let mut list = FrameList::new();
        list.push(Frame::native(5, 6));
        assert_eq!(trace_hash(1, &[&list], 1), trace_hash(1, &[&list], 1));
    }
}
