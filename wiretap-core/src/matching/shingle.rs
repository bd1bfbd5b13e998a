//! Adaptive shingling and Jaccard similarity.

use std::collections::HashSet;

/// `k = clamp(ceil(len/5), 3, 8)` — the shingle width scales with input length so very
/// short payloads still get multiple overlapping windows and very long ones don't
/// produce an unmanageable shingle set.
pub fn adaptive_k(len: usize) -> usize {
    let raw = len.div_ceil(5).max(1);
    raw.clamp(3, 8)
}

/// The set of `k`-byte sliding-window shingles of `data`. Inputs shorter than `k` yield
/// a single shingle equal to the whole input (there is no narrower window to take).
pub fn shingles(data: &[u8], k: usize) -> HashSet<&[u8]> {
    if data.len() <= k {
        let mut set = HashSet::with_capacity(1);
        set.insert(data);
        return set;
    }
    let mut set = HashSet::with_capacity(data.len() - k + 1);
    for window in data.windows(k) {
        set.insert(window);
    }
    set
}

/// `|A ∩ B| / |A ∪ B|`. Two empty sets are defined as perfectly similar (both shingle
/// sets of empty byte strings collapse to one empty-slice element, so this only matters
/// for a deliberately-empty pair).
pub fn jaccard(a: &HashSet<&[u8]>, b: &HashSet<&[u8]>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

/// Convenience: shingle similarity between two raw byte buffers using the adaptive `k`
/// computed from the shorter of the two inputs (matching single `k` per
/// comparison rather than two different widths).
pub fn shingle_similarity(a: &[u8], b: &[u8]) -> f64 {
    let k = adaptive_k(a.len().min(b.len()).max(1));
    jaccard(&shingles(a, k), &shingles(b, k))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_buffers_are_maximally_similar() {
        assert_eq!(shingle_similarity(b"hello world", b"hello world"), 1.0);
    }

    #[test]
    fn disjoint_buffers_are_dissimilar() {
        let sim = shingle_similarity(b"aaaaaaaaaa", b"zzzzzzzzzz");
        assert!(sim < 0.1, "expected near-zero similarity, got {sim}");
    }

    #[test]
    fn adaptive_k_is_clamped() {
        assert_eq!(adaptive_k(1), 3);
        assert_eq!(adaptive_k(15), 3);
        assert_eq!(adaptive_k(16), 4);
        assert_eq!(adaptive_k(1000), 8);
    }
}
