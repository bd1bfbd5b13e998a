//! Printable-ASCII Levenshtein distance.

/// `true` if every byte is printable ASCII (0x20..=0x7e) or common whitespace; the
/// fuzzy-match stage only runs Levenshtein when both sides pass this check, falling
/// back to shingle Jaccard for binary payloads.
pub fn is_printable_ascii(data: &[u8]) -> bool {
    data.iter().all(|&b| (0x20..=0x7e).contains(&b) || matches!(b, b'\t' | b'\n' | b'\r'))
}

/// Classic iterative Levenshtein edit distance over bytes, using two rolling rows
/// rather than a full matrix.
pub fn distance(a: &[u8], b: &[u8]) -> usize {
    let (a, b) = (a, b);
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for (i, &ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// Similarity in `[0, 1]` derived from edit distance against the longer of the two
/// inputs, so a 0-length difference on a 0-length pair is defined as `1.0`.
pub fn similarity(a: &[u8], b: &[u8]) -> f64 {
    let max_len = a.len().max(b.len());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - (distance(a, b) as f64 / max_len as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_strings_have_zero_distance() {
        assert_eq!(distance(b"hello", b"hello"), 0);
    }

    #[test]
    fn distance_matches_known_case() {
        // kitten -> sitting is the textbook distance-3 example.
        assert_eq!(distance(b"kitten", b"sitting"), 3);
    }

    #[test]
    fn printable_ascii_detection() {
        assert!(is_printable_ascii(b"SELECT 1"));
        assert!(!is_printable_ascii(&[0, 159, 146, 150]));
    }
}
