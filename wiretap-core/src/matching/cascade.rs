//! The generic three-stage matcher cascade, shared in shape across
//! protocols. Each protocol crate supplies a [`MatchPredicates`] impl plugging in its
//! own exact/schema equality and a raw-byte projection for the fuzzy stage.
//!
//! Search order: the unconsumed ("filtered") pool is searched first, running the full
//! three-stage cascade against it and requiring the usual `>= 0.78` similarity floor at
//! stage 3. Only if that search yields nothing does the full (unfiltered) pool get
//! searched, where stage 3's shingle sub-strategy accepts its best candidate
//! unconditionally. After a candidate is selected it is atomically claimed;
//! a lost claim race restarts the whole search from the top, since the pool snapshot it
//! was chosen from may be stale.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::matching::{levenshtein, shingle};
use crate::mock::Mock;
use crate::store::{MockId, MockStore};

/// The minimum acceptable similarity for either fuzzy sub-strategy.
pub const FUZZY_THRESHOLD: f64 = 0.78;

/// Protocol-specific predicates plugged into the generic cascade.
pub trait MatchPredicates<Req> {
    /// Stage 1: bit-identical under the protocol's equality relation.
    fn exact(&self, query: &Req, candidate: &Req) -> bool;

    /// Stage 2: same type shape, relaxed value comparisons.
    fn schema(&self, query: &Req, candidate: &Req) -> bool;

    /// A byte projection of the request used only by stage 3's fuzzy sub-strategies.
    /// Protocols with a canonical byte form (e.g. a recorded opaque payload) return it
    /// here; others serialize a stable encoding.
    fn raw_bytes(&self, req: &Req) -> Vec<u8>;
}

/// Runs the full cascade against one already-fetched, already `sort_order`-sorted pool.
/// `accept_fuzzy_unconditionally` controls stage 3's shingle sub-strategy threshold,
/// (filtered pool requires `>= FUZZY_THRESHOLD`; full pool accepts its
/// best candidate regardless).
fn search_pool<Req, Resp>(
    query: &Req,
    pool: &[(MockId, Arc<Mock<Req, Resp>>)],
    predicates: &dyn MatchPredicates<Req>,
    accept_fuzzy_unconditionally: bool,
) -> Option<MockId> {
    // Stage 1 — exact.
    if let Some((id, _)) = pool.iter().find(|(_, m)| predicates.exact(query, &m.request)) {
        return Some(*id);
    }

    // Stage 2 — schema.
    if let Some((id, _)) = pool.iter().find(|(_, m)| predicates.schema(query, &m.request)) {
        return Some(*id);
    }

    // Stage 3.1 — printable-ASCII Levenshtein.
    let query_bytes = predicates.raw_bytes(query);
    if levenshtein::is_printable_ascii(&query_bytes) {
        let mut best: Option<(MockId, usize)> = None;
        for (id, m) in pool {
            let cand = predicates.raw_bytes(&m.request);
            if !levenshtein::is_printable_ascii(&cand) {
                continue;
            }
            let dist = levenshtein::distance(&query_bytes, &cand);
            if dist == 0 {
                return Some(*id);
            }
            if best.map(|(_, best_dist)| dist < best_dist).unwrap_or(true) {
                best = Some((*id, dist));
            }
        }
        if let Some((id, dist)) = best {
            let max_len = query_bytes.len().max(1);
            let similarity = 1.0 - (dist as f64 / max_len as f64);
            if similarity >= FUZZY_THRESHOLD {
                return Some(id);
            }
        }
    }

    // Stage 3.2 — binary shingle Jaccard.
    let k = shingle::adaptive_k(query_bytes.len().max(1));
    let query_shingles = shingle::shingles(&query_bytes, k);
    let mut best: Option<(MockId, f64)> = None;
    for (id, m) in pool {
        let cand = predicates.raw_bytes(&m.request);
        let cand_shingles = shingle::shingles(&cand, k);
        let sim = shingle::jaccard(&query_shingles, &cand_shingles);
        if best.map(|(_, best_sim)| sim > best_sim).unwrap_or(true) {
            best = Some((*id, sim));
        }
    }
    match best {
        Some((id, sim)) if accept_fuzzy_unconditionally || sim >= FUZZY_THRESHOLD => Some(id),
        _ => None,
    }
}

/// Finds and atomically claims the best-matching mock for `query`, retrying the whole
/// search if a concurrent matcher wins the claim race first.
pub fn match_and_claim<Req, Resp, S>(
    store: &S,
    query: &Req,
    predicates: &dyn MatchPredicates<Req>,
) -> Result<Arc<Mock<Req, Resp>>>
where
    S: MockStore<Req, Resp>,
{
    loop {
        let filtered = store.get_filtered();
        let selected = search_pool(query, &filtered, predicates, false).or_else(|| {
                let unfiltered = store.get_unfiltered();
                search_pool(query, &unfiltered, predicates, true)
            });

        let Some(id) = selected else {
            return Err(Error::no_mock("no candidate passed the matcher cascade"));
        };

        if store.claim(id) {
            // Re-fetch so we return the exact record the id pointed at (cheap: both
            // pools are already snapshots, but claim only guarantees the id was ours).
            let mock = store
            .get_unfiltered()
            .into_iter()
            .find(|(found, _)| *found == id)
            .map(|(_, m)| m)
            .ok_or_else(|| Error::no_mock("claimed mock vanished from store"))?;
            return Ok(mock);
        }
        // Lost the race; another matcher claimed it first. Restart from the top.
        tracing::debug!("claim lost race, retrying matcher cascade");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockKind;
    use crate::store::InMemoryMockStore;
    use std::time::SystemTime;

    struct BytesPredicates;

    impl MatchPredicates<Vec<u8>> for BytesPredicates {
        fn exact(&self, query: &Vec<u8>, candidate: &Vec<u8>) -> bool {
            query == candidate
        }

        fn schema(&self, _query: &Vec<u8>, _candidate: &Vec<u8>) -> bool {
            false
        }

        fn raw_bytes(&self, req: &Vec<u8>) -> Vec<u8> {
            req.clone()
        }
    }

    fn insert(store: &InMemoryMockStore<Vec<u8>, Vec<u8>>, req: &[u8]) -> MockId {
        let now = SystemTime::now();
        store.insert(Mock::new(MockKind::Http2Grpc, req.to_vec(), b"resp".to_vec(), now, now))
    }

    #[test]
    fn exact_match_wins_immediately() {
        let store = InMemoryMockStore::new();
        insert(&store, b"hello");
        insert(&store, b"hellp");

        let got = match_and_claim(&store, &b"hello".to_vec(), &BytesPredicates).unwrap();
        assert_eq!(got.request, b"hello");
    }

    #[test]
    fn fuzzy_fallback_picks_closest_then_next_closest() {
        let store = InMemoryMockStore::new();
        // 3-byte difference vs the query.
        insert(&store, b"hello world this is a mock AAA");
        // 17-byte difference vs the query.
        insert(&store, b"completely different text zzzz");
        let query = b"hello world this is a mock XXX".to_vec();

        let first = match_and_claim(&store, &query, &BytesPredicates).unwrap();
        assert_eq!(first.request, b"hello world this is a mock AAA");

        // First mock is now claimed; repeating the match must not return it again.
        match match_and_claim(&store, &query, &BytesPredicates) {
            Ok(second) => assert_eq!(second.request, b"completely different text zzzz"),
            Err(Error::NoMock(_)) => {} // acceptable if similarity fell under threshold
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn no_candidates_is_no_mock() {
        let store: InMemoryMockStore<Vec<u8>, Vec<u8>> = InMemoryMockStore::new();
        let err = match_and_claim(&store, &b"anything".to_vec(), &BytesPredicates).unwrap_err();
        assert!(matches!(err, Error::NoMock(_)));
    }

    #[test]
    fn cascade_monotonicity_stage1_implies_stage2_would_also_accept() {
        // An exact match always also satisfies a trivially-true schema predicate.
        struct AlwaysSchema;
        impl MatchPredicates<Vec<u8>> for AlwaysSchema {
            fn exact(&self, q: &Vec<u8>, c: &Vec<u8>) -> bool {
                q == c
            }
            fn schema(&self, _q: &Vec<u8>, _c: &Vec<u8>) -> bool {
                true
            }
            fn raw_bytes(&self, req: &Vec<u8>) -> Vec<u8> {
                req.clone()
            }
        }
        let store = InMemoryMockStore::new();
        insert(&store, b"x");
        let got = match_and_claim(&store, &b"x".to_vec(), &AlwaysSchema).unwrap();
        assert_eq!(got.request, b"x");
    }
}
