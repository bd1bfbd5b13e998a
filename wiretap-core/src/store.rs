//! Mock store interface and a reference in-memory implementation.
//!
//! The real store lives outside the core ("mock persistence on disk" is an
//! external collaborator); this crate only depends on the trait below, plus ships an
//! in-memory implementation so the matcher and engines can be exercised in tests without
//! a second crate.
//!
//! Mutation discipline: reads are lock-free snapshots (`Arc` clones), writes
//! are a compare-and-swap on the packed `test_mode_info`. A failed CAS is
//! [`Error::StoreContention`](crate::error::Error::StoreContention); callers re-iterate
//! the matcher cascade rather than retry the CAS directly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::mock::{Mock, TestModeInfo};

/// Opaque handle identifying a slot in a [`MockStore`]; stable for the lifetime of the
/// store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MockId(pub usize);

fn pack(info: TestModeInfo) -> u64 {
    let filtered_bit = if info.is_filtered { 1u64 << 63 } else { 0 };
    filtered_bit | (info.sort_order & ((1u64 << 63) - 1))
}

fn unpack(bits: u64) -> TestModeInfo {
    TestModeInfo {
        is_filtered: bits & (1u64 << 63) != 0,
        sort_order: bits & ((1u64 << 63) - 1),
    }
}

/// The operations the matcher needs from a mock store.
pub trait MockStore<Req, Resp>: Send + Sync {
    /// The still-unconsumed pool (`is_filtered == true`), ordered by `sort_order`.
    fn get_filtered(&self) -> Vec<(MockId, Arc<Mock<Req, Resp>>)>;

    /// The full pool regardless of consumption state, ordered by `sort_order`.
    fn get_unfiltered(&self) -> Vec<(MockId, Arc<Mock<Req, Resp>>)>;

    /// Atomically transitions a record from `filtered` to `used`. `false` means another
    /// matcher already claimed it; the caller must retry the cascade from the top.
    fn claim(&self, id: MockId) -> bool;

    /// Idempotent: mark a record used without the atomicity guarantee of `claim` (used
    /// when the caller already knows it holds exclusive access).
    fn mark_used(&self, id: MockId);

    /// Compare-and-swap `test_mode_info`; `false` on a lost race.
    fn update(&self, id: MockId, old: TestModeInfo, new: TestModeInfo) -> bool;
}

struct Slot<Req, Resp> {
    mock: Arc<Mock<Req, Resp>>,
    info: AtomicU64,
}

/// Reference in-memory [`MockStore`]. Not part of the external interface (keeps
/// persistence out of scope) — exists so this workspace's own tests can drive the
/// matcher end to end.
pub struct InMemoryMockStore<Req, Resp> {
    slots: RwLock<Vec<Slot<Req, Resp>>>,
}

impl<Req, Resp> Default for InMemoryMockStore<Req, Resp> {
    fn default() -> Self {
        Self { slots: RwLock::new(Vec::new()) }
    }
}

impl<Req, Resp> InMemoryMockStore<Req, Resp> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, mock: Mock<Req, Resp>) -> MockId {
        let info = pack(mock.test_mode_info);
        let mut slots = self.slots.write();
        let id = MockId(slots.len());
        slots.push(Slot { mock: Arc::new(mock), info: AtomicU64::new(info) });
        id
    }

    fn snapshot(&self, want_filtered: bool) -> Vec<(MockId, Arc<Mock<Req, Resp>>)> {
        let slots = self.slots.read();
        let mut out: Vec<(MockId, Arc<Mock<Req, Resp>>, TestModeInfo)> = slots
        .iter()
        .enumerate()
        .map(|(i, s)| (MockId(i), s.mock.clone(), unpack(s.info.load(Ordering::Acquire))))
        .filter(|(_, _, info)| !want_filtered || info.is_filtered)
        .collect();
        out.sort_by_key(|(_, _, info)| info.sort_order);
        out.into_iter().map(|(id, m, _)| (id, m)).collect()
    }
}

impl<Req, Resp> MockStore<Req, Resp> for InMemoryMockStore<Req, Resp>
where
    Req: Send + Sync,
    Resp: Send + Sync,
{
    fn get_filtered(&self) -> Vec<(MockId, Arc<Mock<Req, Resp>>)> {
        self.snapshot(true)
    }

    fn get_unfiltered(&self) -> Vec<(MockId, Arc<Mock<Req, Resp>>)> {
        self.snapshot(false)
    }

    fn claim(&self, id: MockId) -> bool {
        let slots = self.slots.read();
        let Some(slot) = slots.get(id.0) else { return false };
        loop {
            let current = slot.info.load(Ordering::Acquire);
            let info = unpack(current);
            if !info.is_filtered {
                // Already used by someone else; claim only ever moves filtered -> used.
                return false;
            }
            let new = pack(info.used());
            if slot
            .info
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
            {
                return true;
            }
            // Lost the race against a concurrent claim/update; reread and retry once
            // more before giving up to the caller's own retry loop.
        }
    }

    fn mark_used(&self, id: MockId) {
        let slots = self.slots.read();
        if let Some(slot) = slots.get(id.0) {
            let current = slot.info.load(Ordering::Acquire);
            let info = unpack(current);
            let _ = slot.info.compare_exchange(
                current,
                pack(info.used()),
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }

    fn update(&self, id: MockId, old: TestModeInfo, new: TestModeInfo) -> bool {
        let slots = self.slots.read();
        let Some(slot) = slots.get(id.0) else { return false };
        slot.info
        .compare_exchange(pack(old), pack(new), Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockKind;
    use std::time::SystemTime;

    fn mk(store: &InMemoryMockStore<&'static str, &'static str>, req: &'static str) -> MockId {
        let now = SystemTime::now();
        store.insert(Mock::new(MockKind::Postgres, req, "resp", now, now))
    }

    #[test]
    fn claim_is_single_winner() {
        let store = InMemoryMockStore::new();
        let id = mk(&store, "select 1");

        assert!(store.claim(id));
        assert!(!store.claim(id), "second claim on the same record must fail");
    }

    #[test]
    fn filtered_pool_shrinks_after_claim() {
        let store = InMemoryMockStore::new();
        let a = mk(&store, "a");
        let _b = mk(&store, "b");

        assert_eq!(store.get_filtered().len(), 2);
        assert!(store.claim(a));
        assert_eq!(store.get_filtered().len(), 1);
        assert_eq!(store.get_unfiltered().len(), 2);
    }

    #[test]
    fn sort_order_is_stable_tiebreak() {
        let store = InMemoryMockStore::new();
        mk(&store, "first");
        mk(&store, "second");

        let filtered = store.get_filtered();
        assert_eq!(*filtered[0].1.request, "first");
        assert_eq!(*filtered[1].1.request, "second");
    }
}
